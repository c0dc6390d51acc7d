//! Fan-out of run events to live stream connections.
//!
//! Connections subscribe either to a single run or to the global set. Every
//! event is written to the run's subscribers and to all global subscribers as a
//! JSON frame tagged with `runId` and `timestamp`. A failed write drops only the
//! connection it was written to.
//!
//! Only `progress` frames are lossy: once a connection has `buffer` frames
//! queued, further progress is skipped for it. Lifecycle frames (step results,
//! run outcome, `connection_closing`) are always queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, trace, warn};

use codekb_shared::RunId;

use crate::events::PipelineEvent;
use crate::run::RunSnapshot;

pub type ConnectionId = u64;

/// Which events a connection receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionTarget {
    Run(RunId),
    Global,
}

impl SubscriptionTarget {
    fn scope(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Global => "global",
        }
    }
}

/// Write half of one open stream. The transport owns the matching receiver.
#[derive(Debug, Clone)]
pub struct StreamConnection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<String>,
    queued: Arc<AtomicUsize>,
    buffer: usize,
}

impl StreamConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

/// Read half of one open stream.
#[derive(Debug)]
pub struct StreamReceiver {
    rx: mpsc::UnboundedReceiver<String>,
    queued: Arc<AtomicUsize>,
}

impl StreamReceiver {
    /// Next frame, or `None` once the broadcaster dropped the connection.
    pub async fn recv(&mut self) -> Option<String> {
        let frame = self.rx.recv().await?;
        self.queued.fetch_sub(1, Ordering::Relaxed);
        Some(frame)
    }

    pub fn try_recv(&mut self) -> Result<String, TryRecvError> {
        let frame = self.rx.try_recv()?;
        self.queued.fetch_sub(1, Ordering::Relaxed);
        Ok(frame)
    }
}

#[derive(Default)]
struct Subscriptions {
    runs: HashMap<RunId, HashMap<ConnectionId, StreamConnection>>,
    global: HashMap<ConnectionId, StreamConnection>,
}

struct Inner {
    subs: Mutex<Subscriptions>,
    next_id: AtomicU64,
    close_grace: Duration,
    buffer: usize,
}

/// Shared handle to the subscription sets. Cheap to clone.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("close_grace", &self.inner.close_grace)
            .finish_non_exhaustive()
    }
}

impl Broadcaster {
    /// `buffer` is the number of frames queued per connection before
    /// `progress` frames are skipped for it.
    pub fn new(close_grace: Duration, buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subs: Mutex::new(Subscriptions::default()),
                next_id: AtomicU64::new(1),
                close_grace,
                buffer: buffer.max(1),
            }),
        }
    }

    fn subs(&self) -> MutexGuard<'_, Subscriptions> {
        self.inner.subs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a connection. Frames arrive on the returned receiver until the
    /// connection is closed or unsubscribed.
    pub fn connect(&self) -> (StreamConnection, StreamReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = StreamConnection {
            id,
            tx,
            queued: Arc::clone(&queued),
            buffer: self.inner.buffer,
        };
        (conn, StreamReceiver { rx, queued })
    }

    /// Add `conn` to a subscription set.
    ///
    /// Sends a `connected` frame, then a `status` frame when a snapshot is
    /// given. Subscribing to a run that already finished schedules the usual
    /// delayed closure.
    pub fn subscribe(
        &self,
        target: SubscriptionTarget,
        conn: StreamConnection,
        snapshot: Option<&RunSnapshot>,
    ) {
        let run_id = match &target {
            SubscriptionTarget::Run(id) => Some(id.clone()),
            SubscriptionTarget::Global => None,
        };

        let connected = frame(
            &json!({
                "type": "connected",
                "scope": target.scope(),
                "connectionId": conn.id,
            }),
            run_id.as_ref(),
        );
        if !deliver(&conn, connected, false) {
            return;
        }
        if let Some(snapshot) = snapshot {
            let status = frame(&json!({ "type": "status", "pipeline": snapshot }), run_id.as_ref());
            if !deliver(&conn, status, false) {
                return;
            }
        }

        debug!(connection = conn.id, scope = target.scope(), "stream subscribed");
        let id = conn.id;
        {
            let mut subs = self.subs();
            match &target {
                SubscriptionTarget::Run(run) => {
                    subs.runs.entry(run.clone()).or_default().insert(id, conn);
                }
                SubscriptionTarget::Global => {
                    subs.global.insert(id, conn);
                }
            }
        }

        if let (Some(run_id), Some(snapshot)) = (run_id, snapshot) {
            if snapshot.status.is_terminal() {
                self.schedule_close(run_id, "pipeline already finished");
            }
        }
    }

    /// Remove a connection from whichever set holds it.
    pub fn unsubscribe(&self, id: ConnectionId) {
        let mut subs = self.subs();
        let removed_global = subs.global.remove(&id).is_some();
        let mut removed_run = false;
        subs.runs.retain(|_, conns| {
            removed_run |= conns.remove(&id).is_some();
            !conns.is_empty()
        });
        if removed_global || removed_run {
            debug!(connection = id, "stream unsubscribed");
        }
    }

    /// Forward a run event to the run's subscribers and every global subscriber.
    pub fn broadcast(&self, run_id: &RunId, event: &PipelineEvent) {
        let data = frame(event, Some(run_id));
        let lossy = matches!(event, PipelineEvent::Progress { .. });
        {
            let mut guard = self.subs();
            let subs = &mut *guard;
            if let Some(conns) = subs.runs.get_mut(run_id) {
                write_all(conns, &data, lossy);
                if conns.is_empty() {
                    subs.runs.remove(run_id);
                }
            }
            write_all(&mut subs.global, &data, lossy);
        }

        if event.is_terminal() {
            self.schedule_close(run_id.clone(), event.name());
        }
    }

    /// Close a run's dedicated connections after the grace period.
    fn schedule_close(&self, run_id: RunId, reason: &str) {
        let this = self.clone();
        let grace = self.inner.close_grace;
        let reason = reason.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            this.close_run(&run_id, &reason);
        });
    }

    /// Send `connection_closing` to a run's subscribers and drop them.
    pub fn close_run(&self, run_id: &RunId, reason: &str) {
        let Some(conns) = self.subs().runs.remove(run_id) else {
            return;
        };
        let data = frame(&closing(reason), Some(run_id));
        for conn in conns.values() {
            deliver(conn, data.clone(), false);
        }
        info!(run_id = %run_id, connections = conns.len(), "closed run streams");
    }

    /// Close every connection, e.g. on server shutdown.
    pub fn close_all(&self) {
        let subs = std::mem::take(&mut *self.subs());
        let data = frame(&closing("server shutting down"), None);
        let mut count = 0;
        for conn in subs.runs.values().flat_map(|c| c.values()).chain(subs.global.values()) {
            deliver(conn, data.clone(), false);
            count += 1;
        }
        if count > 0 {
            info!(connections = count, "closed all streams");
        }
    }

    /// Number of open connections for a target.
    pub fn connection_count(&self, target: &SubscriptionTarget) -> usize {
        let subs = self.subs();
        match target {
            SubscriptionTarget::Run(id) => subs.runs.get(id).map_or(0, HashMap::len),
            SubscriptionTarget::Global => subs.global.len(),
        }
    }
}

fn closing(reason: &str) -> Value {
    json!({ "type": "connection_closing", "reason": reason })
}

/// Serialize a frame body, merging in `runId` and `timestamp`.
fn frame(body: &impl Serialize, run_id: Option<&RunId>) -> String {
    let mut value = serde_json::to_value(body).unwrap_or_else(|e| {
        warn!(error = %e, "failed to serialize stream frame");
        json!({ "type": "error" })
    });
    if let Value::Object(map) = &mut value {
        if let Some(run_id) = run_id {
            map.insert("runId".into(), json!(run_id));
        }
        map.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
    }
    value.to_string()
}

/// Queue a frame on one connection. Returns `false` once the client is gone.
///
/// A `lossy` frame is skipped while the connection already has `buffer`
/// frames queued.
fn deliver(conn: &StreamConnection, data: String, lossy: bool) -> bool {
    if lossy && conn.queued.load(Ordering::Relaxed) >= conn.buffer {
        trace!(connection = conn.id, "stream backlog full, progress frame skipped");
        return !conn.tx.is_closed();
    }
    conn.queued.fetch_add(1, Ordering::Relaxed);
    if conn.tx.send(data).is_err() {
        conn.queued.fetch_sub(1, Ordering::Relaxed);
        return false;
    }
    true
}

fn write_all(conns: &mut HashMap<ConnectionId, StreamConnection>, data: &str, lossy: bool) {
    conns.retain(|id, conn| {
        let alive = deliver(conn, data.to_string(), lossy);
        if !alive {
            debug!(connection = *id, "dropping closed stream");
        }
        alive
    });
}
