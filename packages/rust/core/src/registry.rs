//! Process-wide collection of pipeline runs.
//!
//! The [`Registry`] admits new runs up to a concurrency ceiling, schedules them
//! on the Tokio runtime, relays their events to the [`Broadcaster`], and evicts
//! finished runs once they are older than the retention window. It has an
//! explicit `init()`/`shutdown()` lifecycle that owns the eviction sweep.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use codekb_shared::{
    AppConfig, CodeKbError, PipelineConfig, Result, RunId, RunStatus, STEPS, StepDescriptor,
    StepState, step_by_ordinal,
};

use crate::broadcaster::Broadcaster;
use crate::events::{EventStream, PipelineEvent};
use crate::executor::{ProgressSink, StepContext, StepExecutorFactory, StepResult, dispatch};
use crate::run::{PipelineRun, RunSnapshot, RunSummary};

// ---------------------------------------------------------------------------
// Settings and outcomes
// ---------------------------------------------------------------------------

/// Tunables for a [`Registry`].
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Admission ceiling for active (`idle` or `running`) runs.
    pub max_concurrent_runs: usize,
    /// How long a finished run stays queryable.
    pub retention: Duration,
    pub sweep_interval: Duration,
    /// Per-run event buffer; also the per-connection frame buffer.
    pub event_buffer: usize,
    /// Delay before a finished run's streams are closed.
    pub stream_close_grace: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for RegistrySettings {
    fn from(config: &AppConfig) -> Self {
        let pipeline = &config.pipeline;
        Self {
            max_concurrent_runs: pipeline.max_concurrent_runs,
            retention: pipeline.retention(),
            sweep_interval: pipeline.sweep_interval(),
            event_buffer: pipeline.event_buffer,
            stream_close_grace: pipeline.stream_close_grace(),
        }
    }
}

/// Returned by [`Registry::start`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedRun {
    pub run_id: RunId,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
}

/// Returned by [`Registry::cancel`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
}

/// Outcome of a single step executed outside any run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdHocStepRun {
    pub run_id: RunId,
    pub step: &'static StepDescriptor,
    pub state: StepState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Sweeper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    settings: RegistrySettings,
    executors: Arc<dyn StepExecutorFactory>,
    broadcaster: Broadcaster,
    runs: RwLock<HashMap<RunId, Arc<PipelineRun>>>,
    /// Latest ad hoc state per step, indexed by `ordinal - 1`.
    ad_hoc: RwLock<Vec<Option<StepState>>>,
    sweeper: Mutex<Option<Sweeper>>,
}

/// Handle to the run registry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(settings: RegistrySettings, executors: Arc<dyn StepExecutorFactory>) -> Self {
        let broadcaster = Broadcaster::new(settings.stream_close_grace, settings.event_buffer);
        Self::with_broadcaster(settings, executors, broadcaster)
    }

    pub fn with_broadcaster(
        settings: RegistrySettings,
        executors: Arc<dyn StepExecutorFactory>,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                executors,
                broadcaster,
                runs: RwLock::new(HashMap::new()),
                ad_hoc: RwLock::new(vec![None; STEPS.len()]),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the periodic eviction sweep. Calling it again is a no-op.
    pub async fn init(&self) {
        let mut sweeper = self.inner.sweeper.lock().await;
        if sweeper.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let interval = self.inner.settings.sweep_interval;
        let retention = self.inner.settings.retention;
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(sweep_loop(weak, token.clone(), interval, retention));

        info!(
            interval_secs = interval.as_secs(),
            retention_secs = retention.as_secs(),
            "eviction sweep started"
        );
        *sweeper = Some(Sweeper { token, handle });
    }

    /// Stop the sweep and close every open stream.
    pub async fn shutdown(&self) {
        let sweeper = self.inner.sweeper.lock().await.take();
        if let Some(Sweeper { token, handle }) = sweeper {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "eviction sweep task ended abnormally");
            }
            info!("eviction sweep stopped");
        }
        self.inner.broadcaster.close_all();
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Admit and schedule a new run. Returns before any step starts.
    pub async fn start(&self, config: PipelineConfig) -> Result<StartedRun> {
        let (started, _events) = self.start_observed(config).await?;
        Ok(started)
    }

    /// Like [`start`](Self::start), also returning a stream subscribed before
    /// the run is scheduled, so no event is missed.
    #[instrument(skip_all, fields(project = %config.project_path.display()))]
    pub async fn start_observed(&self, config: PipelineConfig) -> Result<(StartedRun, EventStream)> {
        let (run, observer, relay) = {
            let mut runs = self.inner.runs.write().await;
            let limit = self.inner.settings.max_concurrent_runs;
            let mut active = 0;
            for run in runs.values() {
                if run.status().await.is_active() {
                    active += 1;
                }
            }
            if active >= limit {
                warn!(active, limit, "pipeline admission rejected");
                return Err(CodeKbError::CapacityExceeded { limit });
            }

            let run = Arc::new(PipelineRun::new(
                config,
                Arc::clone(&self.inner.executors),
                self.inner.settings.event_buffer,
            ));
            // Subscribed before the run becomes visible to `cancel`.
            let observer = run.subscribe();
            let relay = run.subscribe();
            runs.insert(run.id().clone(), Arc::clone(&run));
            (run, observer, relay)
        };

        let started = StartedRun {
            run_id: run.id().clone(),
            status: RunStatus::Idle,
            created_at: run.created_at(),
        };
        info!(run_id = %started.run_id, "pipeline run admitted");

        tokio::spawn(relay_events(
            started.run_id.clone(),
            relay,
            self.inner.broadcaster.clone(),
        ));
        tokio::spawn(async move { run.run().await });

        Ok((started, observer))
    }

    /// Look up a run by id.
    pub async fn get(&self, run_id: &RunId) -> Result<Arc<PipelineRun>> {
        self.inner
            .runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| CodeKbError::not_found(run_id))
    }

    pub async fn get_status(&self, run_id: &RunId) -> Result<RunSnapshot> {
        Ok(self.get(run_id).await?.snapshot().await)
    }

    /// All known runs, oldest first.
    pub async fn list(&self) -> Vec<RunSummary> {
        let runs: Vec<Arc<PipelineRun>> = self.inner.runs.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(runs.len());
        for run in runs {
            summaries.push(run.summary().await);
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.run_id.cmp(&b.run_id)));
        summaries
    }

    pub async fn cancel(&self, run_id: &RunId) -> Result<CancelOutcome> {
        let run = self.get(run_id).await?;
        let status = run.cancel().await;
        Ok(CancelOutcome {
            run_id: run_id.clone(),
            status,
        })
    }

    /// Remove runs whose `completedAt` is older than `max_age` before `now`.
    ///
    /// Runs that have not finished are never removed.
    pub async fn evict_stale(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<RunId> {
        let cutoff = TimeDelta::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut runs = self.inner.runs.write().await;
        let mut stale = Vec::new();
        for (id, run) in runs.iter() {
            if let Some(done) = run.completed_at().await {
                if done < cutoff {
                    stale.push(id.clone());
                }
            }
        }
        for id in &stale {
            runs.remove(id);
            debug!(run_id = %id, "evicted finished run");
        }
        stale
    }

    // -----------------------------------------------------------------------
    // Step views
    // -----------------------------------------------------------------------

    /// Execute one step outside admission control.
    ///
    /// The step's executor failure is reported in the outcome, not raised;
    /// only an unknown ordinal is an error.
    #[instrument(skip(self, config))]
    pub async fn run_step(&self, ordinal: u8, config: PipelineConfig) -> Result<AdHocStepRun> {
        let step = step_by_ordinal(ordinal)?;
        let run_id = RunId::new();
        let index = usize::from(step.ordinal) - 1;

        let mut state = StepState::pending(step);
        state.mark_running(Utc::now());
        self.inner.ad_hoc.write().await[index] = Some(state.clone());
        info!(step = step.name, run_id = %run_id, "ad hoc step started");

        let (sink, mut progress_rx) = ProgressSink::channel();
        let executor = self.inner.executors.create(
            StepContext {
                run_id: run_id.clone(),
                config: Arc::new(config),
            },
            sink,
        );
        let work = async move {
            let outcome = dispatch(executor.as_ref(), step.kind).await;
            drop(executor);
            outcome
        };
        let progress = async {
            let mut last = None;
            while let Some(p) = progress_rx.recv().await {
                trace!(processed = p.items_processed, total = p.total_items, "ad hoc progress");
                last = Some(p);
            }
            last
        };
        let (outcome, last) = tokio::join!(work, progress);

        if let Some(p) = last {
            state.record_progress(p.items_processed, p.total_items);
        }
        let (result, error) = match outcome {
            Ok(result) => {
                state.mark_completed(Utc::now());
                info!(step = step.name, items = result.items_processed, "ad hoc step completed");
                (Some(result), None)
            }
            Err(err) => {
                let err = match err {
                    e @ CodeKbError::StepExecution { .. } => e,
                    other => step.failure(other.to_string()),
                };
                let message = err.to_string();
                state.mark_failed(Utc::now(), message.clone());
                warn!(step = step.name, error = %message, "ad hoc step failed");
                (None, Some(message))
            }
        };
        self.inner.ad_hoc.write().await[index] = Some(state.clone());

        Ok(AdHocStepRun {
            run_id,
            step,
            state,
            result,
            error,
        })
    }

    /// Per-step view across all runs: the most recently started state of each
    /// step, or `pending` if it never ran.
    pub async fn steps_status(&self) -> Vec<StepState> {
        let mut latest: Vec<Option<StepState>> = self.inner.ad_hoc.read().await.clone();

        let runs: Vec<Arc<PipelineRun>> = self.inner.runs.read().await.values().cloned().collect();
        for run in runs {
            for (slot, state) in latest.iter_mut().zip(run.steps_status().await) {
                if state.started_at.is_none() {
                    continue;
                }
                let newer = slot
                    .as_ref()
                    .is_none_or(|current| current.started_at < state.started_at);
                if newer {
                    *slot = Some(state);
                }
            }
        }

        STEPS
            .iter()
            .zip(latest)
            .map(|(descriptor, state)| state.unwrap_or_else(|| StepState::pending(descriptor)))
            .collect()
    }
}

/// Forward a run's events to the log and the broadcaster until it ends.
async fn relay_events(run_id: RunId, mut events: EventStream, broadcaster: Broadcaster) {
    while let Some(event) = events.next().await {
        match &event {
            PipelineEvent::Progress { .. } => trace!(run_id = %run_id, event = event.name(), "run event"),
            _ => debug!(run_id = %run_id, event = event.name(), "run event"),
        }
        broadcaster.broadcast(&run_id, &event);
        if event.is_terminal() {
            break;
        }
    }
}

async fn sweep_loop(
    registry: Weak<Inner>,
    token: CancellationToken,
    interval: Duration,
    retention: Duration,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = registry.upgrade() else { break };
                let evicted = Registry { inner }.evict_stale(Utc::now(), retention).await;
                if !evicted.is_empty() {
                    info!(count = evicted.len(), "evicted finished runs");
                }
            }
        }
    }
}
