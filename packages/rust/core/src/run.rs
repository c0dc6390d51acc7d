//! Pipeline run state machine.
//!
//! A [`PipelineRun`] drives the five catalog steps strictly in order through a
//! [`StepExecutorFactory`], publishing [`PipelineEvent`]s as it goes.
//!
//! Status moves `idle → running → {completed | failed | cancelled}` (or
//! `idle → cancelled` when cancelled before starting) and never leaves a
//! terminal state. Cancellation is cooperative: the token is checked between
//! steps, and a step already inside its executor runs to completion.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use codekb_shared::{
    CodeKbError, PipelineConfig, Result, RunId, RunStatus, STEPS, StepDescriptor, StepState,
};

use crate::events::{EventChannel, EventStream, PipelineEvent};
use crate::executor::{ProgressSink, StepContext, StepExecutorFactory, StepProgress, StepResult, dispatch};
use crate::rollback;

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Read-only projection of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_ordinal: Option<u8>,
    pub steps: Vec<StepState>,
    pub results: BTreeMap<String, StepResult>,
    pub config: PipelineConfig,
    pub cancel_requested: bool,
    pub rolled_back: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Listing entry for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_ordinal: Option<u8>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub project_path: PathBuf,
    pub file_patterns: Vec<String>,
}

// ---------------------------------------------------------------------------
// PipelineRun
// ---------------------------------------------------------------------------

/// Mutable part of a run, guarded by one lock.
#[derive(Debug)]
struct RunState {
    status: RunStatus,
    current_step: Option<u8>,
    steps: Vec<StepState>,
    results: BTreeMap<String, StepResult>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    rolled_back: bool,
}

/// One execution of the step sequence for a configuration.
pub struct PipelineRun {
    id: RunId,
    config: Arc<PipelineConfig>,
    created_at: DateTime<Utc>,
    state: RwLock<RunState>,
    cancel_token: CancellationToken,
    events: EventChannel,
    executors: Arc<dyn StepExecutorFactory>,
}

impl std::fmt::Debug for PipelineRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRun")
            .field("id", &self.id)
            .field("project", &self.config.project_path)
            .finish_non_exhaustive()
    }
}

impl PipelineRun {
    /// Create an `idle` run with every step `pending`.
    pub fn new(
        config: PipelineConfig,
        executors: Arc<dyn StepExecutorFactory>,
        event_buffer: usize,
    ) -> Self {
        Self {
            id: RunId::new(),
            config: Arc::new(config),
            created_at: Utc::now(),
            state: RwLock::new(RunState {
                status: RunStatus::Idle,
                current_step: None,
                steps: StepState::initial_states(),
                results: BTreeMap::new(),
                started_at: None,
                completed_at: None,
                error_message: None,
                rolled_back: false,
            }),
            cancel_token: CancellationToken::new(),
            events: EventChannel::new(event_buffer),
            executors,
        }
    }

    pub fn id(&self) -> &RunId {
        &self.id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Subscribe to this run's events from now on.
    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    pub async fn status(&self) -> RunStatus {
        self.state.read().await.status
    }

    pub async fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.completed_at
    }

    /// Current step states, in catalog order.
    pub async fn steps_status(&self) -> Vec<StepState> {
        self.state.read().await.steps.clone()
    }

    pub async fn snapshot(&self) -> RunSnapshot {
        let state = self.state.read().await;
        RunSnapshot {
            run_id: self.id.clone(),
            status: state.status,
            current_step_ordinal: state.current_step,
            steps: state.steps.clone(),
            results: state.results.clone(),
            config: (*self.config).clone(),
            cancel_requested: self.cancel_token.is_cancelled(),
            rolled_back: state.rolled_back,
            created_at: self.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            error_message: state.error_message.clone(),
        }
    }

    pub async fn summary(&self) -> RunSummary {
        let state = self.state.read().await;
        RunSummary {
            run_id: self.id.clone(),
            status: state.status,
            current_step_ordinal: state.current_step,
            created_at: self.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            project_path: self.config.project_path.clone(),
            file_patterns: self.config.file_patterns.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Driving the steps
    // -----------------------------------------------------------------------

    /// Execute all steps in order. Returns once the run is terminal.
    ///
    /// Does nothing if the run already left `idle` (e.g. it was cancelled
    /// before the scheduler got to it).
    #[instrument(skip_all, fields(run_id = %self.id))]
    pub async fn run(&self) {
        {
            let mut state = self.state.write().await;
            if state.status != RunStatus::Idle {
                debug!(status = %state.status, "run not idle, nothing to execute");
                return;
            }
            state.status = RunStatus::Running;
            state.started_at = Some(Utc::now());
        }
        info!(project = %self.config.project_path.display(), "pipeline run started");

        for step in STEPS.iter() {
            if self.cancel_token.is_cancelled() {
                self.finish_cancelled(step).await;
                return;
            }
            if let Err(err) = self.execute_step(step).await {
                self.finish_failed(err).await;
                return;
            }
        }

        if self.cancel_token.is_cancelled() {
            info!("cancellation observed after final step");
            self.rollback().await;
            return;
        }
        self.finish_completed().await;
    }

    /// Run one step through a freshly built executor.
    ///
    /// Progress reports are applied to the step state and re-emitted as run
    /// events until the executor (and with it the progress sink) is dropped.
    async fn execute_step(&self, step: &'static StepDescriptor) -> Result<()> {
        let idx = step_index(step);
        {
            let mut state = self.state.write().await;
            state.current_step = Some(step.ordinal);
            state.steps[idx].mark_running(Utc::now());
        }
        info!(step = step.name, ordinal = step.ordinal, "step started");

        let (sink, mut progress_rx) = ProgressSink::channel();
        let executor = self.executors.create(
            StepContext {
                run_id: self.id.clone(),
                config: Arc::clone(&self.config),
            },
            sink,
        );

        let work = async move {
            let outcome = dispatch(executor.as_ref(), step.kind).await;
            drop(executor);
            outcome
        };
        let relay = async {
            while let Some(progress) = progress_rx.recv().await {
                self.record_progress(step, progress).await;
            }
        };
        let (outcome, ()) = tokio::join!(work, relay);

        match outcome {
            Ok(result) => {
                self.complete_step(step, result).await;
                Ok(())
            }
            Err(err) => {
                let err = match err {
                    e @ CodeKbError::StepExecution { .. } => e,
                    other => step.failure(other.to_string()),
                };
                self.fail_step(step, &err).await;
                Err(err)
            }
        }
    }

    async fn record_progress(&self, step: &StepDescriptor, progress: StepProgress) {
        let percent = {
            let mut state = self.state.write().await;
            let step_state = &mut state.steps[step_index(step)];
            step_state.record_progress(progress.items_processed, progress.total_items);
            step_state.progress_percent
        };
        debug!(
            step = step.name,
            processed = progress.items_processed,
            total = progress.total_items,
            "step progress"
        );
        self.events.emit(PipelineEvent::Progress {
            step_ordinal: step.ordinal,
            step_name: step.name.to_string(),
            progress_percent: percent,
            items_processed: progress.items_processed,
            total_items: progress.total_items,
            message: progress.message,
        });
    }

    async fn complete_step(&self, step: &StepDescriptor, result: StepResult) {
        let discarded = {
            let mut state = self.state.write().await;
            let step_state = &mut state.steps[step_index(step)];
            if result.items_processed > step_state.items_processed {
                step_state.items_processed = result.items_processed;
            }
            step_state.total_items = step_state.total_items.max(step_state.items_processed);
            step_state.mark_completed(Utc::now());

            if state.status.is_terminal() {
                true
            } else {
                state.results.insert(step.name.to_string(), result.clone());
                false
            }
        };

        if discarded {
            // The run was cancelled while this step was in flight.
            info!(step = step.name, "discarding result of step finished after cancellation");
            for failure in rollback::cleanup_artifacts(&result.artifacts).await {
                warn!(error = %failure, "rollback cleanup failed");
            }
        } else {
            info!(step = step.name, items = result.items_processed, "step completed");
        }

        self.events.emit(PipelineEvent::StepCompleted {
            step_ordinal: step.ordinal,
            step_name: step.name.to_string(),
            result,
        });
    }

    async fn fail_step(&self, step: &StepDescriptor, err: &CodeKbError) {
        let message = err.to_string();
        {
            let mut state = self.state.write().await;
            state.steps[step_index(step)].mark_failed(Utc::now(), message.clone());
        }
        warn!(step = step.name, error = %message, "step failed");
        self.events.emit(PipelineEvent::StepFailed {
            step_ordinal: step.ordinal,
            step_name: step.name.to_string(),
            error: message,
        });
    }

    async fn finish_completed(&self) {
        let results = {
            let mut state = self.state.write().await;
            if state.status.is_terminal() {
                return;
            }
            state.status = RunStatus::Completed;
            state.completed_at = Some(Utc::now());
            state.results.clone()
        };
        info!(steps = results.len(), "pipeline run completed");
        self.events.emit(PipelineEvent::Completed { results });
    }

    async fn finish_failed(&self, err: CodeKbError) {
        let message = err.to_string();
        let transitioned = {
            let mut state = self.state.write().await;
            if state.status.is_terminal() {
                false
            } else {
                state.status = RunStatus::Failed;
                state.completed_at = Some(Utc::now());
                state.error_message = Some(message.clone());
                true
            }
        };
        if transitioned {
            error!(error = %message, "pipeline run failed");
            self.events.emit(PipelineEvent::Failed { error: message });
        }
        self.rollback().await;
    }

    /// Cancellation seen at a step boundary. `cancel()` already set the status.
    async fn finish_cancelled(&self, next: &StepDescriptor) {
        info!(skipped_from = next.name, "cancellation observed, remaining steps skipped");
        self.rollback().await;
    }

    // -----------------------------------------------------------------------
    // Cancellation and rollback
    // -----------------------------------------------------------------------

    /// Request cancellation and return the resulting status.
    ///
    /// An active run becomes `cancelled` immediately and is rolled back; the
    /// step currently inside its executor is not interrupted. Calling this on a
    /// terminal run changes nothing and reports its status.
    #[instrument(skip_all, fields(run_id = %self.id))]
    pub async fn cancel(&self) -> RunStatus {
        {
            let mut state = self.state.write().await;
            if state.status.is_terminal() {
                debug!(status = %state.status, "cancel on terminal run ignored");
                return state.status;
            }
            self.cancel_token.cancel();
            state.status = RunStatus::Cancelled;
            state.completed_at = Some(Utc::now());
        }
        info!("pipeline run cancelled");
        self.events.emit(PipelineEvent::Cancelled);
        self.rollback().await;
        RunStatus::Cancelled
    }

    /// Clear `results` and delete the artifacts they reference.
    ///
    /// Cleanup failures are logged and otherwise ignored; step states are kept.
    pub async fn rollback(&self) {
        let results = {
            let mut state = self.state.write().await;
            state.rolled_back = true;
            std::mem::take(&mut state.results)
        };
        if results.is_empty() {
            return;
        }

        let artifacts: Vec<PathBuf> = results.into_values().flat_map(|r| r.artifacts).collect();
        let failures = rollback::cleanup_artifacts(&artifacts).await;
        for failure in &failures {
            warn!(error = %failure, "rollback cleanup failed");
        }
        info!(
            artifacts = artifacts.len(),
            failures = failures.len(),
            "rollback finished"
        );
    }
}

fn step_index(step: &StepDescriptor) -> usize {
    usize::from(step.ordinal) - 1
}
