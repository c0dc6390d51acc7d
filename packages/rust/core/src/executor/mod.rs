//! Step executor contract.
//!
//! The orchestration core never does the per-step work itself. A
//! [`StepExecutorFactory`] builds one [`StepExecutor`] per step invocation,
//! bound to the run's [`PipelineConfig`]; [`dispatch`] routes a step to the
//! matching executor method.

mod local;
mod scan;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use codekb_shared::{PipelineConfig, Result, RunId, StepKind};

pub use local::{LocalExecutor, LocalExecutorFactory};
pub use scan::{FileSelector, SourceFile, collect_files, glob_to_regex};

// ---------------------------------------------------------------------------
// Results and progress
// ---------------------------------------------------------------------------

/// Output of a successful step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    /// Number of items (files, chunks, ...) the step handled.
    pub items_processed: u64,
    /// Files written by the step. Rollback deletes these.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<PathBuf>,
    /// Step-specific payload.
    #[serde(default)]
    pub summary: serde_json::Value,
}

/// One progress report from an executor.
#[derive(Debug, Clone, PartialEq)]
pub struct StepProgress {
    pub items_processed: u64,
    /// Zero when the total is not known yet.
    pub total_items: u64,
    pub message: Option<String>,
}

/// Handle an executor uses to report progress to its run.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<StepProgress>,
}

impl ProgressSink {
    /// Create a sink and the receiver the run drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StepProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report `processed` of `total` items. Silently dropped once the run stops listening.
    pub fn report(&self, processed: u64, total: u64, message: impl Into<String>) {
        let _ = self.tx.send(StepProgress {
            items_processed: processed,
            total_items: total,
            message: Some(message.into()),
        });
    }
}

// ---------------------------------------------------------------------------
// Executor traits
// ---------------------------------------------------------------------------

/// Everything an executor is bound to.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub config: Arc<PipelineConfig>,
}

/// Performs the work of the five pipeline steps.
///
/// Errors should be built with [`StepDescriptor::failure`](codekb_shared::StepDescriptor::failure);
/// any other error is wrapped into a step execution error by the run.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn parse(&self) -> Result<StepResult>;

    async fn analyze_dependencies(&self) -> Result<StepResult>;

    async fn enrich(&self) -> Result<StepResult>;

    async fn vectorize(&self) -> Result<StepResult>;

    async fn build_index(&self) -> Result<StepResult>;
}

/// Builds executors. Called once per step so each step gets a fresh progress sink.
pub trait StepExecutorFactory: Send + Sync {
    fn create(&self, ctx: StepContext, progress: ProgressSink) -> Box<dyn StepExecutor>;
}

/// Route a step to the executor method that implements it.
pub async fn dispatch(executor: &dyn StepExecutor, kind: StepKind) -> Result<StepResult> {
    match kind {
        StepKind::Parsing => executor.parse().await,
        StepKind::DependencyAnalysis => executor.analyze_dependencies().await,
        StepKind::SemanticEnrichment => executor.enrich().await,
        StepKind::Vectorization => executor.vectorize().await,
        StepKind::Indexing => executor.build_index().await,
    }
}
