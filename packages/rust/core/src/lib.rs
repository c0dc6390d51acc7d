//! Pipeline orchestration core for CodeKB.
//!
//! A [`Registry`] admits a bounded number of concurrent [`PipelineRun`]s, each
//! of which drives the five catalog steps through a [`StepExecutor`] and emits
//! [`PipelineEvent`]s. The [`Broadcaster`] fans those events out to stream
//! subscribers.

pub mod broadcaster;
pub mod events;
pub mod executor;
pub mod registry;
pub mod rollback;
pub mod run;

#[cfg(test)]
pub(crate) mod testing;

pub use broadcaster::{
    Broadcaster, ConnectionId, StreamConnection, StreamReceiver, SubscriptionTarget,
};
pub use events::{EventChannel, EventStream, PipelineEvent};
pub use executor::{
    LocalExecutor, LocalExecutorFactory, ProgressSink, StepContext, StepExecutor,
    StepExecutorFactory, StepProgress, StepResult,
};
pub use registry::{AdHocStepRun, CancelOutcome, Registry, RegistrySettings, StartedRun};
pub use run::{PipelineRun, RunSnapshot, RunSummary};
