//! Scripted executors for exercising runs and the registry in tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use codekb_shared::{CodeKbError, PipelineConfig, Result, RunId, StepKind};

use crate::executor::{ProgressSink, StepContext, StepExecutor, StepExecutorFactory, StepResult};

pub(crate) fn test_config() -> PipelineConfig {
    PipelineConfig {
        project_path: std::env::temp_dir().join("codekb-test-project"),
        file_patterns: vec!["**/*.rs".into()],
        selected_files: None,
        excluded_files: None,
        force_reparse: false,
        enrichment_model: "enrich-test".into(),
        embedding_model: "embed-test".into(),
    }
}

/// What a scripted step does when invoked.
#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    Succeed,
    /// Fail with a step execution error.
    Fail(String),
    /// Fail with an error that is not tied to the step.
    FailPlain(String),
    /// Wait for [`ScriptedFactory::release`], then succeed.
    Block,
}

#[derive(Default)]
struct Shared {
    behaviors: Mutex<HashMap<u8, Behavior>>,
    calls: Mutex<Vec<u8>>,
    artifacts: Mutex<Vec<PathBuf>>,
    artifact_root: Mutex<Option<PathBuf>>,
    blocker: Mutex<Option<PathBuf>>,
    started: Notify,
    release: Notify,
}

#[derive(Clone, Default)]
pub(crate) struct ScriptedFactory {
    shared: Arc<Shared>,
}

impl ScriptedFactory {
    pub(crate) fn succeeding() -> Self {
        Self::default()
    }

    pub(crate) fn with(self, ordinal: u8, behavior: Behavior) -> Self {
        self.shared
            .behaviors
            .lock()
            .expect("behaviors lock")
            .insert(ordinal, behavior);
        self
    }

    /// Make successful steps write a real artifact file.
    pub(crate) fn with_artifacts(self) -> Self {
        let root = std::env::temp_dir().join(format!("codekb_scripted_{}", uuid::Uuid::now_v7()));
        *self.shared.artifact_root.lock().expect("root lock") = Some(root);
        self
    }

    /// Make successful steps also report an artifact whose parent is a regular
    /// file, so it can never be removed.
    pub(crate) fn with_unremovable_artifact(self) -> Self {
        let root = std::env::temp_dir().join(format!("codekb_blocked_{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&root).expect("blocker dir");
        let blocker = root.join("blocker");
        std::fs::write(&blocker, "not a directory").expect("blocker file");
        *self.shared.blocker.lock().expect("blocker lock") = Some(blocker);
        self
    }

    /// Ordinals of every step invoked, across all runs.
    pub(crate) fn calls(&self) -> Vec<u8> {
        self.shared.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn artifacts(&self) -> Vec<PathBuf> {
        self.shared.artifacts.lock().expect("artifacts lock").clone()
    }

    /// Wait until step `ordinal` has been invoked at least once.
    pub(crate) async fn wait_started(&self, ordinal: u8) {
        loop {
            let notified = self.shared.started.notified();
            if self.calls().contains(&ordinal) {
                return;
            }
            notified.await;
        }
    }

    /// Let one blocked step finish.
    pub(crate) fn release(&self) {
        self.shared.release.notify_one();
    }
}

impl StepExecutorFactory for ScriptedFactory {
    fn create(&self, ctx: StepContext, progress: ProgressSink) -> Box<dyn StepExecutor> {
        Box::new(ScriptedExecutor {
            shared: Arc::clone(&self.shared),
            run_id: ctx.run_id,
            progress,
        })
    }
}

struct ScriptedExecutor {
    shared: Arc<Shared>,
    run_id: RunId,
    progress: ProgressSink,
}

impl ScriptedExecutor {
    async fn step(&self, kind: StepKind) -> Result<StepResult> {
        let descriptor = kind.descriptor();
        self.shared
            .calls
            .lock()
            .expect("calls lock")
            .push(descriptor.ordinal);
        self.shared.started.notify_waiters();

        let behavior = self
            .shared
            .behaviors
            .lock()
            .expect("behaviors lock")
            .get(&descriptor.ordinal)
            .cloned()
            .unwrap_or(Behavior::Succeed);

        self.progress.report(1, 1, descriptor.name);

        match behavior {
            Behavior::Succeed => {}
            Behavior::Fail(msg) => return Err(descriptor.failure(msg)),
            Behavior::FailPlain(msg) => return Err(CodeKbError::Server(msg)),
            Behavior::Block => self.shared.release.notified().await,
        }

        let root = self.shared.artifact_root.lock().expect("root lock").clone();
        let mut artifacts = Vec::new();
        if let Some(root) = root {
            let dir = root.join(self.run_id.to_string());
            std::fs::create_dir_all(&dir).expect("artifact dir");
            let path = dir.join(format!("{}.json", descriptor.ordinal));
            std::fs::write(&path, "{}").expect("artifact write");
            self.shared
                .artifacts
                .lock()
                .expect("artifacts lock")
                .push(path.clone());
            artifacts.push(path);
        }
        if let Some(blocker) = self.shared.blocker.lock().expect("blocker lock").clone() {
            artifacts.push(blocker.join(format!("{}.json", descriptor.ordinal)));
        }

        Ok(StepResult {
            items_processed: 1,
            artifacts,
            summary: serde_json::json!({ "step": descriptor.name }),
        })
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn parse(&self) -> Result<StepResult> {
        self.step(StepKind::Parsing).await
    }

    async fn analyze_dependencies(&self) -> Result<StepResult> {
        self.step(StepKind::DependencyAnalysis).await
    }

    async fn enrich(&self) -> Result<StepResult> {
        self.step(StepKind::SemanticEnrichment).await
    }

    async fn vectorize(&self) -> Result<StepResult> {
        self.step(StepKind::Vectorization).await
    }

    async fn build_index(&self) -> Result<StepResult> {
        self.step(StepKind::Indexing).await
    }
}
