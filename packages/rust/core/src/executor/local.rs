//! Built-in executor that works directly on the local project tree.
//!
//! Each step re-scans the project, processes files one by one while reporting
//! progress, and writes a JSON artifact under `<artifact_root>/<run_id>/`.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use codekb_shared::{CodeKbError, PipelineConfig, Result, StepKind};

use super::scan::{FileSelector, SourceFile, collect_files};
use super::{ProgressSink, StepContext, StepExecutor, StepExecutorFactory, StepResult};

/// Lines per embedding chunk.
const CHUNK_LINES: usize = 40;

static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^\s*(?:use\s+([\w:]+)|import\s+(?:.*?\s+from\s+)?["']?([\w./@-]+)["']?|from\s+([\w.]+)\s+import|#include\s+[<"]([^>"]+)[>"]|.*require\(\s*["']([^"']+)["']\s*\))"#,
    )
    .expect("valid import regex")
});

static SYMBOL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:export\s+)?(?:async\s+)?(?:fn|def|class|struct|enum|trait|interface|func|function|type)\s+([A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("valid symbol regex")
});

/// Creates [`LocalExecutor`]s writing under a shared artifact root.
#[derive(Debug, Clone)]
pub struct LocalExecutorFactory {
    artifact_root: PathBuf,
}

impl LocalExecutorFactory {
    pub fn new(artifact_root: impl Into<PathBuf>) -> Self {
        Self {
            artifact_root: artifact_root.into(),
        }
    }
}

impl StepExecutorFactory for LocalExecutorFactory {
    fn create(&self, ctx: StepContext, progress: ProgressSink) -> Box<dyn StepExecutor> {
        let artifact_dir = self.artifact_root.join(ctx.run_id.to_string());
        Box::new(LocalExecutor {
            config: ctx.config,
            progress,
            artifact_dir,
        })
    }
}

/// Executor bound to one run's configuration.
pub struct LocalExecutor {
    config: Arc<PipelineConfig>,
    progress: ProgressSink,
    artifact_dir: PathBuf,
}

impl LocalExecutor {
    async fn scan(&self, kind: StepKind) -> Result<Vec<SourceFile>> {
        let config = Arc::clone(&self.config);
        let files = tokio::task::spawn_blocking(move || {
            let selector = FileSelector::from_config(&config)?;
            collect_files(&config.project_path, &selector)
        })
        .await
        .map_err(|e| kind.descriptor().failure(format!("scan task aborted: {e}")))??;
        Ok(files)
    }

    /// Apply `per_file` to every selected file and write the step artifact.
    async fn process<F>(&self, kind: StepKind, per_file: F, extra: Value) -> Result<StepResult>
    where
        F: Fn(&SourceFile, &str) -> Value,
    {
        let files = self.scan(kind).await?;
        let total = files.len() as u64;
        let mut entries = Vec::with_capacity(files.len());
        let mut skipped = Vec::new();

        for (i, file) in files.iter().enumerate() {
            match tokio::fs::read_to_string(&file.path).await {
                Ok(content) => entries.push(per_file(file, &content)),
                Err(e) => {
                    debug!(file = %file.relative, error = %e, "skipping unreadable file");
                    skipped.push(file.relative.clone());
                }
            }
            self.progress.report(i as u64 + 1, total, file.relative.clone());
        }

        let processed = entries.len() as u64;
        let mut summary = json!({
            "files": processed,
            "skipped": skipped,
        });
        if let (Value::Object(summary), Value::Object(extra)) = (&mut summary, extra) {
            summary.extend(extra);
        }

        let artifact = self
            .write_artifact(kind, &json!({ "summary": summary, "entries": entries }))
            .await?;

        Ok(StepResult {
            items_processed: processed,
            artifacts: vec![artifact],
            summary,
        })
    }

    async fn write_artifact(&self, kind: StepKind, body: &Value) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.artifact_dir)
            .await
            .map_err(|e| CodeKbError::io(&self.artifact_dir, e))?;

        let descriptor = kind.descriptor();
        let path = self
            .artifact_dir
            .join(format!("{}-{}.json", descriptor.ordinal, descriptor.name));
        let bytes = serde_json::to_vec_pretty(body)?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| CodeKbError::io(&path, e))?;
        Ok(path)
    }
}

#[async_trait]
impl StepExecutor for LocalExecutor {
    #[instrument(skip_all, fields(project = %self.config.project_path.display()))]
    async fn parse(&self) -> Result<StepResult> {
        self.process(
            StepKind::Parsing,
            |file, content| {
                json!({
                    "path": file.relative,
                    "lines": content.lines().count(),
                    "bytes": content.len(),
                })
            },
            json!({ "forceReparse": self.config.force_reparse }),
        )
        .await
    }

    #[instrument(skip_all)]
    async fn analyze_dependencies(&self) -> Result<StepResult> {
        self.process(
            StepKind::DependencyAnalysis,
            |file, content| {
                let imports: Vec<&str> = IMPORT_RE
                    .captures_iter(content)
                    .filter_map(|caps| caps.iter().skip(1).flatten().next())
                    .map(|m| m.as_str())
                    .collect();
                json!({ "path": file.relative, "imports": imports })
            },
            json!({}),
        )
        .await
    }

    #[instrument(skip_all, fields(model = %self.config.enrichment_model))]
    async fn enrich(&self) -> Result<StepResult> {
        self.process(
            StepKind::SemanticEnrichment,
            |file, content| {
                let symbols: Vec<&str> = SYMBOL_RE
                    .captures_iter(content)
                    .filter_map(|caps| caps.get(1))
                    .map(|m| m.as_str())
                    .collect();
                json!({ "path": file.relative, "symbols": symbols })
            },
            json!({ "model": self.config.enrichment_model }),
        )
        .await
    }

    #[instrument(skip_all, fields(model = %self.config.embedding_model))]
    async fn vectorize(&self) -> Result<StepResult> {
        self.process(
            StepKind::Vectorization,
            |file, content| {
                let lines = content.lines().count();
                json!({ "path": file.relative, "chunks": lines.div_ceil(CHUNK_LINES) })
            },
            json!({ "model": self.config.embedding_model, "chunkLines": CHUNK_LINES }),
        )
        .await
    }

    #[instrument(skip_all)]
    async fn build_index(&self) -> Result<StepResult> {
        self.process(
            StepKind::Indexing,
            |file, content| {
                json!({
                    "path": file.relative,
                    "terms": content.split_whitespace().count(),
                })
            },
            json!({ "generatedAt": chrono::Utc::now().to_rfc3339() }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use tokio::sync::mpsc;

    use crate::executor::{StepProgress, dispatch};
    use codekb_shared::RunId;

    fn project() -> PathBuf {
        let root = std::env::temp_dir().join(format!("codekb_local_{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(root.join("src")).expect("mkdir");
        std::fs::write(
            root.join("src/lib.rs"),
            "use std::fmt;\nuse crate::util;\n\npub fn render() {}\nstruct Thing;\n",
        )
        .expect("write");
        std::fs::write(
            root.join("src/app.py"),
            "import os\nfrom pathlib import Path\n\ndef main():\n    pass\n",
        )
        .expect("write");
        root
    }

    fn executor(
        root: &Path,
        artifacts: &Path,
    ) -> (Box<dyn StepExecutor>, mpsc::UnboundedReceiver<StepProgress>) {
        let config = PipelineConfig {
            project_path: root.to_path_buf(),
            file_patterns: vec!["**/*.rs".into(), "**/*.py".into()],
            selected_files: None,
            excluded_files: None,
            force_reparse: true,
            enrichment_model: "enrich-model".into(),
            embedding_model: "embed-model".into(),
        };
        let (sink, rx) = ProgressSink::channel();
        let factory = LocalExecutorFactory::new(artifacts);
        let ctx = StepContext {
            run_id: RunId::new(),
            config: Arc::new(config),
        };
        (factory.create(ctx, sink), rx)
    }

    #[tokio::test]
    async fn parse_writes_inventory_artifact() {
        let root = project();
        let artifacts = root.join("artifacts-out");
        let (exec, mut rx) = executor(&root, &artifacts);

        let result = dispatch(exec.as_ref(), StepKind::Parsing).await.expect("parse");
        assert_eq!(result.items_processed, 2);
        assert_eq!(result.summary["forceReparse"], true);
        assert_eq!(result.artifacts.len(), 1);
        assert!(result.artifacts[0].ends_with("1-parsing.json"));
        assert!(result.artifacts[0].exists());

        drop(exec);
        let mut reports = 0;
        while let Some(p) = rx.recv().await {
            reports += 1;
            assert_eq!(p.total_items, 2);
        }
        assert_eq!(reports, 2);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn dependency_and_symbol_extraction() {
        let root = project();
        let artifacts = root.join("artifacts-out");
        let (exec, _rx) = executor(&root, &artifacts);

        let deps = exec.analyze_dependencies().await.expect("deps");
        let body: Value = serde_json::from_slice(
            &std::fs::read(&deps.artifacts[0]).expect("read artifact"),
        )
        .expect("json");
        let entries = body["entries"].as_array().expect("entries");
        let py = entries.iter().find(|e| e["path"] == "src/app.py").expect("py entry");
        assert_eq!(py["imports"], json!(["os", "pathlib"]));
        let rs = entries.iter().find(|e| e["path"] == "src/lib.rs").expect("rs entry");
        assert_eq!(rs["imports"], json!(["std::fmt", "crate::util"]));

        let enriched = exec.enrich().await.expect("enrich");
        assert_eq!(enriched.summary["model"], "enrich-model");
        let body: Value = serde_json::from_slice(
            &std::fs::read(&enriched.artifacts[0]).expect("read artifact"),
        )
        .expect("json");
        let rs = body["entries"]
            .as_array()
            .and_then(|e| e.iter().find(|e| e["path"] == "src/lib.rs"))
            .expect("rs entry");
        assert_eq!(rs["symbols"], json!(["render", "Thing"]));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn missing_project_fails() {
        let root = std::env::temp_dir().join(format!("codekb_missing_{}", uuid::Uuid::now_v7()));
        let artifacts = std::env::temp_dir().join(format!("codekb_art_{}", uuid::Uuid::now_v7()));
        let (exec, _rx) = executor(&root, &artifacts);
        assert!(exec.parse().await.is_err());
    }
}
