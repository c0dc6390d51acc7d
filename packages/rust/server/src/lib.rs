//! HTTP and SSE surface for the CodeKB pipeline registry.
//!
//! Handlers are thin: they translate requests into [`Registry`] calls and map
//! [`CodeKbError`](codekb_shared::CodeKbError)s to status codes via [`ApiError`].

mod dto;
mod error;
mod handlers;
mod sse;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tracing::info;

use codekb_core::Registry;
use codekb_shared::{AppConfig, CodeKbError, Result};

pub use dto::StartPipelineRequest;
pub use error::ApiError;

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    /// Defaults for fields a request omits.
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(registry: Registry, config: AppConfig) -> Self {
        Self {
            registry,
            config: Arc::new(config),
        }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/pipeline", get(handlers::list_pipelines))
        .route("/pipeline/start", post(handlers::start_pipeline))
        .route("/pipeline/steps/status", get(handlers::steps_status))
        .route("/pipeline/stream/global", get(handlers::stream_global))
        .route("/pipeline/step/{step_id}/run", post(handlers::run_step))
        .route(
            "/pipeline/{id}",
            get(handlers::get_pipeline).delete(handlers::cancel_pipeline),
        )
        .route("/pipeline/{id}/stream", get(handlers::stream_pipeline))
        .with_state(state)
}

/// Bind a listener on `addr`.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| CodeKbError::Server(format!("failed to bind {addr}: {e}")))
}

/// Serve until `shutdown` resolves, then drain open requests.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = listener
        .local_addr()
        .map_err(|e| CodeKbError::Server(e.to_string()))?;
    info!(%addr, "pipeline server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| CodeKbError::Server(e.to_string()))?;

    info!("pipeline server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;
    use std::time::Duration;

    use async_trait::async_trait;
    use codekb_core::{
        LocalExecutorFactory, ProgressSink, RegistrySettings, StepContext, StepExecutor,
        StepExecutorFactory, StepResult,
    };
    use serde_json::{Value, json};
    use tokio::sync::Notify;

    /// Executor whose steps never finish.
    struct Stuck(Arc<Notify>);

    #[async_trait]
    impl StepExecutor for Stuck {
        async fn parse(&self) -> Result<StepResult> {
            self.0.notified().await;
            Ok(StepResult::default())
        }
        async fn analyze_dependencies(&self) -> Result<StepResult> {
            Ok(StepResult::default())
        }
        async fn enrich(&self) -> Result<StepResult> {
            Ok(StepResult::default())
        }
        async fn vectorize(&self) -> Result<StepResult> {
            Ok(StepResult::default())
        }
        async fn build_index(&self) -> Result<StepResult> {
            Ok(StepResult::default())
        }
    }

    struct StuckFactory(Arc<Notify>);

    impl StepExecutorFactory for StuckFactory {
        fn create(&self, _ctx: StepContext, _progress: ProgressSink) -> Box<dyn StepExecutor> {
            Box::new(Stuck(Arc::clone(&self.0)))
        }
    }

    fn scratch(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{prefix}_{}", uuid::Uuid::now_v7()))
    }

    fn project() -> PathBuf {
        let root = scratch("codekb_server_project");
        std::fs::create_dir_all(root.join("src")).expect("mkdir");
        std::fs::write(root.join("src/main.rs"), "use std::io;\nfn main() {}\n").expect("write");
        root
    }

    fn settings(max_concurrent_runs: usize) -> RegistrySettings {
        RegistrySettings {
            max_concurrent_runs,
            stream_close_grace: Duration::from_millis(50),
            ..RegistrySettings::default()
        }
    }

    async fn spawn_server(registry: Registry) -> String {
        let listener = bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let state = AppState::new(registry, AppConfig::default());
        tokio::spawn(serve(listener, state, std::future::pending()));
        format!("http://{addr}")
    }

    async fn local_server() -> String {
        let factory = LocalExecutorFactory::new(scratch("codekb_server_artifacts"));
        spawn_server(Registry::new(settings(3), Arc::new(factory))).await
    }

    async fn stuck_server(max: usize) -> String {
        let factory = StuckFactory(Arc::new(Notify::new()));
        spawn_server(Registry::new(settings(max), Arc::new(factory))).await
    }

    /// Read SSE frames until one of type `until` arrives.
    async fn read_frames(response: &mut reqwest::Response, until: &str) -> Vec<Value> {
        let mut buffer = String::new();
        let mut frames = Vec::new();
        loop {
            let chunk = tokio::time::timeout(Duration::from_secs(10), response.chunk())
                .await
                .expect("stream stalled")
                .expect("chunk")
                .expect("stream ended early");
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(end) = buffer.find("\n\n") {
                let block: String = buffer.drain(..end + 2).collect();
                for line in block.lines() {
                    if let Some(data) = line.strip_prefix("data: ") {
                        let frame: Value = serde_json::from_str(data).expect("frame json");
                        let done = frame["type"] == until;
                        frames.push(frame);
                        if done {
                            return frames;
                        }
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn start_then_query_and_list() {
        let base = local_server().await;
        let client = reqwest::Client::new();
        let root = project();

        let body: Value = client
            .post(format!("{base}/pipeline/start"))
            .json(&json!({ "projectPath": root, "filePatterns": ["**/*.rs"] }))
            .send()
            .await
            .expect("start")
            .json()
            .await
            .expect("json");
        assert_eq!(body["success"], true);
        let run_id = body["pipeline"]["runId"].as_str().expect("run id").to_string();
        assert!(body["pipeline"]["createdAt"].is_string());

        let mut status = Value::Null;
        for _ in 0..200 {
            let body: Value = client
                .get(format!("{base}/pipeline/{run_id}"))
                .send()
                .await
                .expect("get")
                .json()
                .await
                .expect("json");
            status = body["pipeline"]["status"].clone();
            if status == "completed" {
                assert_eq!(body["pipeline"]["results"].as_object().map(|r| r.len()), Some(5));
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, "completed");

        let list: Value = client
            .get(format!("{base}/pipeline"))
            .send()
            .await
            .expect("list")
            .json()
            .await
            .expect("json");
        assert_eq!(list["pipelines"].as_array().map(Vec::len), Some(1));
        assert_eq!(list["pipelines"][0]["runId"], run_id);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn capacity_exceeded_is_500() {
        let base = stuck_server(1).await;
        let client = reqwest::Client::new();
        let body = json!({ "projectPath": "/tmp/anywhere" });

        let first = client
            .post(format!("{base}/pipeline/start"))
            .json(&body)
            .send()
            .await
            .expect("first");
        assert_eq!(first.status(), 200);

        let second = client
            .post(format!("{base}/pipeline/start"))
            .json(&body)
            .send()
            .await
            .expect("second");
        assert_eq!(second.status(), 500);
        let err: Value = second.json().await.expect("json");
        assert_eq!(err["success"], false);
        assert!(err["error"].as_str().is_some_and(|e| e.contains("capacity")));
    }

    #[tokio::test]
    async fn unknown_runs_are_404() {
        let base = stuck_server(3).await;
        let client = reqwest::Client::new();
        let missing = codekb_shared::RunId::new();

        for url in [
            format!("{base}/pipeline/{missing}"),
            format!("{base}/pipeline/not-a-uuid"),
            format!("{base}/pipeline/{missing}/stream"),
        ] {
            let response = client.get(&url).send().await.expect("get");
            assert_eq!(response.status(), 404, "{url}");
        }
        let response = client
            .delete(format!("{base}/pipeline/{missing}"))
            .send()
            .await
            .expect("delete");
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn cancel_reports_cancelled() {
        let base = stuck_server(3).await;
        let client = reqwest::Client::new();
        let started: Value = client
            .post(format!("{base}/pipeline/start"))
            .json(&json!({ "projectPath": "/tmp/anywhere" }))
            .send()
            .await
            .expect("start")
            .json()
            .await
            .expect("json");
        let run_id = started["pipeline"]["runId"].as_str().expect("run id");

        let body: Value = client
            .delete(format!("{base}/pipeline/{run_id}"))
            .send()
            .await
            .expect("delete")
            .json()
            .await
            .expect("json");
        assert_eq!(body["success"], true);
        assert_eq!(body["pipeline"]["runId"], run_id);
        assert_eq!(body["pipeline"]["status"], "cancelled");
    }

    #[tokio::test]
    async fn step_run_validates_ordinal() {
        let base = local_server().await;
        let client = reqwest::Client::new();
        let root = project();
        let body = json!({ "projectPath": root });

        for bad in ["0", "6", "abc"] {
            let response = client
                .post(format!("{base}/pipeline/step/{bad}/run"))
                .json(&body)
                .send()
                .await
                .expect("post");
            assert_eq!(response.status(), 400, "step {bad}");
        }

        let ok: Value = client
            .post(format!("{base}/pipeline/step/2/run"))
            .json(&body)
            .send()
            .await
            .expect("post")
            .json()
            .await
            .expect("json");
        assert_eq!(ok["success"], true);
        assert_eq!(ok["step"]["step"]["name"], "dependency-analysis");
        assert_eq!(ok["step"]["state"]["status"], "completed");

        let status: Value = client
            .get(format!("{base}/pipeline/steps/status"))
            .send()
            .await
            .expect("status")
            .json()
            .await
            .expect("json");
        let steps = status["steps"].as_array().expect("steps");
        assert_eq!(steps.len(), 5);
        assert_eq!(steps[1]["status"], "completed");
        assert_eq!(steps[0]["status"], "pending");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn malformed_body_is_400() {
        let base = local_server().await;
        let response = reqwest::Client::new()
            .post(format!("{base}/pipeline/start"))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .expect("post");
        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.expect("json");
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn streams_deliver_run_events() {
        let base = local_server().await;
        let client = reqwest::Client::new();
        let root = project();

        let mut global = client
            .get(format!("{base}/pipeline/stream/global"))
            .send()
            .await
            .expect("global stream");
        assert_eq!(global.status(), 200);
        let first = read_frames(&mut global, "connected").await;
        assert_eq!(first[0]["scope"], "global");

        let started: Value = client
            .post(format!("{base}/pipeline/start"))
            .json(&json!({ "projectPath": root }))
            .send()
            .await
            .expect("start")
            .json()
            .await
            .expect("json");
        let run_id = started["pipeline"]["runId"].as_str().expect("run id").to_string();

        let frames = read_frames(&mut global, "completed").await;
        let kinds: Vec<&str> = frames.iter().filter_map(|f| f["type"].as_str()).collect();
        assert_eq!(kinds.iter().filter(|k| **k == "step_completed").count(), 5);
        assert!(kinds.contains(&"progress"));
        assert!(frames.iter().all(|f| f["runId"] == run_id.as_str()));

        let mut per_run = client
            .get(format!("{base}/pipeline/{run_id}/stream"))
            .send()
            .await
            .expect("run stream");
        let frames = read_frames(&mut per_run, "connection_closing").await;
        let kinds: Vec<&str> = frames.iter().filter_map(|f| f["type"].as_str()).collect();
        assert_eq!(kinds, vec!["connected", "status", "connection_closing"]);
        assert_eq!(frames[1]["pipeline"]["status"], "completed");

        let _ = std::fs::remove_dir_all(&root);
    }
}
