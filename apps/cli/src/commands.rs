//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use codekb_core::{LocalExecutorFactory, PipelineEvent, Registry, RegistrySettings};
use codekb_server::AppState;
use codekb_shared::config::validate;
use codekb_shared::{
    AppConfig, PipelineConfig, RunStatus, STEPS, init_config, load_config, load_config_from,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::signal::shutdown_signal;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// CodeKB: turn a source tree into a searchable knowledge base.
#[derive(Parser)]
#[command(
    name = "codekb",
    version,
    about = "Parse, analyze, enrich, vectorize and index source projects.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.codekb/codekb.toml).
    #[arg(long, global = true, env = "CODEKB_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Serve the pipeline HTTP/SSE API.
    Serve {
        /// Address to listen on.
        #[arg(long)]
        bind: Option<String>,

        /// Maximum number of active pipeline runs.
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Directory step artifacts are written to.
        #[arg(long)]
        artifact_dir: Option<String>,
    },

    /// Run the full pipeline over a project and wait for it to finish.
    Run {
        /// Project root.
        path: PathBuf,

        /// Include glob (repeatable). Defaults to the configured patterns.
        #[arg(short, long = "pattern")]
        patterns: Vec<String>,

        /// Only process these project-relative files (repeatable).
        #[arg(long = "select")]
        selected: Vec<String>,

        /// Skip these project-relative files (repeatable).
        #[arg(long = "exclude")]
        excluded: Vec<String>,

        /// Reparse even if nothing changed.
        #[arg(long)]
        force: bool,

        #[arg(long)]
        enrichment_model: Option<String>,

        #[arg(long)]
        embedding_model: Option<String>,

        /// Directory step artifacts are written to.
        #[arg(long)]
        artifact_dir: Option<String>,
    },

    /// List the pipeline steps.
    Steps,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "codekb=info",
        1 => "codekb=debug",
        _ => "codekb=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Serve {
            bind,
            max_concurrent,
            artifact_dir,
        } => {
            let mut config = resolve_config(config_path.as_ref())?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(max) = max_concurrent {
                config.pipeline.max_concurrent_runs = max;
            }
            if let Some(dir) = artifact_dir {
                config.pipeline.artifact_dir = dir;
            }
            validate(&config)?;
            cmd_serve(config).await
        }
        Command::Run {
            path,
            patterns,
            selected,
            excluded,
            force,
            enrichment_model,
            embedding_model,
            artifact_dir,
        } => {
            let mut config = resolve_config(config_path.as_ref())?;
            if let Some(dir) = artifact_dir {
                config.pipeline.artifact_dir = dir;
            }
            let pipeline = PipelineConfig {
                project_path: std::path::absolute(&path)
                    .map_err(|e| eyre!("cannot resolve '{}': {e}", path.display()))?,
                file_patterns: if patterns.is_empty() {
                    config.scan.file_patterns.clone()
                } else {
                    patterns
                },
                selected_files: (!selected.is_empty()).then_some(selected),
                excluded_files: (!excluded.is_empty()).then_some(excluded),
                force_reparse: force,
                enrichment_model: enrichment_model
                    .unwrap_or_else(|| config.models.enrichment_model.clone()),
                embedding_model: embedding_model
                    .unwrap_or_else(|| config.models.embedding_model.clone()),
            };
            cmd_run(config, pipeline).await
        }
        Command::Steps => cmd_steps(),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path.as_ref()).await,
        },
    }
}

fn resolve_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

fn build_registry(config: &AppConfig) -> Result<Registry> {
    let artifact_root = config.pipeline.artifact_root()?;
    let executors = LocalExecutorFactory::new(artifact_root);
    Ok(Registry::new(
        RegistrySettings::from(config),
        Arc::new(executors),
    ))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_serve(config: AppConfig) -> Result<()> {
    let registry = build_registry(&config)?;
    registry.init().await;

    let listener = codekb_server::bind(&config.server.bind).await?;
    info!(
        bind = %config.server.bind,
        max_concurrent_runs = config.pipeline.max_concurrent_runs,
        "starting pipeline server"
    );

    let shutdown = {
        let registry = registry.clone();
        async move {
            shutdown_signal().await;
            registry.shutdown().await;
        }
    };
    codekb_server::serve(listener, AppState::new(registry, config), shutdown).await?;
    Ok(())
}

async fn cmd_run(config: AppConfig, pipeline: PipelineConfig) -> Result<()> {
    let registry = build_registry(&config)?;
    let project = pipeline.project_path.clone();
    let started_at = Instant::now();

    let (started, mut events) = registry.start_observed(pipeline).await?;
    info!(run_id = %started.run_id, project = %project.display(), "pipeline run started");

    let reporter = CliProgress::new();
    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                reporter.event(&event);
                if event.is_terminal() {
                    break;
                }
            }
            _ = shutdown_signal() => {
                warn!("interrupted, cancelling pipeline run");
                registry.cancel(&started.run_id).await?;
            }
        }
    }
    reporter.finish();

    let snapshot = registry.get_status(&started.run_id).await?;
    println!();
    match snapshot.status {
        RunStatus::Completed => println!("  Knowledge base built successfully!"),
        RunStatus::Cancelled => println!("  Pipeline run cancelled."),
        _ => println!("  Pipeline run failed."),
    }
    println!("  Run:     {}", snapshot.run_id);
    println!("  Project: {}", project.display());
    for step in &snapshot.steps {
        println!(
            "  {:>2}. {:<20} {:<10} {} items",
            step.ordinal,
            step.label,
            step.status.to_string(),
            step.items_processed
        );
    }
    println!("  Time:    {:.1}s", started_at.elapsed().as_secs_f64());
    println!();

    match snapshot.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Failed => Err(eyre!(
            "{}",
            snapshot
                .error_message
                .unwrap_or_else(|| "pipeline run failed".into())
        )),
        status => Err(eyre!("pipeline run ended as {status}")),
    }
}

fn cmd_steps() -> Result<()> {
    for step in STEPS.iter() {
        println!("  {}. {:<22} {}", step.ordinal, step.name, step.label);
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<&PathBuf>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Renders run events on an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        spinner.set_message("Starting");
        Self { spinner }
    }

    fn event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::Progress {
                step_ordinal,
                step_name,
                items_processed,
                total_items,
                message,
                ..
            } => {
                self.spinner.set_message(format!(
                    "[{step_ordinal}/{}] {step_name} {items_processed}/{total_items} {}",
                    STEPS.len(),
                    message.as_deref().unwrap_or_default()
                ));
            }
            PipelineEvent::StepCompleted {
                step_name, result, ..
            } => {
                self.spinner.println(format!(
                    "  done  {step_name} ({} items)",
                    result.items_processed
                ));
            }
            PipelineEvent::StepFailed {
                step_name, error, ..
            } => {
                self.spinner.println(format!("  FAIL  {step_name}: {error}"));
            }
            PipelineEvent::Completed { .. }
            | PipelineEvent::Failed { .. }
            | PipelineEvent::Cancelled => {}
        }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}
