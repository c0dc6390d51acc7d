//! Shared types, error model, and configuration for CodeKB.
//!
//! This crate is the foundation depended on by all other CodeKB crates.
//! It provides:
//! - [`CodeKbError`]: the unified error type
//! - Domain types ([`PipelineConfig`], [`StepState`], [`RunId`], the [`STEPS`] catalog)
//! - Configuration ([`AppConfig`], [`PipelineSettings`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ModelsConfig, PipelineSettings, ScanConfig, ServerConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from,
};
pub use error::{CodeKbError, Result};
pub use types::{
    PipelineConfig, RunId, RunStatus, STEPS, StepDescriptor, StepKind, StepState, StepStatus,
    step_by_ordinal,
};
