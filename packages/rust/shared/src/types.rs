//! Core domain types for CodeKB pipeline runs.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CodeKbError, Result};

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for pipeline run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// PipelineConfig
// ---------------------------------------------------------------------------

/// Immutable input to a pipeline run. Built once at admission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Root of the project to ingest.
    pub project_path: PathBuf,
    /// Include globs, relative to `project_path` (e.g. `**/*.rs`).
    pub file_patterns: Vec<String>,
    /// Explicit file selection. When non-empty only these files are processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_files: Option<Vec<String>>,
    /// Files to skip even when they match a pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_files: Option<Vec<String>>,
    /// Reparse files even when cached artifacts exist.
    #[serde(default)]
    pub force_reparse: bool,
    /// Model used by the semantic-enrichment step.
    pub enrichment_model: String,
    /// Model used by the vectorization step.
    pub embedding_model: String,
}

// ---------------------------------------------------------------------------
// Step catalog
// ---------------------------------------------------------------------------

/// The five fixed pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    Parsing,
    DependencyAnalysis,
    SemanticEnrichment,
    Vectorization,
    Indexing,
}

impl StepKind {
    /// Stable step name used as the results key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parsing => "parsing",
            Self::DependencyAnalysis => "dependency-analysis",
            Self::SemanticEnrichment => "semantic-enrichment",
            Self::Vectorization => "vectorization",
            Self::Indexing => "indexing",
        }
    }

    /// Static descriptor for this step.
    pub fn descriptor(&self) -> &'static StepDescriptor {
        &STEPS[*self as usize]
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the static step catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDescriptor {
    /// 1-based position in the pipeline.
    pub ordinal: u8,
    pub kind: StepKind,
    /// Stable name (`parsing`, `dependency-analysis`, ...).
    pub name: &'static str,
    /// Human-readable label.
    pub label: &'static str,
    /// Short verb phrase used in error messages.
    #[serde(skip)]
    pub action: &'static str,
}

impl StepDescriptor {
    /// Build the error raised when this step's executor fails.
    pub fn failure(&self, message: impl Into<String>) -> CodeKbError {
        CodeKbError::StepExecution {
            step: self.name.to_string(),
            action: self.action.to_string(),
            message: message.into(),
        }
    }
}

/// Ordered step catalog.
pub const STEPS: [StepDescriptor; 5] = [
    StepDescriptor {
        ordinal: 1,
        kind: StepKind::Parsing,
        name: "parsing",
        label: "Parsing",
        action: "parse source files",
    },
    StepDescriptor {
        ordinal: 2,
        kind: StepKind::DependencyAnalysis,
        name: "dependency-analysis",
        label: "Dependency Analysis",
        action: "analyze dependencies",
    },
    StepDescriptor {
        ordinal: 3,
        kind: StepKind::SemanticEnrichment,
        name: "semantic-enrichment",
        label: "Semantic Enrichment",
        action: "enrich symbols",
    },
    StepDescriptor {
        ordinal: 4,
        kind: StepKind::Vectorization,
        name: "vectorization",
        label: "Vectorization",
        action: "generate embeddings",
    },
    StepDescriptor {
        ordinal: 5,
        kind: StepKind::Indexing,
        name: "indexing",
        label: "Indexing",
        action: "build search index",
    },
];

/// Look up a step by its 1-based ordinal.
pub fn step_by_ordinal(ordinal: u8) -> Result<&'static StepDescriptor> {
    STEPS
        .iter()
        .find(|s| s.ordinal == ordinal)
        .ok_or_else(|| {
            CodeKbError::invalid_argument(format!(
                "step id {ordinal} out of range (expected 1-{})",
                STEPS.len()
            ))
        })
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Per-step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Run-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Active runs count against the admission ceiling.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// StepState
// ---------------------------------------------------------------------------

/// Mutable per-run, per-step record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    pub ordinal: u8,
    pub name: String,
    pub label: String,
    pub status: StepStatus,
    pub progress_percent: u8,
    pub items_processed: u64,
    pub total_items: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StepState {
    /// Fresh `pending` state for a catalog entry.
    pub fn pending(descriptor: &StepDescriptor) -> Self {
        Self {
            ordinal: descriptor.ordinal,
            name: descriptor.name.to_string(),
            label: descriptor.label.to_string(),
            status: StepStatus::Pending,
            progress_percent: 0,
            items_processed: 0,
            total_items: 0,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// One `pending` state per catalog entry, in order.
    pub fn initial_states() -> Vec<Self> {
        STEPS.iter().map(Self::pending).collect()
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = StepStatus::Running;
        self.started_at = Some(now);
    }

    /// Record executor progress. `total == 0` means unknown.
    pub fn record_progress(&mut self, processed: u64, total: u64) {
        self.items_processed = processed;
        self.total_items = total;
        self.progress_percent = match total {
            0 => 0,
            t => (processed.min(t) * 100 / t) as u8,
        };
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = StepStatus::Completed;
        self.progress_percent = 100;
        self.completed_at = Some(now);
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>, message: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.completed_at = Some(now);
        self.error_message = Some(message.into());
    }
}
