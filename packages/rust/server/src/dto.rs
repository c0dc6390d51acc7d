//! Request bodies.

use std::path::PathBuf;

use serde::Deserialize;

use codekb_shared::{AppConfig, CodeKbError, PipelineConfig, Result};

/// Body of `POST /pipeline/start` and `POST /pipeline/step/{stepId}/run`.
///
/// Omitted fields fall back to the server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPipelineRequest {
    pub project_path: PathBuf,
    #[serde(default)]
    pub file_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub selected_files: Option<Vec<String>>,
    #[serde(default)]
    pub excluded_files: Option<Vec<String>>,
    #[serde(default)]
    pub force_reparse: Option<bool>,
    #[serde(default)]
    pub enrichment_model: Option<String>,
    #[serde(default)]
    pub embedding_model: Option<String>,
}

impl StartPipelineRequest {
    pub fn into_config(self, defaults: &AppConfig) -> Result<PipelineConfig> {
        if self.project_path.as_os_str().is_empty() {
            return Err(CodeKbError::invalid_argument("projectPath must not be empty"));
        }

        let file_patterns = match self.file_patterns {
            Some(patterns) if !patterns.is_empty() => patterns,
            _ => defaults.scan.file_patterns.clone(),
        };

        Ok(PipelineConfig {
            project_path: self.project_path,
            file_patterns,
            selected_files: self.selected_files,
            excluded_files: self.excluded_files,
            force_reparse: self.force_reparse.unwrap_or(false),
            enrichment_model: self
                .enrichment_model
                .unwrap_or_else(|| defaults.models.enrichment_model.clone()),
            embedding_model: self
                .embedding_model
                .unwrap_or_else(|| defaults.models.embedding_model.clone()),
        })
    }
}
