//! Best-effort removal of step artifacts.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use codekb_shared::CodeKbError;

/// Delete every artifact, then any parent directory left empty.
///
/// Never fails: each problem is returned as a [`CodeKbError::Rollback`] for the
/// caller to log. Already-missing files are not errors.
pub async fn cleanup_artifacts(artifacts: &[PathBuf]) -> Vec<CodeKbError> {
    let mut failures = Vec::new();
    let mut parents = BTreeSet::new();

    for path in artifacts {
        match remove_path(path).await {
            Ok(()) => debug!(path = %path.display(), "removed artifact"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => failures.push(CodeKbError::Rollback {
                path: path.clone(),
                message: e.to_string(),
            }),
        }
        if let Some(parent) = path.parent() {
            parents.insert(parent.to_path_buf());
        }
    }

    // Deepest first so nested run directories collapse.
    for dir in parents.iter().rev() {
        if let Err(e) = tokio::fs::remove_dir(dir).await {
            debug!(dir = %dir.display(), error = %e, "artifact directory kept");
        }
    }

    failures
}

async fn remove_path(path: &Path) -> std::io::Result<()> {
    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}
