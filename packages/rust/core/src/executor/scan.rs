//! Project file selection for the local executor.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::debug;

use codekb_shared::{CodeKbError, PipelineConfig, Result};

/// Directories never descended into.
const SKIPPED_DIRS: &[&str] = &["target", "node_modules", "dist", "build", "__pycache__"];

/// A file selected for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the project root, `/`-separated.
    pub relative: String,
    pub path: PathBuf,
}

/// Decides which project files a run processes.
#[derive(Debug, Clone)]
pub struct FileSelector {
    include: Vec<Regex>,
    selected: Option<HashSet<String>>,
    excluded: HashSet<String>,
}

impl FileSelector {
    /// Build a selector from a run's include globs and explicit file lists.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let include = config
            .file_patterns
            .iter()
            .map(|p| glob_to_regex(p))
            .collect::<Result<Vec<_>>>()?;

        let selected = config
            .selected_files
            .as_ref()
            .filter(|files| !files.is_empty())
            .map(|files| files.iter().map(|f| normalize(f)).collect());

        let excluded = config
            .excluded_files
            .iter()
            .flatten()
            .map(|f| normalize(f))
            .collect();

        Ok(Self {
            include,
            selected,
            excluded,
        })
    }

    /// Whether a project-relative path is processed.
    pub fn matches(&self, relative: &str) -> bool {
        if self.excluded.contains(relative) {
            return false;
        }
        if let Some(selected) = &self.selected {
            return selected.contains(relative);
        }
        self.include.iter().any(|re| re.is_match(relative))
    }
}

/// Translate a glob (`*`, `**`, `?`, `{a,b}`) into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    let mut in_group = false;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '{' => {
                in_group = true;
                out.push_str("(?:");
            }
            '}' if in_group => {
                in_group = false;
                out.push(')');
            }
            ',' if in_group => out.push('|'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
        i += 1;
    }
    out.push('$');

    Regex::new(&out)
        .map_err(|e| CodeKbError::invalid_argument(format!("bad file pattern '{pattern}': {e}")))
}

/// Walk `root` and return matching files sorted by relative path.
///
/// Hidden entries and build output directories are skipped. Blocking; call
/// from `spawn_blocking`.
pub fn collect_files(root: &Path, selector: &FileSelector) -> Result<Vec<SourceFile>> {
    if !root.is_dir() {
        return Err(CodeKbError::invalid_argument(format!(
            "project path {} is not a directory",
            root.display()
        )));
    }

    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| CodeKbError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| CodeKbError::io(&dir, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }

            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| CodeKbError::io(&path, e))?;
            if file_type.is_dir() {
                if !SKIPPED_DIRS.contains(&name.as_ref()) {
                    pending.push(path);
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            let relative = normalize(&rel.to_string_lossy());
            if selector.matches(&relative) {
                files.push(SourceFile { relative, path });
            }
        }
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    debug!(root = %root.display(), count = files.len(), "collected project files");
    Ok(files)
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches("./").to_string()
}
