use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{IoContext, Result};

/// Everything needed to build a patch between two trees.
///
/// Usually assembled from command-line flags, optionally seeded from a JSON
/// file (`PatchSpec::from_json_file`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchSpec {
    pub old_folder: PathBuf,
    pub new_folder: PathBuf,
    pub old_version: String,
    pub new_version: String,
    /// Sub-path (relative, `/`-suffixed) the patch is restricted to.
    pub root: String,
    pub ignored_files: Vec<String>,
    pub critical_files: Vec<String>,
    pub optional_files: Vec<String>,
    pub strict_files: Vec<String>,
    /// Debris tolerated in the target under strict validation.
    pub delete_files: Vec<String>,
    pub strict: bool,
    pub case_sensitive: bool,
    /// Diff archives entry by entry instead of shipping them whole.
    pub zip_diff: bool,
}

impl Default for PatchSpec {
    fn default() -> Self {
        Self {
            old_folder: PathBuf::new(),
            new_folder: PathBuf::new(),
            old_version: String::new(),
            new_version: String::new(),
            root: String::new(),
            ignored_files: Vec::new(),
            critical_files: Vec::new(),
            optional_files: Vec::new(),
            strict_files: Vec::new(),
            delete_files: Vec::new(),
            strict: false,
            case_sensitive: default_case_sensitive(),
            zip_diff: true,
        }
    }
}

/// Linux filesystems are case-sensitive; Windows and macOS defaults are not.
pub fn default_case_sensitive() -> bool {
    !cfg!(any(windows, target_os = "macos"))
}

impl PatchSpec {
    pub fn new(old_folder: impl Into<PathBuf>, new_folder: impl Into<PathBuf>) -> Self {
        Self {
            old_folder: old_folder.into(),
            new_folder: new_folder.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).at(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The root normalized to either empty or a `/`-terminated relative path.
    pub fn normalized_root(&self) -> String {
        normalize_root(&self.root)
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_ignored(mut self, patterns: &[&str]) -> Self {
        self.ignored_files.extend(patterns.iter().map(|s| s.to_string()));
        self
    }

    pub fn with_critical(mut self, patterns: &[&str]) -> Self {
        self.critical_files.extend(patterns.iter().map(|s| s.to_string()));
        self
    }

    pub fn with_optional(mut self, patterns: &[&str]) -> Self {
        self.optional_files.extend(patterns.iter().map(|s| s.to_string()));
        self
    }

    pub fn with_strict_files(mut self, patterns: &[&str]) -> Self {
        self.strict_files.extend(patterns.iter().map(|s| s.to_string()));
        self
    }

    pub fn with_delete_files(mut self, patterns: &[&str]) -> Self {
        self.delete_files.extend(patterns.iter().map(|s| s.to_string()));
        self
    }

    pub fn with_root(mut self, root: &str) -> Self {
        self.root = root.to_string();
        self
    }

    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }
}

pub(crate) fn normalize_root(root: &str) -> String {
    let trimmed = root.trim_matches('/').replace('\\', "/");
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}
