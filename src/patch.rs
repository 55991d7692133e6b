use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::action::PatchAction;
use crate::config::PatchSpec;
use crate::digest::Signature;
use crate::error::Result;
use crate::patch_format::Payload;
use crate::ui::{LockInspector, UpdaterUi};
use crate::util::{self, PathMatcher};
use crate::validation::ValidationResult;
use crate::{diff, validator};

/// Ordered action list plus the build-time policy it was computed under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub old_version: String,
    pub new_version: String,
    /// Subtree (relative, `/`-suffixed, or empty) all paths are relative to.
    pub root: String,
    pub actions: Vec<PatchAction>,
    pub ignored_files: Vec<String>,
    pub critical_files: Vec<String>,
    pub optional_files: Vec<String>,
    pub strict_files: Vec<String>,
    pub delete_files: Vec<String>,
    pub strict: bool,
    pub case_sensitive: bool,
    /// Signatures of unchanged entries checked under strict validation.
    pub unchanged: BTreeMap<String, Signature>,
}

/// Compiled policy globs of a patch.
#[derive(Debug, Clone)]
pub struct PatchMatchers {
    pub ignored: PathMatcher,
    pub critical: PathMatcher,
    pub optional: PathMatcher,
    pub strict: PathMatcher,
    pub delete: PathMatcher,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PatchSummary {
    pub created: usize,
    pub updated: usize,
    pub moved: usize,
    pub zip_updated: usize,
    pub deleted: usize,
}

impl fmt::Display for PatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Created: {}", self.created)?;
        writeln!(f, "  Updated: {}", self.updated)?;
        writeln!(f, "  Moved: {}", self.moved)?;
        writeln!(f, "  Archives patched: {}", self.zip_updated)?;
        write!(f, "  Deleted: {}", self.deleted)
    }
}

impl Patch {
    /// Diff the two trees named by `spec`.
    pub fn build(spec: &PatchSpec, ui: &dyn UpdaterUi) -> Result<(Patch, Payload)> {
        diff::build_patch(spec, ui)
    }

    /// Check a target tree against the assumptions this patch was built on.
    pub fn validate(
        &self,
        target: &Path,
        ui: &dyn UpdaterUi,
        locks: Option<&dyn LockInspector>,
    ) -> Result<Vec<ValidationResult>> {
        validator::validate(self, target, ui, locks)
    }

    pub fn matchers(&self) -> Result<PatchMatchers> {
        let cs = self.case_sensitive;
        Ok(PatchMatchers {
            ignored: PathMatcher::new(&self.ignored_files, cs)?,
            critical: PathMatcher::new(&self.critical_files, cs)?,
            optional: PathMatcher::new(&self.optional_files, cs)?,
            strict: PathMatcher::new(&self.strict_files, cs)?,
            delete: PathMatcher::new(&self.delete_files, cs)?,
        })
    }

    /// Directory the actions operate in for a given installation.
    pub fn target_root(&self, target: &Path) -> PathBuf {
        util::resolve(target, &self.root)
    }

    pub fn summary(&self) -> PatchSummary {
        let mut summary = PatchSummary::default();
        for action in &self.actions {
            match action {
                PatchAction::Create(_) => summary.created += 1,
                PatchAction::Delete(_) => summary.deleted += 1,
                PatchAction::Update(a) if a.source.is_some() => summary.moved += 1,
                PatchAction::Update(_) => summary.updated += 1,
                PatchAction::UpdateZip(_) => summary.zip_updated += 1,
            }
        }
        summary
    }
}
