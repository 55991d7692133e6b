//! Checks a concrete target tree against the assumptions a patch was built on.
//! Every finding is returned as data; only failures to read the target at all
//! are errors.

use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

use crate::action::{PatchAction, UpdateAction};
use crate::digest::{self, Signature};
use crate::error::{is_lock_error, Result};
use crate::patch::{Patch, PatchMatchers};
use crate::ui::{self, LockInspector, UpdaterUi};
use crate::util;
use crate::validation::{
    ValidationAction, ValidationOption, ValidationResult, ABSENT, ACCESS_DENIED, ALREADY_EXISTS,
    MODIFIED, SOURCE_MISSING, SOURCE_MODIFIED, UNEXPECTED_FILE,
};

struct Validator<'a> {
    patch: &'a Patch,
    matchers: PatchMatchers,
    root: std::path::PathBuf,
    locks: Option<&'a dyn LockInspector>,
    /// Opens a path the way apply will; replaced in tests to simulate locks.
    open_check: AccessCheck,
    results: Vec<ValidationResult>,
}

type AccessCheck = fn(&Path) -> std::io::Result<()>;

pub fn validate(
    patch: &Patch,
    target: &Path,
    ui: &dyn UpdaterUi,
    locks: Option<&dyn LockInspector>,
) -> Result<Vec<ValidationResult>> {
    validate_with(patch, target, ui, locks, try_open)
}

fn validate_with(
    patch: &Patch,
    target: &Path,
    ui: &dyn UpdaterUi,
    locks: Option<&dyn LockInspector>,
    open_check: AccessCheck,
) -> Result<Vec<ValidationResult>> {
    ui.start_process("Validating installation...");
    let mut v = Validator {
        patch,
        matchers: patch.matchers()?,
        root: patch.target_root(target),
        locks,
        open_check,
        results: Vec::new(),
    };

    for (done, action) in patch.actions.iter().enumerate() {
        ui.check_cancelled()?;
        ui.set_status(&format!("Validating {}", action.path()));
        ui.set_progress(ui::percent(done, patch.actions.len()));
        match action {
            PatchAction::Create(a) => v.check_create(&a.path, a.checksum, ValidationAction::Create)?,
            PatchAction::Delete(a) => v.check_delete(&a.path, a.checksum)?,
            PatchAction::Update(a) if a.source.is_some() => v.check_move(a)?,
            PatchAction::Update(a) => v.check_existing(&a.path, a.checksum, a.new_checksum)?,
            PatchAction::UpdateZip(a) => v.check_existing(&a.path, a.checksum, a.new_checksum)?,
        }
    }

    ui.check_cancelled()?;
    v.check_unchanged()?;
    if patch.strict {
        v.check_unexpected()?;
    }

    info!("Validation finished: {} result(s)", v.results.len());
    Ok(v.results)
}

impl Validator<'_> {
    fn current(&self, relative_path: &str) -> Result<Option<Signature>> {
        digest::digest_if_exists(&util::resolve(&self.root, relative_path))
    }

    fn is_strict(&self, relative_path: &str) -> bool {
        self.patch.strict || self.matchers.strict.is_match(relative_path)
    }

    fn check_create(&mut self, path: &str, checksum: Signature, action: ValidationAction) -> Result<()> {
        match self.current(path)? {
            Some(current) if !current.matches(checksum) => {
                self.results.push(ValidationResult::conflict(
                    path,
                    action,
                    ALREADY_EXISTS,
                    vec![ValidationOption::Replace, ValidationOption::Keep],
                ));
            }
            _ => {}
        }
        Ok(())
    }

    fn check_delete(&mut self, path: &str, checksum: Signature) -> Result<()> {
        let Some(current) = self.current(path)? else {
            return Ok(());
        };
        if !current.matches(checksum) {
            self.results.push(ValidationResult::conflict(
                path,
                ValidationAction::Delete,
                MODIFIED,
                vec![ValidationOption::Delete, ValidationOption::Keep],
            ));
        } else {
            self.check_access(path, ValidationAction::Delete);
        }
        Ok(())
    }

    /// Update and UpdateZip of a path that must already be there.
    fn check_existing(&mut self, path: &str, checksum: Signature, new_checksum: Signature) -> Result<()> {
        let current = self.current(path)?;
        match current {
            None if self.matchers.optional.is_match(path) => {
                debug!("Optional file {path} is absent");
            }
            None => {
                let option = if self.is_strict(path) {
                    ValidationOption::None
                } else {
                    ValidationOption::Ignore
                };
                self.results.push(ValidationResult::error(
                    path,
                    ValidationAction::Update,
                    ABSENT,
                    vec![option],
                ));
            }
            Some(c) if c.matches(checksum) => self.check_access(path, ValidationAction::Update),
            Some(c) if c.matches(new_checksum) => {
                debug!("{path} already has the expected new content");
            }
            Some(_) if self.matchers.critical.is_match(path) => {
                self.results.push(ValidationResult::conflict(
                    path,
                    ValidationAction::Update,
                    MODIFIED,
                    vec![ValidationOption::Replace, ValidationOption::Ignore],
                ));
            }
            Some(_) => {
                self.results.push(ValidationResult::error(
                    path,
                    ValidationAction::Update,
                    MODIFIED,
                    vec![ValidationOption::Ignore],
                ));
            }
        }
        Ok(())
    }

    fn check_move(&mut self, a: &UpdateAction) -> Result<()> {
        let Some(source) = &a.source else {
            return Ok(());
        };
        if self.current(&a.path)?.is_some_and(|c| c.matches(a.new_checksum))
            && self.current(&source.path)?.is_none()
        {
            return Ok(());
        }

        let message = match self.current(&source.path)? {
            Some(c) if c.matches(a.checksum) => None,
            Some(_) => Some(SOURCE_MODIFIED),
            None => Some(SOURCE_MISSING),
        };
        match message {
            Some(message) if source.required => {
                self.results.push(ValidationResult::error(
                    &a.path,
                    ValidationAction::Update,
                    format!("{message}: {}", source.path),
                    vec![ValidationOption::Ignore],
                ));
            }
            Some(message) => debug!("{message} for {}; full content will be used", a.path),
            None => self.check_access(&source.path, ValidationAction::Update),
        }

        self.check_create(&a.path, a.new_checksum, ValidationAction::Update)
    }

    fn check_access(&mut self, path: &str, action: ValidationAction) {
        let full = util::resolve(&self.root, path);
        let Err(err) = (self.open_check)(&full) else {
            return;
        };
        if !is_lock_error(&err) {
            return;
        }
        let result = match self.locks {
            Some(locks) => {
                let names: Vec<String> = locks
                    .processes_using(&full)
                    .iter()
                    .map(|p| format!("{} ({})", p.name, p.pid))
                    .collect();
                ValidationResult::error(
                    path,
                    action,
                    format!("{ACCESS_DENIED}. Locked by: {}", names.join(", ")),
                    vec![ValidationOption::KillProcess],
                )
            }
            None => ValidationResult::error(
                path,
                action,
                format!("{ACCESS_DENIED}: {err}"),
                vec![ValidationOption::Ignore],
            ),
        };
        self.results.push(result);
    }

    fn check_unchanged(&mut self) -> Result<()> {
        let patch = self.patch;
        for (path, checksum) in &patch.unchanged {
            let message = match self.current(path)? {
                Some(c) if c.matches(*checksum) => continue,
                Some(_) => MODIFIED,
                None if self.matchers.optional.is_match(path) => continue,
                None => ABSENT,
            };
            self.results.push(ValidationResult::error(
                path,
                ValidationAction::Validate,
                message,
                vec![ValidationOption::Ignore],
            ));
        }
        Ok(())
    }

    fn check_unexpected(&mut self) -> Result<()> {
        let patch = self.patch;
        let mut known: HashSet<&str> = patch.unchanged.keys().map(|k| k.as_str()).collect();
        for action in &patch.actions {
            known.insert(action.path());
            if let Some(source) = action.move_source() {
                known.insert(source.path.as_str());
            }
        }

        let present = digest::digest_files(&self.root, &self.matchers.ignored)?;
        let mut reported: Vec<String> = Vec::new();
        for path in present.keys() {
            if known.contains(path.as_str())
                || self.matchers.delete.is_match(path)
                || reported.iter().any(|dir| util::is_under(path, dir))
            {
                continue;
            }
            self.results.push(ValidationResult::conflict(
                path,
                ValidationAction::Delete,
                UNEXPECTED_FILE,
                vec![ValidationOption::Delete, ValidationOption::Keep],
            ));
            reported.push(path.clone());
        }
        Ok(())
    }
}

/// Open the path the way apply will need to; a lock shows up as an error here.
fn try_open(full: &Path) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(full)?;
    if !meta.is_file() {
        return Ok(());
    }
    std::fs::File::open(full)?;
    #[cfg(windows)]
    std::fs::OpenOptions::new().append(true).open(full)?;
    Ok(())
}
