//! Apply/revert orchestration: validate, resolve user choices, execute actions
//! in patch order with per-action backups, and replay backups in reverse.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::action::{ApplyContext, DeleteAction, PatchAction};
use crate::config::PatchSpec;
use crate::digest;
use crate::error::{PatchError, Result};
use crate::patch::Patch;
use crate::patch_format::{self, Payload};
use crate::ui::{self, LockInspector, UpdaterUi};
use crate::util::{self, RetryPolicy};
use crate::validation::{ValidationOption, ValidationResult, UNEXPECTED_FILE};
use crate::validator;

/// A loaded patch validated against a target, before anything is mutated.
#[derive(Debug, Clone)]
pub struct PreparationResult {
    pub patch: Patch,
    pub payload: Payload,
    pub target: PathBuf,
    pub validation_results: Vec<ValidationResult>,
}

#[derive(Debug)]
pub struct ApplicationResult {
    pub applied: bool,
    /// Actions executed successfully, in execution order.
    pub applied_actions: Vec<PatchAction>,
    /// The action whose apply step failed, if any. Its pre-image was backed up.
    pub failed_action: Option<PatchAction>,
    pub error: Option<PatchError>,
}

impl ApplicationResult {
    /// Everything that may have touched the target and should be reverted.
    pub fn actions_to_revert(&self) -> Vec<PatchAction> {
        self.applied_actions
            .iter()
            .chain(self.failed_action.iter())
            .cloned()
            .collect()
    }

    fn failed(applied_actions: Vec<PatchAction>, failed_action: Option<PatchAction>, error: PatchError) -> Self {
        Self {
            applied: false,
            applied_actions,
            failed_action,
            error: Some(error),
        }
    }
}

/// Build a patch from `spec` and write it to `output`.
pub fn create(spec: &PatchSpec, output: &Path, ui: &dyn UpdaterUi) -> Result<Patch> {
    let (patch, payload) = Patch::build(spec, ui)?;
    patch_format::write_patch_file(output, &patch, &payload)?;
    info!("Patch written to {}", output.display());
    Ok(patch)
}

/// Load a patch container and validate it against `target`.
pub fn prepare(
    patch_file: &Path,
    target: &Path,
    ui: &dyn UpdaterUi,
    locks: Option<&dyn LockInspector>,
) -> Result<PreparationResult> {
    ui.start_process("Extracting patch file...");
    let (patch, payload) = patch_format::read_patch_file(patch_file)?;
    prepare_patch(patch, payload, target, ui, locks)
}

/// Validate an in-memory patch against `target`.
pub fn prepare_patch(
    patch: Patch,
    payload: Payload,
    target: &Path,
    ui: &dyn UpdaterUi,
    locks: Option<&dyn LockInspector>,
) -> Result<PreparationResult> {
    let validation_results = patch.validate(target, ui, locks)?;
    Ok(PreparationResult {
        patch,
        payload,
        target: target.to_path_buf(),
        validation_results,
    })
}

/// Apply a prepared patch. Stops at the first failure or cancellation and
/// reports what was done; reverting is left to the caller.
pub fn apply(
    prep: &PreparationResult,
    options: &HashMap<String, ValidationOption>,
    backup_dir: Option<&Path>,
    ui: &dyn UpdaterUi,
) -> ApplicationResult {
    apply_with_retry(prep, options, backup_dir, ui, RetryPolicy::default())
}

pub fn apply_with_retry(
    prep: &PreparationResult,
    options: &HashMap<String, ValidationOption>,
    backup_dir: Option<&Path>,
    ui: &dyn UpdaterUi,
    retry: RetryPolicy,
) -> ApplicationResult {
    ui.start_process("Applying patch...");
    let results = match validator::validate(&prep.patch, &prep.target, ui, None) {
        Ok(results) => results,
        Err(e) => return ApplicationResult::failed(Vec::new(), None, e),
    };

    let choices = match resolve_choices(&results, options, ui) {
        Ok(choices) => choices,
        Err(e) => return ApplicationResult::failed(Vec::new(), None, e),
    };

    let actions = plan_actions(&prep.patch, &results, &choices);
    let root = prep.patch.target_root(&prep.target);
    if let Some(backup) = backup_dir {
        if let Err(e) = std::fs::create_dir_all(backup) {
            return ApplicationResult::failed(Vec::new(), None, PatchError::io(backup, e));
        }
    }

    let stage = match stage_move_sources(&actions, &root) {
        Ok(stage) => stage,
        Err(e) => return ApplicationResult::failed(Vec::new(), None, e),
    };

    let ctx = ApplyContext {
        target: &root,
        payload: &prep.payload,
        stage: stage.path(),
        retry,
    };

    let mut applied = Vec::new();
    for (done, action) in actions.iter().enumerate() {
        if let Err(e) = ui.check_cancelled() {
            warn!("Apply cancelled after {} action(s)", applied.len());
            return ApplicationResult::failed(applied, None, e);
        }
        ui.set_status(&format!("Applying {}", action.path()));
        ui.set_progress(ui::percent(done, actions.len()));

        match action.is_applied(&root) {
            Ok(true) => {
                debug!("{} {} already in place", action.name(), action.path());
                continue;
            }
            Ok(false) => {}
            Err(e) => return ApplicationResult::failed(applied, None, e),
        }

        if let Some(backup) = backup_dir {
            if let Err(e) = action.backup(&root, backup) {
                return ApplicationResult::failed(applied, None, e);
            }
        }

        if let Err(e) = action.apply(&ctx) {
            warn!("{} {} failed: {e}", action.name(), action.path());
            return ApplicationResult::failed(applied, Some(action.clone()), e);
        }
        applied.push(action.clone());
    }

    info!("Applied {} action(s)", applied.len());
    ApplicationResult {
        applied: true,
        applied_actions: applied,
        failed_action: None,
        error: None,
    }
}

/// Undo `applied_actions` from the backup tree, newest first. Keeps going past
/// failures and reports them together at the end.
pub fn revert(
    prep: &PreparationResult,
    applied_actions: &[PatchAction],
    backup_dir: &Path,
    ui: &dyn UpdaterUi,
) -> Result<()> {
    ui.start_process("Reverting...");
    let root = prep.patch.target_root(&prep.target);
    let retry = RetryPolicy::default();

    let mut failures = Vec::new();
    for (done, action) in applied_actions.iter().rev().enumerate() {
        ui.check_cancelled()?;
        ui.set_status(&format!("Reverting {}", action.path()));
        ui.set_progress(ui::percent(done, applied_actions.len()));
        let res = retry.run(&format!("revert {}", action.path()), || {
            action.revert(&root, backup_dir)
        });
        if let Err(e) = res {
            warn!("Failed to revert {} {}: {e}", action.name(), action.path());
            failures.push(format!("{}: {e}", action.path()));
        }
    }

    if failures.is_empty() {
        info!("Reverted {} action(s)", applied_actions.len());
        Ok(())
    } else {
        Err(PatchError::RevertFailed(failures))
    }
}

/// Caller choices first, then the UI, then each conflict's default. Any result
/// left without a choice blocks the apply.
fn resolve_choices(
    results: &[ValidationResult],
    options: &HashMap<String, ValidationOption>,
    ui: &dyn UpdaterUi,
) -> Result<HashMap<String, ValidationOption>> {
    let unanswered: Vec<ValidationResult> = results
        .iter()
        .filter(|r| !options.contains_key(&r.path))
        .cloned()
        .collect();
    let asked = if unanswered.is_empty() {
        HashMap::new()
    } else {
        ui.ask_user(&unanswered)?
    };

    let mut choices = HashMap::new();
    let mut blocked = 0;
    for result in results {
        let choice = options
            .get(&result.path)
            .or_else(|| asked.get(&result.path))
            .copied()
            .or_else(|| result.default_option());
        match choice {
            Some(choice) => {
                choices.insert(result.path.clone(), choice);
            }
            None => {
                warn!("Unresolved: {result}");
                blocked += 1;
            }
        }
    }
    if blocked > 0 {
        return Err(PatchError::Blocked(blocked));
    }
    Ok(choices)
}

/// The patch's actions minus skipped ones, preceded by deletions of unexpected
/// files the user chose to remove.
fn plan_actions(
    patch: &Patch,
    results: &[ValidationResult],
    choices: &HashMap<String, ValidationOption>,
) -> Vec<PatchAction> {
    let skipped: HashSet<&str> = choices
        .iter()
        .filter(|(_, option)| option.skips_action())
        .map(|(path, _)| path.as_str())
        .collect();

    let mut debris: Vec<String> = results
        .iter()
        .filter(|r| r.message == UNEXPECTED_FILE && choices.get(&r.path) == Some(&ValidationOption::Delete))
        .map(|r| r.path.clone())
        .collect();
    util::sort_deepest_first(&mut debris);

    let mut actions: Vec<PatchAction> = debris
        .into_iter()
        .map(|path| {
            PatchAction::Delete(DeleteAction {
                path,
                checksum: digest::Signature::INVALID,
            })
        })
        .collect();
    actions.extend(
        patch
            .actions
            .iter()
            .filter(|a| !skipped.contains(a.path()))
            .cloned(),
    );
    actions
}

/// Copy every move source aside so moves survive earlier deletes and work
/// without a backup directory.
fn stage_move_sources(actions: &[PatchAction], root: &Path) -> Result<tempfile::TempDir> {
    let stage = tempfile::tempdir().map_err(|e| PatchError::io(std::env::temp_dir(), e))?;
    for source in actions.iter().filter_map(|a| a.move_source()) {
        let full = util::resolve(root, &source.path);
        if std::fs::symlink_metadata(&full).is_ok() {
            util::copy_recursively(&full, &util::resolve(stage.path(), &source.path))?;
        }
    }
    Ok(stage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{CreateAction, UpdateAction};
    use crate::ui::SilentUi;
    use crate::validation::ValidationAction;
    use std::fs;

    fn prep_for(patch: Patch, payload: Payload, target: &Path) -> PreparationResult {
        prepare_patch(patch, payload, target, &SilentUi::new(), None).unwrap()
    }

    fn create_file(path: &str, data: &[u8], payload: &mut Payload) -> PatchAction {
        payload.insert_file(path, data.to_vec());
        PatchAction::Create(CreateAction {
            path: path.into(),
            checksum: digest::digest_bytes(data),
        })
    }

    #[test]
    fn test_errors_without_choice_block_apply() {
        let target = tempfile::tempdir().unwrap();
        fs::write(target.path().join("a.txt"), b"edited").unwrap();
        let mut patch = Patch::default();
        patch.actions.push(PatchAction::Update(UpdateAction {
            path: "a.txt".into(),
            checksum: digest::digest_bytes(b"v1"),
            new_checksum: digest::digest_bytes(b"v2"),
            source: None,
        }));
        let prep = prep_for(patch, Payload::default(), target.path());
        assert_eq!(prep.validation_results.len(), 1);

        let result = apply(&prep, &HashMap::new(), None, &SilentUi::new());
        assert!(!result.applied);
        assert!(matches!(result.error, Some(PatchError::Blocked(1))));
        assert!(result.applied_actions.is_empty());

        let mut options = HashMap::new();
        options.insert("a.txt".to_string(), ValidationOption::Ignore);
        let result = apply(&prep, &options, None, &SilentUi::new());
        assert!(result.applied);
        assert!(result.applied_actions.is_empty());
        assert_eq!(fs::read(target.path().join("a.txt")).unwrap(), b"edited");
    }

    #[test]
    fn test_keep_skips_and_replace_overwrites() {
        let target = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        fs::write(target.path().join("keep.txt"), b"mine").unwrap();
        fs::write(target.path().join("replace.txt"), b"mine").unwrap();

        let mut payload = Payload::default();
        let mut patch = Patch::default();
        patch.actions.push(create_file("keep.txt", b"theirs", &mut payload));
        patch.actions.push(create_file("replace.txt", b"theirs", &mut payload));
        let prep = prep_for(patch, payload, target.path());

        let ui = SilentUi::new().with_answer("keep.txt", ValidationOption::Keep);
        let result = apply(&prep, &HashMap::new(), Some(backup.path()), &ui);
        assert!(result.applied, "{:?}", result.error);
        assert_eq!(result.applied_actions.len(), 1);
        assert_eq!(fs::read(target.path().join("keep.txt")).unwrap(), b"mine");
        assert_eq!(fs::read(target.path().join("replace.txt")).unwrap(), b"theirs");

        revert(&prep, &result.applied_actions, backup.path(), &SilentUi::new()).unwrap();
        assert_eq!(fs::read(target.path().join("replace.txt")).unwrap(), b"mine");
    }

    #[test]
    fn test_failure_stops_and_reports_progress() {
        let target = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        let mut payload = Payload::default();
        let mut patch = Patch::default();
        patch.actions.push(create_file("a.txt", b"a", &mut payload));
        // No payload for b.txt: its apply fails.
        patch.actions.push(PatchAction::Create(CreateAction {
            path: "b.txt".into(),
            checksum: digest::digest_bytes(b"b"),
        }));
        patch.actions.push(create_file("c.txt", b"c", &mut payload));
        let prep = prep_for(patch, payload, target.path());

        let result = apply(&prep, &HashMap::new(), Some(backup.path()), &SilentUi::new());
        assert!(!result.applied);
        assert!(matches!(result.error, Some(PatchError::MissingPayload(ref p)) if p == "b.txt"));
        assert_eq!(result.applied_actions.len(), 1);
        assert_eq!(result.failed_action.as_ref().map(|a| a.path()), Some("b.txt"));
        assert!(target.path().join("a.txt").exists());
        assert!(!target.path().join("c.txt").exists());

        revert(&prep, &result.actions_to_revert(), backup.path(), &SilentUi::new()).unwrap();
        assert!(!target.path().join("a.txt").exists());
    }

    #[test]
    fn test_cancellation_mid_apply() {
        let target = tempfile::tempdir().unwrap();
        let mut payload = Payload::default();
        let mut patch = Patch::default();
        patch.actions.push(create_file("a.txt", b"a", &mut payload));
        patch.actions.push(create_file("b.txt", b"b", &mut payload));
        let prep = prep_for(patch, payload, target.path());

        // Re-validation checks once per action plus once at the end; the
        // fourth check is the first apply iteration.
        let ui = SilentUi::new().cancel_after(4);
        let result = apply(&prep, &HashMap::new(), None, &ui);
        assert!(!result.applied);
        assert!(result.error.as_ref().is_some_and(|e| e.is_cancelled()));
        assert_eq!(result.applied_actions.len(), 1);
        assert!(!target.path().join("b.txt").exists());
    }

    #[test]
    fn test_unexpected_file_deleted_on_request_and_restored() {
        let target = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        fs::write(target.path().join("stray.txt"), b"stray").unwrap();
        let mut patch = Patch::default();
        patch.strict = true;
        let prep = prep_for(patch, Payload::default(), target.path());
        assert_eq!(prep.validation_results.len(), 1);
        assert_eq!(prep.validation_results[0].action, ValidationAction::Delete);

        let result = apply(&prep, &HashMap::new(), Some(backup.path()), &SilentUi::new());
        assert!(result.applied);
        assert!(!target.path().join("stray.txt").exists());

        revert(&prep, &result.applied_actions, backup.path(), &SilentUi::new()).unwrap();
        assert_eq!(fs::read(target.path().join("stray.txt")).unwrap(), b"stray");
    }

    #[test]
    fn test_kill_process_choice_runs_locked_action() {
        let target = tempfile::tempdir().unwrap();
        fs::write(target.path().join("app.exe"), b"v1").unwrap();
        let mut payload = Payload::default();
        payload.insert_file("app.exe", b"v2".to_vec());
        let mut patch = Patch::default();
        patch.actions.push(PatchAction::Update(UpdateAction {
            path: "app.exe".into(),
            checksum: digest::digest_bytes(b"v1"),
            new_checksum: digest::digest_bytes(b"v2"),
            source: None,
        }));
        let locked = vec![ValidationResult::error(
            "app.exe",
            ValidationAction::Update,
            crate::validation::ACCESS_DENIED,
            vec![ValidationOption::KillProcess],
        )];

        assert!(matches!(
            resolve_choices(&locked, &HashMap::new(), &SilentUi::new()),
            Err(PatchError::Blocked(1))
        ));
        let ui = SilentUi::new().with_answer("app.exe", ValidationOption::KillProcess);
        let choices = resolve_choices(&locked, &HashMap::new(), &ui).unwrap();
        assert_eq!(plan_actions(&patch, &locked, &choices), patch.actions);

        let mut ignore = HashMap::new();
        ignore.insert("app.exe".to_string(), ValidationOption::Ignore);
        let choices = resolve_choices(&locked, &ignore, &SilentUi::new()).unwrap();
        assert!(plan_actions(&patch, &locked, &choices).is_empty());

        // Once the holder is gone the chosen action goes through.
        let prep = prep_for(patch, payload, target.path());
        let mut kill = HashMap::new();
        kill.insert("app.exe".to_string(), ValidationOption::KillProcess);
        let result = apply(&prep, &kill, None, &SilentUi::new());
        assert!(result.applied, "{:?}", result.error);
        assert_eq!(fs::read(target.path().join("app.exe")).unwrap(), b"v2");
    }

    #[test]
    fn test_revert_continues_past_failures() {
        let target = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        fs::write(target.path().join("a.txt"), b"new").unwrap();
        // Backup whose parent is a file cannot be restored into place.
        fs::write(target.path().join("blocker"), b"file").unwrap();
        fs::create_dir_all(backup.path().join("blocker")).unwrap();
        fs::write(backup.path().join("blocker/inner.txt"), b"x").unwrap();
        fs::write(backup.path().join("a.txt"), b"old").unwrap();

        let prep = prep_for(Patch::default(), Payload::default(), target.path());
        let actions = vec![
            PatchAction::Update(UpdateAction {
                path: "a.txt".into(),
                checksum: digest::digest_bytes(b"old"),
                new_checksum: digest::digest_bytes(b"new"),
                source: None,
            }),
            PatchAction::Delete(DeleteAction {
                path: "blocker/inner.txt".into(),
                checksum: digest::digest_bytes(b"x"),
            }),
        ];
        let err = revert(&prep, &actions, backup.path(), &SilentUi::new()).unwrap_err();
        match err {
            PatchError::RevertFailed(failures) => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("blocker/inner.txt"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs::read(target.path().join("a.txt")).unwrap(), b"old");
    }
}
