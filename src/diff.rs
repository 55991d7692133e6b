//! Diff builder: walks the old and new trees and emits the ordered action list.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::action::{CreateAction, DeleteAction, MoveSource, PatchAction, UpdateAction, UpdateZipAction};
use crate::config::PatchSpec;
use crate::digest::{self, Signature};
use crate::error::Result;
use crate::patch::Patch;
use crate::patch_format::Payload;
use crate::ui::{self, UpdaterUi};
use crate::util::{self, EntryKind, PathMatcher};

#[derive(Debug, Clone)]
struct TreeEntry {
    kind: EntryKind,
    signature: Signature,
    full_path: PathBuf,
    size: u64,
}

/// Build a patch (and the payload it needs) from `spec.old_folder` to
/// `spec.new_folder`.
pub fn build_patch(spec: &PatchSpec, ui: &dyn UpdaterUi) -> Result<(Patch, Payload)> {
    ui.start_process("Calculating difference...");

    let root = spec.normalized_root();
    let old_root = util::resolve(&spec.old_folder, &root);
    let new_root = util::resolve(&spec.new_folder, &root);

    let mut patch = Patch {
        old_version: spec.old_version.clone(),
        new_version: spec.new_version.clone(),
        root,
        ignored_files: spec.ignored_files.clone(),
        critical_files: spec.critical_files.clone(),
        optional_files: spec.optional_files.clone(),
        strict_files: spec.strict_files.clone(),
        delete_files: spec.delete_files.clone(),
        strict: spec.strict,
        case_sensitive: spec.case_sensitive,
        ..Patch::default()
    };
    let matchers = patch.matchers()?;

    ui.set_status("Scanning old files");
    ui.set_progress_indeterminate();
    let old_files = scan_tree(&old_root, &matchers.ignored, ui)?;
    ui.set_status("Scanning new files");
    let new_files = scan_tree(&new_root, &matchers.ignored, ui)?;

    let diff = classify(&old_files, &new_files, spec.case_sensitive);
    debug!(
        "Classified: {} deleted, {} created, {} changed, {} unchanged",
        diff.deleted.len(),
        diff.created.len(),
        diff.changed.len(),
        diff.unchanged.len()
    );

    let moves = detect_moves(&old_files, &new_files, &old_root, &new_root, &diff);
    ui.check_cancelled()?;

    let move_sources: HashSet<&String> = moves.values().map(|m| &m.path).collect();
    let mut deletes: Vec<String> = diff
        .deleted
        .iter()
        .filter(|p| !move_sources.contains(p))
        .cloned()
        .collect();
    util::sort_deepest_first(&mut deletes);

    let mut actions: Vec<PatchAction> = deletes
        .into_iter()
        .map(|path| {
            let checksum = old_files[&path].signature;
            PatchAction::Delete(DeleteAction { path, checksum })
        })
        .collect();

    let mut rest: Vec<PatchAction> = Vec::new();
    for path in &diff.created {
        let new_entry = &new_files[path];
        let action = match moves.get(path) {
            Some(source) => PatchAction::Update(UpdateAction {
                path: path.clone(),
                checksum: old_files[&source.path].signature,
                new_checksum: new_entry.signature,
                source: Some(source.clone()),
            }),
            None => PatchAction::Create(CreateAction {
                path: path.clone(),
                checksum: new_entry.signature,
            }),
        };
        rest.push(action);
    }

    for (done, path) in diff.changed.iter().enumerate() {
        ui.check_cancelled()?;
        ui.set_progress(ui::percent(done, diff.changed.len()));
        let old_entry = &old_files[path];
        let new_entry = &new_files[path];
        let zip_diff = spec.zip_diff
            && !matchers.critical.is_match(path)
            && old_entry.kind == EntryKind::File
            && new_entry.kind == EntryKind::File
            && util::is_archive(&new_entry.full_path);
        let action = if zip_diff {
            ui.set_status(&format!("Diffing archive {path}"));
            PatchAction::UpdateZip(UpdateZipAction::calculate(
                path,
                &old_entry.full_path,
                &new_entry.full_path,
                old_entry.signature,
                new_entry.signature,
            )?)
        } else {
            PatchAction::Update(UpdateAction {
                path: path.clone(),
                checksum: old_entry.signature,
                new_checksum: new_entry.signature,
                source: None,
            })
        };
        rest.push(action);
    }
    rest.sort_by(|a, b| a.path().cmp(b.path()));
    actions.extend(rest);

    patch.unchanged = diff
        .unchanged
        .iter()
        .filter(|p| spec.strict || matchers.strict.is_match(p))
        .map(|p| (p.clone(), new_files[p].signature))
        .collect();

    ui.set_status("Collecting payload");
    let mut payload = Payload::default();
    for (done, action) in actions.iter().enumerate() {
        ui.check_cancelled()?;
        ui.set_progress(ui::percent(done, actions.len()));
        action.write_payload(&new_root, &mut payload, matchers.critical.is_match(action.path()))?;
    }

    patch.actions = actions;
    info!(
        "Patch calculated: {} actions, {} payload bytes",
        patch.actions.len(),
        payload.total_bytes()
    );
    Ok((patch, payload))
}

fn scan_tree(
    root: &Path,
    ignored: &PathMatcher,
    ui: &dyn UpdaterUi,
) -> Result<BTreeMap<String, TreeEntry>> {
    let mut result = BTreeMap::new();
    for entry in util::walk_directory(root, ignored)? {
        ui.check_cancelled()?;
        let signature = match entry.kind {
            EntryKind::Dir => Signature::DIRECTORY,
            _ => digest::digest_path(&entry.full_path)?,
        };
        result.insert(
            entry.relative_path,
            TreeEntry {
                kind: entry.kind,
                signature,
                full_path: entry.full_path,
                size: entry.size,
            },
        );
    }
    Ok(result)
}

#[derive(Debug, Default)]
struct TreeDiff {
    /// Old-tree paths with no counterpart in the new tree.
    deleted: Vec<String>,
    /// New-tree paths with no counterpart in the old tree.
    created: Vec<String>,
    changed: Vec<String>,
    unchanged: Vec<String>,
}

fn classify(
    old_files: &BTreeMap<String, TreeEntry>,
    new_files: &BTreeMap<String, TreeEntry>,
    case_sensitive: bool,
) -> TreeDiff {
    let old_by_key: HashMap<String, &String> = old_files
        .keys()
        .map(|p| (util::path_key(p, case_sensitive), p))
        .collect();
    let mut matched: HashSet<&String> = HashSet::new();
    let mut diff = TreeDiff::default();

    for (path, new_entry) in new_files {
        // A case-only rename or a directory/file swap does not pair: the old
        // entry is removed and the new one recreated.
        let paired = old_by_key
            .get(&util::path_key(path, case_sensitive))
            .copied()
            .filter(|old_path| {
                let old_entry = &old_files[*old_path];
                *old_path == path
                    && (old_entry.kind == EntryKind::Dir) == (new_entry.kind == EntryKind::Dir)
            });
        match paired {
            None => diff.created.push(path.clone()),
            Some(old_path) => {
                matched.insert(old_path);
                if old_files[old_path].signature == new_entry.signature {
                    diff.unchanged.push(path.clone());
                } else {
                    diff.changed.push(path.clone());
                }
            }
        }
    }

    diff.deleted = old_files
        .keys()
        .filter(|p| !matched.contains(p))
        .cloned()
        .collect();
    diff
}

/// Pair deleted and created entries with identical content.
///
/// Among several candidates the one sharing the longest leading path with the
/// created path wins, ties going to the lexicographically smallest path. A
/// candidate inside a deleted directory is only taken when it is the only one.
fn detect_moves(
    old_files: &BTreeMap<String, TreeEntry>,
    new_files: &BTreeMap<String, TreeEntry>,
    old_root: &Path,
    new_root: &Path,
    diff: &TreeDiff,
) -> BTreeMap<String, MoveSource> {
    let deleted_dirs: Vec<&String> = diff
        .deleted
        .iter()
        .filter(|p| old_files[*p].kind == EntryKind::Dir)
        .collect();

    let mut candidates: HashMap<Signature, Vec<&String>> = HashMap::new();
    for path in &diff.deleted {
        let entry = &old_files[path];
        if let Some(key) = move_key(entry, old_root) {
            candidates.entry(key).or_default().push(path);
        }
    }

    let mut consumed: HashSet<&String> = HashSet::new();
    let mut moves = BTreeMap::new();
    for path in &diff.created {
        let Some(key) = move_key(&new_files[path], new_root) else {
            continue;
        };
        let Some(pool) = candidates.get(&key) else {
            continue;
        };
        let available: Vec<&String> = pool
            .iter()
            .copied()
            .filter(|c| !consumed.contains(c))
            .collect();

        let chosen = match available.as_slice() {
            [] => None,
            [only] => Some((*only, true)),
            many => many
                .iter()
                .copied()
                .filter(|c| !deleted_dirs.iter().any(|d| util::is_under(c, d)))
                .max_by(|a, b| {
                    util::common_prefix_len(a, path)
                        .cmp(&util::common_prefix_len(b, path))
                        .then_with(|| b.cmp(a))
                })
                .map(|c| (c, false)),
        };

        if let Some((source, required)) = chosen {
            debug!("Detected move {source} -> {path} (required: {required})");
            consumed.insert(source);
            moves.insert(
                path.clone(),
                MoveSource {
                    path: source.clone(),
                    required,
                },
            );
        }
    }
    moves
}

/// Content key used to match moves. Links are keyed by the content they resolve
/// to inside the tree, still tagged as links so they only ever pair with links.
fn move_key(entry: &TreeEntry, root: &Path) -> Option<Signature> {
    match entry.kind {
        EntryKind::Dir => None,
        EntryKind::File if entry.size == 0 => None,
        EntryKind::File => Some(entry.signature),
        EntryKind::Symlink => Some(dereferenced(entry, root).unwrap_or(entry.signature)),
    }
}

fn dereferenced(entry: &TreeEntry, root: &Path) -> Option<Signature> {
    let resolved = entry.full_path.canonicalize().ok()?;
    let root = root.canonicalize().ok()?;
    if !resolved.starts_with(&root) || !resolved.is_file() {
        return None;
    }
    let content = digest::digest_path(&resolved).ok()?;
    Some(Signature(content.content() | Signature::SYMLINK))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: EntryKind, sig: u64) -> TreeEntry {
        TreeEntry {
            kind,
            signature: Signature(sig),
            full_path: PathBuf::new(),
            size: 1,
        }
    }

    fn tree(items: &[(&str, EntryKind, u64)]) -> BTreeMap<String, TreeEntry> {
        items
            .iter()
            .map(|(p, k, s)| (p.to_string(), entry(*k, *s)))
            .collect()
    }

    #[test]
    fn test_classify_dir_becomes_file() {
        let old = tree(&[("x/", EntryKind::Dir, Signature::DIRECTORY.0), ("same", EntryKind::File, 1)]);
        let new = tree(&[("x", EntryKind::File, 5), ("same", EntryKind::File, 1)]);
        let diff = classify(&old, &new, true);
        assert_eq!(diff.deleted, vec!["x/"]);
        assert_eq!(diff.created, vec!["x"]);
        assert_eq!(diff.unchanged, vec!["same"]);
        assert!(diff.changed.is_empty());
    }

    #[test]
    fn test_classify_case_insensitive_rename() {
        let old = tree(&[("readme.txt", EntryKind::File, 1)]);
        let new = tree(&[("README.txt", EntryKind::File, 1)]);
        let diff = classify(&old, &new, false);
        assert_eq!(diff.deleted, vec!["readme.txt"]);
        assert_eq!(diff.created, vec!["README.txt"]);

        let old = tree(&[("readme.txt", EntryKind::File, 1)]);
        let new = tree(&[("readme.txt", EntryKind::File, 2)]);
        assert_eq!(classify(&old, &new, false).changed, vec!["readme.txt"]);
    }

    #[test]
    fn test_moves_prefer_closest_candidate_and_never_share_sources() {
        let old = tree(&[
            ("a/x.bin", EntryKind::File, 7),
            ("b/x.bin", EntryKind::File, 7),
        ]);
        let new = tree(&[
            ("b/y.bin", EntryKind::File, 7),
            ("c/z.bin", EntryKind::File, 7),
            ("c/w.bin", EntryKind::File, 7),
        ]);
        let diff = classify(&old, &new, true);
        let moves = detect_moves(&old, &new, Path::new("."), Path::new("."), &diff);

        assert_eq!(moves["b/y.bin"].path, "b/x.bin");
        assert!(!moves["b/y.bin"].required);
        // b/ candidate is taken; the remaining one is unique.
        assert_eq!(moves["c/w.bin"].path, "a/x.bin");
        assert!(moves["c/w.bin"].required);
        assert!(!moves.contains_key("c/z.bin"));
    }

    #[test]
    fn test_moves_skip_candidates_in_deleted_dirs_unless_unique() {
        let old = tree(&[
            ("gone/", EntryKind::Dir, Signature::DIRECTORY.0),
            ("gone/x.bin", EntryKind::File, 7),
            ("kept/x.bin", EntryKind::File, 7),
            ("kept/", EntryKind::Dir, Signature::DIRECTORY.0),
        ]);
        let new = tree(&[
            ("kept/", EntryKind::Dir, Signature::DIRECTORY.0),
            ("new/", EntryKind::Dir, Signature::DIRECTORY.0),
            ("new/a.bin", EntryKind::File, 7),
        ]);
        let diff = classify(&old, &new, true);
        let moves = detect_moves(&old, &new, Path::new("."), Path::new("."), &diff);
        assert_eq!(moves["new/a.bin"].path, "kept/x.bin");
        assert!(!moves["new/a.bin"].required);
    }

    #[test]
    fn test_files_and_links_never_pair() {
        let old = tree(&[("a", EntryKind::File, 7)]);
        let mut new = tree(&[]);
        new.insert(
            "b".into(),
            TreeEntry {
                kind: EntryKind::Symlink,
                signature: Signature(7 | Signature::SYMLINK),
                full_path: PathBuf::from("/nonexistent/link"),
                size: 0,
            },
        );
        let diff = classify(&old, &new, true);
        assert!(detect_moves(&old, &new, Path::new("."), Path::new("."), &diff).is_empty());
    }
}
