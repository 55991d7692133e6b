//! The closed set of patch operations.
//!
//! Each action knows how to collect its payload at build time, back up the
//! pre-image of the paths it touches, apply itself to a target tree and revert
//! itself from the backup tree. Validation lives in [`crate::validator`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, trace};
use zip::write::SimpleFileOptions;

use crate::digest::{self, Signature};
use crate::error::{IoContext, PatchError, Result};
use crate::patch_format::Payload;
use crate::util::{self, RetryPolicy};
use crate::validation::ValidationAction;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchAction {
    Create(CreateAction),
    Delete(DeleteAction),
    Update(UpdateAction),
    UpdateZip(UpdateZipAction),
}

/// Materializes a path absent from the old tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAction {
    pub path: String,
    /// Signature the created path will have.
    pub checksum: Signature,
}

/// Removes a path absent from the new tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteAction {
    pub path: String,
    /// Signature the path had in the old tree.
    pub checksum: Signature,
}

/// Old-tree path whose content a moved file is taken from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveSource {
    pub path: String,
    /// Unique candidate: the source must be present. Otherwise the payload
    /// carries the full content as a fallback.
    pub required: bool,
}

/// Replaces the content of a file or the target of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAction {
    pub path: String,
    /// Pre-image signature of the path read from: `source` for moves,
    /// `path` otherwise.
    pub checksum: Signature,
    pub new_checksum: Signature,
    pub source: Option<MoveSource>,
}

/// Rewrites an archive entry by entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateZipAction {
    pub path: String,
    pub checksum: Signature,
    pub new_checksum: Signature,
    pub added: BTreeSet<String>,
    pub updated: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

/// Everything an action needs while executing against a target.
pub struct ApplyContext<'a> {
    /// Target root (patch root already applied).
    pub target: &'a Path,
    pub payload: &'a Payload,
    /// Where move sources were copied before any action ran.
    pub stage: &'a Path,
    pub retry: RetryPolicy,
}

impl PatchAction {
    pub fn path(&self) -> &str {
        match self {
            Self::Create(a) => &a.path,
            Self::Delete(a) => &a.path,
            Self::Update(a) => &a.path,
            Self::UpdateZip(a) => &a.path,
        }
    }

    pub fn checksum(&self) -> Signature {
        match self {
            Self::Create(a) => a.checksum,
            Self::Delete(a) => a.checksum,
            Self::Update(a) => a.checksum,
            Self::UpdateZip(a) => a.checksum,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Create(_) => "Create",
            Self::Delete(_) => "Delete",
            Self::Update(_) => "Update",
            Self::UpdateZip(_) => "UpdateZip",
        }
    }

    pub fn validation_action(&self) -> ValidationAction {
        match self {
            Self::Create(_) => ValidationAction::Create,
            Self::Delete(_) => ValidationAction::Delete,
            Self::Update(_) | Self::UpdateZip(_) => ValidationAction::Update,
        }
    }

    pub fn move_source(&self) -> Option<&MoveSource> {
        match self {
            Self::Update(a) => a.source.as_ref(),
            _ => None,
        }
    }

    /// Copy the bytes this action needs from the new tree into `payload`.
    /// `full_content` forces a payload even for required moves.
    pub fn write_payload(&self, new_root: &Path, payload: &mut Payload, full_content: bool) -> Result<()> {
        match self {
            Self::Create(a) => {
                if !a.checksum.is_directory() {
                    payload.insert_file(&a.path, read_content(new_root, &a.path, a.checksum)?);
                }
            }
            Self::Delete(_) => {}
            Self::Update(a) => {
                let needs_bytes = match &a.source {
                    None => true,
                    Some(source) => !source.required || full_content || a.new_checksum.is_symlink(),
                };
                if needs_bytes {
                    payload.insert_file(&a.path, read_content(new_root, &a.path, a.new_checksum)?);
                }
            }
            Self::UpdateZip(a) => {
                let archive_path = util::resolve(new_root, &a.path);
                let file = fs::File::open(&archive_path).at(&archive_path)?;
                let mut archive =
                    zip::ZipArchive::new(file).map_err(|e| PatchError::zip(&archive_path, e))?;
                for name in a.added.iter().chain(a.updated.iter()) {
                    if name.ends_with('/') {
                        continue;
                    }
                    let mut entry = archive
                        .by_name(name)
                        .map_err(|e| PatchError::zip(&archive_path, e))?;
                    let mut data = Vec::with_capacity(entry.size() as usize);
                    std::io::copy(&mut entry, &mut data).at(&archive_path)?;
                    payload.insert_entry(&a.path, name, data);
                }
            }
        }
        Ok(())
    }

    /// Whether the target already looks the way this action would leave it.
    pub fn is_applied(&self, target: &Path) -> Result<bool> {
        let current = digest::digest_if_exists(&util::resolve(target, self.path()))?;
        Ok(match self {
            Self::Create(a) => current.is_some_and(|c| c.matches(a.checksum)),
            Self::Delete(_) => current.is_none(),
            Self::Update(a) => {
                let source_gone = match &a.source {
                    Some(source) => {
                        fs::symlink_metadata(util::resolve(target, &source.path)).is_err()
                            || same_location(&source.path, &a.path)
                    }
                    None => true,
                };
                current.is_some_and(|c| c.matches(a.new_checksum)) && source_gone
            }
            Self::UpdateZip(a) => current.is_some_and(|c| c.matches(a.new_checksum)),
        })
    }

    /// Save the pre-image of every path this action touches. The first backup
    /// of a path wins: later actions never overwrite an earlier pre-image.
    pub fn backup(&self, target: &Path, backup_dir: &Path) -> Result<()> {
        backup_path(target, backup_dir, self.path())?;
        if let Some(source) = self.move_source() {
            backup_path(target, backup_dir, &source.path)?;
        }
        Ok(())
    }

    pub fn apply(&self, ctx: &ApplyContext<'_>) -> Result<()> {
        trace!("Applying {} {}", self.name(), self.path());
        match self {
            Self::Create(a) => apply_create(a, ctx),
            Self::Delete(a) => {
                let full = util::resolve(ctx.target, &a.path);
                ctx.retry.run(&format!("delete {}", a.path), || util::remove_path(&full))
            }
            Self::Update(a) => apply_update(a, ctx),
            Self::UpdateZip(a) => apply_update_zip(a, ctx),
        }
    }

    /// Undo this action from the backup tree. Paths that were never backed up
    /// are left alone unless this action created them.
    pub fn revert(&self, target: &Path, backup_dir: &Path) -> Result<()> {
        trace!("Reverting {} {}", self.name(), self.path());
        match self {
            Self::Create(a) => restore_or_remove(target, backup_dir, &a.path),
            Self::Delete(a) => restore_if_backed_up(target, backup_dir, &a.path).map(|_| ()),
            Self::Update(a) => {
                match &a.source {
                    Some(source) => {
                        restore_or_remove(target, backup_dir, &a.path)?;
                        restore_if_backed_up(target, backup_dir, &source.path)?;
                    }
                    None => {
                        restore_if_backed_up(target, backup_dir, &a.path)?;
                    }
                }
                Ok(())
            }
            Self::UpdateZip(a) => restore_if_backed_up(target, backup_dir, &a.path).map(|_| ()),
        }
    }
}

impl UpdateZipAction {
    /// Entry-level diff of two archives. Both must be readable and non-empty.
    pub fn calculate(
        path: &str,
        old_file: &Path,
        new_file: &Path,
        checksum: Signature,
        new_checksum: Signature,
    ) -> Result<Self> {
        let old_entries = digest::digest_archive_entries(old_file)?;
        if old_entries.is_empty() {
            return Err(PatchError::CorruptArchive(old_file.to_path_buf()));
        }
        let new_entries = digest::digest_archive_entries(new_file)?;
        if new_entries.is_empty() {
            return Err(PatchError::CorruptArchive(new_file.to_path_buf()));
        }

        let mut action = Self {
            path: path.to_string(),
            checksum,
            new_checksum,
            added: BTreeSet::new(),
            updated: BTreeSet::new(),
            removed: BTreeSet::new(),
        };
        for (name, sig) in &new_entries {
            match old_entries.get(name) {
                None => {
                    action.added.insert(name.clone());
                }
                Some(old_sig) if old_sig != sig => {
                    action.updated.insert(name.clone());
                }
                Some(_) => {}
            }
        }
        action.removed = old_entries
            .keys()
            .filter(|name| !new_entries.contains_key(*name))
            .cloned()
            .collect();
        Ok(action)
    }
}

fn read_content(root: &Path, relative_path: &str, sig: Signature) -> Result<Vec<u8>> {
    let full = util::resolve(root, relative_path);
    if sig.is_symlink() {
        Ok(util::link_target(&full)?.into_bytes())
    } else {
        util::read_file(&full)
    }
}

/// Whether two relative paths name the same file on this platform.
fn same_location(a: &str, b: &str) -> bool {
    a == b || (!cfg!(target_os = "linux") && a.eq_ignore_ascii_case(b))
}

fn write_content(full: &Path, relative_path: &str, sig: Signature, data: &[u8]) -> Result<()> {
    util::remove_path(full)?;
    util::create_parent_dirs(full)?;
    if sig.is_symlink() {
        let target = std::str::from_utf8(data)
            .map_err(|_| PatchError::UnsupportedPath(full.to_path_buf()))?;
        util::create_symlink(target, full)?;
    } else {
        fs::write(full, data).at(full)?;
        util::set_executable(full, sig.is_executable())?;
    }
    verify(full, relative_path, sig)
}

fn verify(full: &Path, relative_path: &str, expected: Signature) -> Result<()> {
    let actual = digest::digest_path(full)?;
    if actual.matches(expected) {
        Ok(())
    } else {
        Err(PatchError::ChecksumMismatch {
            path: relative_path.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

fn apply_create(a: &CreateAction, ctx: &ApplyContext<'_>) -> Result<()> {
    let full = util::resolve(ctx.target, &a.path);
    if a.checksum.is_directory() {
        if full.is_file() || full.is_symlink() {
            util::remove_path(&full)?;
        }
        return fs::create_dir_all(&full).at(&full);
    }
    let data = ctx
        .payload
        .file(&a.path)
        .ok_or_else(|| PatchError::MissingPayload(a.path.clone()))?;
    ctx.retry.run(&format!("create {}", a.path), || {
        write_content(&full, &a.path, a.checksum, data)
    })
}

fn apply_update(a: &UpdateAction, ctx: &ApplyContext<'_>) -> Result<()> {
    let full = util::resolve(ctx.target, &a.path);

    let staged = a
        .source
        .as_ref()
        .map(|s| util::resolve(ctx.stage, &s.path))
        .filter(|p| fs::symlink_metadata(p).is_ok());

    let data = ctx.payload.file(&a.path);
    if data.is_none() && staged.is_none() {
        return Err(match &a.source {
            Some(source) => PatchError::MissingSource {
                path: a.path.clone(),
                source_path: source.path.clone(),
            },
            None => PatchError::MissingPayload(a.path.clone()),
        });
    }

    if let Some(source) = &a.source {
        if !same_location(&source.path, &a.path) {
            let source_full = util::resolve(ctx.target, &source.path);
            ctx.retry.run(&format!("remove {}", source.path), || {
                util::remove_path(&source_full)
            })?;
        }
    }

    ctx.retry.run(&format!("update {}", a.path), || match (data, &staged) {
        (Some(data), _) if a.new_checksum.is_symlink() || staged.is_none() => {
            write_content(&full, &a.path, a.new_checksum, data)
        }
        (_, Some(staged)) => {
            debug!("Moving {} from staged source", a.path);
            util::remove_path(&full)?;
            util::copy_recursively(staged, &full)?;
            util::set_executable(&full, a.new_checksum.is_executable())?;
            verify(&full, &a.path, a.new_checksum)
        }
        _ => Err(PatchError::MissingPayload(a.path.clone())),
    })
}

fn apply_update_zip(a: &UpdateZipAction, ctx: &ApplyContext<'_>) -> Result<()> {
    let full = util::resolve(ctx.target, &a.path);
    let parent = full.parent().unwrap_or(ctx.target);

    let file = fs::File::open(&full).at(&full)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| PatchError::zip(&full, e))?;
    let mut temp = tempfile::NamedTempFile::new_in(parent).at(parent)?;

    {
        let mut writer = zip::ZipWriter::new(temp.as_file_mut());
        for i in 0..archive.len() {
            let entry = archive.by_index_raw(i).map_err(|e| PatchError::zip(&full, e))?;
            let name = entry.name().to_string();
            if a.removed.contains(&name) {
                continue;
            }
            if a.updated.contains(&name) {
                let options = SimpleFileOptions::default().compression_method(entry.compression());
                drop(entry);
                write_entry(&mut writer, a, &name, options, ctx.payload, &full)?;
                continue;
            }
            writer
                .raw_copy_file(entry)
                .map_err(|e| PatchError::zip(&full, e))?;
        }
        for name in &a.added {
            write_entry(&mut writer, a, name, SimpleFileOptions::default(), ctx.payload, &full)?;
        }
        writer.finish().map_err(|e| PatchError::zip(&full, e))?;
    }
    drop(archive);

    let temp_path = temp.into_temp_path();
    ctx.retry.run(&format!("replace {}", a.path), || {
        fs::rename(&temp_path, &full).at(&full)
    })?;
    util::set_executable(&full, a.new_checksum.is_executable())?;
    verify(&full, &a.path, a.new_checksum)
}

fn write_entry<W: Write + std::io::Seek>(
    writer: &mut zip::ZipWriter<W>,
    action: &UpdateZipAction,
    name: &str,
    options: SimpleFileOptions,
    payload: &Payload,
    archive_path: &Path,
) -> Result<()> {
    if name.ends_with('/') {
        return writer
            .add_directory(name, options)
            .map_err(|e| PatchError::zip(archive_path, e));
    }
    let data = payload
        .entry(&action.path, name)
        .ok_or_else(|| PatchError::MissingPayload(format!("{}!{}", action.path, name)))?;
    writer
        .start_file(name, options)
        .map_err(|e| PatchError::zip(archive_path, e))?;
    writer.write_all(data).at(archive_path)
}

fn backup_path(target: &Path, backup_dir: &Path, relative_path: &str) -> Result<()> {
    let src = util::resolve(target, relative_path);
    let dst = util::resolve(backup_dir, relative_path);
    if fs::symlink_metadata(&src).is_err() {
        return Ok(());
    }
    trace!("Backing up {relative_path}");
    merge_backup(&src, &dst)
}

/// Copy `src` to `dst`, filling in only what is not saved yet. A directory whose
/// backup exists because a child was saved first still gets its other entries.
fn merge_backup(src: &Path, dst: &Path) -> Result<()> {
    let Ok(saved) = fs::symlink_metadata(dst) else {
        return util::copy_recursively(src, dst);
    };
    let meta = fs::symlink_metadata(src).at(src)?;
    if !(saved.is_dir() && meta.is_dir()) {
        return Ok(());
    }
    for entry in fs::read_dir(src).at(src)? {
        let entry = entry.at(src)?;
        merge_backup(&entry.path(), &dst.join(entry.file_name()))?;
    }
    Ok(())
}

/// Put the pre-image back. Returns whether a backup existed.
fn restore_if_backed_up(target: &Path, backup_dir: &Path, relative_path: &str) -> Result<bool> {
    let saved = util::resolve(backup_dir, relative_path);
    if fs::symlink_metadata(&saved).is_err() {
        return Ok(false);
    }
    let full = util::resolve(target, relative_path);
    util::remove_path(&full)?;
    util::copy_recursively(&saved, &full)?;
    Ok(true)
}

fn restore_or_remove(target: &Path, backup_dir: &Path, relative_path: &str) -> Result<()> {
    if !restore_if_backed_up(target, backup_dir, relative_path)? {
        util::remove_path(&util::resolve(target, relative_path))?;
    }
    Ok(())
}
