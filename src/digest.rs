//! Content fingerprints for files, directories and symlinks.
//!
//! A [`Signature`] packs a 32-bit content hash into the low bits and type flags
//! into the high byte. Directories always digest to [`Signature::DIRECTORY`];
//! links digest their raw target string with the [`Signature::SYMLINK`] tag so
//! they never compare equal to a regular file with the same bytes. Archives are
//! digested entry by entry so that rewriting one with identical entries keeps
//! its fingerprint.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;

use crate::error::{IoContext, PatchError, Result};
use crate::util::{self, EntryKind, PathMatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature(pub u64);

impl Signature {
    pub const INVALID: Signature = Signature(0x8000_0000_0000_0000);
    pub const DIRECTORY: Signature = Signature(0x4000_0000_0000_0000);
    pub const SYMLINK: u64 = 0x0200_0000_0000_0000;
    pub const EXECUTABLE: u64 = 0x0100_0000_0000_0000;
    const FLAG_MASK: u64 = 0xFF00_0000_0000_0000;

    fn from_content(hash: u32, flags: u64) -> Self {
        Signature(hash as u64 | flags)
    }

    pub fn is_directory(self) -> bool {
        self == Self::DIRECTORY
    }

    pub fn is_symlink(self) -> bool {
        self.0 & Self::SYMLINK != 0 && self != Self::INVALID
    }

    pub fn is_executable(self) -> bool {
        self.0 & Self::EXECUTABLE != 0
    }

    pub fn kind(self) -> EntryKind {
        if self.is_directory() {
            EntryKind::Dir
        } else if self.is_symlink() {
            EntryKind::Symlink
        } else {
            EntryKind::File
        }
    }

    /// Content equality; the executable flag only counts where the platform
    /// can represent it.
    pub fn matches(self, other: Signature) -> bool {
        if cfg!(unix) {
            self == other
        } else {
            (self.0 & !Self::EXECUTABLE) == (other.0 & !Self::EXECUTABLE)
        }
    }

    /// The signature without type flags.
    pub fn content(self) -> u64 {
        self.0 & !Self::FLAG_MASK
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

fn truncate(hash: blake3::Hash) -> u32 {
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Digest any stream of bytes as regular-file content.
/// Uses a 256 KB BufReader to reduce syscall overhead vs the default 8 KB.
pub fn digest_reader<R: Read>(reader: R) -> std::io::Result<Signature> {
    let mut reader = std::io::BufReader::with_capacity(256 * 1024, reader);
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut reader, &mut hasher)?;
    Ok(Signature::from_content(truncate(hasher.finalize()), 0))
}

pub fn digest_bytes(data: &[u8]) -> Signature {
    Signature::from_content(truncate(blake3::hash(data)), 0)
}

/// Signature of a symlink pointing at `target`.
pub fn digest_link(target: &str) -> Signature {
    Signature::from_content(truncate(blake3::hash(target.as_bytes())), Signature::SYMLINK)
}

/// Digest whatever is at `path`: directory marker, link target or file content.
pub fn digest_path(path: &Path) -> Result<Signature> {
    let meta = fs::symlink_metadata(path).at(path)?;
    if meta.file_type().is_symlink() {
        return Ok(digest_link(&util::link_target(path)?));
    }
    if meta.is_dir() {
        return Ok(Signature::DIRECTORY);
    }

    let flags = if is_executable(&meta) {
        Signature::EXECUTABLE
    } else {
        0
    };

    if util::is_archive(path) {
        if let Some(sig) = digest_archive(path)? {
            return Ok(Signature(sig.0 | flags));
        }
    }

    let file = fs::File::open(path).at(path)?;
    let sig = digest_reader(file).at(path)?;
    Ok(Signature(sig.0 | flags))
}

/// Digest of a path, or `None` when nothing exists there.
pub fn digest_if_exists(path: &Path) -> Result<Option<Signature>> {
    match fs::symlink_metadata(path) {
        Ok(_) => digest_path(path).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PatchError::io(path, e)),
    }
}

/// Entry-level digest of an archive: sorted names plus entry contents.
/// Returns `None` if the file is not a readable archive.
fn digest_archive(path: &Path) -> Result<Option<Signature>> {
    let file = fs::File::open(path).at(path)?;
    let mut archive = match zip::ZipArchive::new(file) {
        Ok(a) => a,
        Err(_) => return Ok(None),
    };

    let mut names: Vec<String> = archive.file_names().map(|n| n.to_string()).collect();
    names.sort();

    let mut hasher = blake3::Hasher::new();
    hasher.update(b"zip\0");
    for name in names {
        hasher.update(name.as_bytes());
        hasher.update(b"\0");
        let mut entry = archive.by_name(&name).map_err(|e| PatchError::zip(path, e))?;
        let entry_sig = digest_reader(&mut entry).at(path)?;
        hasher.update(&entry_sig.0.to_le_bytes());
    }
    Ok(Some(Signature::from_content(truncate(hasher.finalize()), 0)))
}

/// Per-entry signatures of an archive, keyed by entry name.
pub fn digest_archive_entries(path: &Path) -> Result<BTreeMap<String, Signature>> {
    let file = fs::File::open(path).at(path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|_| PatchError::CorruptArchive(path.to_path_buf()))?;
    let mut result = BTreeMap::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| PatchError::zip(path, e))?;
        let name = entry.name().to_string();
        let sig = if entry.is_dir() {
            Signature::DIRECTORY
        } else {
            digest_reader(&mut entry).at(path)?
        };
        result.insert(name, sig);
    }
    Ok(result)
}

/// Digest every entry under `root` except ignored ones.
pub fn digest_files(root: &Path, ignored: &PathMatcher) -> Result<BTreeMap<String, Signature>> {
    let mut result = BTreeMap::new();
    for entry in util::walk_directory(root, ignored)? {
        let sig = match entry.kind {
            EntryKind::Dir => Signature::DIRECTORY,
            _ => digest_path(&entry.full_path)?,
        };
        result.insert(entry.relative_path, sig);
    }
    Ok(result)
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])], method: zip::CompressionMethod) {
        let mut zip = zip::ZipWriter::new(fs::File::create(path).unwrap());
        let options = SimpleFileOptions::default().compression_method(method);
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_directory_sentinel() {
        let temp = tempfile::tempdir().unwrap();
        assert_eq!(digest_path(temp.path()).unwrap(), Signature::DIRECTORY);
    }

    #[test]
    fn test_file_and_stream_agree() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("a.txt");
        fs::write(&path, b"hello").unwrap();
        assert_eq!(digest_path(&path).unwrap(), digest_bytes(b"hello"));
        assert_eq!(digest_reader(&b"hello"[..]).unwrap(), digest_bytes(b"hello"));
        assert_ne!(digest_bytes(b"hello"), digest_bytes(b"hello!"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_never_equals_file() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("plain");
        fs::write(&file, b"target.txt").unwrap();
        let link = temp.path().join("link");
        std::os::unix::fs::symlink("target.txt", &link).unwrap();

        let link_sig = digest_path(&link).unwrap();
        assert!(link_sig.is_symlink());
        assert_eq!(link_sig, digest_link("target.txt"));
        assert_ne!(link_sig, digest_path(&file).unwrap());
        assert_eq!(link_sig.content(), digest_path(&file).unwrap().content());
        assert_ne!(digest_link("./target.txt"), link_sig);
    }

    #[test]
    fn test_archive_digest_ignores_compression() {
        let temp = tempfile::tempdir().unwrap();
        let a = temp.path().join("a.jar");
        let b = temp.path().join("b.jar");
        let entries: &[(&str, &[u8])] = &[("A.class", b"aaaa"), ("B.class", b"bbbb")];
        write_zip(&a, entries, zip::CompressionMethod::Stored);
        write_zip(&b, &[entries[1], entries[0]], zip::CompressionMethod::Deflated);
        assert_eq!(digest_path(&a).unwrap(), digest_path(&b).unwrap());

        write_zip(&b, &[("A.class", b"aaaa"), ("B.class", b"cccc")], zip::CompressionMethod::Stored);
        assert_ne!(digest_path(&a).unwrap(), digest_path(&b).unwrap());
    }

    #[test]
    fn test_broken_archive_digests_as_bytes() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("broken.zip");
        fs::write(&path, b"not a zip").unwrap();
        assert_eq!(digest_path(&path).unwrap(), digest_bytes(b"not a zip"));
        assert!(matches!(
            digest_archive_entries(&path),
            Err(PatchError::CorruptArchive(_))
        ));
    }

    #[test]
    fn test_digest_files_maps_tree() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("d")).unwrap();
        fs::write(temp.path().join("d/f.txt"), b"f").unwrap();
        fs::write(temp.path().join("skip.log"), b"s").unwrap();

        let ignored = PathMatcher::new(&["*.log"], true).unwrap();
        let map = digest_files(temp.path(), &ignored).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["d/"], Signature::DIRECTORY);
        assert_eq!(map["d/f.txt"], digest_bytes(b"f"));
    }
}
