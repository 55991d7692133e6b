use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use memmap2::Mmap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{IoContext, PatchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Forward-slash relative path; directories carry a trailing `/`.
    pub relative_path: String,
    pub kind: EntryKind,
    pub full_path: PathBuf,
    /// File size in bytes (0 for directories and links).
    pub size: u64,
}

/// Glob list compiled once and matched against tree-relative paths.
#[derive(Debug, Clone)]
pub struct PathMatcher {
    set: GlobSet,
}

impl PathMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S], case_sensitive: bool) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim_end_matches('/');
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(!case_sensitive)
                .literal_separator(false)
                .build()?;
            builder.add(glob);
        }
        Ok(Self {
            set: builder.build()?,
        })
    }

    pub fn empty() -> Self {
        Self {
            set: GlobSet::empty(),
        }
    }

    /// Directory paths match with or without their trailing slash.
    pub fn is_match(&self, relative_path: &str) -> bool {
        self.set.is_match(relative_path.trim_end_matches('/'))
    }
}

/// Bounded sleep-and-retry for files held open by another process.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    warn!("{what} failed (attempt {attempt}/{}): {e}", self.attempts);
                    std::thread::sleep(self.delay * attempt);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Walk a directory tree and collect all entries with relative paths.
/// Paths use forward slashes for cross-platform consistency in the patch format.
/// Symlinks are reported as links and never followed; ignored entries (and
/// everything under an ignored directory) are skipped.
pub fn walk_directory(root: &Path, ignored: &PathMatcher) -> Result<Vec<DirEntry>> {
    let root = root.canonicalize().at(root)?;

    let mut entries = Vec::new();
    let walker = WalkDir::new(&root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| match relative_of(&root, e.path(), e.file_type().is_dir()) {
            Ok(rel) => !ignored.is_match(&rel),
            Err(_) => true,
        });

    for entry in walker {
        let entry = entry.map_err(|source| PatchError::Walk {
            path: root.clone(),
            source,
        })?;

        let file_type = entry.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        let full_path = entry.path().to_path_buf();
        let relative_path = relative_of(&root, &full_path, kind == EntryKind::Dir)?;

        let size = if kind == EntryKind::File {
            entry.metadata().map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };

        entries.push(DirEntry {
            relative_path,
            kind,
            full_path,
            size,
        });
    }

    debug!("Walked {}: {} entries", root.display(), entries.len());
    Ok(entries)
}

fn relative_of(root: &Path, full: &Path, is_dir: bool) -> Result<String> {
    let relative = full
        .strip_prefix(root)
        .map_err(|_| PatchError::UnsupportedPath(full.to_path_buf()))?;
    let mut s = relative
        .to_str()
        .ok_or_else(|| PatchError::UnsupportedPath(full.to_path_buf()))?
        .replace('\\', "/");
    if is_dir {
        s.push('/');
    }
    Ok(s)
}

/// Resolve a tree-relative path (possibly `/`-suffixed) under `root`.
pub fn resolve(root: &Path, relative_path: &str) -> PathBuf {
    let trimmed = relative_path.trim_end_matches('/');
    if trimmed.is_empty() {
        root.to_path_buf()
    } else {
        root.join(trimmed)
    }
}

/// Key used to pair paths between trees on case-insensitive filesystems.
pub fn path_key(relative_path: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        relative_path.to_string()
    } else {
        relative_path.to_lowercase()
    }
}

/// Whether `path` lies strictly below the directory `dir` (which ends with `/`).
pub fn is_under(path: &str, dir: &str) -> bool {
    dir.ends_with('/') && path.len() > dir.len() && path.starts_with(dir)
}

/// Length of the shared leading path components of two relative paths.
pub fn common_prefix_len(a: &str, b: &str) -> usize {
    a.split('/')
        .zip(b.split('/'))
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x.len() + 1)
        .sum()
}

pub fn is_archive(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    matches!(ext.as_deref(), Some("zip" | "jar" | "war" | "ear" | "apk"))
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = fs::File::open(path).at(path)?;
    // SAFETY: We only read from this mapping; no concurrent modification of these files.
    unsafe { Mmap::map(&file).at(path) }
}

/// Read the full content of a file. Empty files are not mapped.
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    let len = fs::metadata(path).at(path)?.len();
    if len == 0 {
        return Ok(Vec::new());
    }
    Ok(mmap_file(path)?.to_vec())
}

pub fn link_target(path: &Path) -> Result<String> {
    let target = fs::read_link(path).at(path)?;
    target
        .to_str()
        .map(|s| s.to_string())
        .ok_or(PatchError::UnsupportedPath(target))
}

pub fn create_symlink(target: &str, link: &Path) -> Result<()> {
    #[cfg(unix)]
    let res = std::os::unix::fs::symlink(target, link);
    #[cfg(windows)]
    let res = std::os::windows::fs::symlink_file(target, link);
    res.at(link)
}

pub fn set_executable(path: &Path, executable: bool) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path).at(path)?.permissions();
        let mode = perms.mode();
        let new_mode = if executable {
            mode | ((mode & 0o444) >> 2)
        } else {
            mode & !0o111
        };
        if new_mode != mode {
            perms.set_mode(new_mode);
            fs::set_permissions(path, perms).at(path)?;
        }
    }
    #[cfg(not(unix))]
    let _ = (path, executable);
    Ok(())
}

pub fn create_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    Ok(())
}

/// Remove a file, link or whole directory tree. Missing paths are not an error.
pub fn remove_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(PatchError::io(path, e)),
    };
    let res = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        if meta.permissions().readonly() {
            let mut perms = meta.permissions();
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(false);
            let _ = fs::set_permissions(path, perms);
        }
        fs::remove_file(path)
    };
    match res {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PatchError::io(path, e)),
    }
}

/// Copy a file, link or directory tree to `dst`, creating parents as needed.
/// Links are recreated, not followed.
pub fn copy_recursively(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src).at(src)?;
    create_parent_dirs(dst)?;
    if meta.file_type().is_symlink() {
        remove_path(dst)?;
        create_symlink(&link_target(src)?, dst)
    } else if meta.is_dir() {
        fs::create_dir_all(dst).at(dst)?;
        for entry in fs::read_dir(src).at(src)? {
            let entry = entry.at(src)?;
            copy_recursively(&entry.path(), &dst.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        if fs::symlink_metadata(dst).is_ok() {
            remove_path(dst)?;
        }
        fs::copy(src, dst).at(dst)?;
        Ok(())
    }
}

/// Sort paths so children come before parents (for deletion).
pub fn sort_deepest_first(paths: &mut [String]) {
    paths.sort();
    paths.reverse();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_under() {
        assert!(is_under("a/b.txt", "a/"));
        assert!(is_under("a/b/c", "a/"));
        assert!(!is_under("a/", "a/"));
        assert!(!is_under("ab/c", "a/"));
    }

    #[test]
    fn test_common_prefix_len_counts_components() {
        assert_eq!(common_prefix_len("lib/x/a.bin", "lib/x/b.bin"), "lib/x/".len());
        assert_eq!(common_prefix_len("lib/a.bin", "bin/a.bin"), 0);
    }

    #[test]
    fn test_matcher_dirs_and_case() {
        let m = PathMatcher::new(&["*.log", "cache/"], true).unwrap();
        assert!(m.is_match("error.log"));
        assert!(m.is_match("sub/deep/error.log"));
        assert!(m.is_match("cache/"));
        assert!(!m.is_match("ERROR.LOG"));

        let m = PathMatcher::new(&["*.log"], false).unwrap();
        assert!(m.is_match("ERROR.LOG"));
        assert!(!PathMatcher::empty().is_match("anything"));
        let none: &[&str] = &[];
        assert!(!PathMatcher::new(none, true).unwrap().is_match(""));
    }

    #[test]
    fn test_deepest_first_order() {
        let mut dirs = vec!["a/b/".to_string(), "a/".to_string(), "a/b/c".to_string()];
        sort_deepest_first(&mut dirs);
        assert_eq!(dirs, vec!["a/b/c", "a/b/", "a/"]);
    }

    #[test]
    fn test_walk_skips_ignored_subtrees() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("keep/sub")).unwrap();
        fs::create_dir_all(temp.path().join("skip")).unwrap();
        fs::write(temp.path().join("keep/sub/a.txt"), b"a").unwrap();
        fs::write(temp.path().join("skip/b.txt"), b"b").unwrap();
        fs::write(temp.path().join("x.tmp"), b"x").unwrap();

        let ignored = PathMatcher::new(&["skip/", "*.tmp"], true).unwrap();
        let entries = walk_directory(temp.path(), &ignored).unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["keep/", "keep/sub/", "keep/sub/a.txt"]);
        assert_eq!(entries[2].size, 1);
    }

    #[test]
    fn test_retry_gives_up_after_attempts() {
        let policy = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(1),
        };
        let mut calls = 0;
        let res: Result<()> = policy.run("write", || {
            calls += 1;
            Err(PatchError::io(
                "x",
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked"),
            ))
        });
        assert!(res.is_err());
        assert_eq!(calls, 3);
    }
}
