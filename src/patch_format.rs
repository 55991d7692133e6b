//! On-disk patch container: an 8-byte magic followed by a zstd-compressed
//! bincode manifest holding the patch description and the payload bytes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use tracing::debug;

use crate::error::{IoContext, PatchError, Result};
use crate::patch::Patch;
use crate::util;

pub const MAGIC: &[u8; 8] = b"TPATCH01";
pub const FORMAT_VERSION: u32 = 1;
const COMPRESSION_LEVEL: i32 = 3;

/// New-content bytes for actions not satisfied by an in-tree move.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Whole-file content (link target text for symlinks), by relative path.
    files: BTreeMap<String, Vec<u8>>,
    /// Added/updated archive entries: archive path, then entry name.
    entries: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
}

impl Payload {
    pub fn insert_file(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(path.to_string(), data);
    }

    pub fn insert_entry(&mut self, archive: &str, entry: &str, data: Vec<u8>) {
        self.entries
            .entry(archive.to_string())
            .or_default()
            .insert(entry.to_string(), data);
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(|v| v.as_slice())
    }

    pub fn entry(&self, archive: &str, entry: &str) -> Option<&[u8]> {
        self.entries
            .get(archive)
            .and_then(|m| m.get(entry))
            .map(|v| v.as_slice())
    }

    pub fn total_bytes(&self) -> usize {
        self.files.values().map(|v| v.len()).sum::<usize>()
            + self
                .entries
                .values()
                .flat_map(|m| m.values())
                .map(|v| v.len())
                .sum::<usize>()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PatchManifest {
    version: u32,
    patch: Patch,
    payload: Payload,
}

/// Serialize, compress and write a patch container to any writer.
pub fn write_to<W: Write>(mut out: W, patch: &Patch, payload: &Payload) -> Result<()> {
    let manifest = PatchManifest {
        version: FORMAT_VERSION,
        patch: patch.clone(),
        payload: payload.clone(),
    };
    let encoded = bincode::serialize(&manifest)?;
    let compressed = zstd::bulk::compress(&encoded, COMPRESSION_LEVEL)
        .map_err(|e| PatchError::io("<patch>", e))?;
    out.write_all(MAGIC).at("<patch>")?;
    out.write_all(&compressed).at("<patch>")?;
    out.flush().at("<patch>")
}

/// Read a patch container from raw bytes (magic included).
pub fn read_from(raw: &[u8]) -> Result<(Patch, Payload)> {
    if raw.len() < MAGIC.len() || &raw[..MAGIC.len()] != MAGIC {
        return Err(PatchError::BadMagic);
    }
    let decoder = zstd::Decoder::new(&raw[MAGIC.len()..]).at("<patch>")?;
    let manifest: PatchManifest = bincode::deserialize_from(decoder)?;
    if manifest.version != FORMAT_VERSION {
        return Err(PatchError::UnsupportedVersion {
            found: manifest.version,
            expected: FORMAT_VERSION,
        });
    }
    Ok((manifest.patch, manifest.payload))
}

pub fn write_patch_file(path: &Path, patch: &Patch, payload: &Payload) -> Result<()> {
    let file = std::fs::File::create(path).at(path)?;
    write_to(std::io::BufWriter::new(file), patch, payload)?;
    debug!(
        "Wrote {} ({} actions, {} payload bytes)",
        path.display(),
        patch.actions.len(),
        payload.total_bytes()
    );
    Ok(())
}

/// mmap the patch file, check magic, then stream-decompress into bincode.
pub fn read_patch_file(path: &Path) -> Result<(Patch, Payload)> {
    let raw = util::mmap_file(path)?;
    read_from(&raw)
}

/// Encode any serializable value the way the container does, without framing.
/// Used for the applied-actions journal next to a backup tree.
pub fn write_journal<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let encoded = bincode::serialize(value)?;
    std::fs::write(path, encoded).at(path)
}

pub fn read_journal<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let mut data = Vec::new();
    std::fs::File::open(path)
        .at(path)?
        .read_to_end(&mut data)
        .at(path)?;
    Ok(bincode::deserialize(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{CreateAction, PatchAction};
    use crate::digest::{self, Signature};

    fn sample_patch() -> Patch {
        let mut patch = Patch::default();
        patch.actions.push(PatchAction::Create(CreateAction {
            path: "dir/".into(),
            checksum: Signature::DIRECTORY,
        }));
        patch.actions.push(PatchAction::Create(CreateAction {
            path: "dir/a.txt".into(),
            checksum: digest::digest_bytes(b"a"),
        }));
        patch.ignored_files.push("*.log".into());
        patch
    }

    #[test]
    fn test_container_round_trip() {
        let patch = sample_patch();
        let mut payload = Payload::default();
        payload.insert_file("dir/a.txt", b"a".to_vec());
        payload.insert_entry("lib/x.jar", "A.class", b"class".to_vec());

        let mut buf = Vec::new();
        write_to(&mut buf, &patch, &payload).unwrap();
        assert_eq!(&buf[..8], MAGIC);

        let (read_patch, read_payload) = read_from(&buf).unwrap();
        assert_eq!(read_patch, patch);
        assert_eq!(read_payload, payload);
        assert_eq!(read_payload.entry("lib/x.jar", "A.class"), Some(&b"class"[..]));
    }

    #[test]
    fn test_bad_magic_rejected() {
        assert!(matches!(read_from(b"NOTAPATCH"), Err(PatchError::BadMagic)));
        assert!(matches!(read_from(b""), Err(PatchError::BadMagic)));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let manifest = PatchManifest {
            version: FORMAT_VERSION + 1,
            patch: Patch::default(),
            payload: Payload::default(),
        };
        let mut buf = MAGIC.to_vec();
        buf.extend(zstd::bulk::compress(&bincode::serialize(&manifest).unwrap(), 3).unwrap());
        assert!(matches!(
            read_from(&buf),
            Err(PatchError::UnsupportedVersion { found, .. }) if found == FORMAT_VERSION + 1
        ));
    }
}
