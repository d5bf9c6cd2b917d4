//! Content-addressed attachment store (C3, spec §4.3).
//!
//! Layout: `attachments/<aa>/<hash>/<filename>`, where `<aa>` is the first
//! two lowercase hex characters of the SHA-256 hash. Writes stream through
//! a temp file under `attachments/.tmp/` and are moved into place with a
//! single atomic rename, so a reader never observes a partial blob.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::fs::FileSystem;

pub const ATTACHMENTS_DIR: &str = "attachments";
const TMP_DIR: &str = "attachments/.tmp";

lazy_static::lazy_static! {
    static ref HASH_RE: Regex = Regex::new("^[0-9a-f]{64}$").unwrap();
    static ref SHARD_RE: Regex = Regex::new("^[0-9a-f]{2}$").unwrap();
    static ref SAFE_FILENAME_CHARS: Regex = Regex::new("[^A-Za-z0-9._-]").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub hash: String,
    pub size_bytes: u64,
    /// Relative, POSIX-style path from the repository root.
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureViolationKind {
    BadShardName,
    ShardMismatch,
    UnexpectedEntry,
}

#[derive(Debug, Clone)]
pub struct StructureViolation {
    pub kind: StructureViolationKind,
    pub path: String,
    pub message: String,
}

pub struct AttachmentStore {
    fs: Arc<dyn FileSystem>,
    root: PathBuf,
}

impl AttachmentStore {
    pub fn new(fs: Arc<dyn FileSystem>, repo_root: impl Into<PathBuf>) -> Self {
        Self { fs, root: repo_root.into() }
    }

    fn attachments_root(&self) -> PathBuf {
        self.root.join(ATTACHMENTS_DIR)
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    fn blob_dir(&self, hash: &str) -> PathBuf {
        self.attachments_root().join(&hash[0..2]).join(hash)
    }

    /// Sanitizes a filename hint to `[A-Za-z0-9._-]`, falling back to a
    /// type-specific synthetic name when the hint is empty after
    /// sanitization (spec §4.3).
    pub fn sanitize_filename(hint: &str, content_type: &str) -> String {
        let sanitized = SAFE_FILENAME_CHARS.replace_all(hint, "_").to_string();
        let mut trimmed = sanitized.trim_matches('_').to_string();
        if !trimmed.is_empty() && trimmed.chars().all(|c| c == '.') {
            // A component that's *only* dots (".", "..") would act as a
            // directory traversal segment once joined onto a path.
            trimmed.clear();
        }
        if trimmed.is_empty() {
            let ext = extension_for_content_type(content_type);
            format!("attachment{ext}")
        } else {
            trimmed
        }
    }

    /// Streams `reader` into the store, returning the resulting
    /// [`Attachment`]. If a blob with the same hash already exists, the
    /// staged temp file is discarded and the existing blob returned.
    pub fn store(&self, mut reader: impl Read, filename_hint: &str) -> Result<Attachment> {
        self.fs.create_dir_all(&self.tmp_dir())?;
        let tmp_path = self.tmp_dir().join(format!("stage-{}", tmp_suffix()));
        let mut hasher = Sha256::new();
        let mut size_bytes: u64 = 0;
        {
            let mut writer = self.fs.open_write_new(&tmp_path)?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf).map_err(|e| Error::io(&tmp_path, "read", e))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                size_bytes += n as u64;
                std::io::Write::write_all(&mut writer, &buf[..n]).map_err(|e| Error::io(&tmp_path, "write", e))?;
            }
        }
        let hash = hex::encode(hasher.finalize());
        let dir = self.blob_dir(&hash);
        let filename = filename_hint.to_string();
        let dest = dir.join(&filename);
        let path_str = format!("{}/{}/{}/{}", ATTACHMENTS_DIR, &hash[0..2], hash, filename);

        if self.fs.exists(&dest) {
            let _ = self.fs.remove_file(&tmp_path);
            return Ok(Attachment { hash, size_bytes, path: path_str });
        }
        self.fs.create_dir_all(&dir)?;
        self.fs.rename(&tmp_path, &dest)?;
        Ok(Attachment { hash, size_bytes, path: path_str })
    }

    pub fn exists(&self, hash: &str) -> Result<bool> {
        if !HASH_RE.is_match(hash) {
            return Err(Error::InsecurePath { path: hash.to_string() });
        }
        let dir = self.blob_dir(hash);
        if !self.fs.exists(&dir) {
            return Ok(false);
        }
        Ok(!self.fs.list_dir(&dir)?.is_empty())
    }

    pub fn path(&self, hash: &str) -> Result<Option<String>> {
        let dir = self.blob_dir(hash);
        if !self.fs.exists(&dir) {
            return Ok(None);
        }
        let entries = self.fs.list_dir(&dir)?;
        let file = entries.into_iter().find(|e| !e.is_dir);
        Ok(file.map(|e| {
            format!("{}/{}/{}/{}", ATTACHMENTS_DIR, &hash[0..2], hash, e.path.file_name().unwrap().to_string_lossy())
        }))
    }

    pub fn read(&self, hash: &str) -> Result<Vec<u8>> {
        let rel = self.path(hash)?.ok_or_else(|| {
            Error::io(self.root.join(hash), "read attachment", std::io::Error::new(std::io::ErrorKind::NotFound, "no such attachment"))
        })?;
        self.fs.read(&self.root.join(rel))
    }

    pub fn verify(&self, hash: &str) -> Result<bool> {
        let bytes = self.read(hash)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()) == hash)
    }

    /// Enumerates every blob by walking the shard directories.
    pub fn list(&self) -> Result<Vec<Attachment>> {
        let mut out = Vec::new();
        self.stream(|a| {
            out.push(a);
            Ok(())
        })?;
        Ok(out)
    }

    pub fn stream(&self, mut callback: impl FnMut(Attachment) -> Result<()>) -> Result<()> {
        let root = self.attachments_root();
        if !self.fs.exists(&root) {
            return Ok(());
        }
        for shard in self.fs.list_dir(&root)? {
            if !shard.is_dir || shard.path.file_name().map(|n| n == ".tmp").unwrap_or(false) {
                continue;
            }
            for hash_dir in self.fs.list_dir(&shard.path)? {
                if !hash_dir.is_dir {
                    continue;
                }
                let hash = hash_dir.path.file_name().unwrap().to_string_lossy().to_string();
                for entry in self.fs.list_dir(&hash_dir.path)? {
                    if entry.is_dir {
                        continue;
                    }
                    let size_bytes = self.fs.metadata(&entry.path)?.len;
                    let filename = entry.path.file_name().unwrap().to_string_lossy().to_string();
                    callback(Attachment {
                        hash: hash.clone(),
                        size_bytes,
                        path: format!("{}/{}/{}/{}", ATTACHMENTS_DIR, &hash[0..2], hash, filename),
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Blobs in the store that aren't named in `referenced` (a set of
    /// lowercase hex SHA-256 hashes).
    pub fn find_orphans(&self, referenced: &std::collections::HashSet<String>) -> Result<Vec<Attachment>> {
        let mut orphans = Vec::new();
        self.stream(|a| {
            if !referenced.contains(&a.hash) {
                orphans.push(a);
            }
            Ok(())
        })?;
        Ok(orphans)
    }

    /// Deletes orphaned blobs. Returns the attachments removed (or, in
    /// `dry_run` mode, the attachments that *would* be removed).
    pub fn prune_orphans(
        &self,
        referenced: &std::collections::HashSet<String>,
        dry_run: bool,
    ) -> Result<Vec<Attachment>> {
        let orphans = self.find_orphans(referenced)?;
        if !dry_run {
            for orphan in &orphans {
                let dir = self.blob_dir(&orphan.hash);
                self.fs.remove_dir_all(&dir)?;
            }
        }
        Ok(orphans)
    }

    /// Validates shard naming and placement (spec §4.3): every shard
    /// directory name matches `^[0-9a-f]{2}$`, every blob's first two hex
    /// characters match its shard, no extra files at the attachments root,
    /// no unexpected sub-shards.
    pub fn validate_structure(&self) -> Result<Vec<StructureViolation>> {
        let mut violations = Vec::new();
        let root = self.attachments_root();
        if !self.fs.exists(&root) {
            return Ok(violations);
        }
        for entry in self.fs.list_dir(&root)? {
            let name = entry.path.file_name().unwrap().to_string_lossy().to_string();
            if name == ".tmp" {
                continue;
            }
            if !entry.is_dir {
                violations.push(StructureViolation {
                    kind: StructureViolationKind::UnexpectedEntry,
                    path: entry.path.display().to_string(),
                    message: "unexpected file at attachments root".to_string(),
                });
                continue;
            }
            if !SHARD_RE.is_match(&name) {
                violations.push(StructureViolation {
                    kind: StructureViolationKind::BadShardName,
                    path: entry.path.display().to_string(),
                    message: format!("shard directory name '{name}' is not two lowercase hex characters"),
                });
                continue;
            }
            for hash_dir in self.fs.list_dir(&entry.path)? {
                if !hash_dir.is_dir {
                    violations.push(StructureViolation {
                        kind: StructureViolationKind::UnexpectedEntry,
                        path: hash_dir.path.display().to_string(),
                        message: "unexpected file directly under shard".to_string(),
                    });
                    continue;
                }
                let hash = hash_dir.path.file_name().unwrap().to_string_lossy().to_string();
                if !HASH_RE.is_match(&hash) || !hash.starts_with(&name) {
                    violations.push(StructureViolation {
                        kind: StructureViolationKind::ShardMismatch,
                        path: hash_dir.path.display().to_string(),
                        message: format!("blob hash '{hash}' does not belong under shard '{name}'"),
                    });
                }
            }
        }
        Ok(violations)
    }
}

fn tmp_suffix() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!("{}-{}", std::process::id(), COUNTER.fetch_add(1, Ordering::Relaxed))
}

fn extension_for_content_type(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/bmp" => ".bmp",
        "image/webp" => ".webp",
        _ => ".bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;
    use std::io::Cursor;

    fn store() -> AttachmentStore {
        AttachmentStore::new(Arc::new(MemFs::new()), "/repo")
    }

    #[test]
    fn store_and_read_roundtrip() {
        let store = store();
        let bytes = [0xDE, 0xAD, 0xBE];
        let att = store.store(Cursor::new(bytes), "photo.jpg").unwrap();
        assert_eq!(att.hash, "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb");
        assert!(store.exists(&att.hash).unwrap());
        assert_eq!(store.read(&att.hash).unwrap(), bytes);
        assert!(store.verify(&att.hash).unwrap());
    }

    #[test]
    fn storing_same_content_twice_is_idempotent() {
        let store = store();
        let a = store.store(Cursor::new([1, 2, 3]), "a.jpg").unwrap();
        let b = store.store(Cursor::new([1, 2, 3]), "a.jpg").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn sanitizes_unsafe_filenames() {
        assert_eq!(AttachmentStore::sanitize_filename("../../etc/passwd", "image/jpeg"), ".._.._etc_passwd");
        assert_eq!(AttachmentStore::sanitize_filename("..", "image/jpeg"), "attachment.jpg");
        assert_eq!(AttachmentStore::sanitize_filename("", "image/png"), "attachment.png");
    }

    #[test]
    fn find_orphans_excludes_referenced() {
        let store = store();
        let a = store.store(Cursor::new([1]), "a.jpg").unwrap();
        let b = store.store(Cursor::new([2]), "b.jpg").unwrap();
        let referenced: std::collections::HashSet<_> = [a.hash.clone()].into_iter().collect();
        let orphans = store.find_orphans(&referenced).unwrap();
        assert_eq!(orphans, vec![b]);
    }

    #[test]
    fn validate_structure_flags_bad_shard() {
        let fs = Arc::new(MemFs::new());
        fs.write_new(std::path::Path::new("/repo/attachments/zz/not-a-hash/f.jpg"), b"x").unwrap();
        let store = AttachmentStore::new(fs, "/repo");
        let violations = store.validate_structure().unwrap();
        assert!(violations.iter().any(|v| v.kind == StructureViolationKind::BadShardName));
    }
}
