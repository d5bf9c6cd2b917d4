//! Narrow filesystem abstraction (spec §9): the core depends on this trait,
//! never directly on `std::fs`, so tests can swap in an in-memory
//! implementation and so fault injection between write and rename is
//! possible without touching real disk.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct Metadata {
    pub len: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Filesystem operations the core needs: read, atomic-rename write, walk,
/// stat, remove. Implementations must make `rename` atomic with respect to
/// readers (no partial file is ever visible under the destination path).
pub trait FileSystem: Send + Sync {
    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + '_>>;

    fn exists(&self, path: &Path) -> bool;

    fn metadata(&self, path: &Path) -> Result<Metadata>;

    fn create_dir_all(&self, path: &Path) -> Result<()>;

    fn remove_file(&self, path: &Path) -> Result<()>;

    fn remove_dir_all(&self, path: &Path) -> Result<()>;

    /// Lists immediate children of `path` (non-recursive), sorted by name.
    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>>;

    /// Recursively walks `root`, returning every regular file in
    /// lexicographic POSIX-path order. Hidden directories (name starting
    /// with `.`) are skipped; symlinks are followed.
    fn walk_files(&self, root: &Path) -> Result<Vec<PathBuf>>;

    /// Writes `bytes` to `dest` atomically: stages under `tmp_dir` (which
    /// must be on the same filesystem as `dest`'s parent) then renames over
    /// `dest`. Used by writers that already hold the whole payload in
    /// memory (year files, manifest, contacts, marker).
    fn write_atomic(&self, tmp_dir: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
        self.create_dir_all(tmp_dir)?;
        let tmp_path = tmp_dir.join(format!(".tmp-{}", tmp_name_suffix()));
        self.write_new(&tmp_path, bytes)?;
        let result = self.rename(&tmp_path, dest);
        if result.is_err() {
            let _ = self.remove_file(&tmp_path);
        }
        result
    }

    /// Writes a brand-new file (used internally by `write_atomic`, and
    /// directly by streamed writers that need to fill a temp file
    /// incrementally before the final rename).
    fn write_new(&self, path: &Path, bytes: &[u8]) -> Result<()>;

    fn open_write_new(&self, path: &Path) -> Result<Box<dyn Write + '_>>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
}

fn tmp_name_suffix() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", std::process::id(), n)
}

/// Real, disk-backed filesystem.
pub struct RealFs;

impl FileSystem for RealFs {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        std::fs::read(path).map_err(|e| Error::io(path, "read", e))
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + '_>> {
        let f = std::fs::File::open(path).map_err(|e| Error::io(path, "open", e))?;
        Ok(Box::new(f))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn metadata(&self, path: &Path) -> Result<Metadata> {
        let m = std::fs::metadata(path).map_err(|e| Error::io(path, "stat", e))?;
        Ok(Metadata { len: m.len(), is_dir: m.is_dir() })
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).map_err(|e| Error::io(path, "mkdir", e))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path).map_err(|e| Error::io(path, "remove", e))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        std::fs::remove_dir_all(path).map_err(|e| Error::io(path, "rmdir", e))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        let rd = std::fs::read_dir(path).map_err(|e| Error::io(path, "readdir", e))?;
        for entry in rd {
            let entry = entry.map_err(|e| Error::io(path, "readdir", e))?;
            let file_type = entry.file_type().map_err(|e| Error::io(path, "stat", e))?;
            out.push(DirEntry { path: entry.path(), is_dir: file_type.is_dir() });
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn walk_files(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.path() == root
                    || !e
                        .file_name()
                        .to_str()
                        .map(|n| n.starts_with('.'))
                        .unwrap_or(false)
                    || !e.file_type().is_dir()
            })
        {
            let entry = entry.map_err(|e| {
                Error::io(
                    e.path().unwrap_or(root).to_path_buf(),
                    "walk",
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                )
            })?;
            if entry.file_type().is_file() {
                out.push(entry.path().to_path_buf());
            }
        }
        out.sort();
        Ok(out)
    }

    fn write_new(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent)?;
        }
        std::fs::write(path, bytes).map_err(|e| Error::io(path, "write", e))
    }

    fn open_write_new(&self, path: &Path) -> Result<Box<dyn Write + '_>> {
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent)?;
        }
        let f = std::fs::File::create(path).map_err(|e| Error::io(path, "create", e))?;
        Ok(Box::new(f))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            self.create_dir_all(parent)?;
        }
        std::fs::rename(from, to).map_err(|e| Error::io(to, "rename", e))
    }
}

/// In-memory filesystem for tests. Directories are implicit in the key
/// set: a path "exists as a directory" if some stored file has it as a
/// proper prefix, or it was explicitly created via `create_dir_all`.
#[derive(Default)]
pub struct MemFs {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
    dirs: Mutex<std::collections::BTreeSet<PathBuf>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileSystem for MemFs {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::io(path, "read", std::io::Error::from(std::io::ErrorKind::NotFound)))
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + '_>> {
        Ok(Box::new(Cursor::new(self.read(path)?)))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path) || self.dirs.lock().unwrap().contains(path)
    }

    fn metadata(&self, path: &Path) -> Result<Metadata> {
        if let Some(bytes) = self.files.lock().unwrap().get(path) {
            return Ok(Metadata { len: bytes.len() as u64, is_dir: false });
        }
        if self.dirs.lock().unwrap().contains(path) {
            return Ok(Metadata { len: 0, is_dir: true });
        }
        Err(Error::io(path, "stat", std::io::Error::from(std::io::ErrorKind::NotFound)))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut dirs = self.dirs.lock().unwrap();
        let mut cur = PathBuf::new();
        for comp in path.components() {
            cur.push(comp);
            dirs.insert(cur.clone());
        }
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::io(path, "remove", std::io::Error::from(std::io::ErrorKind::NotFound)))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        self.files.lock().unwrap().retain(|p, _| !p.starts_with(path));
        self.dirs.lock().unwrap().retain(|p| !p.starts_with(path));
        Ok(())
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let mut seen = std::collections::BTreeMap::new();
        for p in self.files.lock().unwrap().keys() {
            if let Ok(rest) = p.strip_prefix(path) {
                if let Some(first) = rest.components().next() {
                    let child = path.join(first);
                    seen.entry(child).or_insert(false);
                }
            }
        }
        for p in self.dirs.lock().unwrap().iter() {
            if p == path {
                continue;
            }
            if let Ok(rest) = p.strip_prefix(path) {
                if let Some(first) = rest.components().next() {
                    let child = path.join(first);
                    if rest.components().count() == 1 {
                        seen.insert(child, true);
                    } else {
                        seen.entry(child).or_insert(true);
                    }
                }
            }
        }
        Ok(seen
            .into_iter()
            .map(|(path, is_dir)| DirEntry { path, is_dir })
            .collect())
    }

    fn walk_files(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut out: Vec<PathBuf> = self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|p| {
                p.starts_with(root)
                    && p.strip_prefix(root)
                        .unwrap()
                        .components()
                        .all(|c| !c.as_os_str().to_str().map(|s| s.starts_with('.')).unwrap_or(false))
            })
            .cloned()
            .collect();
        out.sort();
        Ok(out)
    }

    fn write_new(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent)?;
        }
        self.files.lock().unwrap().insert(path.to_path_buf(), bytes.to_vec());
        Ok(())
    }

    fn open_write_new(&self, path: &Path) -> Result<Box<dyn Write + '_>> {
        Ok(Box::new(MemWriter { fs: self, path: path.to_path_buf(), buf: Vec::new() }))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let bytes = self
            .files
            .lock()
            .unwrap()
            .remove(from)
            .ok_or_else(|| Error::io(from, "rename", std::io::Error::from(std::io::ErrorKind::NotFound)))?;
        self.write_new(to, &bytes)
    }
}

struct MemWriter<'a> {
    fs: &'a MemFs,
    path: PathBuf,
    buf: Vec<u8>,
}

impl Write for MemWriter<'_> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for MemWriter<'_> {
    fn drop(&mut self) {
        let _ = self.fs.write_new(&self.path, &self.buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_fs_atomic_write_then_read() {
        let fs = MemFs::new();
        fs.write_atomic(Path::new("/repo/.tmp"), Path::new("/repo/out.txt"), b"hello").unwrap();
        assert_eq!(fs.read(Path::new("/repo/out.txt")).unwrap(), b"hello");
        let leftovers = fs.list_dir(Path::new("/repo/.tmp")).unwrap();
        assert!(leftovers.is_empty(), "temp file should have been renamed away: {leftovers:?}");
    }

    #[test]
    fn mem_fs_walk_files_skips_hidden_dirs() {
        let fs = MemFs::new();
        fs.write_new(Path::new("/repo/a.txt"), b"1").unwrap();
        fs.write_new(Path::new("/repo/.hidden/b.txt"), b"2").unwrap();
        let files = fs.walk_files(Path::new("/repo")).unwrap();
        assert_eq!(files, vec![PathBuf::from("/repo/a.txt")]);
    }
}
