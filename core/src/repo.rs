//! Repository layout conventions: marker file, well-known paths, the
//! advisory import lock, and minimal init (spec §6, §9, §A.3).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fs::FileSystem;

pub const MARKER_FILENAME: &str = ".mobilecombackup.yaml";
pub const LOCK_FILENAME: &str = ".mobilecombackup.lock";
pub const FILES_YAML: &str = "files.yaml";
pub const FILES_YAML_SHA256: &str = "files.yaml.sha256";
pub const CONTACTS_YAML: &str = "contacts.yaml";
pub const SUMMARY_YAML: &str = "summary.yaml";
pub const CALLS_DIR: &str = "calls";
pub const SMS_DIR: &str = "sms";
pub const REJECTED_DIR: &str = "rejected";

/// The single structure version this implementation understands (I7).
pub const SUPPORTED_STRUCTURE_VERSION: &str = "1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Marker {
    pub repository_structure_version: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// Path conventions rooted at a repository directory. Every method returns
/// a path relative to `root`; callers that need an absolute path join it
/// themselves (mirrors `DatasetRoot` in the teacher's entity_utils).
#[derive(Debug, Clone)]
pub struct RepoPaths {
    pub root: PathBuf,
}

impl RepoPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn marker(&self) -> PathBuf {
        self.root.join(MARKER_FILENAME)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILENAME)
    }

    pub fn files_yaml(&self) -> PathBuf {
        self.root.join(FILES_YAML)
    }

    pub fn files_yaml_sha256(&self) -> PathBuf {
        self.root.join(FILES_YAML_SHA256)
    }

    pub fn contacts_yaml(&self) -> PathBuf {
        self.root.join(CONTACTS_YAML)
    }

    pub fn summary_yaml(&self) -> PathBuf {
        self.root.join(SUMMARY_YAML)
    }

    pub fn calls_dir(&self) -> PathBuf {
        self.root.join(CALLS_DIR)
    }

    pub fn sms_dir(&self) -> PathBuf {
        self.root.join(SMS_DIR)
    }

    pub fn calls_tmp_dir(&self) -> PathBuf {
        self.calls_dir().join(".tmp")
    }

    pub fn sms_tmp_dir(&self) -> PathBuf {
        self.sms_dir().join(".tmp")
    }

    pub fn calls_year_file(&self, year: i32) -> PathBuf {
        self.calls_dir().join(format!("calls-{year}.xml"))
    }

    pub fn sms_year_file(&self, year: i32) -> PathBuf {
        self.sms_dir().join(format!("sms-{year}.xml"))
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.root.join(crate::attachments::ATTACHMENTS_DIR)
    }

    pub fn rejected_dir(&self) -> PathBuf {
        self.root.join(REJECTED_DIR)
    }
}

/// Reads and validates the marker file. A missing file is reported as
/// `None`, distinct from a present-but-invalid one (spec §4.11 phase 1).
pub fn read_marker(fs: &dyn FileSystem, paths: &RepoPaths) -> Result<Option<Marker>> {
    if !fs.exists(&paths.marker()) {
        return Ok(None);
    }
    let bytes = fs.read(&paths.marker())?;
    let marker: Marker = serde_yaml::from_slice(&bytes)?;
    Ok(Some(marker))
}

pub fn check_supported_version(marker: &Marker) -> Result<()> {
    if marker.repository_structure_version != SUPPORTED_STRUCTURE_VERSION {
        return Err(Error::UnsupportedVersion {
            found: marker.repository_structure_version.clone(),
            supported: SUPPORTED_STRUCTURE_VERSION.to_string(),
        });
    }
    Ok(())
}

/// Initializes a brand new, empty repository: writes the marker file,
/// creates the well-known directories, and writes empty `contacts.yaml`
/// and `summary.yaml` so a freshly initialized repository already
/// satisfies the structure phase of the validator (spec §4.11 phase 2).
/// Does not write `files.yaml` — that is produced by the first commit.
pub fn init(fs: &dyn FileSystem, paths: &RepoPaths, created_by: &str, now: DateTime<Utc>) -> Result<()> {
    fs.create_dir_all(&paths.calls_dir())?;
    fs.create_dir_all(&paths.sms_dir())?;
    fs.create_dir_all(&paths.attachments_dir())?;
    let marker = Marker {
        repository_structure_version: SUPPORTED_STRUCTURE_VERSION.to_string(),
        created_at: now,
        created_by: created_by.to_string(),
    };
    let bytes = serde_yaml::to_string(&marker)?.into_bytes();
    fs.write_new(&paths.marker(), &bytes)?;

    let contacts = crate::contacts::ContactsFile::default();
    fs.write_new(&paths.contacts_yaml(), serde_yaml::to_string(&contacts)?.as_bytes())?;

    let summary = crate::writers::Summary::default();
    fs.write_new(&paths.summary_yaml(), serde_yaml::to_string(&summary)?.as_bytes())?;

    Ok(())
}

/// Advisory, exclusive lock for the duration of an import (spec §5).
/// Readers never take it; enforcement is cooperative, not a true
/// filesystem lock, since the narrow `FileSystem` trait has no flock
/// primitive (and an in-memory test filesystem couldn't honor one).
pub struct RepoLock {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl RepoLock {
    pub fn acquire(fs: Arc<dyn FileSystem>, paths: &RepoPaths) -> Result<Self> {
        let path = paths.lock_file();
        if fs.exists(&path) {
            return Err(Error::Lock { path });
        }
        fs.write_new(&path, b"")?;
        Ok(Self { fs, path })
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = self.fs.remove_file(&self.path);
    }
}

pub fn path_to_posix(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| Error::InsecurePath { path: path.display().to_string() })?;
    let mut parts = Vec::new();
    for comp in rel.components() {
        match comp {
            std::path::Component::Normal(s) => parts.push(s.to_string_lossy().into_owned()),
            std::path::Component::CurDir => {}
            _ => return Err(Error::InsecurePath { path: path.display().to_string() }),
        }
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;

    #[test]
    fn init_then_read_marker_round_trips() {
        let fs = MemFs::new();
        let paths = RepoPaths::new("/repo");
        let now: DateTime<Utc> = "2026-01-01T00:00:00Z".parse().unwrap();
        init(&fs, &paths, "test", now).unwrap();
        let marker = read_marker(&fs, &paths).unwrap().unwrap();
        assert_eq!(marker.repository_structure_version, "1");
        check_supported_version(&marker).unwrap();
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let marker = Marker {
            repository_structure_version: "2".to_string(),
            created_at: Utc::now(),
            created_by: "x".to_string(),
        };
        assert!(check_supported_version(&marker).is_err());
    }

    #[test]
    fn lock_is_exclusive() {
        let fs = Arc::new(MemFs::new());
        let paths = RepoPaths::new("/repo");
        let first = RepoLock::acquire(fs.clone(), &paths).unwrap();
        assert!(RepoLock::acquire(fs.clone(), &paths).is_err());
        drop(first);
        assert!(RepoLock::acquire(fs, &paths).is_ok());
    }

    #[test]
    fn path_to_posix_rejects_traversal() {
        assert!(path_to_posix(Path::new("/repo"), Path::new("/repo/../etc/passwd")).is_err());
        assert_eq!(path_to_posix(Path::new("/repo"), Path::new("/repo/calls/calls-2015.xml")).unwrap(), "calls/calls-2015.xml");
    }
}
