//! Manifest engine (C10, spec §4.10).
//!
//! `files.yaml` lists every regular file under the repository root except
//! `files.yaml` itself, `files.yaml.sha256`, anything under `rejected/`,
//! and dotfiles other than the marker. `files.yaml.sha256` pins the
//! manifest's own hash so a reader can detect manifest tampering or
//! staleness in one extra read.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::fs::FileSystem;
use crate::repo::RepoPaths;
use crate::validate::{ValidationReport, ValidationViolation, ViolationKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub file: String,
    pub sha256: String,
    pub size_bytes: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ManifestFile {
    files: Vec<FileEntry>,
}

fn included(root: &Path, path: &Path) -> bool {
    let rel = match path.strip_prefix(root) {
        Ok(r) => r,
        Err(_) => return false,
    };
    if rel.starts_with(crate::repo::REJECTED_DIR) {
        return false;
    }
    match rel.to_str() {
        Some(crate::repo::FILES_YAML) | Some(crate::repo::FILES_YAML_SHA256) => return false,
        _ => {}
    }
    for comp in rel.components() {
        if let std::path::Component::Normal(name) = comp {
            let name = name.to_string_lossy();
            if name.starts_with('.') && name != crate::repo::MARKER_FILENAME {
                return false;
            }
        }
    }
    true
}

fn hash_file(fs: &Arc<dyn FileSystem>, path: &Path) -> Result<(String, u64)> {
    let bytes = fs.read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok((hex::encode(hasher.finalize()), bytes.len() as u64))
}

/// Builds `files.yaml` from the current repository contents and writes both
/// it and `files.yaml.sha256`.
pub fn build_and_write(fs: &Arc<dyn FileSystem>, paths: &RepoPaths) -> Result<()> {
    let mut entries = Vec::new();
    for path in fs.walk_files(&paths.root)? {
        if !included(&paths.root, &path) {
            continue;
        }
        let rel = crate::repo::path_to_posix(&paths.root, &path)?;
        let (sha256, size_bytes) = hash_file(fs, &path)?;
        entries.push(FileEntry { file: rel, sha256, size_bytes });
    }
    entries.sort_by(|a, b| a.file.cmp(&b.file));

    let manifest = ManifestFile { files: entries };
    let bytes = serde_yaml::to_string(&manifest)?.into_bytes();
    fs.write_atomic(&paths.root.join(".tmp"), &paths.files_yaml(), &bytes)?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = format!("{}\n", hex::encode(hasher.finalize()));
    fs.write_atomic(&paths.root.join(".tmp"), &paths.files_yaml_sha256(), digest.as_bytes())
}

/// Manifest validation phase (spec §4.11 phase 3, run between structure and
/// content). Appends violations rather than returning `Result<Vec<_>>` so
/// it composes with the other phases in `validate::run`.
pub fn validate_manifest(fs: &Arc<dyn FileSystem>, paths: &RepoPaths, report: &mut ValidationReport) -> Result<()> {
    let manifest_present = fs.exists(&paths.files_yaml());
    let checksum_present = fs.exists(&paths.files_yaml_sha256());
    if !manifest_present {
        report.violations.push(ValidationViolation::new(ViolationKind::MissingFile, crate::repo::FILES_YAML, "manifest file is missing"));
    }
    if !checksum_present {
        report.violations.push(ValidationViolation::new(
            ViolationKind::MissingFile,
            crate::repo::FILES_YAML_SHA256,
            "manifest checksum file is missing",
        ));
    }
    if !manifest_present || !checksum_present {
        return Ok(());
    }

    let manifest_bytes = fs.read(&paths.files_yaml())?;
    let mut hasher = Sha256::new();
    hasher.update(&manifest_bytes);
    let actual_digest = hex::encode(hasher.finalize());
    let recorded_digest = String::from_utf8_lossy(&fs.read(&paths.files_yaml_sha256())?).trim().to_string();
    if actual_digest != recorded_digest {
        report.violations.push(
            ValidationViolation::new(ViolationKind::ChecksumMismatch, crate::repo::FILES_YAML_SHA256, "manifest checksum file does not match files.yaml")
                .with_expected_actual(recorded_digest, actual_digest),
        );
    }

    let parsed: ManifestFile = match serde_yaml::from_slice(&manifest_bytes) {
        Ok(m) => m,
        Err(e) => {
            report.violations.push(ValidationViolation::new(ViolationKind::InvalidFormat, crate::repo::FILES_YAML, e.to_string()));
            return Ok(());
        }
    };

    let mut listed_paths = std::collections::HashSet::new();
    for entry in &parsed.files {
        let has_control_byte = entry.file.bytes().any(|b| b.is_ascii_control());
        if entry.file.contains("..") || entry.file.starts_with('/') || has_control_byte {
            report.violations.push(ValidationViolation::new(ViolationKind::StructureViolation, entry.file.clone(), "manifest entry path is invalid"));
            continue;
        }
        listed_paths.insert(entry.file.clone());
        let abs = paths.root.join(&entry.file);
        if !fs.exists(&abs) {
            report.violations.push(ValidationViolation::new(ViolationKind::MissingFile, entry.file.clone(), "file listed in manifest is missing"));
            continue;
        }
        let (sha256, size_bytes) = hash_file(fs, &abs)?;
        if size_bytes != entry.size_bytes {
            report.violations.push(
                ValidationViolation::new(ViolationKind::SizeMismatch, entry.file.clone(), "file size does not match manifest")
                    .with_expected_actual(entry.size_bytes.to_string(), size_bytes.to_string()),
            );
        }
        if sha256 != entry.sha256 {
            report.violations.push(
                ValidationViolation::new(ViolationKind::ChecksumMismatch, entry.file.clone(), "file checksum does not match manifest")
                    .with_expected_actual(entry.sha256.clone(), sha256),
            );
        }
    }

    for path in fs.walk_files(&paths.root)? {
        if !included(&paths.root, &path) {
            continue;
        }
        let rel = crate::repo::path_to_posix(&paths.root, &path)?;
        if !listed_paths.contains(&rel) {
            report.violations.push(ValidationViolation::new(ViolationKind::ExtraFile, rel, "file exists but is not listed in the manifest"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;
    use chrono::Utc;

    #[test]
    fn build_excludes_self_and_rejected_dir() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemFs::new());
        let paths = RepoPaths::new("/repo");
        crate::repo::init(&fs, &paths, "test", Utc::now()).unwrap();
        fs.write_new(&paths.rejected_dir().join("calls-abc-20260101-000000-rejects.xml"), b"<calls/>").unwrap();
        build_and_write(&fs, &paths).unwrap();
        let manifest: ManifestFile = serde_yaml::from_slice(&fs.read(&paths.files_yaml()).unwrap()).unwrap();
        assert!(manifest.files.iter().all(|f| !f.file.starts_with("rejected/")));
        assert!(manifest.files.iter().any(|f| f.file == crate::repo::MARKER_FILENAME));
    }

    #[test]
    fn validate_detects_tampered_file() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemFs::new());
        let paths = RepoPaths::new("/repo");
        crate::repo::init(&fs, &paths, "test", Utc::now()).unwrap();
        build_and_write(&fs, &paths).unwrap();
        fs.write_new(&paths.marker(), b"tampered: true\n").unwrap();
        let mut report = ValidationReport::default();
        validate_manifest(&fs, &paths, &mut report).unwrap();
        assert!(report.violations.iter().any(|v| v.kind == ViolationKind::ChecksumMismatch && v.file == crate::repo::MARKER_FILENAME));
    }

    #[test]
    fn validate_detects_extra_file() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemFs::new());
        let paths = RepoPaths::new("/repo");
        crate::repo::init(&fs, &paths, "test", Utc::now()).unwrap();
        build_and_write(&fs, &paths).unwrap();
        fs.write_new(&paths.root.join("calls").join("stray.xml"), b"<calls/>").unwrap();
        let mut report = ValidationReport::default();
        validate_manifest(&fs, &paths, &mut report).unwrap();
        assert!(report.violations.iter().any(|v| v.kind == ViolationKind::ExtraFile));
    }

    #[test]
    fn fresh_manifest_round_trips_clean() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemFs::new());
        let paths = RepoPaths::new("/repo");
        crate::repo::init(&fs, &paths, "test", Utc::now()).unwrap();
        build_and_write(&fs, &paths).unwrap();
        let mut report = ValidationReport::default();
        validate_manifest(&fs, &paths, &mut report).unwrap();
        assert!(report.violations.is_empty(), "{:?}", report.violations);
    }
}
