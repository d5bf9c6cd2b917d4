//! Repository validator (C11, spec §4.11).
//!
//! Violation types live at the top of this module because `error.rs`'s
//! `ManifestInconsistent` variant carries them; the phased `validate::run`
//! orchestration (which pulls in readers, the manifest engine, the
//! attachment store, and contacts) is built once those exist.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::fs::FileSystem;
use crate::repo::RepoPaths;

/// One violation kind per spec §4.11's tagged variant list. `Severity`
/// distinguishes `OrphanedAttachment` (always a warning) from everything
/// else (always an error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    MissingFile,
    ExtraFile,
    ChecksumMismatch,
    InvalidFormat,
    OrphanedAttachment,
    CountMismatch,
    SizeMismatch,
    StructureViolation,
    MissingMarkerFile,
    UnsupportedVersion,
}

impl ViolationKind {
    pub fn severity(&self) -> Severity {
        match self {
            ViolationKind::OrphanedAttachment => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

/// A single finding. `file` is always a repository-relative POSIX path, or
/// empty for violations that aren't about one specific file (e.g. a
/// `DuplicateNumber` surfaced through the consistency phase).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationViolation {
    pub kind: ViolationKind,
    pub file: String,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

impl ValidationViolation {
    pub fn new(kind: ViolationKind, file: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind, file: file.into(), message: message.into(), expected: None, actual: None }
    }

    pub fn with_expected_actual(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }
}

/// A violation that carries a concrete, mechanically-applicable fix
/// (spec §4.11 `FixableViolation`, restricted by §A.3 to the three cases
/// `autofix` knows how to apply).
#[derive(Debug, Clone)]
pub struct FixableViolation {
    pub violation: ValidationViolation,
    pub suggested_fix: SuggestedFix,
}

#[derive(Debug, Clone)]
pub enum SuggestedFix {
    RewriteFilesYaml,
    RewriteFilesYamlSha256,
}

/// The phase a violation (or a cancellation) was produced in, in the order
/// spec §4.11 runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationPhase {
    Marker,
    Structure,
    Manifest,
    Content,
    Consistency,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub violations: Vec<ValidationViolation>,
    pub cancelled: bool,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationViolation> {
        self.violations.iter().filter(|v| v.severity() == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationViolation> {
        self.violations.iter().filter(|v| v.severity() == Severity::Warning)
    }

    pub fn has_fatal(&self) -> bool {
        self.errors().next().is_some()
    }

    /// Aggregated counts by severity, for the summarized report mode.
    pub fn summary_counts(&self) -> (usize, usize) {
        (self.errors().count(), self.warnings().count())
    }
}

/// Options threaded through `run`: nothing here is read from the
/// environment (§A.2) — the CLI shell constructs this from flags.
#[derive(Clone)]
pub struct ValidateOptions {
    pub cancel: CancellationToken,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self { cancel: CancellationToken::new() }
    }
}

/// Runs all five phases in order, short-circuiting after phase 1 only when
/// the marker reports an unsupported structure version (spec §4.11, §7).
pub fn run(fs: &Arc<dyn FileSystem>, paths: &RepoPaths, opts: &ValidateOptions) -> crate::error::Result<ValidationReport> {
    let mut report = ValidationReport::default();

    if !phase_marker(fs, paths, &mut report)? {
        return Ok(report);
    }
    if opts.cancel.is_cancelled() {
        report.cancelled = true;
        return Ok(report);
    }

    phase_structure(fs, paths, &mut report);
    if opts.cancel.is_cancelled() {
        report.cancelled = true;
        return Ok(report);
    }

    crate::manifest::validate_manifest(fs, paths, &mut report)?;
    if opts.cancel.is_cancelled() {
        report.cancelled = true;
        return Ok(report);
    }

    phase_content(fs, paths, &opts.cancel, &mut report)?;
    if opts.cancel.is_cancelled() {
        report.cancelled = true;
        return Ok(report);
    }

    phase_consistency(fs, paths, &mut report)?;

    Ok(report)
}

/// Phase 1: marker file. Returns `false` if the rest of validation should
/// be skipped (missing marker or unsupported version).
fn phase_marker(fs: &Arc<dyn FileSystem>, paths: &RepoPaths, report: &mut ValidationReport) -> crate::error::Result<bool> {
    let marker = match crate::repo::read_marker(fs, paths) {
        Ok(Some(m)) => m,
        Ok(None) => {
            report.violations.push(ValidationViolation::new(
                ViolationKind::MissingMarkerFile,
                crate::repo::MARKER_FILENAME,
                "repository marker file is missing",
            ));
            return Ok(false);
        }
        Err(_) => {
            report.violations.push(ValidationViolation::new(
                ViolationKind::InvalidFormat,
                crate::repo::MARKER_FILENAME,
                "marker file is not valid YAML",
            ));
            return Ok(false);
        }
    };
    if crate::repo::check_supported_version(&marker).is_err() {
        report.violations.push(
            ValidationViolation::new(
                ViolationKind::UnsupportedVersion,
                crate::repo::MARKER_FILENAME,
                format!("unsupported repository structure version {:?}", marker.repository_structure_version),
            )
            .with_expected_actual(crate::repo::SUPPORTED_STRUCTURE_VERSION, marker.repository_structure_version.clone()),
        );
        return Ok(false);
    }
    Ok(true)
}

/// Phase 2: well-known directories and files exist.
fn phase_structure(fs: &Arc<dyn FileSystem>, paths: &RepoPaths, report: &mut ValidationReport) {
    let required_dirs: [(&str, PathBuf); 3] =
        [("calls/", paths.calls_dir()), ("sms/", paths.sms_dir()), ("attachments/", paths.attachments_dir())];
    for (label, dir) in required_dirs {
        if !fs.exists(&dir) {
            report.violations.push(ValidationViolation::new(ViolationKind::MissingFile, label, "required directory is missing"));
        }
    }
    let required_files: [(&str, PathBuf); 2] =
        [("contacts.yaml", paths.contacts_yaml()), ("summary.yaml", paths.summary_yaml())];
    for (label, file) in required_files {
        if !fs.exists(&file) {
            report.violations.push(ValidationViolation::new(ViolationKind::MissingFile, label, "required file is missing"));
        }
    }
}

/// Phase 4: content. Delegates the actual per-record checking to the
/// readers, which already know how to validate a year file's records
/// without hard-failing on one bad record (spec §4.5).
fn phase_content(
    fs: &Arc<dyn FileSystem>,
    paths: &RepoPaths,
    cancel: &CancellationToken,
    report: &mut ValidationReport,
) -> crate::error::Result<()> {
    let calls = crate::readers::CallsReader::new(fs.clone(), paths.clone());
    for year in calls.available_years()? {
        if cancel.is_cancelled() {
            return Ok(());
        }
        report.violations.extend(calls.validate(year)?);
    }

    let sms = crate::readers::SMSReader::new(fs.clone(), paths.clone());
    for year in sms.available_years()? {
        if cancel.is_cancelled() {
            return Ok(());
        }
        report.violations.extend(sms.validate(year)?);
    }

    let store = crate::attachments::AttachmentStore::new(fs.clone(), paths.root.clone());
    report.violations.extend(
        store
            .validate_structure()?
            .into_iter()
            .map(|v| ValidationViolation::new(ViolationKind::StructureViolation, v.path, v.message)),
    );
    for attachment in store.list()? {
        if !store.verify(&attachment.hash)? {
            report.violations.push(ValidationViolation::new(
                ViolationKind::ChecksumMismatch,
                attachment.path.display().to_string(),
                "attachment content does not match its hash-derived path",
            ));
        }
    }

    Ok(())
}

/// Phase 5: cross-cutting consistency (attachment reference closure,
/// contacts duplicate detection).
fn phase_consistency(fs: &Arc<dyn FileSystem>, paths: &RepoPaths, report: &mut ValidationReport) -> crate::error::Result<()> {
    let sms = crate::readers::SMSReader::new(fs.clone(), paths.clone());
    let referenced = sms.all_attachment_refs()?;
    let store = crate::attachments::AttachmentStore::new(fs.clone(), paths.root.clone());
    for orphan in store.find_orphans(&referenced)? {
        report.violations.push(ValidationViolation::new(
            ViolationKind::OrphanedAttachment,
            orphan.path.display().to_string(),
            "attachment is not referenced by any MMS part",
        ));
    }
    for hash in &referenced {
        if !store.exists(hash)? {
            let shard = if hash.len() >= 2 { &hash[0..2] } else { "--" };
            report.violations.push(ValidationViolation::new(
                ViolationKind::MissingFile,
                format!("{}/{}/{}", crate::attachments::ATTACHMENTS_DIR, shard, hash),
                "MMS part references a blob that does not exist in the store",
            ));
        }
    }

    if fs.exists(&paths.contacts_yaml()) {
        if let Err(e) = crate::contacts::ContactsManager::load(fs, paths) {
            report.violations.push(ValidationViolation::new(
                ViolationKind::InvalidFormat,
                crate::repo::CONTACTS_YAML,
                e.to_string(),
            ));
        }
    }

    Ok(())
}

/// Rewrites only the derived artifacts `autofix` is allowed to touch:
/// `files.yaml` (if missing or checksums stale) and `files.yaml.sha256`
/// (if missing or stale). Never rewrites record data (spec §A.3).
pub fn autofix(fs: &Arc<dyn FileSystem>, paths: &RepoPaths, report: &ValidationReport) -> crate::error::Result<usize> {
    let needs_manifest_rewrite = report.violations.iter().any(|v| {
        matches!(v.kind, ViolationKind::ChecksumMismatch | ViolationKind::MissingFile | ViolationKind::ExtraFile | ViolationKind::SizeMismatch)
            && (v.file == crate::repo::FILES_YAML || v.file == crate::repo::FILES_YAML_SHA256)
    }) || !fs.exists(&paths.files_yaml())
        || !fs.exists(&paths.files_yaml_sha256());

    if needs_manifest_rewrite {
        crate::manifest::build_and_write(fs, paths)?;
        Ok(1)
    } else {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;
    use chrono::Utc;

    #[test]
    fn missing_marker_short_circuits() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemFs::new());
        let paths = RepoPaths::new("/repo");
        let report = run(&fs, &paths, &ValidateOptions::default()).unwrap();
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].kind, ViolationKind::MissingMarkerFile);
    }

    #[test]
    fn fresh_init_has_no_fatal_violations_besides_manifest() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemFs::new());
        let paths = RepoPaths::new("/repo");
        crate::repo::init(&fs, &paths, "test", Utc::now()).unwrap();
        crate::manifest::build_and_write(&fs, &paths).unwrap();
        let report = run(&fs, &paths, &ValidateOptions::default()).unwrap();
        assert!(report.errors().next().is_none(), "{:?}", report.violations);
    }
}
