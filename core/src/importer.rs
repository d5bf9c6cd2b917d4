//! Importer orchestration (C7, spec §4.7): the only place new backup
//! exports are merged into the repository.
//!
//! Per-record validation failures never abort the run; they're routed to
//! [`crate::rejects::RejectSink`] and the record is skipped. Everything
//! else - I/O, parser-fatal XML, a repository that already has fatal
//! violations - bubbles as an [`Error`] and the run stops (spec §7).
//! The repository is only ever rewritten once, in the commit phase at the
//! end of a successful pass (I8); attachment blobs may be added earlier,
//! since storing one is append-only and idempotent.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};

use crate::attachments::AttachmentStore;
use crate::cancel::{CancellationToken, CHECK_EVERY_N_RECORDS};
use crate::coalesce::{CoalesceSummary, Coalescer};
use crate::contacts::ContactsManager;
use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::model::{BinaryPart, Call, Mms, Part, PartContent, Record, Sms, BINARY_CONTENT_TYPE_WHITELIST};
use crate::progress::{null_sink, ProgressEvent, ProgressSink};
use crate::readers::{
    addr_from_raw, parse_calls_document, parse_sms_document, part_from_raw, CallsReader, RawElement, RawMessage, SMSReader, SmsOrMms,
};
use crate::rejects::{RejectSink, RejectedCall, RejectedMms, RejectedSms, RejectedSmsOrMms};
use crate::repo::RepoPaths;
use crate::validate::{self, ValidateOptions};
use crate::writers::{self, Summary};
use crate::xml::XmlLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFilter {
    All,
    CallsOnly,
    SmsOnly,
}

impl RecordFilter {
    fn wants_calls(self) -> bool {
        !matches!(self, RecordFilter::SmsOnly)
    }

    fn wants_sms(self) -> bool {
        !matches!(self, RecordFilter::CallsOnly)
    }
}

#[derive(Clone)]
pub struct ImportOptions {
    pub filter: RecordFilter,
    pub dry_run: bool,
    pub post_validate: bool,
    pub cancel: CancellationToken,
    pub progress: Arc<dyn ProgressSink>,
    pub limits: XmlLimits,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            filter: RecordFilter::All,
            dry_run: false,
            post_validate: false,
            cancel: CancellationToken::new(),
            progress: null_sink(),
            limits: XmlLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Clean,
    RejectsPresent,
}

#[derive(Debug, Default)]
pub struct ImportReport {
    pub calls: CoalesceSummary,
    pub sms: CoalesceSummary,
    pub rejected_files: usize,
    pub rejected_records: usize,
    pub attachments_stored: usize,
    pub cancelled: bool,
    pub post_validation: Option<validate::ValidationReport>,
}

impl ImportReport {
    pub fn exit_class(&self) -> ExitClass {
        if self.rejected_records > 0 {
            ExitClass::RejectsPresent
        } else {
            ExitClass::Clean
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputKind {
    Calls,
    Sms,
}

fn classify_input(path: &Path) -> Option<InputKind> {
    let name = path.file_name()?.to_str()?;
    if !name.ends_with(".xml") {
        return None;
    }
    if name.starts_with("calls") {
        Some(InputKind::Calls)
    } else if name.starts_with("sms") {
        Some(InputKind::Sms)
    } else {
        None
    }
}

/// Expands an explicit mix of files and directories into a flat, sorted
/// list of classified input files, skipping anything already inside the
/// repository itself.
pub fn discover_inputs(fs: &Arc<dyn FileSystem>, repo_root: &Path, roots: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for root in roots {
        if root.starts_with(repo_root) {
            continue;
        }
        let meta = fs.metadata(root)?;
        if meta.is_dir {
            for path in fs.walk_files(root)? {
                if path.starts_with(repo_root) {
                    continue;
                }
                if classify_input(&path).is_some() {
                    found.push(path);
                }
            }
        } else if classify_input(root).is_some() {
            found.push(root.clone());
        } else {
            log::warn!("skipping input with unrecognized name: {}", root.display());
        }
    }
    found.sort();
    found.dedup();
    Ok(found)
}

struct PendingCallsRejects {
    source_bytes: Vec<u8>,
    rejects: Vec<RejectedCall>,
}

struct PendingSmsRejects {
    source_bytes: Vec<u8>,
    rejects: Vec<RejectedSmsOrMms>,
}

/// Runs one full import pass over `inputs` against the repository at
/// `paths` (spec §4.7 steps 1-5).
pub fn run(fs: &Arc<dyn FileSystem>, paths: &RepoPaths, inputs: &[PathBuf], opts: &ImportOptions) -> Result<ImportReport> {
    let validate_opts = ValidateOptions { cancel: opts.cancel.clone() };
    let pre_report = validate::run(fs, paths, &validate_opts)?;
    if pre_report.has_fatal() {
        return Err(Error::ManifestInconsistent { violations: pre_report.violations });
    }

    let mut report = ImportReport::default();
    if opts.cancel.is_cancelled() {
        report.cancelled = true;
        return Ok(report);
    }

    let mut calls_coalescer: Coalescer<Call> = Coalescer::new();
    let calls_reader = CallsReader::new(fs.clone(), paths.clone()).with_limits(opts.limits);
    for year in calls_reader.available_years()? {
        calls_coalescer.load_existing(calls_reader.read(year)?);
    }

    let mut sms_coalescer: Coalescer<SmsOrMms> = Coalescer::new();
    let sms_reader = SMSReader::new(fs.clone(), paths.clone()).with_limits(opts.limits);
    for year in sms_reader.available_years()? {
        sms_coalescer.load_existing(sms_reader.read(year)?);
    }

    let mut contacts = ContactsManager::load(fs, paths)?;
    let attachments = AttachmentStore::new(fs.clone(), paths.root.clone());

    let mut pending_calls_rejects = Vec::new();
    let mut pending_sms_rejects = Vec::new();
    let mut records_seen: usize = 0;

    for path in inputs {
        let kind = match classify_input(path) {
            Some(k) => k,
            None => continue,
        };
        if kind == InputKind::Calls && !opts.filter.wants_calls() {
            continue;
        }
        if kind == InputKind::Sms && !opts.filter.wants_sms() {
            continue;
        }
        if opts.cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        let display_path = path.display().to_string();
        opts.progress.on_event(ProgressEvent::FileStarted { path: display_path.clone() });
        let source_bytes = fs.read(path)?;

        let (added, duplicates, rejected) = match kind {
            InputKind::Calls => {
                let (_, raw_records) = parse_calls_document(&source_bytes, opts.limits)?;
                let mut file_rejects = Vec::new();
                let mut added = 0usize;
                let mut duplicates = 0usize;
                for raw in raw_records {
                    match Call::from_attrs(&raw.attrs) {
                        Ok(call) => {
                            if let Some(name) = call.contact_name.clone() {
                                if let Err(e) = contacts.add_unprocessed(&call.number, &name) {
                                    log::warn!("contact extraction skipped for {}: {e}", call.number);
                                }
                            }
                            if calls_coalescer.add(call) {
                                added += 1;
                            } else {
                                duplicates += 1;
                            }
                        }
                        Err(violations) => file_rejects.push(RejectedCall { line: raw.line, attrs: raw.attrs, violations }),
                    }
                    records_seen += 1;
                    if records_seen % CHECK_EVERY_N_RECORDS == 0 {
                        opts.progress.on_event(ProgressEvent::RecordsProcessed { path: display_path.clone(), count: records_seen as u64 });
                        if opts.cancel.is_cancelled() {
                            report.cancelled = true;
                            return Ok(report);
                        }
                    }
                }
                let rejected = file_rejects.len();
                if !file_rejects.is_empty() {
                    pending_calls_rejects.push(PendingCallsRejects { source_bytes, rejects: file_rejects });
                }
                (added, duplicates, rejected)
            }
            InputKind::Sms => {
                let (_, raw_messages) = parse_sms_document(&source_bytes, opts.limits)?;
                let mut file_rejects = Vec::new();
                let mut added = 0usize;
                let mut duplicates = 0usize;
                for raw in raw_messages {
                    match raw {
                        RawMessage::Sms(e) => match Sms::from_attrs(&e.attrs) {
                            Ok(sms) => {
                                if let Some(name) = sms.contact_name.clone() {
                                    if let Err(err) = contacts.add_unprocessed(&sms.address, &name) {
                                        log::warn!("contact extraction skipped for {}: {err}", sms.address);
                                    }
                                }
                                if sms_coalescer.add(SmsOrMms::Sms(sms)) {
                                    added += 1;
                                } else {
                                    duplicates += 1;
                                }
                            }
                            Err(violations) => file_rejects.push(RejectedSmsOrMms::Sms(RejectedSms { line: e.line, attrs: e.attrs, violations })),
                        },
                        RawMessage::Mms { header, parts, addrs } => {
                            match process_mms(&header, &parts, &addrs, &attachments)? {
                                Ok(mms) => {
                                    report.attachments_stored += mms
                                        .parts
                                        .iter()
                                        .filter(|p| matches!(p.content, PartContent::Binary(BinaryPart::Stored { .. })))
                                        .count();
                                    if let Some(name) = mms.contact_name.clone() {
                                        if let Err(err) = contacts.add_unprocessed(&mms.address, &name) {
                                            log::warn!("contact extraction skipped for {}: {err}", mms.address);
                                        }
                                    }
                                    if sms_coalescer.add(SmsOrMms::Mms(mms)) {
                                        added += 1;
                                    } else {
                                        duplicates += 1;
                                    }
                                }
                                Err(violations) => {
                                    let raw_parts: Vec<_> = parts.iter().map(|p| p.attrs.clone()).collect();
                                    let raw_addrs: Vec<_> = addrs.iter().map(|a| a.attrs.clone()).collect();
                                    file_rejects.push(RejectedSmsOrMms::Mms(RejectedMms {
                                        line: header.line,
                                        attrs: header.attrs,
                                        parts: raw_parts,
                                        addrs: raw_addrs,
                                        violations,
                                    }));
                                }
                            }
                        }
                    }
                    records_seen += 1;
                    if records_seen % CHECK_EVERY_N_RECORDS == 0 {
                        opts.progress.on_event(ProgressEvent::RecordsProcessed { path: display_path.clone(), count: records_seen as u64 });
                        if opts.cancel.is_cancelled() {
                            report.cancelled = true;
                            return Ok(report);
                        }
                    }
                }
                let rejected = file_rejects.len();
                if !file_rejects.is_empty() {
                    pending_sms_rejects.push(PendingSmsRejects { source_bytes, rejects: file_rejects });
                }
                (added, duplicates, rejected)
            }
        };

        report.rejected_records += rejected;
        if rejected > 0 {
            report.rejected_files += 1;
        }
        opts.progress.on_event(ProgressEvent::FileFinished { path: display_path, added, duplicates, rejected });
    }

    if opts.dry_run {
        report.calls = calls_coalescer.summary();
        report.sms = sms_coalescer.summary();
        return Ok(report);
    }

    opts.progress.on_event(ProgressEvent::CommitStarted);
    let now = Utc::now();
    let reject_sink = RejectSink::new(fs.clone(), paths.clone());
    for pending in &pending_calls_rejects {
        reject_sink.write_calls_rejects(&pending.source_bytes, &pending.rejects, now)?;
    }
    for pending in &pending_sms_rejects {
        reject_sink.write_sms_rejects(&pending.source_bytes, &pending.rejects, now)?;
    }

    report.calls = calls_coalescer.summary();
    let calls_by_year = write_calls_years(fs, paths, calls_coalescer)?;

    report.sms = sms_coalescer.summary();
    let sms_by_year = write_sms_years(fs, paths, sms_coalescer, &attachments)?;

    let summary = Summary {
        calls_by_year,
        sms_by_year,
        attachments: attachments.list()?.len(),
        contacts: contacts.contact_count(),
    };
    writers::write_summary(fs, paths, &summary)?;

    contacts.save(fs, paths)?;
    // Manifest last: it must reflect every artifact's final bytes,
    // including contacts.yaml, or the very next validate sees a stale
    // checksum for a file this same run just wrote.
    crate::manifest::build_and_write(fs, paths)?;

    opts.progress.on_event(ProgressEvent::CommitFinished);

    if opts.post_validate {
        let post_report = validate::run(fs, paths, &validate_opts)?;
        if post_report.has_fatal() {
            return Err(Error::ManifestInconsistent { violations: post_report.violations });
        }
        report.post_validation = Some(post_report);
    }

    Ok(report)
}

fn write_calls_years(fs: &Arc<dyn FileSystem>, paths: &RepoPaths, coalescer: Coalescer<Call>) -> Result<BTreeMap<i32, usize>> {
    let mut by_year: BTreeMap<i32, Vec<Call>> = BTreeMap::new();
    for call in coalescer.into_sorted() {
        by_year.entry(call.year()).or_default().push(call);
    }
    let counts = by_year.iter().map(|(y, v)| (*y, v.len())).collect();
    for (year, records) in by_year {
        writers::write_calls_year(fs, paths, year, &records)?;
    }
    Ok(counts)
}

fn write_sms_years(
    fs: &Arc<dyn FileSystem>,
    paths: &RepoPaths,
    coalescer: Coalescer<SmsOrMms>,
    attachments: &AttachmentStore,
) -> Result<BTreeMap<i32, usize>> {
    let mut by_year: BTreeMap<i32, Vec<SmsOrMms>> = BTreeMap::new();
    for record in coalescer.into_sorted() {
        by_year.entry(record.year()).or_default().push(record);
    }
    let counts = by_year.iter().map(|(y, v)| (*y, v.len())).collect();
    for (year, records) in by_year {
        writers::write_sms_year(fs, paths, year, &records, attachments)?;
    }
    Ok(counts)
}

/// Converts a raw `<mms>` into a typed [`Mms`], extracting whitelisted
/// binary parts to the attachment store along the way (spec §4.7.2).
/// The outer `Result` carries fatal errors (I/O during extraction); the
/// inner one carries per-record violations routed to the rejection sink.
fn process_mms(
    header: &RawElement,
    raw_parts: &[RawElement],
    raw_addrs: &[RawElement],
    attachments: &AttachmentStore,
) -> Result<std::result::Result<Mms, Vec<String>>> {
    let mut violations = Vec::new();
    let mut parts = Vec::new();
    for raw in raw_parts {
        match part_from_raw(raw) {
            Ok(mut part) => {
                let whitelisted = BINARY_CONTENT_TYPE_WHITELIST.contains(&part.content_type.as_str());
                match part.content.clone() {
                    PartContent::Binary(BinaryPart::Pending { base64 }) => {
                        if !whitelisted {
                            violations.push(format!("unknown-content-type: {}", part.content_type));
                            continue;
                        }
                        match extract_binary_part(&part, &base64, attachments)? {
                            Ok(content) => part.content = content,
                            Err(reason) => {
                                violations.push(reason);
                                continue;
                            }
                        }
                    }
                    PartContent::Text(_) if whitelisted => {
                        // A part declared with a binary content type but no
                        // `data` attribute — the content doesn't match what
                        // it claims to be (spec §9 design note).
                        violations.push("conflicting-type/data".to_string());
                        continue;
                    }
                    _ => {}
                }
                parts.push(part);
            }
            Err(v) => violations.push(v),
        }
    }
    let mut addrs = Vec::new();
    for raw in raw_addrs {
        match addr_from_raw(raw) {
            Ok(addr) => addrs.push(addr),
            Err(v) => violations.push(v),
        }
    }
    if !violations.is_empty() {
        return Ok(Err(violations));
    }
    Ok(Mms::from_attrs(&header.attrs, parts, addrs))
}

fn extract_binary_part(part: &Part, base64: &str, attachments: &AttachmentStore) -> Result<std::result::Result<PartContent, String>> {
    let bytes = match BASE64.decode(base64.as_bytes()) {
        Ok(b) => b,
        Err(_) => return Ok(Err("invalid-field:data".to_string())),
    };
    let hint = AttachmentStore::sanitize_filename(part.filename.as_deref().or(part.name.as_deref()).unwrap_or(""), &part.content_type);
    let attachment = attachments.store(Cursor::new(bytes), &hint)?;
    Ok(Ok(PartContent::Binary(BinaryPart::Stored { sha256_hex: attachment.hash })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;
    use crate::repo;

    fn new_repo() -> (Arc<dyn FileSystem>, RepoPaths) {
        let fs: Arc<dyn FileSystem> = Arc::new(MemFs::new());
        let paths = RepoPaths::new("/repo");
        repo::init(&fs, &paths, "test", Utc::now()).unwrap();
        (fs, paths)
    }

    fn drop_input(fs: &Arc<dyn FileSystem>, name: &str, bytes: &[u8]) -> PathBuf {
        let path = PathBuf::from("/incoming").join(name);
        fs.write_new(&path, bytes).unwrap();
        path
    }

    #[test]
    fn imports_valid_calls_and_writes_year_file() {
        let (fs, paths) = new_repo();
        let input = drop_input(
            &fs,
            "calls.xml",
            br#"<calls count="1"><call number="5551234567" duration="12" date="1420070400000" type="1" readable_date="x" contact_name="Alice" /></calls>"#,
        );
        let report = run(&fs, &paths, &[input], &ImportOptions::default()).unwrap();
        assert_eq!(report.calls.added, 1);
        assert_eq!(report.rejected_records, 0);
        assert!(fs.exists(&paths.calls_year_file(2015)));
        assert!(fs.exists(&paths.files_yaml()));
    }

    #[test]
    fn rejects_invalid_call_without_failing_the_run() {
        let (fs, paths) = new_repo();
        let input = drop_input(
            &fs,
            "calls.xml",
            br#"<calls count="1"><call number="" duration="12" date="1420070400000" type="1" /></calls>"#,
        );
        let report = run(&fs, &paths, &[input], &ImportOptions::default()).unwrap();
        assert_eq!(report.calls.added, 0);
        assert_eq!(report.rejected_records, 1);
        assert_eq!(report.exit_class(), ExitClass::RejectsPresent);
        assert!(fs.exists(&paths.rejected_dir()));
    }

    #[test]
    fn reimporting_same_file_is_a_no_op() {
        let (fs, paths) = new_repo();
        let bytes: &[u8] =
            br#"<calls count="1"><call number="5551234567" duration="12" date="1420070400000" type="1" readable_date="x" contact_name="Alice" /></calls>"#;
        let first = drop_input(&fs, "calls-a.xml", bytes);
        run(&fs, &paths, &[first], &ImportOptions::default()).unwrap();
        let second = drop_input(&fs, "calls-b.xml", bytes);
        let report = run(&fs, &paths, &[second], &ImportOptions::default()).unwrap();
        assert_eq!(report.calls.added, 0);
        assert_eq!(report.calls.duplicates, 1);
    }

    #[test]
    fn mms_binary_part_is_extracted_to_attachment_store() {
        let (fs, paths) = new_repo();
        let png_b64 = BASE64.encode(b"fake png bytes");
        let xml = format!(
            r#"<smses count="1"><mms address="5551234567" date="1420070400000" msg_box="1"><parts><part seq="0" ct="image/png" data="{png_b64}" /></parts><addrs><addr address="5551234567" type="137" /></addrs></mms></smses>"#
        );
        let input = drop_input(&fs, "sms.xml", xml.as_bytes());
        let report = run(&fs, &paths, &[input], &ImportOptions::default()).unwrap();
        assert_eq!(report.sms.added, 1);
        assert_eq!(report.attachments_stored, 1);
        assert_eq!(report.rejected_records, 0);
    }

    #[test]
    fn mms_with_unknown_content_type_is_rejected() {
        let (fs, paths) = new_repo();
        let xml = br#"<smses count="1"><mms address="5551234567" date="1420070400000" msg_box="1"><parts><part seq="0" ct="application/octet-stream" data="AAAA" /></parts><addrs><addr address="5551234567" type="137" /></addrs></mms></smses>"#;
        let input = drop_input(&fs, "sms.xml", xml);
        let report = run(&fs, &paths, &[input], &ImportOptions::default()).unwrap();
        assert_eq!(report.sms.added, 0);
        assert_eq!(report.rejected_records, 1);
    }

    #[test]
    fn dry_run_leaves_repository_untouched() {
        let (fs, paths) = new_repo();
        let input = drop_input(
            &fs,
            "calls.xml",
            br#"<calls count="1"><call number="5551234567" duration="12" date="1420070400000" type="1" /></calls>"#,
        );
        let opts = ImportOptions { dry_run: true, ..ImportOptions::default() };
        let report = run(&fs, &paths, &[input], &opts).unwrap();
        assert_eq!(report.calls.added, 1);
        assert!(!fs.exists(&paths.calls_year_file(2015)));
        assert!(!fs.exists(&paths.files_yaml()));
    }

    #[test]
    fn filter_excludes_the_other_record_type() {
        let (fs, paths) = new_repo();
        let calls = drop_input(
            &fs,
            "calls.xml",
            br#"<calls count="1"><call number="5551234567" duration="12" date="1420070400000" type="1" /></calls>"#,
        );
        let opts = ImportOptions { filter: RecordFilter::SmsOnly, ..ImportOptions::default() };
        let report = run(&fs, &paths, &[calls], &opts).unwrap();
        assert_eq!(report.calls.added, 0);
        assert_eq!(report.calls.loaded, 0);
    }

    #[test]
    fn discover_inputs_skips_paths_under_the_repo_root() {
        let (fs, paths) = new_repo();
        fs.write_new(&paths.root.join("calls-stray.xml"), b"<calls/>").unwrap();
        let outside = drop_input(&fs, "calls.xml", b"<calls/>");
        let found = discover_inputs(&fs, &paths.root, &[paths.root.clone(), PathBuf::from("/incoming")]).unwrap();
        assert_eq!(found, vec![outside]);
    }
}
