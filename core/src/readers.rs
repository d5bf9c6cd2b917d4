//! Year-partitioned readers for calls and SMS/MMS (C5, spec §4.5).
//!
//! Also the home of the raw document parser shared with the importer: both
//! "read an existing year file" and "parse a freshly-dropped backup file"
//! walk the same `<calls>`/`<smses>` schema, so the element-to-line-number
//! bookkeeping lives here once.

use std::io::Cursor;
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::model::{Addr, AddrType, BinaryPart, Call, Mms, Part, PartContent, Sms};
use crate::model::RawAttrs;
use crate::repo::RepoPaths;
use crate::validate::{ValidationViolation, ViolationKind};
use crate::xml::{SecureXmlStreamer, XmlEvent, XmlLimits};

/// One parsed element plus the 1-based source line its opening tag started
/// on, used to key rejections (spec §4.7 step 3c) and to report violations
/// for already-committed year files.
#[derive(Debug, Clone)]
pub struct RawElement {
    pub line: u64,
    pub attrs: RawAttrs,
}

#[derive(Debug, Clone)]
pub enum RawMessage {
    Sms(RawElement),
    Mms { header: RawElement, parts: Vec<RawElement>, addrs: Vec<RawElement> },
}

impl RawMessage {
    pub fn line(&self) -> u64 {
        match self {
            RawMessage::Sms(e) => e.line,
            RawMessage::Mms { header, .. } => header.line,
        }
    }
}

/// Parses a `<calls count="N">...</calls>` document. Returns the declared
/// count (if present) and every `<call>` child in document order.
pub fn parse_calls_document(bytes: &[u8], limits: XmlLimits) -> Result<(Option<i64>, Vec<RawElement>)> {
    let mut streamer = SecureXmlStreamer::new(Cursor::new(bytes.to_vec()), limits);
    let mut declared_count = None;
    let mut records = Vec::new();
    loop {
        match streamer.next_event()? {
            XmlEvent::Start { name, attrs } if name == "calls" => {
                declared_count = attrs.get("count").and_then(|s| s.parse().ok());
            }
            XmlEvent::Start { name, attrs } if name == "call" => {
                let line = streamer.current_line();
                streamer.next_event()?; // matching End, "call" is always self-closing
                records.push(RawElement { line, attrs });
            }
            XmlEvent::End { name } if name == "calls" => break,
            XmlEvent::Eof => break,
            _ => {}
        }
    }
    Ok((declared_count, records))
}

/// Parses a `<smses count="N">...</smses>` document, interleaving `<sms>`
/// and `<mms>` children in document order.
pub fn parse_sms_document(bytes: &[u8], limits: XmlLimits) -> Result<(Option<i64>, Vec<RawMessage>)> {
    let mut streamer = SecureXmlStreamer::new(Cursor::new(bytes.to_vec()), limits);
    let mut declared_count = None;
    let mut records = Vec::new();
    loop {
        match streamer.next_event()? {
            XmlEvent::Start { name, attrs } if name == "smses" => {
                declared_count = attrs.get("count").and_then(|s| s.parse().ok());
            }
            XmlEvent::Start { name, attrs } if name == "sms" => {
                let line = streamer.current_line();
                streamer.next_event()?;
                records.push(RawMessage::Sms(RawElement { line, attrs }));
            }
            XmlEvent::Start { name, attrs } if name == "mms" => {
                let line = streamer.current_line();
                let (parts, addrs) = parse_mms_children(&mut streamer)?;
                records.push(RawMessage::Mms { header: RawElement { line, attrs }, parts, addrs });
            }
            XmlEvent::End { name } if name == "smses" => break,
            XmlEvent::Eof => break,
            _ => {}
        }
    }
    Ok((declared_count, records))
}

fn parse_mms_children<R: std::io::BufRead>(
    streamer: &mut SecureXmlStreamer<R>,
) -> Result<(Vec<RawElement>, Vec<RawElement>)> {
    let mut parts = Vec::new();
    let mut addrs = Vec::new();
    loop {
        match streamer.next_event()? {
            XmlEvent::Start { name, .. } if name == "parts" => loop {
                match streamer.next_event()? {
                    XmlEvent::Start { name, attrs } if name == "part" => {
                        let line = streamer.current_line();
                        streamer.next_event()?;
                        parts.push(RawElement { line, attrs });
                    }
                    XmlEvent::End { name } if name == "parts" => break,
                    XmlEvent::Eof => return Err(unexpected_eof_in_mms()),
                    _ => {}
                }
            },
            XmlEvent::Start { name, .. } if name == "addrs" => loop {
                match streamer.next_event()? {
                    XmlEvent::Start { name, attrs } if name == "addr" => {
                        let line = streamer.current_line();
                        streamer.next_event()?;
                        addrs.push(RawElement { line, attrs });
                    }
                    XmlEvent::End { name } if name == "addrs" => break,
                    XmlEvent::Eof => return Err(unexpected_eof_in_mms()),
                    _ => {}
                }
            },
            XmlEvent::End { name } if name == "mms" => break,
            XmlEvent::Eof => return Err(unexpected_eof_in_mms()),
            _ => {}
        }
    }
    Ok((parts, addrs))
}

fn unexpected_eof_in_mms() -> Error {
    Error::Malformed { reason: "unexpected end of document inside <mms>".to_string(), offset: 0, line: 0 }
}

const ANDROID_PART_CONTENT_TYPE: &str = "ct";
const ANDROID_PART_CHARSET: &str = "chset";
const ANDROID_PART_DISPOSITION: &str = "cd";
const ANDROID_PART_FILENAME: &str = "fn";
const ANDROID_PART_CONTENT_ID: &str = "cid";
const ANDROID_PART_CONTENT_LOCATION: &str = "cl";

/// Converts one raw `<part>` element. Structural well-formedness only
/// (spec §4.7.1 "parts list well-formed"); the content-type whitelist is
/// enforced later, during extraction (§4.7.2), not here.
pub fn part_from_raw(raw: &RawElement) -> std::result::Result<Part, String> {
    let seq = raw.attrs.get("seq").and_then(|s| s.parse::<i64>().ok()).ok_or_else(|| "invalid-field:seq".to_string())?;
    let content_type = raw.attrs.get(ANDROID_PART_CONTENT_TYPE).cloned().unwrap_or_default();
    if content_type.is_empty() {
        return Err("missing-content-type".to_string());
    }
    let content = if let Some(data) = raw.attrs.get("data") {
        PartContent::Binary(BinaryPart::Pending { base64: data.clone() })
    } else {
        PartContent::Text(raw.attrs.get("text").cloned().unwrap_or_default())
    };
    Ok(Part {
        seq,
        content_type,
        name: raw.attrs.get("name").cloned(),
        charset: raw.attrs.get(ANDROID_PART_CHARSET).cloned(),
        content_disposition: raw.attrs.get(ANDROID_PART_DISPOSITION).cloned(),
        filename: raw.attrs.get(ANDROID_PART_FILENAME).cloned(),
        content_id: raw.attrs.get(ANDROID_PART_CONTENT_ID).cloned(),
        content_location: raw.attrs.get(ANDROID_PART_CONTENT_LOCATION).cloned(),
        content,
    })
}

pub fn addr_from_raw(raw: &RawElement) -> std::result::Result<Addr, String> {
    let address = raw.attrs.get("address").cloned().unwrap_or_default();
    if address.is_empty() {
        return Err("invalid-field:address".to_string());
    }
    let addr_type = raw
        .attrs
        .get("type")
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(AddrType::from_code)
        .ok_or_else(|| "invalid-field:type".to_string())?;
    Ok(Addr { address, addr_type, charset: raw.attrs.get("charset").cloned() })
}

/// Converts a full raw `<mms>` (header + children) into a [`Mms`],
/// collecting every structural violation before giving up (spec §4.7.1:
/// "collecting every violation rather than stopping at the first one").
pub fn mms_from_raw(header: &RawElement, raw_parts: &[RawElement], raw_addrs: &[RawElement]) -> std::result::Result<Mms, Vec<String>> {
    let mut violations = Vec::new();
    let mut parts = Vec::new();
    for p in raw_parts {
        match part_from_raw(p) {
            Ok(part) => parts.push(part),
            Err(v) => violations.push(v),
        }
    }
    let mut addrs = Vec::new();
    for a in raw_addrs {
        match addr_from_raw(a) {
            Ok(addr) => addrs.push(addr),
            Err(v) => violations.push(v),
        }
    }
    if !violations.is_empty() {
        return Err(violations);
    }
    Mms::from_attrs(&header.attrs, parts, addrs)
}

fn year_bounds_ms(year: i32) -> (i64, i64) {
    let start = Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap().timestamp_millis();
    let end = Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).unwrap().timestamp_millis();
    (start, end)
}

fn years_from_filenames(entries: Vec<std::path::PathBuf>, prefix: &str) -> Vec<i32> {
    let mut years: Vec<i32> = entries
        .into_iter()
        .filter_map(|p| {
            let stem = p.file_stem()?.to_str()?.to_string();
            stem.strip_prefix(prefix)?.parse::<i32>().ok()
        })
        .collect();
    years.sort_unstable();
    years.dedup();
    years
}

pub struct CallsReader {
    fs: Arc<dyn FileSystem>,
    paths: RepoPaths,
    limits: XmlLimits,
}

impl CallsReader {
    pub fn new(fs: Arc<dyn FileSystem>, paths: RepoPaths) -> Self {
        Self { fs, paths, limits: XmlLimits::default() }
    }

    pub fn with_limits(mut self, limits: XmlLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn available_years(&self) -> Result<Vec<i32>> {
        if !self.fs.exists(&self.paths.calls_dir()) {
            return Ok(Vec::new());
        }
        let entries = self.fs.list_dir(&self.paths.calls_dir())?;
        let paths = entries.into_iter().filter(|e| !e.is_dir).map(|e| e.path).collect();
        Ok(years_from_filenames(paths, "calls-"))
    }

    fn load(&self, year: i32) -> Result<(Option<i64>, Vec<RawElement>)> {
        let bytes = self.fs.read(&self.paths.calls_year_file(year))?;
        parse_calls_document(&bytes, self.limits)
    }

    pub fn count(&self, year: i32) -> Result<usize> {
        Ok(self.load(year)?.1.len())
    }

    pub fn stream(&self, year: i32, mut callback: impl FnMut(Call) -> Result<()>) -> Result<()> {
        for raw in self.load(year)?.1 {
            match Call::from_attrs(&raw.attrs) {
                Ok(call) => callback(call)?,
                Err(violations) => log::warn!("skipping malformed call at {}:{}: {:?}", year, raw.line, violations),
            }
        }
        Ok(())
    }

    pub fn read(&self, year: i32) -> Result<Vec<Call>> {
        let mut out = Vec::new();
        self.stream(year, |c| {
            out.push(c);
            Ok(())
        })?;
        Ok(out)
    }

    pub fn validate(&self, year: i32) -> Result<Vec<ValidationViolation>> {
        let file = format!("calls/calls-{year}.xml");
        let (declared_count, records) = self.load(year)?;
        let mut violations = Vec::new();
        match declared_count {
            Some(n) if n as usize != records.len() => {
                violations.push(
                    ValidationViolation::new(ViolationKind::CountMismatch, &file, "declared count attribute does not match the number of records")
                        .with_expected_actual(n.to_string(), records.len().to_string()),
                );
            }
            None => {
                violations.push(ValidationViolation::new(ViolationKind::InvalidFormat, &file, "missing count attribute on root element"));
            }
            _ => {}
        }
        let (lo, hi) = year_bounds_ms(year);
        for raw in &records {
            match Call::from_attrs(&raw.attrs) {
                Ok(call) => {
                    if call.date_ms < lo || call.date_ms >= hi {
                        violations.push(ValidationViolation::new(
                            ViolationKind::InvalidFormat,
                            &file,
                            format!("record at line {} has date_ms outside year {year}", raw.line),
                        ));
                    }
                }
                Err(reasons) => {
                    violations.push(ValidationViolation::new(
                        ViolationKind::InvalidFormat,
                        &file,
                        format!("record at line {} failed validation: {}", raw.line, reasons.join(", ")),
                    ));
                }
            }
        }
        Ok(violations)
    }
}

/// Sum type the SMS reader streams, since a year file interleaves both
/// kinds (spec §4.5, §6).
#[derive(Debug, Clone)]
pub enum SmsOrMms {
    Sms(Sms),
    Mms(Mms),
}

impl crate::model::Record for SmsOrMms {
    fn canonical_hash(&self) -> [u8; 32] {
        match self {
            SmsOrMms::Sms(s) => s.canonical_hash(),
            SmsOrMms::Mms(m) => m.canonical_hash(),
        }
    }

    fn timestamp_ms(&self) -> i64 {
        match self {
            SmsOrMms::Sms(s) => s.timestamp_ms(),
            SmsOrMms::Mms(m) => m.timestamp_ms(),
        }
    }
}

pub struct SMSReader {
    fs: Arc<dyn FileSystem>,
    paths: RepoPaths,
    limits: XmlLimits,
}

impl SMSReader {
    pub fn new(fs: Arc<dyn FileSystem>, paths: RepoPaths) -> Self {
        Self { fs, paths, limits: XmlLimits::default() }
    }

    pub fn with_limits(mut self, limits: XmlLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn available_years(&self) -> Result<Vec<i32>> {
        if !self.fs.exists(&self.paths.sms_dir()) {
            return Ok(Vec::new());
        }
        let entries = self.fs.list_dir(&self.paths.sms_dir())?;
        let paths = entries.into_iter().filter(|e| !e.is_dir).map(|e| e.path).collect();
        Ok(years_from_filenames(paths, "sms-"))
    }

    fn load(&self, year: i32) -> Result<(Option<i64>, Vec<RawMessage>)> {
        let bytes = self.fs.read(&self.paths.sms_year_file(year))?;
        parse_sms_document(&bytes, self.limits)
    }

    pub fn count(&self, year: i32) -> Result<usize> {
        Ok(self.load(year)?.1.len())
    }

    pub fn stream(&self, year: i32, mut callback: impl FnMut(SmsOrMms) -> Result<()>) -> Result<()> {
        for raw in self.load(year)?.1 {
            match &raw {
                RawMessage::Sms(e) => match Sms::from_attrs(&e.attrs) {
                    Ok(sms) => callback(SmsOrMms::Sms(sms))?,
                    Err(v) => log::warn!("skipping malformed sms at {}:{}: {:?}", year, e.line, v),
                },
                RawMessage::Mms { header, parts, addrs } => match mms_from_raw(header, parts, addrs) {
                    Ok(mms) => callback(SmsOrMms::Mms(mms))?,
                    Err(v) => log::warn!("skipping malformed mms at {}:{}: {:?}", year, header.line, v),
                },
            }
        }
        Ok(())
    }

    pub fn read(&self, year: i32) -> Result<Vec<SmsOrMms>> {
        let mut out = Vec::new();
        self.stream(year, |m| {
            out.push(m);
            Ok(())
        })?;
        Ok(out)
    }

    pub fn validate(&self, year: i32) -> Result<Vec<ValidationViolation>> {
        let file = format!("sms/sms-{year}.xml");
        let (declared_count, records) = self.load(year)?;
        let mut violations = Vec::new();
        match declared_count {
            Some(n) if n as usize != records.len() => {
                violations.push(
                    ValidationViolation::new(ViolationKind::CountMismatch, &file, "declared count attribute does not match the number of records")
                        .with_expected_actual(n.to_string(), records.len().to_string()),
                );
            }
            None => {
                violations.push(ValidationViolation::new(ViolationKind::InvalidFormat, &file, "missing count attribute on root element"));
            }
            _ => {}
        }
        let (lo, hi) = year_bounds_ms(year);
        for raw in &records {
            let line = raw.line();
            let parsed = match &raw {
                RawMessage::Sms(e) => Sms::from_attrs(&e.attrs).map(|s| s.timestamp_ms()).map_err(|v| v.join(", ")),
                RawMessage::Mms { header, parts, addrs } => {
                    mms_from_raw(header, parts, addrs).map(|m| m.timestamp_ms()).map_err(|v| v.join(", "))
                }
            };
            match parsed {
                Ok(ts) if ts < lo || ts >= hi => {
                    violations.push(ValidationViolation::new(
                        ViolationKind::InvalidFormat,
                        &file,
                        format!("record at line {line} has date_ms outside year {year}"),
                    ));
                }
                Ok(_) => {}
                Err(reasons) => {
                    violations.push(ValidationViolation::new(
                        ViolationKind::InvalidFormat,
                        &file,
                        format!("record at line {line} failed validation: {reasons}"),
                    ));
                }
            }
        }
        Ok(violations)
    }

    /// Blob hashes referenced by MMS parts in a single year file.
    pub fn attachment_refs(&self, year: i32) -> Result<std::collections::HashSet<String>> {
        let mut out = std::collections::HashSet::new();
        for raw in self.load(year)?.1 {
            if let RawMessage::Mms { header, parts, addrs } = raw {
                if let Ok(mms) = mms_from_raw(&header, &parts, &addrs) {
                    for part in &mms.parts {
                        if let PartContent::Binary(bin) = &part.content {
                            if let Ok(hash) = bin.sha256_hex() {
                                out.insert(hash);
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Blob hashes referenced by any MMS part across every year file.
    pub fn all_attachment_refs(&self) -> Result<std::collections::HashSet<String>> {
        let mut out = std::collections::HashSet::new();
        for year in self.available_years()? {
            out.extend(self.attachment_refs(year)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;
    use std::path::Path;

    fn fs_with_calls(year_xml: &str, year: i32) -> Arc<dyn FileSystem> {
        let fs: Arc<dyn FileSystem> = Arc::new(MemFs::new());
        fs.write_new(Path::new(&format!("/repo/calls/calls-{year}.xml")), year_xml.as_bytes()).unwrap();
        fs
    }

    #[test]
    fn reads_calls_year_file() {
        let fs = fs_with_calls(
            r#"<calls count="2"><call number="1" duration="1" date="1420070400000" type="1"/><call number="2" duration="2" date="1420070400001" type="2"/></calls>"#,
            2015,
        );
        let reader = CallsReader::new(fs, RepoPaths::new("/repo"));
        assert_eq!(reader.available_years().unwrap(), vec![2015]);
        assert_eq!(reader.count(2015).unwrap(), 2);
        let calls = reader.read(2015).unwrap();
        assert_eq!(calls.len(), 2);
        assert!(reader.validate(2015).unwrap().is_empty());
    }

    #[test]
    fn validate_flags_count_mismatch() {
        let fs = fs_with_calls(r#"<calls count="5"><call number="1" duration="1" date="1420070400000" type="1"/></calls>"#, 2015);
        let reader = CallsReader::new(fs, RepoPaths::new("/repo"));
        let violations = reader.validate(2015).unwrap();
        assert!(violations.iter().any(|v| v.kind == ViolationKind::CountMismatch));
    }

    #[test]
    fn validate_flags_wrong_year() {
        let fs = fs_with_calls(r#"<calls count="1"><call number="1" duration="1" date="1451606400000" type="1"/></calls>"#, 2015);
        let reader = CallsReader::new(fs, RepoPaths::new("/repo"));
        let violations = reader.validate(2015).unwrap();
        assert!(violations.iter().any(|v| v.message.contains("outside year")));
    }

    #[test]
    fn reads_mms_with_parts_and_addrs() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemFs::new());
        let xml = r#"<smses count="1"><mms address="555~666" date="1420070400000" msg_box="1"><parts><part seq="-1" ct="application/smil" text="&lt;smil/&gt;"/><part seq="0" ct="image/jpeg" data="3q2+"/></parts><addrs><addr address="555" type="137"/><addr address="666" type="151"/></addrs></mms></smses>"#;
        fs.write_new(Path::new("/repo/sms/sms-2015.xml"), xml.as_bytes()).unwrap();
        let reader = SMSReader::new(fs, RepoPaths::new("/repo"));
        let messages = reader.read(2015).unwrap();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            SmsOrMms::Mms(mms) => {
                assert_eq!(mms.parts.len(), 2);
                assert_eq!(mms.addrs.len(), 2);
            }
            _ => panic!("expected mms"),
        }
        let refs = reader.all_attachment_refs().unwrap();
        assert_eq!(refs.len(), 1);
    }
}
