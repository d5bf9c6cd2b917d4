//! Rejection sink (C8, spec §4.8).
//!
//! For every source file that produced at least one invalid record, writes
//! a rejection pair under `rejected/`: the offending records re-serialized
//! verbatim in the original backup schema (so a corrected copy can be
//! re-imported, P8), and a YAML list of violations keyed by source line.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::Writer as QuickWriter;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::model::RawAttrs;
use crate::repo::RepoPaths;

pub struct RejectedCall {
    pub line: u64,
    pub attrs: RawAttrs,
    pub violations: Vec<String>,
}

pub struct RejectedSms {
    pub line: u64,
    pub attrs: RawAttrs,
    pub violations: Vec<String>,
}

pub struct RejectedMms {
    pub line: u64,
    pub attrs: RawAttrs,
    pub parts: Vec<RawAttrs>,
    pub addrs: Vec<RawAttrs>,
    pub violations: Vec<String>,
}

pub enum RejectedSmsOrMms {
    Sms(RejectedSms),
    Mms(RejectedMms),
}

impl RejectedSmsOrMms {
    fn line(&self) -> u64 {
        match self {
            RejectedSmsOrMms::Sms(r) => r.line,
            RejectedSmsOrMms::Mms(r) => r.line,
        }
    }

    fn violations(&self) -> &[String] {
        match self {
            RejectedSmsOrMms::Sms(r) => &r.violations,
            RejectedSmsOrMms::Mms(r) => &r.violations,
        }
    }
}

#[derive(Serialize)]
struct ViolationEntry {
    line: u64,
    violations: Vec<String>,
}

pub struct RejectSink {
    fs: Arc<dyn FileSystem>,
    paths: RepoPaths,
}

impl RejectSink {
    pub fn new(fs: Arc<dyn FileSystem>, paths: RepoPaths) -> Self {
        Self { fs, paths }
    }

    pub fn write_calls_rejects(&self, source_bytes: &[u8], rejects: &[RejectedCall], now: DateTime<Utc>) -> Result<()> {
        if rejects.is_empty() {
            return Ok(());
        }
        let stem = self.stem_for("calls", source_bytes, now)?;
        let dir = self.paths.rejected_dir();
        let xml = write_raw_calls_xml(rejects)?;
        let yaml = violations_yaml(rejects.iter().map(|r| (r.line, &r.violations)))?;
        self.fs.write_new(&dir.join(format!("{stem}-rejects.xml")), &xml)?;
        self.fs.write_new(&dir.join(format!("{stem}-violations.yaml")), &yaml)?;
        Ok(())
    }

    pub fn write_sms_rejects(&self, source_bytes: &[u8], rejects: &[RejectedSmsOrMms], now: DateTime<Utc>) -> Result<()> {
        if rejects.is_empty() {
            return Ok(());
        }
        let stem = self.stem_for("sms", source_bytes, now)?;
        let dir = self.paths.rejected_dir();
        let xml = write_raw_sms_xml(rejects)?;
        let yaml = violations_yaml(rejects.iter().map(|r| (r.line(), r.violations())))?;
        self.fs.write_new(&dir.join(format!("{stem}-rejects.xml")), &xml)?;
        self.fs.write_new(&dir.join(format!("{stem}-violations.yaml")), &yaml)?;
        Ok(())
    }

    fn stem_for(&self, type_str: &str, source_bytes: &[u8], now: DateTime<Utc>) -> Result<String> {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(source_bytes);
        let src_hash = hex::encode(hasher.finalize());
        let timestamp = now.format("%Y%m%d-%H%M%S").to_string();
        let base = format!("{type_str}-{src_hash}-{timestamp}");
        unique_stem(self.fs.as_ref(), &self.paths.rejected_dir(), &base)
    }
}

/// Appends `-<nonce>` for the first nonce that collides with neither
/// companion file (spec §4.8: same-second collisions are disambiguated
/// this way).
fn unique_stem(fs: &dyn FileSystem, dir: &Path, base: &str) -> Result<String> {
    if is_free(fs, dir, base) {
        return Ok(base.to_string());
    }
    let mut nonce = 1u64;
    loop {
        let candidate = format!("{base}-{nonce}");
        if is_free(fs, dir, &candidate) {
            return Ok(candidate);
        }
        nonce += 1;
    }
}

fn is_free(fs: &dyn FileSystem, dir: &Path, stem: &str) -> bool {
    !fs.exists(&dir.join(format!("{stem}-rejects.xml"))) && !fs.exists(&dir.join(format!("{stem}-violations.yaml")))
}

fn violations_yaml<'a>(entries: impl Iterator<Item = (u64, &'a Vec<String>)>) -> Result<Vec<u8>> {
    let list: Vec<ViolationEntry> = entries.map(|(line, violations)| ViolationEntry { line, violations: violations.clone() }).collect();
    Ok(serde_yaml::to_string(&list)?.into_bytes())
}

fn sorted_attrs(attrs: &RawAttrs) -> Vec<(&str, &str)> {
    let mut pairs: Vec<(&str, &str)> = attrs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    pairs.sort_unstable_by_key(|(k, _)| *k);
    pairs
}

fn push_attrs(el: &mut BytesStart, attrs: &RawAttrs) {
    for (k, v) in sorted_attrs(attrs) {
        el.push_attribute((k, v));
    }
}

fn write_raw_calls_xml(rejects: &[RejectedCall]) -> Result<Vec<u8>> {
    let mut w = QuickWriter::new(Vec::new());
    let mut root = BytesStart::new("calls");
    root.push_attribute(("count", rejects.len().to_string().as_str()));
    w.write_event(Event::Start(root)).map_err(wrap)?;
    for r in rejects {
        let mut el = BytesStart::new("call");
        push_attrs(&mut el, &r.attrs);
        w.write_event(Event::Empty(el)).map_err(wrap)?;
    }
    w.write_event(Event::End(BytesEnd::new("calls"))).map_err(wrap)?;
    Ok(w.into_inner())
}

fn write_raw_sms_xml(rejects: &[RejectedSmsOrMms]) -> Result<Vec<u8>> {
    let mut w = QuickWriter::new(Vec::new());
    let mut root = BytesStart::new("smses");
    root.push_attribute(("count", rejects.len().to_string().as_str()));
    w.write_event(Event::Start(root)).map_err(wrap)?;
    for r in rejects {
        match r {
            RejectedSmsOrMms::Sms(r) => {
                let mut el = BytesStart::new("sms");
                push_attrs(&mut el, &r.attrs);
                w.write_event(Event::Empty(el)).map_err(wrap)?;
            }
            RejectedSmsOrMms::Mms(r) => {
                let mut el = BytesStart::new("mms");
                push_attrs(&mut el, &r.attrs);
                w.write_event(Event::Start(el)).map_err(wrap)?;
                w.write_event(Event::Start(BytesStart::new("parts"))).map_err(wrap)?;
                for part in &r.parts {
                    let mut pel = BytesStart::new("part");
                    push_attrs(&mut pel, part);
                    w.write_event(Event::Empty(pel)).map_err(wrap)?;
                }
                w.write_event(Event::End(BytesEnd::new("parts"))).map_err(wrap)?;
                w.write_event(Event::Start(BytesStart::new("addrs"))).map_err(wrap)?;
                for addr in &r.addrs {
                    let mut ael = BytesStart::new("addr");
                    push_attrs(&mut ael, addr);
                    w.write_event(Event::Empty(ael)).map_err(wrap)?;
                }
                w.write_event(Event::End(BytesEnd::new("addrs"))).map_err(wrap)?;
                w.write_event(Event::End(BytesEnd::new("mms"))).map_err(wrap)?;
            }
        }
    }
    w.write_event(Event::End(BytesEnd::new("smses"))).map_err(wrap)?;
    Ok(w.into_inner())
}

fn wrap(e: quick_xml::Error) -> Error {
    Error::Malformed { reason: format!("xml write error: {e}"), offset: 0, line: 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;

    fn attrs(pairs: &[(&str, &str)]) -> RawAttrs {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn writes_calls_reject_pair() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemFs::new());
        let sink = RejectSink::new(fs.clone(), RepoPaths::new("/repo"));
        let rejects = vec![RejectedCall {
            line: 3,
            attrs: attrs(&[("date", "0")]),
            violations: vec!["missing-timestamp".to_string(), "invalid-field:number".to_string()],
        }];
        let now: DateTime<Utc> = "2026-01-02T03:04:05Z".parse().unwrap();
        sink.write_calls_rejects(b"source file bytes", &rejects, now).unwrap();
        let dir = fs.list_dir(Path::new("/repo/rejected")).unwrap();
        assert_eq!(dir.len(), 2);
        assert!(dir.iter().any(|e| e.path.to_string_lossy().ends_with("-rejects.xml")));
        assert!(dir.iter().any(|e| e.path.to_string_lossy().ends_with("-violations.yaml")));
    }

    #[test]
    fn nonce_disambiguates_same_second_collision() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemFs::new());
        let sink = RejectSink::new(fs.clone(), RepoPaths::new("/repo"));
        let rejects = vec![RejectedCall { line: 1, attrs: attrs(&[]), violations: vec!["x".to_string()] }];
        let now: DateTime<Utc> = "2026-01-02T03:04:05Z".parse().unwrap();
        sink.write_calls_rejects(b"a", &rejects, now).unwrap();
        sink.write_calls_rejects(b"b", &rejects, now).unwrap();
        let dir = fs.list_dir(Path::new("/repo/rejected")).unwrap();
        assert_eq!(dir.len(), 4);
        assert!(dir.iter().any(|e| e.path.to_string_lossy().contains("-1-rejects.xml")));
    }

    #[test]
    fn empty_batch_writes_nothing() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemFs::new());
        let sink = RejectSink::new(fs.clone(), RepoPaths::new("/repo"));
        sink.write_calls_rejects(b"x", &[], Utc::now()).unwrap();
        assert!(!fs.exists(Path::new("/repo/rejected")));
    }
}
