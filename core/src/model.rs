//! Domain model and canonical hashing (C2, spec §3 and §4.2).

mod call;
mod mms;
mod sms;

pub use call::{Call, CallKind};
pub use mms::{Addr, AddrType, BinaryPart, Mms, MmsKind, Part, PartContent, BINARY_CONTENT_TYPE_WHITELIST};
pub use sms::{Sms, SmsKind};

use chrono::{TimeZone, Utc};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Raw, untyped attribute bag as produced by the XML streamer for one
/// element. Values are owned strings; attribute order is not preserved
/// (the writers define their own fixed output order, §6).
pub type RawAttrs = std::collections::HashMap<String, String>;

/// A field tag plus an optional value, contributing to a canonical hash
/// (spec §4.2): absent and empty-string values are distinguishable from
/// "field omitted entirely" only in that the tag is always emitted.
struct CanonicalHasher {
    hasher: Sha256,
}

impl CanonicalHasher {
    fn new() -> Self {
        Self { hasher: Sha256::new() }
    }

    fn field_str(&mut self, tag: &str, value: Option<&str>) -> &mut Self {
        self.hasher.update(b"\x1F");
        self.hasher.update(tag.as_bytes());
        self.hasher.update(b"=");
        if let Some(v) = value {
            self.hasher.update(canonicalize_string(v).as_bytes());
        }
        self.hasher.update(b"\x1E");
        self
    }

    fn field_i64(&mut self, tag: &str, value: i64) -> &mut Self {
        self.field_str(tag, Some(&value.to_string()))
    }

    fn field_opt_i64(&mut self, tag: &str, value: Option<i64>) -> &mut Self {
        self.field_str(tag, value.map(|v| v.to_string()).as_deref())
    }

    fn field_bool(&mut self, tag: &str, value: Option<bool>) -> &mut Self {
        self.field_str(tag, value.map(|v| if v { "1" } else { "0" }).as_deref())
    }

    /// Hashes the SHA-256 of already-decoded binary content under `tag`,
    /// not the binary itself, so a part referencing store hash `H` hashes
    /// identically whether `data` was inline base64 or already extracted.
    fn field_binary_hash(&mut self, tag: &str, sha256_hex: Option<&str>) -> &mut Self {
        self.field_str(tag, sha256_hex)
    }

    fn finish(self) -> [u8; 32] {
        self.hasher.finalize().into()
    }
}

/// NFC-normalizes and trims trailing ASCII whitespace left over from XML
/// line folding. No other case-folding is performed (spec §4.2).
fn canonicalize_string(s: &str) -> String {
    let normalized: String = s.nfc().collect();
    normalized.trim_end_matches([' ', '\t', '\r', '\n']).to_string()
}

pub fn hash_to_hex(hash: [u8; 32]) -> String {
    hex::encode(hash)
}

/// Narrow trait implemented by `Call`/`Sms`/`Mms` so generic machinery (the
/// coalescer, readers, writers) never needs to match on the record kind
/// (spec §9: dynamic dispatch over record variants is done only where the
/// variant actually matters).
pub trait Record {
    fn canonical_hash(&self) -> [u8; 32];
    fn timestamp_ms(&self) -> i64;

    fn year(&self) -> i32 {
        utc_year(self.timestamp_ms())
    }
}

/// UTC year of an epoch-millisecond timestamp (spec §3 I1, §4.2).
pub fn utc_year(date_ms: i64) -> i32 {
    Utc.timestamp_millis_opt(date_ms)
        .single()
        .map(|dt| dt.format("%Y").to_string().parse().unwrap())
        .unwrap_or(1970)
}

/// `readable_date` as written on output: always UTC, fixed format
/// (spec §6, §9 — deliberate loss of source local-zone display).
pub fn format_readable_date(date_ms: i64) -> String {
    Utc.timestamp_millis_opt(date_ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "1970-01-01 00:00:00 UTC".to_string())
}

/// Sum type used where call sites genuinely need to know which kind of
/// record they're holding (e.g. writers, rejection sink).
#[derive(Debug, Clone)]
pub enum AnyRecord {
    Call(Call),
    Sms(Sms),
    Mms(Mms),
}

impl Record for AnyRecord {
    fn canonical_hash(&self) -> [u8; 32] {
        match self {
            AnyRecord::Call(c) => c.canonical_hash(),
            AnyRecord::Sms(s) => s.canonical_hash(),
            AnyRecord::Mms(m) => m.canonical_hash(),
        }
    }

    fn timestamp_ms(&self) -> i64 {
        match self {
            AnyRecord::Call(c) => c.timestamp_ms(),
            AnyRecord::Sms(s) => s.timestamp_ms(),
            AnyRecord::Mms(m) => m.timestamp_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_trims_only_trailing_ascii_whitespace() {
        assert_eq!(canonicalize_string("hello \t\r\n"), "hello");
        assert_eq!(canonicalize_string("  hello"), "  hello");
    }

    #[test]
    fn utc_year_boundary() {
        assert_eq!(utc_year(1420070399999), 2014);
        assert_eq!(utc_year(1420070400000), 2015);
    }
}
