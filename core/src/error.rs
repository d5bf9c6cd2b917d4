//! Closed set of error kinds produced by the core (spec §7).

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything the core can fail with. Per-record validation failures are
/// *not* represented here: they are recovered locally by the importer and
/// routed to the rejection sink (§4.7.1, §7 propagation policy).
#[derive(Debug, Error)]
pub enum Error {
    // --- Input ---
    #[error("malformed input at byte {offset} (line {line}): {reason}")]
    Malformed {
        reason: String,
        offset: u64,
        line: u64,
    },

    #[error("insecure path: {path}")]
    InsecurePath { path: String },

    // --- Environment ---
    #[error("io error during {op} on {path}: {source}")]
    Io {
        path: PathBuf,
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("could not acquire repository lock at {path}")]
    Lock { path: PathBuf },

    #[error("unsupported repository structure version {found:?}, expected {supported:?}")]
    UnsupportedVersion { found: String, supported: String },

    // --- Integrity ---
    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        expected: String,
        actual: String,
        path: PathBuf,
    },

    #[error("manifest inconsistent: {} violation(s)", violations.len())]
    ManifestInconsistent {
        violations: Vec<crate::validate::ValidationViolation>,
    },

    // --- Logic ---
    #[error("address/contact-name count mismatch: {addr_count} addresses vs {name_count} names")]
    AddressContactMismatch { addr_count: usize, name_count: usize },

    #[error("number {number} maps to conflicting contact names: {names:?}")]
    DuplicateNumber { number: String, names: Vec<String> },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, op: &'static str, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), op, source }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Malformed { reason: format!("yaml error: {e}"), offset: 0, line: 0 }
    }
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        Error::Malformed { reason: e.to_string(), offset: 0, line: 0 }
    }
}
