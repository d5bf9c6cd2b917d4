use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

use super::{CanonicalHasher, RawAttrs, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmsKind {
    Received = 1,
    Sent = 2,
}

impl MmsKind {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Received),
            2 => Some(Self::Sent),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrType {
    From = 137,
    To = 151,
}

impl AddrType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            137 => Some(Self::From),
            151 => Some(Self::To),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }
}

#[derive(Debug, Clone)]
pub struct Addr {
    pub address: String,
    pub addr_type: AddrType,
    pub charset: Option<String>,
}

/// Binary content of a part, either as first parsed (still base64) or
/// already rewritten to a store reference (spec §3 Part, §4.7.2).
#[derive(Debug, Clone)]
pub enum BinaryPart {
    Pending { base64: String },
    Stored { sha256_hex: String },
}

impl BinaryPart {
    /// SHA-256 of the decoded binary, computed on demand for `Pending`
    /// (decoding once is unavoidable before extraction anyway) and read
    /// directly for `Stored`.
    pub fn sha256_hex(&self) -> Result<String, base64::DecodeError> {
        match self {
            BinaryPart::Stored { sha256_hex } => Ok(sha256_hex.clone()),
            BinaryPart::Pending { base64 } => {
                let bytes = BASE64.decode(base64.as_bytes())?;
                let mut hasher = Sha256::new();
                hasher.update(&bytes);
                Ok(hex::encode(hasher.finalize()))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum PartContent {
    /// Inline text, including SMIL layout (`seq == -1`).
    Text(String),
    Binary(BinaryPart),
}

#[derive(Debug, Clone)]
pub struct Part {
    pub seq: i64,
    pub content_type: String,
    pub name: Option<String>,
    pub charset: Option<String>,
    pub content_disposition: Option<String>,
    pub filename: Option<String>,
    pub content_id: Option<String>,
    pub content_location: Option<String>,
    pub content: PartContent,
}

/// Binary content types extracted to the attachment store; anything else
/// is rejected at the record level (spec §4.7.2).
pub const BINARY_CONTENT_TYPE_WHITELIST: &[&str] =
    &["image/jpeg", "image/jpg", "image/png", "image/gif", "image/bmp", "image/webp"];

#[derive(Debug, Clone)]
pub struct Mms {
    pub address: String,
    pub date_ms: i64,
    pub kind: MmsKind,
    pub readable_date: Option<String>,
    pub contact_name: Option<String>,
    /// Remaining MMS transport/display attributes in the order they were
    /// parsed (by attribute name). Sorted by key, so hashing and output
    /// are both deterministic regardless of source attribute order.
    pub extra: BTreeMap<String, String>,
    pub parts: Vec<Part>,
    pub addrs: Vec<Addr>,
}

impl Mms {
    pub fn from_attrs(
        attrs: &RawAttrs,
        parts: Vec<Part>,
        addrs: Vec<Addr>,
    ) -> Result<Mms, Vec<String>> {
        let mut violations = Vec::new();

        let address = attrs.get("address").cloned().unwrap_or_default();
        if address.is_empty() {
            violations.push("invalid-field:address".to_string());
        }

        let date_ms = match attrs.get("date").map(|s| s.parse::<i64>()) {
            Some(Ok(v)) if v > 0 => Some(v),
            Some(Ok(_)) | None => {
                violations.push("missing-timestamp".to_string());
                None
            }
            Some(Err(_)) => {
                violations.push("invalid-field:date".to_string());
                None
            }
        };

        let kind = attrs
            .get("msg_box")
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(MmsKind::from_code);
        if kind.is_none() {
            violations.push("invalid-field:msg_box".to_string());
        }

        if !violations.is_empty() {
            return Err(violations);
        }

        let extra: BTreeMap<String, String> = attrs
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "address" | "date" | "msg_box" | "readable_date" | "contact_name"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Mms {
            address,
            date_ms: date_ms.unwrap(),
            kind: kind.unwrap(),
            readable_date: attrs.get("readable_date").cloned(),
            contact_name: attrs.get("contact_name").cloned(),
            extra,
            parts,
            addrs,
        })
    }

    /// Numbers named in `address`, split on `~` (spec §3, §4.9).
    pub fn addresses(&self) -> Vec<&str> {
        self.address.split('~').collect()
    }

    /// Names named in `contact_name`, split on `,` (spec §4.9).
    pub fn contact_names(&self) -> Vec<&str> {
        self.contact_name.as_deref().map(|s| s.split(',').collect()).unwrap_or_default()
    }
}

impl Record for Mms {
    fn canonical_hash(&self) -> [u8; 32] {
        let mut h = CanonicalHasher::new();
        h.field_str("address", Some(&self.address))
            .field_i64("date_ms", self.date_ms)
            .field_i64("kind", self.kind.code());
        for (k, v) in &self.extra {
            h.field_str(k, Some(v));
        }
        for (i, part) in self.parts.iter().enumerate() {
            let tag = format!("part[{i}]");
            h.field_i64(&format!("{tag}.seq"), part.seq)
                .field_str(&format!("{tag}.content_type"), Some(&part.content_type))
                .field_str(&format!("{tag}.name"), part.name.as_deref())
                .field_str(&format!("{tag}.charset"), part.charset.as_deref())
                .field_str(&format!("{tag}.content_disposition"), part.content_disposition.as_deref())
                .field_str(&format!("{tag}.filename"), part.filename.as_deref())
                .field_str(&format!("{tag}.content_id"), part.content_id.as_deref())
                .field_str(&format!("{tag}.content_location"), part.content_location.as_deref());
            match &part.content {
                PartContent::Text(text) => {
                    h.field_str(&format!("{tag}.text"), Some(text));
                }
                PartContent::Binary(bin) => {
                    let sha = bin.sha256_hex().unwrap_or_default();
                    h.field_binary_hash(&format!("{tag}.data_sha256"), Some(&sha));
                }
            }
        }
        for (i, addr) in self.addrs.iter().enumerate() {
            let tag = format!("addr[{i}]");
            h.field_str(&format!("{tag}.address"), Some(&addr.address))
                .field_i64(&format!("{tag}.type"), addr.addr_type.code())
                .field_str(&format!("{tag}.charset"), addr.charset.as_deref());
        }
        h.finish()
    }

    fn timestamp_ms(&self) -> i64 {
        self.date_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mms_with_part(content: PartContent) -> Mms {
        Mms::from_attrs(
            &[("address", "5551111111"), ("date", "1420070400000"), ("msg_box", "1")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            vec![Part {
                seq: 0,
                content_type: "image/jpeg".to_string(),
                name: None,
                charset: None,
                content_disposition: None,
                filename: Some("a.jpg".to_string()),
                content_id: None,
                content_location: None,
                content,
            }],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn pending_and_stored_binary_hash_the_same_mms() {
        let base64_payload = BASE64.encode([0xDE, 0xAD, 0xBE]);
        let pending = mms_with_part(PartContent::Binary(BinaryPart::Pending { base64: base64_payload }));
        let sha = pending.parts[0].content_sha256().unwrap();
        let stored = mms_with_part(PartContent::Binary(BinaryPart::Stored { sha256_hex: sha }));
        assert_eq!(pending.canonical_hash(), stored.canonical_hash());
    }

    #[test]
    fn missing_content_type_violation_not_enforced_here() {
        // Content-type whitelist enforcement happens in the importer's
        // extraction policy (spec §4.7.2), not in the model layer.
        assert_eq!(BINARY_CONTENT_TYPE_WHITELIST.len(), 6);
    }
}

impl Part {
    pub fn content_sha256(&self) -> Option<String> {
        match &self.content {
            PartContent::Binary(bin) => bin.sha256_hex().ok(),
            PartContent::Text(_) => None,
        }
    }
}
