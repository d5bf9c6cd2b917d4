use super::{CanonicalHasher, RawAttrs, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsKind {
    Received = 1,
    Sent = 2,
}

impl SmsKind {
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

#[derive(Debug, Clone)]
pub struct Sms {
    pub address: String,
    pub date_ms: i64,
    pub kind: SmsKind,
    pub body: String,
    pub subject: Option<String>,
    pub protocol: Option<String>,
    pub service_center: Option<String>,
    pub read: Option<bool>,
    pub status: Option<i64>,
    pub locked: Option<bool>,
    pub date_sent_ms: Option<i64>,
    pub readable_date: Option<String>,
    pub contact_name: Option<String>,
}

impl Sms {
    pub fn from_attrs(attrs: &RawAttrs) -> Result<Sms, Vec<String>> {
        let mut violations = Vec::new();

        let address = attrs.get("address").cloned().unwrap_or_default();
        if address.is_empty() {
            violations.push("invalid-field:address".to_string());
        }

        let date_ms = match attrs.get("date").map(|s| s.parse::<i64>()) {
            Some(Ok(v)) if v > 0 => Some(v),
            Some(Ok(_)) => {
                violations.push("missing-timestamp".to_string());
                None
            }
            Some(Err(_)) => {
                violations.push("invalid-field:date".to_string());
                None
            }
            None => {
                violations.push("missing-timestamp".to_string());
                None
            }
        };

        let kind = attrs
            .get("type")
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(SmsKind::from_code);
        if kind.is_none() {
            violations.push("invalid-field:type".to_string());
        }

        if !violations.is_empty() {
            return Err(violations);
        }

        Ok(Sms {
            address,
            date_ms: date_ms.unwrap(),
            kind: kind.unwrap(),
            body: attrs.get("body").cloned().unwrap_or_default(),
            subject: non_null(attrs.get("subject")),
            protocol: non_null(attrs.get("protocol")),
            service_center: non_null(attrs.get("service_center")),
            read: attrs.get("read").and_then(|s| parse_bool(s)),
            status: attrs.get("status").and_then(|s| s.parse::<i64>().ok()),
            locked: attrs.get("locked").and_then(|s| parse_bool(s)),
            date_sent_ms: attrs.get("date_sent").and_then(|s| s.parse::<i64>().ok()),
            readable_date: attrs.get("readable_date").cloned(),
            contact_name: attrs.get("contact_name").cloned(),
        })
    }
}

fn non_null(v: Option<&String>) -> Option<String> {
    match v {
        Some(s) if s != "null" => Some(s.clone()),
        _ => None,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

impl Record for Sms {
    fn canonical_hash(&self) -> [u8; 32] {
        CanonicalHasher::new()
            .field_str("address", Some(&self.address))
            .field_i64("date_ms", self.date_ms)
            .field_i64("kind", self.kind.code())
            .field_str("body", Some(&self.body))
            .field_str("subject", self.subject.as_deref())
            .field_str("protocol", self.protocol.as_deref())
            .field_str("service_center", self.service_center.as_deref())
            .field_bool("read", self.read)
            .field_opt_i64("status", self.status)
            .field_bool("locked", self.locked)
            .field_opt_i64("date_sent_ms", self.date_sent_ms)
            .finish()
    }

    fn timestamp_ms(&self) -> i64 {
        self.date_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> RawAttrs {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn empty_body_is_allowed() {
        let sms = Sms::from_attrs(&attrs(&[
            ("address", "5551234567"),
            ("date", "1420070400000"),
            ("type", "1"),
            ("body", ""),
        ]))
        .unwrap();
        assert_eq!(sms.body, "");
    }

    #[test]
    fn display_fields_excluded_from_hash() {
        let mut a = attrs(&[
            ("address", "5551234567"),
            ("date", "1420070400000"),
            ("type", "2"),
            ("body", "hi"),
            ("readable_date", "x"),
            ("contact_name", "Alice"),
        ]);
        let s1 = Sms::from_attrs(&a).unwrap();
        a.insert("readable_date".to_string(), "y".to_string());
        a.insert("contact_name".to_string(), "Bob".to_string());
        let s2 = Sms::from_attrs(&a).unwrap();
        assert_eq!(s1.canonical_hash(), s2.canonical_hash());
    }

    #[test]
    fn body_change_changes_hash() {
        let mut a = attrs(&[("address", "5551234567"), ("date", "1"), ("type", "1"), ("body", "hi")]);
        // date must be >0
        a.insert("date".to_string(), "1420070400000".to_string());
        let s1 = Sms::from_attrs(&a).unwrap();
        a.insert("body".to_string(), "bye".to_string());
        let s2 = Sms::from_attrs(&a).unwrap();
        assert_ne!(s1.canonical_hash(), s2.canonical_hash());
    }
}
