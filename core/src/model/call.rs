use super::{CanonicalHasher, RawAttrs, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Incoming = 1,
    Outgoing = 2,
    Missed = 3,
    Voicemail = 4,
}

impl CallKind {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Incoming),
            2 => Some(Self::Outgoing),
            3 => Some(Self::Missed),
            4 => Some(Self::Voicemail),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }
}

#[derive(Debug, Clone)]
pub struct Call {
    pub number: String,
    pub duration_seconds: i64,
    pub date_ms: i64,
    pub kind: CallKind,
    pub readable_date: Option<String>,
    pub contact_name: Option<String>,
}

impl Call {
    /// Parses a `<call>` element's attributes, collecting every violation
    /// rather than stopping at the first one (spec §4.7.1).
    pub fn from_attrs(attrs: &RawAttrs) -> Result<Call, Vec<String>> {
        let mut violations = Vec::new();

        let number = attrs.get("number").cloned().unwrap_or_default();
        if number.is_empty() {
            violations.push("invalid-field:number".to_string());
        }

        let date_ms = parse_required_i64(attrs, "date", &mut violations);
        if let Some(d) = date_ms {
            if d <= 0 {
                violations.push("missing-timestamp".to_string());
            }
        }

        let duration_seconds = parse_i64(attrs, "duration", 0, &mut violations);
        if duration_seconds < 0 {
            violations.push("invalid-field:duration".to_string());
        }

        let kind = attrs
            .get("type")
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(CallKind::from_code);
        if kind.is_none() {
            violations.push("invalid-field:type".to_string());
        }

        if !violations.is_empty() {
            return Err(violations);
        }

        Ok(Call {
            number,
            duration_seconds,
            date_ms: date_ms.unwrap(),
            kind: kind.unwrap(),
            readable_date: attrs.get("readable_date").cloned(),
            contact_name: attrs.get("contact_name").cloned(),
        })
    }
}

impl Record for Call {
    fn canonical_hash(&self) -> [u8; 32] {
        CanonicalHasher::new()
            .field_str("number", Some(&self.number))
            .field_i64("duration_seconds", self.duration_seconds)
            .field_i64("date_ms", self.date_ms)
            .field_i64("kind", self.kind.code())
            .finish()
    }

    fn timestamp_ms(&self) -> i64 {
        self.date_ms
    }
}

fn parse_required_i64(attrs: &RawAttrs, key: &str, violations: &mut Vec<String>) -> Option<i64> {
    match attrs.get(key).map(|s| s.parse::<i64>()) {
        Some(Ok(v)) => Some(v),
        Some(Err(_)) => {
            violations.push(format!("invalid-field:{key}"));
            None
        }
        None => {
            violations.push("missing-timestamp".to_string());
            None
        }
    }
}

fn parse_i64(attrs: &RawAttrs, key: &str, default: i64, violations: &mut Vec<String>) -> i64 {
    match attrs.get(key) {
        None => default,
        Some(s) if s.is_empty() || s == "null" => default,
        Some(s) => s.parse::<i64>().unwrap_or_else(|_| {
            violations.push(format!("invalid-field:{key}"));
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> RawAttrs {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_valid_call() {
        let call = Call::from_attrs(&attrs(&[
            ("number", "+15551111111"),
            ("duration", "10"),
            ("date", "1420070400000"),
            ("type", "1"),
        ]))
        .unwrap();
        assert_eq!(call.kind, CallKind::Incoming);
        assert_eq!(call.duration_seconds, 10);
    }

    #[test]
    fn rejects_missing_number() {
        let err = Call::from_attrs(&attrs(&[("date", "1"), ("type", "1")])).unwrap_err();
        assert!(err.iter().any(|v| v == "invalid-field:number"));
    }

    #[test]
    fn readable_date_and_contact_name_do_not_affect_hash() {
        let mut a = attrs(&[
            ("number", "+15551111111"),
            ("duration", "10"),
            ("date", "1420070400000"),
            ("type", "1"),
            ("readable_date", "Jan 1, 2015"),
            ("contact_name", "Alice"),
        ]);
        let call_a = Call::from_attrs(&a).unwrap();
        a.insert("readable_date".to_string(), "different".to_string());
        a.insert("contact_name".to_string(), "Bob".to_string());
        let call_b = Call::from_attrs(&a).unwrap();
        assert_eq!(call_a.canonical_hash(), call_b.canonical_hash());
    }
}
