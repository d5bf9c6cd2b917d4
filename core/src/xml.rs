//! Secure XML streamer (C1, spec §4.1).
//!
//! Wraps `quick_xml`'s pull parser with the limits and refusals the spec
//! demands: no DOCTYPE (so no external entities, no entity expansion —
//! `quick_xml` never resolves custom entities in the first place, so this
//! mostly means rejecting a `<!DOCTYPE>` outright), bounded document size,
//! bounded single element/attribute size, bounded attribute count, bounded
//! nesting depth. Memory use is O(max_depth + single_element_size): we
//! never buffer more than one element's worth of bytes plus the open-tag
//! stack.

use std::collections::VecDeque;
use std::io::BufRead;

use quick_xml::events::Event as QEvent;
use quick_xml::Reader;

use crate::error::{Error, Result};
use crate::model::RawAttrs;

#[derive(Debug, Clone)]
pub enum XmlEvent {
    Start { name: String, attrs: RawAttrs },
    End { name: String },
    Text(String),
    Eof,
}

#[derive(Debug, Clone, Copy)]
pub struct XmlLimits {
    pub max_document_bytes: u64,
    pub max_single_value_bytes: usize,
    pub max_attrs_per_element: usize,
    pub max_nesting_depth: usize,
}

impl Default for XmlLimits {
    fn default() -> Self {
        Self {
            max_document_bytes: 500 * 1024 * 1024,
            max_single_value_bytes: 10 * 1024 * 1024,
            max_attrs_per_element: 64,
            max_nesting_depth: 64,
        }
    }
}

pub struct SecureXmlStreamer<R: BufRead> {
    reader: Reader<R>,
    limits: XmlLimits,
    depth: usize,
    line: u64,
    buf: Vec<u8>,
    pending: VecDeque<XmlEvent>,
    poison: Option<(String, u64, u64)>,
}

impl<R: BufRead> SecureXmlStreamer<R> {
    pub fn new(inner: R, limits: XmlLimits) -> Self {
        let mut reader = Reader::from_reader(inner);
        reader.config_mut().trim_text = true;
        Self {
            reader,
            limits,
            depth: 0,
            line: 1,
            buf: Vec::new(),
            pending: VecDeque::new(),
            poison: None,
        }
    }

    pub fn next_event(&mut self) -> Result<XmlEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }
        if let Some((reason, offset, line)) = &self.poison {
            return Err(Error::Malformed { reason: reason.clone(), offset: *offset, line: *line });
        }
        match self.next_event_inner() {
            Ok(event) => Ok(event),
            Err(e) => {
                let (reason, offset, line) = match &e {
                    Error::Malformed { reason, offset, line } => (reason.clone(), *offset, *line),
                    other => (other.to_string(), self.reader.buffer_position(), self.line),
                };
                self.poison = Some((reason.clone(), offset, line));
                Err(Error::Malformed { reason, offset, line })
            }
        }
    }

    fn next_event_inner(&mut self) -> Result<XmlEvent> {
        loop {
            self.buf.clear();
            let event = self.reader.read_event_into(&mut self.buf).map_err(|e| self.malformed(e.to_string()))?;
            self.line += event_newlines(&event);
            if self.reader.buffer_position() > self.limits.max_document_bytes {
                return Err(self.malformed("document exceeds maximum size".to_string()));
            }
            match event {
                QEvent::Start(e) => {
                    self.depth += 1;
                    if self.depth > self.limits.max_nesting_depth {
                        return Err(self.malformed("nesting depth exceeds limit".to_string()));
                    }
                    let name = qname_to_string(e.name().as_ref());
                    let attrs = self.collect_attrs(&e)?;
                    return Ok(XmlEvent::Start { name, attrs });
                }
                QEvent::Empty(e) => {
                    let name = qname_to_string(e.name().as_ref());
                    let attrs = self.collect_attrs(&e)?;
                    self.pending.push_back(XmlEvent::End { name: name.clone() });
                    return Ok(XmlEvent::Start { name, attrs });
                }
                QEvent::End(e) => {
                    if self.depth == 0 {
                        return Err(self.malformed("unbalanced end tag".to_string()));
                    }
                    self.depth -= 1;
                    return Ok(XmlEvent::End { name: qname_to_string(e.name().as_ref()) });
                }
                QEvent::Text(e) => {
                    let text = e
                        .unescape()
                        .map_err(|err| self.malformed(format!("invalid text/entity: {err}")))?
                        .into_owned();
                    if text.len() > self.limits.max_single_value_bytes {
                        return Err(self.malformed("text node exceeds maximum size".to_string()));
                    }
                    if text.trim().is_empty() {
                        continue;
                    }
                    return Ok(XmlEvent::Text(text));
                }
                QEvent::CData(e) => {
                    let bytes = e.into_inner();
                    if bytes.len() > self.limits.max_single_value_bytes {
                        return Err(self.malformed("CDATA section exceeds maximum size".to_string()));
                    }
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    return Ok(XmlEvent::Text(text));
                }
                QEvent::DocType(_) => {
                    return Err(self.malformed("DOCTYPE declarations are not permitted".to_string()));
                }
                QEvent::Decl(_) | QEvent::PI(_) | QEvent::Comment(_) => continue,
                QEvent::Eof => return Ok(XmlEvent::Eof),
            }
        }
    }

    fn collect_attrs(&mut self, e: &quick_xml::events::BytesStart) -> Result<RawAttrs> {
        let mut attrs = RawAttrs::new();
        let mut count = 0usize;
        for attr in e.attributes() {
            let attr = attr.map_err(|err| self.malformed(format!("invalid attribute: {err}")))?;
            count += 1;
            if count > self.limits.max_attrs_per_element {
                return Err(self.malformed("attribute count exceeds limit".to_string()));
            }
            let key = qname_to_string(attr.key.as_ref());
            let value = attr
                .unescape_value()
                .map_err(|err| self.malformed(format!("invalid attribute value: {err}")))?
                .into_owned();
            if value.len() > self.limits.max_single_value_bytes {
                return Err(self.malformed("attribute value exceeds maximum size".to_string()));
            }
            attrs.insert(key, value);
        }
        Ok(attrs)
    }

    fn malformed(&self, reason: String) -> Error {
        Error::Malformed { reason, offset: self.reader.buffer_position(), line: self.line }
    }

    /// 1-based line number of the event most recently returned by
    /// `next_event` (spec §4.7: rejections are keyed by source line).
    pub fn current_line(&self) -> u64 {
        self.line
    }
}

fn qname_to_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn event_newlines(event: &QEvent) -> u64 {
    match event {
        QEvent::Text(e) => e.as_ref().iter().filter(|&&b| b == b'\n').count() as u64,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn events(xml: &str) -> Vec<XmlEvent> {
        let mut streamer = SecureXmlStreamer::new(Cursor::new(xml.as_bytes().to_vec()), XmlLimits::default());
        let mut out = Vec::new();
        loop {
            match streamer.next_event().unwrap() {
                XmlEvent::Eof => break,
                other => out.push(other),
            }
        }
        out
    }

    #[test]
    fn parses_simple_element_with_attrs() {
        let evs = events(r#"<calls count="1"><call number="123" /></calls>"#);
        assert!(matches!(&evs[0], XmlEvent::Start { name, .. } if name == "calls"));
        assert!(matches!(&evs[1], XmlEvent::Start { name, .. } if name == "call"));
        assert!(matches!(&evs[2], XmlEvent::End { name } if name == "call"));
        assert!(matches!(&evs[3], XmlEvent::End { name } if name == "calls"));
    }

    #[test]
    fn rejects_doctype() {
        let mut streamer = SecureXmlStreamer::new(
            Cursor::new(br#"<!DOCTYPE foo [<!ENTITY xxe SYSTEM "file:///etc/passwd">]><foo/>"#.to_vec()),
            XmlLimits::default(),
        );
        let err = streamer.next_event().unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }));
    }

    #[test]
    fn poisons_after_first_error() {
        let mut streamer = SecureXmlStreamer::new(Cursor::new(b"<unterminated".to_vec()), XmlLimits::default());
        let first = streamer.next_event().unwrap_err();
        let second = streamer.next_event().unwrap_err();
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn enforces_attribute_value_limit() {
        let mut limits = XmlLimits::default();
        limits.max_single_value_bytes = 4;
        let mut streamer =
            SecureXmlStreamer::new(Cursor::new(br#"<a b="too long"/>"#.to_vec()), limits);
        let err = streamer.next_event().unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }));
    }
}
