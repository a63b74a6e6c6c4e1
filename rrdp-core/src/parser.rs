//! RRDP XML decoding.
//!
//! Turns raw notification, snapshot and delta documents into the typed
//! structures in [`crate::document`]. Parsing is synchronous and stateless.
//!
//! All three document types share the same shape: a root element carrying
//! `version`, `session_id` and `serial`, with a flat list of child elements.
//! The reader first collects that two-level structure and the per-document
//! functions then interpret it. Namespace prefixes are ignored.

use std::borrow::Cow;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use quick_xml::events::{BytesStart, Event};

use crate::document::{
    DeltaDocument, DeltaElement, DeltaRef, NotificationDocument, PublishedObject, SnapshotDocument,
    SnapshotRef,
};
use crate::hash::ContentHash;

/// The only protocol version this client understands.
pub const RRDP_VERSION: &str = "1";

/// RRDP document decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Malformed XML: {0}")]
    Xml(String),

    #[error("Unexpected root element <{found}>, expected <{expected}>")]
    UnexpectedRoot {
        expected: &'static str,
        found: String,
    },

    #[error("Unsupported RRDP version {0:?}")]
    UnsupportedVersion(String),

    #[error("Missing attribute {attribute:?} on <{element}>")]
    MissingAttribute {
        element: String,
        attribute: &'static str,
    },

    #[error("Invalid {attribute:?} value {value:?} on <{element}>")]
    InvalidAttribute {
        element: String,
        attribute: &'static str,
        value: String,
    },

    #[error("Invalid content for {uri}: {reason}")]
    InvalidContent { uri: String, reason: String },

    #[error("Invalid document structure: {0}")]
    InvalidStructure(String),
}

/// Decode a notification document.
pub fn parse_notification(xml: &[u8]) -> Result<NotificationDocument, ParseError> {
    let raw = read_document(xml, "notification")?;
    let header = raw.root.header()?;

    let mut snapshot = None;
    let mut deltas = Vec::new();
    for child in &raw.children {
        match child.name.as_str() {
            "snapshot" => {
                if snapshot.is_some() {
                    return Err(ParseError::InvalidStructure(
                        "notification lists more than one <snapshot>".to_string(),
                    ));
                }
                snapshot = Some(SnapshotRef {
                    uri: child.required("uri")?.to_string(),
                    hash: child.hash("hash")?,
                });
            }
            "delta" => deltas.push(DeltaRef {
                serial: child.serial()?,
                uri: child.required("uri")?.to_string(),
                hash: child.hash("hash")?,
            }),
            other => return Err(unexpected_child("notification", other)),
        }
    }

    let snapshot = snapshot.ok_or_else(|| {
        ParseError::InvalidStructure("notification does not reference a <snapshot>".to_string())
    })?;

    Ok(NotificationDocument {
        session_id: header.session_id,
        serial: header.serial,
        snapshot,
        deltas,
    })
}

/// Decode a snapshot document.
pub fn parse_snapshot(xml: &[u8]) -> Result<SnapshotDocument, ParseError> {
    let raw = read_document(xml, "snapshot")?;
    let header = raw.root.header()?;

    let mut published = Vec::with_capacity(raw.children.len());
    for child in raw.children {
        if child.name != "publish" {
            return Err(unexpected_child("snapshot", &child.name));
        }
        let uri = child.required("uri")?.to_string();
        let content = decode_content(&uri, &child.text)?;
        published.push(PublishedObject { uri, content });
    }

    Ok(SnapshotDocument {
        session_id: header.session_id,
        serial: header.serial,
        published,
    })
}

/// Decode a delta document.
pub fn parse_delta(xml: &[u8]) -> Result<DeltaDocument, ParseError> {
    let raw = read_document(xml, "delta")?;
    let header = raw.root.header()?;

    let mut elements = Vec::with_capacity(raw.children.len());
    for child in raw.children {
        let uri = child.required("uri")?.to_string();
        match child.name.as_str() {
            "publish" => {
                let replaces = match child.attribute("hash") {
                    Some(_) => Some(child.hash("hash")?),
                    None => None,
                };
                let content = decode_content(&uri, &child.text)?;
                elements.push(DeltaElement::Publish {
                    uri,
                    replaces,
                    content,
                });
            }
            "withdraw" => {
                let hash = child.hash("hash")?;
                elements.push(DeltaElement::Withdraw { uri, hash });
            }
            other => return Err(unexpected_child("delta", other)),
        }
    }

    Ok(DeltaDocument {
        session_id: header.session_id,
        serial: header.serial,
        elements,
    })
}

fn unexpected_child(parent: &str, child: &str) -> ParseError {
    ParseError::InvalidStructure(format!("unexpected <{}> inside <{}>", child, parent))
}

/// Base64 content may be wrapped over several lines; XML whitespace is
/// dropped before decoding. An empty body is an empty object.
fn decode_content(uri: &str, text: &str) -> Result<Vec<u8>, ParseError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Ok(Vec::new());
    }
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| ParseError::InvalidContent {
            uri: uri.to_string(),
            reason: e.to_string(),
        })
}

struct Header {
    session_id: String,
    serial: u64,
}

struct RawElement {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
}

impl RawElement {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, ParseError> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| ParseError::Xml(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            // Namespace declarations are not data.
            if attr.key.as_ref() == b"xmlns" || attr.key.as_ref().starts_with(b"xmlns:") {
                continue;
            }
            let value = attr
                .unescape_value()
                .map_err(|e| ParseError::Xml(e.to_string()))?
                .into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            attributes,
            text: String::new(),
        })
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn required(&self, name: &'static str) -> Result<&str, ParseError> {
        match self.attribute(name) {
            Some(v) if !v.is_empty() => Ok(v),
            Some(v) => Err(ParseError::InvalidAttribute {
                element: self.name.clone(),
                attribute: name,
                value: v.to_string(),
            }),
            None => Err(ParseError::MissingAttribute {
                element: self.name.clone(),
                attribute: name,
            }),
        }
    }

    fn hash(&self, name: &'static str) -> Result<ContentHash, ParseError> {
        let value = self.required(name)?;
        ContentHash::from_hex(value).map_err(|_| ParseError::InvalidAttribute {
            element: self.name.clone(),
            attribute: name,
            value: value.to_string(),
        })
    }

    fn serial(&self) -> Result<u64, ParseError> {
        let value = self.required("serial")?;
        let invalid = || ParseError::InvalidAttribute {
            element: self.name.clone(),
            attribute: "serial",
            value: value.to_string(),
        };
        if !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        value.parse::<u64>().map_err(|_| invalid())
    }

    fn header(&self) -> Result<Header, ParseError> {
        let version = self.required("version")?;
        if version != RRDP_VERSION {
            return Err(ParseError::UnsupportedVersion(version.to_string()));
        }
        Ok(Header {
            session_id: self.required("session_id")?.to_string(),
            serial: self.serial()?,
        })
    }
}

struct RawDocument {
    root: RawElement,
    children: Vec<RawElement>,
}

/// Read the two-level element structure shared by all RRDP documents.
fn read_document(xml: &[u8], expected_root: &'static str) -> Result<RawDocument, ParseError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut root: Option<RawElement> = None;
    let mut root_closed = false;
    let mut current: Option<RawElement> = None;
    let mut children = Vec::new();
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ParseError::Xml(format!("at byte {}: {}", reader.buffer_position(), e)))?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let element = RawElement::from_start(e)?;
                if root_closed {
                    return Err(ParseError::InvalidStructure(
                        "content after the root element".to_string(),
                    ));
                }
                match root {
                    None => {
                        if element.name != expected_root {
                            return Err(ParseError::UnexpectedRoot {
                                expected: expected_root,
                                found: element.name,
                            });
                        }
                        root = Some(element);
                        root_closed = is_empty;
                    }
                    Some(_) => {
                        if current.is_some() {
                            return Err(ParseError::InvalidStructure(format!(
                                "nested <{}> element",
                                element.name
                            )));
                        }
                        if is_empty {
                            children.push(element);
                        } else {
                            current = Some(element);
                        }
                    }
                }
            }
            Event::End(_) => match current.take() {
                Some(element) => children.push(element),
                None => root_closed = true,
            },
            Event::Text(ref t) => {
                let text = t.unescape().map_err(|e| ParseError::Xml(e.to_string()))?;
                push_text(current.as_mut(), text)?;
            }
            Event::CData(ref c) => {
                let text = std::str::from_utf8(c).map_err(|e| ParseError::Xml(e.to_string()))?;
                push_text(current.as_mut(), Cow::Borrowed(text))?;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    match root {
        Some(root) if root_closed => Ok(RawDocument { root, children }),
        Some(_) => Err(ParseError::Xml("unexpected end of document".to_string())),
        None => Err(ParseError::UnexpectedRoot {
            expected: expected_root,
            found: String::new(),
        }),
    }
}

fn push_text(current: Option<&mut RawElement>, text: Cow<'_, str>) -> Result<(), ParseError> {
    match current {
        Some(element) => {
            element.text.push_str(&text);
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(ParseError::InvalidStructure(
            "unexpected text outside of a child element".to_string(),
        )),
    }
}
