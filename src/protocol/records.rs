//! Raw tag records as delivered by the sensing subsystem
//!
//! A tag read produces either an ordered set of records (identifier, type tag,
//! payload bytes) or, when the tag carries no parsable record content, only its
//! low-level UID/RID.

use serde::{Deserialize, Serialize};

/// Type tag of a well-known text record.
pub const TEXT_RECORD_TYPE: &[u8] = b"T";

/// One raw record read from a tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagRecord {
    /// Record identifier bytes (may be empty)
    #[serde(default)]
    pub id: Vec<u8>,
    /// Record type tag
    #[serde(rename = "type", default)]
    pub record_type: Vec<u8>,
    /// Raw payload bytes
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl TagRecord {
    pub fn new(
        id: impl Into<Vec<u8>>,
        record_type: impl Into<Vec<u8>>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: id.into(),
            record_type: record_type.into(),
            payload: payload.into(),
        }
    }

    /// Build a well-known text record.
    ///
    /// The payload starts with a status byte holding the language code length,
    /// followed by the language code and the UTF-8 text. With a two-letter
    /// language code this is the 3-byte header removed by `trim_header`.
    pub fn text(language: &str, text: &str) -> Self {
        let language = language.as_bytes();
        let mut payload = Vec::with_capacity(1 + language.len() + text.len());
        payload.push((language.len() & 0x3f) as u8);
        payload.extend_from_slice(language);
        payload.extend_from_slice(text.as_bytes());
        Self::new(Vec::<u8>::new(), TEXT_RECORD_TYPE, payload)
    }

    /// Check if this is a well-known text record
    pub fn is_text(&self) -> bool {
        self.record_type == TEXT_RECORD_TYPE
    }
}

/// A single tag read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TagEvent {
    /// Tag carried an ordered record set
    Records { records: Vec<TagRecord> },
    /// Tag exposed only its low-level identifier (UID or random ID)
    TagId { id: Vec<u8> },
}

impl TagEvent {
    pub fn records(records: Vec<TagRecord>) -> Self {
        TagEvent::Records { records }
    }

    pub fn tag_id(id: impl Into<Vec<u8>>) -> Self {
        TagEvent::TagId { id: id.into() }
    }

    /// Number of records carried by the event (a bare tag id counts as one)
    pub fn len(&self) -> usize {
        match self {
            TagEvent::Records { records } => records.len(),
            TagEvent::TagId { .. } => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, TagEvent::Records { records } if records.is_empty())
    }
}

/// Render bytes as space-separated lowercase hex pairs, e.g. `5b 42 0a`
pub fn hexdump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
