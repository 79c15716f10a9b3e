//! Wire payload encoding for tag events
//!
//! Every payload is UTF-8 JSON. Encoding is a pure function of its inputs:
//! identical records, attributes, variant and trim flag always produce the
//! same string.

use super::records::{TagEvent, TagRecord};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of payload bytes removed when `trim_header` is enabled
/// (status byte plus a two-letter language code on text records).
pub const TRIMMED_HEADER_LEN: usize = 3;

/// Prefix of indexed payload keys: `attr0`, `attr1`, ...
pub const ATTRIBUTE_KEY_PREFIX: &str = "attr";

/// Caller-supplied attributes merged into `PAYLOAD_PLUS_ATTRIBUTES` payloads
pub type Attributes = BTreeMap<String, String>;

/// Payload shape sent to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageEncoding {
    /// `{"attr0": "<hex id>"}` built from the tag identifier
    OnlyUidRid,
    /// `["payload0", "payload1", ...]`
    #[default]
    OnlyPayload,
    /// `[{"id": [..], "type": [..], "payload": [..]}, ...]`
    FullRecord,
    /// `{"attr0": "payload0", ..., "<caller key>": "<caller value>"}`
    PayloadPlusAttributes,
}

impl MessageEncoding {
    pub const ALL: [MessageEncoding; 4] = [
        MessageEncoding::OnlyUidRid,
        MessageEncoding::OnlyPayload,
        MessageEncoding::FullRecord,
        MessageEncoding::PayloadPlusAttributes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageEncoding::OnlyUidRid => "ONLY_UID_RID",
            MessageEncoding::OnlyPayload => "ONLY_PAYLOAD",
            MessageEncoding::FullRecord => "FULL_RECORD",
            MessageEncoding::PayloadPlusAttributes => "PAYLOAD_PLUS_ATTRIBUTES",
        }
    }
}

impl fmt::Display for MessageEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageEncoding {
    type Err = EncodeError;

    /// Accepts the wire names in any case, with `-` or `_` separators
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        MessageEncoding::ALL
            .into_iter()
            .find(|encoding| encoding.as_str() == normalized)
            .ok_or_else(|| EncodeError::UnknownEncoding(s.to_string()))
    }
}

/// Encoding errors
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Unknown message encoding: {0}")]
    UnknownEncoding(String),
    #[error("Serialization error")]
    Serialization(#[source] serde_json::Error),
}

/// Encode an ordered record set into a wire payload
pub fn encode(
    records: &[TagRecord],
    attributes: &Attributes,
    encoding: MessageEncoding,
    trim_header: bool,
) -> Result<String, EncodeError> {
    match encoding {
        MessageEncoding::OnlyUidRid => {
            encode_identifier(records.first().map(|record| record.id.as_slice()))
        }
        MessageEncoding::OnlyPayload => {
            let payloads: Vec<String> = records
                .iter()
                .map(|record| decode_payload(&record.payload, trim_header))
                .collect();
            to_json(&payloads)
        }
        MessageEncoding::FullRecord => to_json(records),
        MessageEncoding::PayloadPlusAttributes => {
            let mut entries: Vec<(String, String)> = records
                .iter()
                .enumerate()
                .map(|(index, record)| {
                    (
                        attribute_key(index),
                        decode_payload(&record.payload, trim_header),
                    )
                })
                .collect();

            // Caller attributes are applied last and win on key collision
            for (key, value) in attributes {
                match entries.iter_mut().find(|(existing, _)| existing == key) {
                    Some(entry) => entry.1 = value.clone(),
                    None => entries.push((key.clone(), value.clone())),
                }
            }

            to_json(&OrderedObject(&entries))
        }
    }
}

/// Encode a tag event.
///
/// A bare tag identifier has no record content, so it is always sent as
/// `ONLY_UID_RID` whatever encoding is configured.
pub fn encode_event(
    event: &TagEvent,
    attributes: &Attributes,
    encoding: MessageEncoding,
    trim_header: bool,
) -> Result<String, EncodeError> {
    match event {
        TagEvent::Records { records } => encode(records, attributes, encoding, trim_header),
        TagEvent::TagId { id } => encode_identifier(Some(id)),
    }
}

/// Decode a record payload as UTF-8 text.
///
/// With `trim_header` the first [`TRIMMED_HEADER_LEN`] bytes are dropped;
/// shorter payloads decode as the empty string. Invalid sequences become
/// U+FFFD.
pub fn decode_payload(payload: &[u8], trim_header: bool) -> String {
    let body = if trim_header {
        payload.get(TRIMMED_HEADER_LEN..).unwrap_or_default()
    } else {
        payload
    };
    String::from_utf8_lossy(body).into_owned()
}

/// Indexed payload key for the record at `index`
pub fn attribute_key(index: usize) -> String {
    format!("{ATTRIBUTE_KEY_PREFIX}{index}")
}

fn encode_identifier(id: Option<&[u8]>) -> Result<String, EncodeError> {
    let entries: Vec<(String, String)> = id
        .map(|id| vec![(attribute_key(0), hex::encode(id))])
        .unwrap_or_default();
    to_json(&OrderedObject(&entries))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, EncodeError> {
    serde_json::to_string(value).map_err(EncodeError::Serialization)
}

/// JSON object that keeps its entries in insertion order
struct OrderedObject<'a>(&'a [(String, String)]);

impl Serialize for OrderedObject<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}
