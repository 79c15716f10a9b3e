//! Tag event data model and wire payload encoding
//!
//! Records arrive from the sensing subsystem as raw bytes; this module turns
//! them into the UTF-8 JSON payloads published to the broker.

pub mod encoding;
pub mod records;

pub use encoding::*;
pub use records::*;
