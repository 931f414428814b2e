//! Sortable record and its line encoding.

use std::error::Error;
use std::io;

use serde::{Deserialize, Serialize};

/// The sortable unit: an ordering key plus an opaque payload.
/// Records are ordered by `key` only, the payload never takes part in comparisons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: i64,
    pub value: serde_json::Value,
}

impl Record {
    pub fn new(key: i64, value: impl Into<serde_json::Value>) -> Self {
        Record {
            key,
            value: value.into(),
        }
    }
}

/// Line codec interface. Every record is stored as exactly one line so each line of a spill
/// or output file can be decoded independently.
pub trait LineCodec: Clone + Send + Sync + 'static {
    /// Encoding error.
    type EncodeError: Error + Send + 'static;
    /// Decoding error.
    type DecodeError: Error + Send + 'static;

    /// Writes a record followed by a line terminator.
    fn encode<W: io::Write>(&self, record: &Record, writer: &mut W) -> Result<(), Self::EncodeError>;

    /// Parses a single line (without its terminator).
    fn decode(&self, line: &str) -> Result<Record, Self::DecodeError>;
}

/// JSON lines codec: `{"key":<i64>,"value":<json>}` per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLineCodec;

impl LineCodec for JsonLineCodec {
    type EncodeError = serde_json::Error;
    type DecodeError = serde_json::Error;

    fn encode<W: io::Write>(&self, record: &Record, writer: &mut W) -> Result<(), Self::EncodeError> {
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n").map_err(serde_json::Error::io)
    }

    fn decode(&self, line: &str) -> Result<Record, Self::DecodeError> {
        serde_json::from_str(line)
    }
}
