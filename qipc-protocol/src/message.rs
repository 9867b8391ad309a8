//! Decoded messages and per-call options.

use crate::error::ProtocolError;
use crate::header::MessageKind;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Body of a decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<V> {
    /// Undecoded payload bytes (raw mode).
    Raw(Bytes),
    /// Value produced by the codec.
    Value(V),
}

impl<V> Payload<V> {
    pub fn is_raw(&self) -> bool {
        matches!(self, Payload::Raw(_))
    }

    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            Payload::Raw(bytes) => Some(bytes),
            Payload::Value(_) => None,
        }
    }

    pub fn into_raw(self) -> Option<Bytes> {
        match self {
            Payload::Raw(bytes) => Some(bytes),
            Payload::Value(_) => None,
        }
    }

    pub fn into_value(self) -> Option<V> {
        match self {
            Payload::Raw(_) => None,
            Payload::Value(value) => Some(value),
        }
    }
}

/// A message read from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<V> {
    pub kind: MessageKind,
    /// Total declared size, header included.
    pub size: u64,
    pub compression_mode: u8,
    pub payload: Payload<V>,
}

impl<V> Message<V> {
    pub fn is_compressed(&self) -> bool {
        self.compression_mode > 0
    }

    pub fn into_payload(self) -> Payload<V> {
        self.payload
    }
}

/// Per-call options.
///
/// `raw` is interpreted by the framing layer; every other entry is passed
/// through to the value codec untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Return the undecoded payload instead of a decoded value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<bool>,

    /// Codec-specific entries.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options with raw mode enabled.
    pub fn raw() -> Self {
        Self::new().with_raw(true)
    }

    pub fn with_raw(mut self, raw: bool) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn is_raw(&self) -> bool {
        self.raw.unwrap_or(false)
    }

    /// Returns these options overlaid with `overrides`; entries set in
    /// `overrides` win.
    pub fn merged(&self, overrides: &Options) -> Options {
        let mut merged = self.clone();
        if overrides.raw.is_some() {
            merged.raw = overrides.raw;
        }
        for (key, value) in &overrides.extra {
            merged.extra.insert(key.clone(), value.clone());
        }
        merged
    }
}

/// Text encoding for credentials and character data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    #[default]
    Latin1,
    Utf8,
}

impl TextEncoding {
    pub fn name(self) -> &'static str {
        match self {
            TextEncoding::Latin1 => "latin-1",
            TextEncoding::Utf8 => "utf-8",
        }
    }

    pub fn encode(self, text: &str) -> Result<Vec<u8>, ProtocolError> {
        match self {
            TextEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
            TextEncoding::Latin1 => text
                .chars()
                .map(|ch| {
                    u8::try_from(u32::from(ch)).map_err(|_| ProtocolError::Unencodable {
                        ch,
                        encoding: self.name(),
                    })
                })
                .collect(),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }
}
