//! Persistence codec — WAV bytes to and from the storable data-URI string,
//! plus the record shape the sound library exchanges with us.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::{RecorderError, Result};
use crate::pcm::PcmBuffer;
use crate::wav;

/// Prefix of every storable string we produce.
pub const DATA_URI_PREFIX: &str = "data:audio/wav;base64,";

/// Wrap WAV bytes as `data:audio/wav;base64,<payload>`.
pub fn to_storable(wav_bytes: &[u8]) -> String {
    let mut out = String::with_capacity(DATA_URI_PREFIX.len() + wav_bytes.len().div_ceil(3) * 4);
    out.push_str(DATA_URI_PREFIX);
    STANDARD.encode_string(wav_bytes, &mut out);
    out
}

/// Recover the bytes from a storable string.
///
/// Accepts a full data-URI or a bare base64 payload. ASCII whitespace is
/// ignored. Anything else fails with `InvalidEncoding`.
pub fn from_storable(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    let payload = if let Some(rest) = s.strip_prefix("data:") {
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| RecorderError::InvalidEncoding("data URI has no payload".to_string()))?;
        if !header.ends_with(";base64") {
            return Err(RecorderError::InvalidEncoding(format!(
                "data URI is not base64 encoded: {header}"
            )));
        }
        payload
    } else {
        s
    };

    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(RecorderError::InvalidEncoding("empty payload".to_string()));
    }
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| RecorderError::InvalidEncoding(e.to_string()))
}

/// The committed result of a save: encoded WAV plus its length in time.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedSound {
    storable: String,
    duration: Duration,
}

impl RenderedSound {
    pub fn from_buffer(buffer: &PcmBuffer) -> Result<Self> {
        Ok(RenderedSound {
            storable: to_storable(&wav::encode(buffer)?),
            duration: buffer.duration(),
        })
    }

    pub fn as_storable(&self) -> &str {
        &self.storable
    }

    pub fn into_storable(self) -> String {
        self.storable
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The encoded WAV bytes.
    pub fn wav_bytes(&self) -> Result<Vec<u8>> {
        from_storable(&self.storable)
    }
}

/// A sound as the library stores it. We only ever produce or read `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoundRecord {
    pub id: String,
    pub name: String,
    pub data: String,
}

impl SoundRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, sound: RenderedSound) -> Self {
        SoundRecord {
            id: id.into(),
            name: name.into(),
            data: sound.into_storable(),
        }
    }
}
