//! Default length-prefixed text codec.
//!
//! Wire format per message: `[length prefix][payload bytes]`. Payloads
//! shorter than 128 bytes use a single prefix byte holding the length.
//! Longer payloads use a 4-byte big-endian prefix with the top bit forced
//! set; the decoder recovers the length as `prefix & 0x7fff`. A first byte
//! with the high bit set is what distinguishes the two encodings on decode.

use std::borrow::Cow;

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{Codec, Decoded, MAX_FRAME_LENGTH, check_frame_length};
use crate::error::Result;

/// Character set used to convert between text and payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    /// UTF-8; invalid sequences decode to replacement characters.
    #[default]
    Utf8,
    /// ISO-8859-1; code points above U+00FF encode as `?`.
    Latin1,
}

impl Charset {
    fn decode(self, bytes: &[u8]) -> String {
        match self {
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Charset::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }

    fn encode(self, text: &str) -> Cow<'_, [u8]> {
        match self {
            Charset::Utf8 => Cow::Borrowed(text.as_bytes()),
            Charset::Latin1 => Cow::Owned(
                text.chars()
                    .map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' })
                    .collect(),
            ),
        }
    }
}

/// Length-prefixed [`String`] codec, the default framing for text servers.
pub struct TextCodec {
    charset: Charset,
    limit: usize,
}

impl TextCodec {
    /// Codec with the default charset (UTF-8) and the maximum frame length.
    pub fn new() -> Self {
        TextCodec {
            charset: Charset::default(),
            limit: MAX_FRAME_LENGTH,
        }
    }

    pub fn with_charset(charset: Charset) -> Self {
        TextCodec {
            charset,
            limit: MAX_FRAME_LENGTH,
        }
    }

    /// Cap the payload length in bytes. Values above the wire format's hard
    /// maximum of 32 767 are clamped down to it.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit.min(MAX_FRAME_LENGTH).max(1);
        self
    }
}

impl Default for TextCodec {
    fn default() -> Self {
        TextCodec::new()
    }
}

impl Codec for TextCodec {
    type Item = String;

    fn decode(&self, src: &[u8]) -> Result<Decoded<String>> {
        if src.is_empty() {
            return Ok(Decoded::Incomplete);
        }
        let first = src[0];
        let (length, header) = if first < 0x80 {
            (first as usize, 1)
        } else {
            if src.len() < 4 {
                // The 4-byte prefix itself spans a buffer boundary.
                return Ok(Decoded::Incomplete);
            }
            let prefix = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
            ((prefix & 0x7fff) as usize, 4)
        };
        // Reject oversized frames before touching the payload.
        check_frame_length(length, self.limit)?;
        if src.len() < header + length {
            return Ok(Decoded::Incomplete);
        }
        let text = self.charset.decode(&src[header..header + length]);
        Ok(Decoded::Frame(text, header + length))
    }

    fn encode(&self, item: &String) -> Result<Bytes> {
        let payload = self.charset.encode(item);
        let len = payload.len();
        check_frame_length(len, self.limit)?;
        let mut buf = BytesMut::with_capacity(len + 4);
        if len < 0x80 {
            buf.put_u8(len as u8);
        } else {
            // Sign bit of the first byte marks the 4-byte form; the decoder
            // masks it (and the unused bits 16..31) back off with 0x7fff.
            buf.put_u32(len as u32 | 0x8000_0000);
        }
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }
}
