//! Terminal byte decoding.
//!
//! Remote shells do not promise an encoding. Bytes are tried against a priority list
//! (UTF-8, GBK, GB18030) and the first strict decode wins; windows-1252 maps every
//! byte and is the final fallback, so decoding never fails.
//!
//! [`ChunkDecoder`] keeps an incomplete trailing UTF-8 sequence between reads so a
//! multi-byte character split across two packets is not turned into garbage.

use encoding_rs::{Encoding, GB18030, GBK, UTF_8, WINDOWS_1252};

/// Encodings tried in order before the permissive fallback.
const ENCODINGS: [&Encoding; 3] = [UTF_8, GBK, GB18030];

/// Longest possible incomplete UTF-8 tail (a 4-byte sequence missing its last byte).
const MAX_UTF8_TAIL: usize = 3;

/// Decode a complete chunk of terminal output.
pub fn decode_bytes(bytes: &[u8]) -> String {
    for encoding in ENCODINGS {
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes) {
            return text.into_owned();
        }
    }
    let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
    text.into_owned()
}

/// Stateful decoder for a stream of reads from one shell.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next read. Bytes that look like the start of an unfinished UTF-8
    /// character are held back until the next call.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(bytes);

        if let Err(err) = std::str::from_utf8(&buf)
            && err.error_len().is_none()
        {
            let valid = err.valid_up_to();
            if buf.len() - valid <= MAX_UTF8_TAIL {
                self.pending = buf.split_off(valid);
            }
        }

        decode_bytes(&buf)
    }

    /// Drain whatever is still held back.
    pub fn flush(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let pending = std::mem::take(&mut self.pending);
        decode_bytes(&pending)
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
