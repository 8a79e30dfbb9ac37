//! Incremental UTF-8 decoding of transport chunks.
//!
//! The transport may hand over raw bytes or text it already decoded. Byte
//! chunks can end in the middle of a codepoint; those trailing bytes are held
//! back and prepended to the next chunk.

use bytes::Bytes;

/// One unit of data delivered by the transport, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawChunk {
    Bytes(Bytes),
    Text(String),
}

impl RawChunk {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            RawChunk::Bytes(bytes) => bytes.len(),
            RawChunk::Text(text) => text.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Bytes> for RawChunk {
    fn from(bytes: Bytes) -> Self {
        RawChunk::Bytes(bytes)
    }
}

impl From<Vec<u8>> for RawChunk {
    fn from(bytes: Vec<u8>) -> Self {
        RawChunk::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for RawChunk {
    fn from(bytes: &'static [u8]) -> Self {
        RawChunk::Bytes(Bytes::from_static(bytes))
    }
}

impl From<String> for RawChunk {
    fn from(text: String) -> Self {
        RawChunk::Text(text)
    }
}

impl From<&str> for RawChunk {
    fn from(text: &str) -> Self {
        RawChunk::Text(text.to_owned())
    }
}

/// Byte-level UTF-8 decoder with carry-over of incomplete trailing sequences.
#[derive(Debug, Default)]
pub struct ByteTextDecoder {
    remainder: Vec<u8>,
    replaced_sequences: u64,
}

impl ByteTextDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes` and return the text that is complete so far.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len() + self.remainder.len());
        self.decode_into(bytes, &mut out);
        out
    }

    /// Decode `bytes`, appending complete text to `out`.
    ///
    /// Invalid sequences become U+FFFD. An incomplete sequence at the end of
    /// the input is kept for the next call.
    pub fn decode_into(&mut self, bytes: &[u8], out: &mut String) {
        let mut replaced = 0u64;
        if self.remainder.is_empty() {
            let tail = decode_valid_prefix(bytes, out, &mut replaced);
            self.remainder.extend_from_slice(tail);
        } else {
            self.remainder.extend_from_slice(bytes);
            let consumed = {
                let tail = decode_valid_prefix(&self.remainder, out, &mut replaced);
                self.remainder.len() - tail.len()
            };
            self.remainder.drain(..consumed);
        }
        if replaced > 0 {
            self.replaced_sequences += replaced;
            tracing::warn!(
                replaced,
                "invalid UTF-8 in stream chunk replaced with U+FFFD"
            );
        }
    }

    /// Decode either chunk shape into `out`.
    ///
    /// Text chunks bypass byte decoding; any bytes still deferred from an
    /// earlier byte chunk are flushed first so ordering is preserved.
    pub fn decode_chunk_into(&mut self, chunk: &RawChunk, out: &mut String) {
        match chunk {
            RawChunk::Bytes(bytes) => self.decode_into(bytes, out),
            RawChunk::Text(text) => {
                if !self.remainder.is_empty() {
                    out.push_str(&self.finish());
                }
                out.push_str(text);
            }
        }
    }

    /// Flush deferred bytes at end of stream, replacing what cannot be decoded.
    pub fn finish(&mut self) -> String {
        if self.remainder.is_empty() {
            return String::new();
        }
        tracing::warn!(
            deferred_bytes = self.remainder.len(),
            "stream ended inside a UTF-8 sequence"
        );
        self.replaced_sequences += 1;
        let text = String::from_utf8_lossy(&self.remainder).into_owned();
        self.remainder.clear();
        text
    }

    /// Number of bytes currently held back awaiting the rest of a codepoint.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.remainder.len()
    }

    /// Total number of invalid sequences replaced so far.
    #[must_use]
    pub fn replaced_sequences(&self) -> u64 {
        self.replaced_sequences
    }
}

/// Append the decodable prefix of `input` to `out` and return the incomplete tail.
fn decode_valid_prefix<'a>(mut input: &'a [u8], out: &mut String, replaced: &mut u64) -> &'a [u8] {
    loop {
        match std::str::from_utf8(input) {
            Ok(text) => {
                out.push_str(text);
                return &[];
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                // Safety: valid_up_to is guaranteed to be a valid UTF-8 boundary.
                let text = unsafe { std::str::from_utf8_unchecked(&input[..valid_up_to]) };
                out.push_str(text);
                match e.error_len() {
                    Some(invalid_len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        *replaced += 1;
                        input = &input[valid_up_to + invalid_len..];
                    }
                    None => return &input[valid_up_to..],
                }
            }
        }
    }
}
