use memchr::{memchr, memchr_iter};

/// Splits decoded text into `\n`-terminated lines.
///
/// Feed it text chunks with arbitrary boundaries; the trailing segment that
/// has not seen a terminator yet is kept as the pending line and prefixed to
/// the next chunk. Lines are emitted verbatim (a trailing `\r` is left for
/// the event parser to trim).
#[derive(Debug, Default)]
pub struct FrameSplitter {
    pending: String,
}

impl FrameSplitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed text and return the complete lines it finished.
    pub fn feed(&mut self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.feed_into(text, &mut out);
        out
    }

    /// Feed text and append complete lines into a caller-provided buffer.
    pub fn feed_into(&mut self, text: &str, out: &mut Vec<String>) {
        let bytes = text.as_bytes();
        if memchr(b'\n', bytes).is_none() {
            self.pending.push_str(text);
            return;
        }

        let mut line_start = 0usize;
        for line_end in memchr_iter(b'\n', bytes) {
            let segment = &text[line_start..line_end];
            if self.pending.is_empty() {
                out.push(segment.to_owned());
            } else {
                let mut line = std::mem::take(&mut self.pending);
                line.push_str(segment);
                out.push(line);
            }
            line_start = line_end + 1;
        }
        self.pending.push_str(&text[line_start..]);
    }

    /// Take the unterminated trailing line at end of stream, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }

    #[must_use]
    pub fn pending(&self) -> &str {
        &self.pending
    }
}
