//! Incremental decoding of a streamed chat completion.
//!
//! Transport chunk → [`ByteTextDecoder`] → [`FrameSplitter`] → [`EventParser`]
//! → [`ChannelAccumulator`]. Every stage is synchronous and keeps only the
//! state needed to bridge chunk boundaries.

pub mod accumulator;
pub mod decoder;
pub mod event;
pub mod splitter;

pub use accumulator::{
    normalize_delta, Applied, ChannelAccumulator, ChannelBuffers, DeltaBatch, RenderSnapshot,
};
pub use decoder::{ByteTextDecoder, RawChunk};
pub use event::{parse_line, EventParser, LineEvents, StreamEvent, TerminalSignal};
pub use splitter::FrameSplitter;

/// The decode → split → parse stages for one stream.
///
/// Owns the carry-over state of each stage; feed it chunks strictly in
/// arrival order.
#[derive(Debug, Default)]
pub struct ChunkPipeline {
    decoder: ByteTextDecoder,
    splitter: FrameSplitter,
    parser: EventParser,
    text: String,
    lines: Vec<String>,
    events: LineEvents,
}

impl ChunkPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one chunk through every stage and collect its deltas into `batch`.
    pub fn process(&mut self, chunk: &RawChunk, batch: &mut DeltaBatch) {
        self.text.clear();
        self.decoder.decode_chunk_into(chunk, &mut self.text);
        self.lines.clear();
        self.splitter.feed_into(&self.text, &mut self.lines);
        self.parse_lines(batch);
    }

    /// Flush the decoder and the pending line at end of stream.
    pub fn finish(&mut self, batch: &mut DeltaBatch) {
        self.text.clear();
        self.text.push_str(&self.decoder.finish());
        self.lines.clear();
        self.splitter.feed_into(&self.text, &mut self.lines);
        if let Some(last) = self.splitter.finish() {
            self.lines.push(last);
        }
        self.parse_lines(batch);
    }

    fn parse_lines(&mut self, batch: &mut DeltaBatch) {
        for line in self.lines.drain(..) {
            self.events.clear();
            self.parser.parse_into(&line, &mut self.events);
            for event in self.events.drain(..) {
                batch.push_event(event);
            }
        }
    }

    #[must_use]
    pub fn parser(&self) -> &EventParser {
        &self.parser
    }

    #[must_use]
    pub fn pending_line(&self) -> &str {
        self.splitter.pending()
    }

    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.decoder.pending_bytes()
    }
}
