use smallvec::SmallVec;

use crate::protocol::chat::ChatStreamChunk;

/// Prefix every payload line carries.
pub const DATA_PREFIX: &str = "data: ";
/// Complete sentinel line closing the stream.
pub const DONE_LINE: &str = "data: [DONE]";

const MALFORMED_PREVIEW_CHARS: usize = 80;

/// Why the stream is known to be finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalSignal {
    /// `data: [DONE]`.
    DoneSentinel,
    /// `finish_reason: "stop"` on a payload.
    FinishStop,
}

/// A parsed unit of one `data:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    ContentDelta(String),
    ReasoningDelta(String),
    Terminal(TerminalSignal),
    /// The payload could not be decoded; the line is skipped.
    Malformed,
}

/// Events produced by a single line. At most a content delta, a reasoning
/// delta and a terminal signal.
pub type LineEvents = SmallVec<[StreamEvent; 3]>;

/// Parse one protocol line.
///
/// Empty lines, comments and anything not prefixed by `data: ` produce no
/// events. A payload that fails to decode yields [`StreamEvent::Malformed`];
/// this is expected whenever a JSON object straddles a chunk boundary and is
/// never an error.
#[must_use]
pub fn parse_line(line: &str) -> LineEvents {
    let mut out = LineEvents::new();
    parse_line_into(line, &mut out);
    out
}

/// Parse one protocol line, appending its events to `out`.
pub fn parse_line_into(line: &str, out: &mut LineEvents) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    if trimmed == DONE_LINE {
        out.push(StreamEvent::Terminal(TerminalSignal::DoneSentinel));
        return;
    }
    let Some(payload) = trimmed.strip_prefix(DATA_PREFIX) else {
        return;
    };

    let chunk: ChatStreamChunk = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(_) => {
            out.push(StreamEvent::Malformed);
            return;
        }
    };

    let Some(choice) = chunk.choices.into_iter().next() else {
        return;
    };
    if let Some(delta) = choice.delta {
        if let Some(content) = delta.content.filter(|text| !text.is_empty()) {
            out.push(StreamEvent::ContentDelta(content));
        }
        if let Some(reasoning) = delta.reasoning_content.filter(|text| !text.is_empty()) {
            out.push(StreamEvent::ReasoningDelta(reasoning));
        }
    }
    if choice.finish_reason.as_deref() == Some("stop") {
        out.push(StreamEvent::Terminal(TerminalSignal::FinishStop));
    }
}

/// Line parser that keeps per-session statistics and logs skipped payloads.
#[derive(Debug, Default)]
pub struct EventParser {
    lines_seen: u64,
    malformed_lines: u64,
}

impl EventParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `line`, appending events to `out`. Malformed payloads are
    /// logged at debug level and reported as a single `Malformed` event.
    pub fn parse_into(&mut self, line: &str, out: &mut LineEvents) {
        self.lines_seen += 1;
        let before = out.len();
        parse_line_into(line, out);
        if out[before..]
            .iter()
            .any(|event| matches!(event, StreamEvent::Malformed))
        {
            self.malformed_lines += 1;
            tracing::debug!(
                preview = %preview(line.trim()),
                "skipping undecodable stream payload"
            );
        }
    }

    #[must_use]
    pub fn lines_seen(&self) -> u64 {
        self.lines_seen
    }

    #[must_use]
    pub fn malformed_lines(&self) -> u64 {
        self.malformed_lines
    }
}

fn preview(line: &str) -> &str {
    match line.char_indices().nth(MALFORMED_PREVIEW_CHARS) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_and_foreign_lines_yield_nothing() {
        assert!(parse_line("").is_empty());
        assert!(parse_line("   \r").is_empty());
        assert!(parse_line(": keep-alive").is_empty());
        assert!(parse_line("event: message").is_empty());
        assert!(parse_line("data:{\"choices\":[]}").is_empty());
    }

    #[test]
    fn test_done_sentinel() {
        assert_eq!(
            parse_line("data: [DONE]\r").as_slice(),
            &[StreamEvent::Terminal(TerminalSignal::DoneSentinel)]
        );
    }

    #[test]
    fn test_content_delta() {
        let events =
            parse_line(r#"data: {"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#);
        assert_eq!(
            events.as_slice(),
            &[StreamEvent::ContentDelta("Hello".to_string())]
        );
    }

    #[test]
    fn test_reasoning_delta() {
        let events = parse_line(
            r#"data: {"choices":[{"delta":{"reasoning_content":"thinking"},"finish_reason":null}]}"#,
        );
        assert_eq!(
            events.as_slice(),
            &[StreamEvent::ReasoningDelta("thinking".to_string())]
        );
    }

    #[test]
    fn test_both_channels_and_stop_on_one_line() {
        let events = parse_line(
            r#"data: {"choices":[{"delta":{"content":"a","reasoning_content":"b"},"finish_reason":"stop"}]}"#,
        );
        assert_eq!(
            events.as_slice(),
            &[
                StreamEvent::ContentDelta("a".to_string()),
                StreamEvent::ReasoningDelta("b".to_string()),
                StreamEvent::Terminal(TerminalSignal::FinishStop),
            ]
        );
    }

    #[test]
    fn test_stop_with_empty_delta() {
        let events = parse_line(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#);
        assert_eq!(
            events.as_slice(),
            &[StreamEvent::Terminal(TerminalSignal::FinishStop)]
        );
    }

    #[test]
    fn test_other_finish_reasons_are_not_terminal() {
        let events = parse_line(r#"data: {"choices":[{"delta":{},"finish_reason":"length"}]}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let events = parse_line(r#"data: {"choices":[{"delta":{"content":"ab"#);
        assert_eq!(events.as_slice(), &[StreamEvent::Malformed]);
    }

    #[test]
    fn test_non_object_payload_is_malformed() {
        assert_eq!(parse_line("data: 42").as_slice(), &[StreamEvent::Malformed]);
        assert_eq!(
            parse_line("data: [DONE] extra").as_slice(),
            &[StreamEvent::Malformed]
        );
    }

    #[test]
    fn test_escaped_text_is_unescaped_by_json() {
        let events = parse_line(r#"data: {"choices":[{"delta":{"content":"甲子\n"}}]}"#);
        assert_eq!(
            events.as_slice(),
            &[StreamEvent::ContentDelta("甲子\n".to_string())]
        );
    }

    #[test]
    fn test_parser_counts_malformed_lines() {
        let mut parser = EventParser::new();
        let mut out = LineEvents::new();
        parser.parse_into("data: {", &mut out);
        parser.parse_into(r#"data: {"choices":[{"delta":{"content":"x"}}]}"#, &mut out);
        assert_eq!(parser.lines_seen(), 2);
        assert_eq!(parser.malformed_lines(), 1);
        assert_eq!(out.len(), 2);
    }
}
