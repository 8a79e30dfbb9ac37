use std::borrow::Cow;

use memchr::memchr2;
use serde::Serialize;

use super::event::StreamEvent;

/// Deltas collected from every line of one transport chunk.
///
/// Applied to [`ChannelBuffers`] in one step so a renderer never sees half of
/// a chunk. Once a terminal signal has been recorded, later deltas in the same
/// batch are dropped.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeltaBatch {
    content: String,
    reasoning: String,
    terminal: bool,
    malformed: u32,
}

impl DeltaBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&mut self, event: StreamEvent) {
        if self.terminal {
            return;
        }
        match event {
            StreamEvent::ContentDelta(text) => self.content.push_str(&text),
            StreamEvent::ReasoningDelta(text) => self.reasoning.push_str(&text),
            StreamEvent::Terminal(_) => self.terminal = true,
            StreamEvent::Malformed => self.malformed += 1,
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    #[must_use]
    pub fn malformed(&self) -> u32 {
        self.malformed
    }

    /// True when the batch would change neither buffer nor completion.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.reasoning.is_empty() && !self.terminal
    }

    pub fn clear(&mut self) {
        self.content.clear();
        self.reasoning.clear();
        self.terminal = false;
        self.malformed = 0;
    }
}

/// The two accumulated channels plus the completion flag.
///
/// Read access is public; only [`ChannelAccumulator`] mutates.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChannelBuffers {
    reasoning: String,
    answer: String,
    completed: bool,
}

impl ChannelBuffers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    #[must_use]
    pub fn answer(&self) -> &str {
        &self.answer
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    #[must_use]
    pub fn snapshot(&self) -> RenderSnapshot {
        RenderSnapshot {
            answer_text: self.answer.clone(),
            reasoning_text: self.reasoning.clone(),
            is_complete: self.completed,
            has_reasoning_channel: !self.reasoning.is_empty(),
        }
    }
}

/// What the renderer receives after every processed chunk.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderSnapshot {
    pub answer_text: String,
    pub reasoning_text: String,
    pub is_complete: bool,
    pub has_reasoning_channel: bool,
}

/// Result of applying one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    pub answer_appended: usize,
    pub reasoning_appended: usize,
    pub completed_now: bool,
}

impl Applied {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.answer_appended > 0 || self.reasoning_appended > 0 || self.completed_now
    }
}

/// Routes batched deltas into [`ChannelBuffers`].
pub struct ChannelAccumulator;

impl ChannelAccumulator {
    /// Apply `batch` to `buffers`.
    ///
    /// Returns `None` when the buffers are already complete; completed buffers
    /// never change again.
    pub fn apply(buffers: &mut ChannelBuffers, batch: &DeltaBatch) -> Option<Applied> {
        if buffers.completed {
            return None;
        }
        let mut applied = Applied::default();
        if !batch.content.is_empty() {
            let text = normalize_delta(&batch.content);
            buffers.answer.push_str(&text);
            applied.answer_appended = text.len();
        }
        if !batch.reasoning.is_empty() {
            let text = normalize_delta(&batch.reasoning);
            buffers.reasoning.push_str(&text);
            applied.reasoning_appended = text.len();
        }
        if batch.terminal {
            buffers.completed = true;
            applied.completed_now = true;
        }
        Some(applied)
    }
}

/// Turn literal `\n` escapes and `\r\n` pairs in incoming delta text into `\n`.
#[must_use]
pub fn normalize_delta(text: &str) -> Cow<'_, str> {
    if memchr2(b'\\', b'\r', text.as_bytes()).is_none() {
        return Cow::Borrowed(text);
    }
    Cow::Owned(text.replace("\\n", "\n").replace("\r\n", "\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::event::TerminalSignal;

    fn batch(events: Vec<StreamEvent>) -> DeltaBatch {
        let mut batch = DeltaBatch::new();
        for event in events {
            batch.push_event(event);
        }
        batch
    }

    #[test]
    fn test_normalize_delta() {
        assert!(matches!(normalize_delta("plain"), Cow::Borrowed("plain")));
        assert_eq!(normalize_delta("a\\nb"), "a\nb");
        assert_eq!(normalize_delta("a\r\nb\r\n"), "a\nb\n");
        assert_eq!(normalize_delta("lone\rcr"), "lone\rcr");
    }

    #[test]
    fn test_channel_isolation() {
        let mut buffers = ChannelBuffers::new();
        ChannelAccumulator::apply(
            &mut buffers,
            &batch(vec![StreamEvent::ReasoningDelta("think".into())]),
        );
        assert_eq!(buffers.answer(), "");
        assert_eq!(buffers.reasoning(), "think");

        ChannelAccumulator::apply(
            &mut buffers,
            &batch(vec![StreamEvent::ContentDelta("answer".into())]),
        );
        assert_eq!(buffers.reasoning(), "think");
        assert_eq!(buffers.answer(), "answer");
    }

    #[test]
    fn test_marker_text_does_not_switch_channels() {
        let mut buffers = ChannelBuffers::new();
        ChannelAccumulator::apply(
            &mut buffers,
            &batch(vec![StreamEvent::ContentDelta("思考过程：先看日主".into())]),
        );
        assert_eq!(buffers.answer(), "思考过程：先看日主");
        assert!(!buffers.snapshot().has_reasoning_channel);
    }

    #[test]
    fn test_normalization_only_touches_incoming_text() {
        let mut buffers = ChannelBuffers::new();
        ChannelAccumulator::apply(
            &mut buffers,
            &batch(vec![StreamEvent::ContentDelta("ends with \\".into())]),
        );
        ChannelAccumulator::apply(
            &mut buffers,
            &batch(vec![StreamEvent::ContentDelta("n next".into())]),
        );
        assert_eq!(buffers.answer(), "ends with \\n next");
    }

    #[test]
    fn test_terminal_is_one_way() {
        let mut buffers = ChannelBuffers::new();
        let applied = ChannelAccumulator::apply(
            &mut buffers,
            &batch(vec![
                StreamEvent::ContentDelta("last".into()),
                StreamEvent::Terminal(TerminalSignal::FinishStop),
            ]),
        )
        .expect("applied");
        assert!(applied.completed_now);
        assert_eq!(applied.answer_appended, 4);

        let again = ChannelAccumulator::apply(
            &mut buffers,
            &batch(vec![
                StreamEvent::ContentDelta("more".into()),
                StreamEvent::Terminal(TerminalSignal::DoneSentinel),
            ]),
        );
        assert!(again.is_none());
        assert_eq!(buffers.answer(), "last");
        assert!(buffers.is_completed());
    }

    #[test]
    fn test_deltas_after_terminal_in_same_batch_dropped() {
        let b = batch(vec![
            StreamEvent::Terminal(TerminalSignal::DoneSentinel),
            StreamEvent::ContentDelta("late".into()),
        ]);
        assert!(b.is_terminal());
        assert_eq!(b.content(), "");
    }

    #[test]
    fn test_malformed_is_counted_not_applied() {
        let b = batch(vec![StreamEvent::Malformed, StreamEvent::Malformed]);
        assert!(b.is_empty());
        assert_eq!(b.malformed(), 2);
        let mut buffers = ChannelBuffers::new();
        let applied = ChannelAccumulator::apply(&mut buffers, &b).expect("applied");
        assert!(!applied.changed());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let mut buffers = ChannelBuffers::new();
        ChannelAccumulator::apply(
            &mut buffers,
            &batch(vec![StreamEvent::ReasoningDelta("r".into())]),
        );
        let value = serde_json::to_value(buffers.snapshot()).expect("serialize");
        assert_eq!(value["answerText"], "");
        assert_eq!(value["reasoningText"], "r");
        assert_eq!(value["isComplete"], false);
        assert_eq!(value["hasReasoningChannel"], true);
    }
}
