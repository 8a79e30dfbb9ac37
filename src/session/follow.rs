use std::time::{Duration, Instant};

use crate::stream::RenderSnapshot;

/// Reasoning text must grow by more than this many characters in one update
/// before a new line in it triggers a follow.
const REASONING_FOLLOW_MIN_GROWTH: usize = 50;

/// Decides when the renderer should scroll to keep up with new text.
///
/// Only the follow hint is throttled; every snapshot is still delivered.
#[derive(Debug, Clone)]
pub struct FollowThrottle {
    interval: Duration,
    last_follow: Option<Instant>,
    answer: ChannelMark,
    reasoning: ChannelMark,
}

/// What one channel looked like at the previous update.
#[derive(Debug, Clone, Copy, Default)]
struct ChannelMark {
    bytes: usize,
    chars: usize,
    lines: usize,
}

/// Growth of one channel since the previous update.
#[derive(Debug, Clone, Copy, Default)]
struct Growth {
    new_lines: usize,
    new_chars: usize,
}

impl ChannelMark {
    fn advance(&mut self, text: &str) -> Growth {
        let growth = match text.get(self.bytes..) {
            Some(fresh) => Growth {
                new_lines: count_lines(fresh),
                new_chars: fresh.chars().count(),
            },
            // Not an extension of the previous text; compare totals.
            None => {
                let lines = count_lines(text);
                let chars = text.chars().count();
                let growth = Growth {
                    new_lines: lines.saturating_sub(self.lines),
                    new_chars: chars.saturating_sub(self.chars),
                };
                *self = ChannelMark {
                    bytes: text.len(),
                    chars,
                    lines,
                };
                return growth;
            }
        };
        self.bytes = text.len();
        self.chars += growth.new_chars;
        self.lines += growth.new_lines;
        growth
    }
}

impl FollowThrottle {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_follow: None,
            answer: ChannelMark::default(),
            reasoning: ChannelMark::default(),
        }
    }

    /// Observe `snapshot` at `now`; returns whether to follow.
    ///
    /// Growth is measured against the previous snapshot only.
    pub fn observe(&mut self, snapshot: &RenderSnapshot, now: Instant) -> bool {
        let answer = self.answer.advance(&snapshot.answer_text);
        let reasoning = self.reasoning.advance(&snapshot.reasoning_text);

        let answer_new_line = answer.new_lines > 0;
        let reasoning_new_line =
            reasoning.new_lines > 0 && reasoning.new_chars > REASONING_FOLLOW_MIN_GROWTH;
        if !(answer_new_line || reasoning_new_line) {
            return false;
        }
        if let Some(last) = self.last_follow {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last_follow = Some(now);
        true
    }
}

fn count_lines(text: &str) -> usize {
    memchr::memchr_iter(b'\n', text.as_bytes()).count()
}
