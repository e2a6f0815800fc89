use unicode_segmentation::UnicodeSegmentation;

use crate::models::{ChatMessage, Thread};

const CHARS_PER_TOKEN: usize = 4;

/// Approximate context-size estimator (graphemes / 4, rounded up)
pub struct TokenCounter;

impl TokenCounter {
    pub fn count_text(text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        text.graphemes(true).count().div_ceil(CHARS_PER_TOKEN)
    }

    pub fn count_message(message: &ChatMessage) -> usize {
        Self::count_text(&message.content)
            + message.tool_name.as_deref().map_or(0, Self::count_text)
            + message.tool_result.as_deref().map_or(0, Self::count_text)
    }

    pub fn count_messages(messages: &[ChatMessage]) -> usize {
        messages.iter().map(Self::count_message).sum()
    }

    pub fn count_thread(thread: &Thread) -> usize {
        Self::count_messages(thread.messages())
    }

    /// Longest prefix of `text` whose estimate stays within `max_tokens`
    pub fn truncate_to(text: &str, max_tokens: usize) -> &str {
        let max_graphemes = max_tokens.saturating_mul(CHARS_PER_TOKEN);
        match text.grapheme_indices(true).nth(max_graphemes) {
            Some((idx, _)) => &text[..idx],
            None => text,
        }
    }
}
