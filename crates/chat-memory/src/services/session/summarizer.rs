use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::token_counter::TokenCounter;
use crate::models::{ChatMessage, Role, Thread};
use crate::utils::{SessionError, SessionResult};

/// Messages longer than this are cut in the summarization prompt
const PROMPT_MESSAGE_CHARS: usize = 1000;

const SUMMARY_HEADER: &str = "[CONVERSATION SUMMARY]\n";
const SUMMARY_FOOTER: &str = "\n[END SUMMARY]";

/// Text completion collaborator used to condense history
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], max_tokens: usize) -> Result<String>;
}

/// Result of a successful compaction
#[derive(Debug, Clone)]
pub struct Summarization {
    pub thread: Thread,
    pub summary: String,
    pub summarized_messages: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

pub struct Summarizer {
    provider: Arc<dyn CompletionProvider>,
    timeout: Duration,
}

impl Summarizer {
    pub fn new(provider: Arc<dyn CompletionProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub fn needs_summarization(thread: &Thread, max_tokens: usize) -> bool {
        TokenCounter::count_thread(thread) > max_tokens
    }

    /// Collapse everything but the last `keep_recent` messages into one
    /// system message.
    ///
    /// Returns `Ok(None)` when there is nothing worth condensing. The input
    /// thread is never modified; on failure the caller keeps using it.
    pub async fn summarize(
        &self,
        thread: &Thread,
        target_tokens: usize,
        keep_recent: usize,
    ) -> SessionResult<Option<Summarization>> {
        let messages = thread.messages();
        if messages.len() <= keep_recent {
            debug!("Not enough messages to summarize ({})", messages.len());
            return Ok(None);
        }

        let (older, recent) = messages.split_at(messages.len() - keep_recent);
        let older_tokens = TokenCounter::count_messages(older);
        let recent_tokens = TokenCounter::count_messages(recent);
        let tokens_before = older_tokens + recent_tokens;

        // The summary must weigh less than what it replaces, and should bring
        // the thread under target when the recent tail allows it.
        let ceiling = older_tokens.saturating_sub(1);
        let allowance = if recent_tokens < target_tokens {
            (target_tokens - recent_tokens).min(ceiling)
        } else {
            ceiling
        };
        if allowance == 0 {
            debug!("Older segment too small to condense ({} tokens)", older_tokens);
            return Ok(None);
        }

        let prompt = build_prompt(older, allowance);
        let raw = match tokio::time::timeout(self.timeout, self.provider.complete(&prompt, allowance))
            .await
        {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!("Summary generation failed: {}", e);
                return Err(SessionError::Summarization(e.to_string()));
            }
            Err(_) => {
                warn!("Summary generation timed out after {:?}", self.timeout);
                return Err(SessionError::Summarization(format!(
                    "completion timed out after {:?}",
                    self.timeout
                )));
            }
        };

        let summary = raw.trim();
        if summary.is_empty() {
            return Err(SessionError::Summarization("empty summary".into()));
        }

        let content = fit_summary(summary, allowance);
        let mut compacted = Vec::with_capacity(recent.len() + 1);
        compacted.push(ChatMessage::system(content));
        compacted.extend_from_slice(recent);
        let thread = Thread::from_messages(compacted);
        let tokens_after = TokenCounter::count_thread(&thread);

        info!(
            "Summarized {} messages ({} -> {} tokens, kept {})",
            older.len(),
            tokens_before,
            tokens_after,
            recent.len()
        );

        Ok(Some(Summarization {
            thread,
            summary: summary.to_string(),
            summarized_messages: older.len(),
            tokens_before,
            tokens_after,
        }))
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "SYSTEM",
        Role::User => "USER",
        Role::Assistant => "ASSISTANT",
        Role::Tool => "TOOL",
    }
}

fn format_history(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|msg| {
            let mut content: String = msg.content.chars().take(PROMPT_MESSAGE_CHARS).collect();
            if msg.content.chars().nth(PROMPT_MESSAGE_CHARS).is_some() {
                content.push_str("...[truncated]");
            }
            match &msg.tool_name {
                Some(tool) => format!("{} ({}): {}", role_label(msg.role), tool, content),
                None => format!("{}: {}", role_label(msg.role), content),
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn build_prompt(older: &[ChatMessage], target_tokens: usize) -> Vec<ChatMessage> {
    let instructions = format!(
        "You condense conversations. Provide a concise summary of the conversation below.\n\
         Focus on:\n\
         1. Key topics discussed\n\
         2. Important decisions or conclusions\n\
         3. Action items or pending questions\n\
         4. Facts about the user needed to continue the conversation\n\n\
         Keep the summary under {} tokens. Output only the summary.",
        target_tokens
    );
    vec![
        ChatMessage::system(instructions),
        ChatMessage::user(format!("CONVERSATION:\n{}\n\nSUMMARY:", format_history(older))),
    ]
}

/// Wrap and cut the summary so its estimate never exceeds `allowance`
fn fit_summary(summary: &str, allowance: usize) -> String {
    let framing = TokenCounter::count_text(SUMMARY_HEADER) + TokenCounter::count_text(SUMMARY_FOOTER);
    if allowance > framing {
        let body = TokenCounter::truncate_to(summary, allowance - framing);
        format!("{}{}{}", SUMMARY_HEADER, body, SUMMARY_FOOTER)
    } else {
        TokenCounter::truncate_to(summary, allowance).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_thread(count: usize) -> Thread {
        Thread::from_messages(
            (0..count)
                .map(|i| {
                    if i % 2 == 0 {
                        ChatMessage::user(format!("question {} {}", i, "x".repeat(200)))
                    } else {
                        ChatMessage::assistant(format!("answer {} {}", i, "y".repeat(200)))
                    }
                })
                .collect(),
        )
    }

    fn summarizer(mock: MockCompletionProvider) -> Summarizer {
        Summarizer::new(Arc::new(mock), Duration::from_secs(5))
    }

    #[test]
    fn test_needs_summarization_threshold() {
        let thread = long_thread(10);
        let tokens = TokenCounter::count_thread(&thread);
        assert!(Summarizer::needs_summarization(&thread, tokens - 1));
        assert!(!Summarizer::needs_summarization(&thread, tokens));
    }

    #[tokio::test]
    async fn test_summary_replaces_older_and_keeps_recent() {
        let mut mock = MockCompletionProvider::new();
        mock.expect_complete()
            .times(1)
            .returning(|_, _| Ok("User asked ten questions.".to_string()));

        let thread = long_thread(12);
        let outcome = summarizer(mock)
            .summarize(&thread, 400, 5)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.thread.len(), 6);
        assert_eq!(outcome.thread.messages()[0].role, Role::System);
        assert!(outcome.thread.messages()[0]
            .content
            .contains("User asked ten questions."));
        assert_eq!(&outcome.thread.messages()[1..], &thread.messages()[7..]);
        assert_eq!(outcome.summarized_messages, 7);
        assert!(outcome.tokens_after < outcome.tokens_before);
        assert!(outcome.tokens_after <= 400);
    }

    #[tokio::test]
    async fn test_verbose_summary_is_cut_to_budget() {
        let mut mock = MockCompletionProvider::new();
        mock.expect_complete()
            .returning(|_, _| Ok("blah ".repeat(5000)));

        let thread = long_thread(12);
        let outcome = summarizer(mock)
            .summarize(&thread, 350, 5)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.tokens_after <= 350);
        assert!(outcome.tokens_after < TokenCounter::count_thread(&thread));
    }

    #[tokio::test]
    async fn test_recent_tail_above_target_still_shrinks() {
        let mut mock = MockCompletionProvider::new();
        mock.expect_complete()
            .returning(|_, _| Ok("z".repeat(10_000)));

        let thread = long_thread(12);
        let before = TokenCounter::count_thread(&thread);
        let outcome = summarizer(mock)
            .summarize(&thread, 10, 5)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.tokens_after < before);
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_thread_untouched() {
        let mut mock = MockCompletionProvider::new();
        mock.expect_complete()
            .returning(|_, _| Err(anyhow::anyhow!("model overloaded")));

        let thread = long_thread(12);
        let snapshot = thread.clone();
        let err = summarizer(mock).summarize(&thread, 400, 5).await.unwrap_err();
        assert!(matches!(err, SessionError::Summarization(_)));
        assert_eq!(thread, snapshot);
    }

    #[tokio::test]
    async fn test_empty_completion_is_an_error() {
        let mut mock = MockCompletionProvider::new();
        mock.expect_complete().returning(|_, _| Ok("   ".to_string()));

        let err = summarizer(mock)
            .summarize(&long_thread(12), 400, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Summarization(_)));
    }

    #[tokio::test]
    async fn test_nothing_older_is_noop() {
        let mut mock = MockCompletionProvider::new();
        mock.expect_complete().never();

        let outcome = summarizer(mock)
            .summarize(&long_thread(5), 10, 5)
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn test_prompt_truncates_long_messages() {
        let older = vec![ChatMessage::user("a".repeat(5000))];
        let prompt = build_prompt(&older, 100);
        assert_eq!(prompt.len(), 2);
        assert!(prompt[1].content.contains("...[truncated]"));
        assert!(prompt[1].content.len() < 1200);
    }
}
