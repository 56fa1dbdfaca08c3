//! Running summary of the conversation.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::StreamError;
use crate::llm::{CONTEXT_LINES, TextGenerator, render_history, sanitize_response};
use crate::retry::{RetryPolicy, retry};
use crate::turn::HistoryEntry;

const SUMMARY_SYSTEM: &str = "You condense a live discussion for the people taking part in it.";

/// True when `turn_count` lands on the summary interval; `every_n <= 0` disables.
pub fn should_summarize(turn_count: usize, every_n: i64) -> bool {
    every_n > 0 && (turn_count as u64) % (every_n as u64) == 0
}

pub struct Summarizer {
    llm: Arc<dyn TextGenerator>,
    model: String,
    every_n: i64,
    policy: RetryPolicy,
}

impl Summarizer {
    pub fn new(llm: Arc<dyn TextGenerator>, model: impl Into<String>, every_n: i64, policy: RetryPolicy) -> Self {
        Self {
            llm,
            model: model.into(),
            every_n,
            policy,
        }
    }

    pub fn should_summarize(&self, turn_count: usize) -> bool {
        should_summarize(turn_count, self.every_n)
    }

    /// A replacement summary for `previous` given the latest history.
    pub async fn summarize(&self, previous: &str, history: &[HistoryEntry]) -> Result<String, StreamError> {
        let prompt = build_summary_prompt(previous, history);
        let (llm, model, prompt) = (&self.llm, self.model.as_str(), prompt.as_str());

        let summary = retry(&self.policy, "summarize", move || async move {
            let text = sanitize_response(&llm.complete(model, SUMMARY_SYSTEM, prompt).await?);
            if text.is_empty() {
                return Err(StreamError::GenerationError("empty summary".to_string()));
            }
            Ok(text)
        })
        .await;

        match &summary {
            Ok(text) => info!(target: "summary", chars = text.len(), "running summary refreshed"),
            Err(err) => warn!(target: "summary", error = %err, "summary failed, keeping previous"),
        }
        summary
    }
}

pub fn build_summary_prompt(previous: &str, history: &[HistoryEntry]) -> String {
    let previous = if previous.is_empty() { "(empty)" } else { previous };
    format!(
        "Condense the conversation into 2-4 sentences.\n\
         Rules:\n\
         - Only rephrase what has already been said; do NOT introduce new facts.\n\
         - If hypotheses or doubts were raised, mark them as such.\n\
         - No links.\n\n\
         Current summary:\n{}\n\n\
         Latest lines:\n{}",
        previous,
        render_history(history, CONTEXT_LINES)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockTextGenerator;
    use crate::participant::Speaker;

    #[test]
    fn test_should_summarize_interval() {
        assert!(should_summarize(6, 6));
        assert!(should_summarize(12, 6));
        assert!(!should_summarize(7, 6));
        assert!(!should_summarize(6, 0));
        assert!(!should_summarize(6, -3));
    }

    #[test]
    fn test_prompt_forbids_new_facts() {
        let history = vec![HistoryEntry::new(Speaker::A, "Halos are real.")];
        let prompt = build_summary_prompt("", &history);
        assert!(prompt.contains("do NOT introduce new facts"));
        assert!(prompt.contains("Current summary:\n(empty)"));
        assert!(prompt.contains("A: Halos are real."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_summarize_returns_new_text() {
        let mut llm = MockTextGenerator::new();
        llm.expect_complete()
            .times(1)
            .returning(|model, _, prompt| {
                assert_eq!(model, "sum");
                assert!(prompt.contains("old summary"));
                Ok("A new summary.".to_string())
            });
        let summarizer = Summarizer::new(Arc::new(llm), "sum", 6, RetryPolicy::default());
        let out = summarizer.summarize("old summary", &[]).await.unwrap();
        assert_eq!(out, "A new summary.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_summarize_failure_is_error() {
        let mut llm = MockTextGenerator::new();
        llm.expect_complete()
            .times(2)
            .returning(|_, _, _| Err(StreamError::Timeout("summary".to_string())));
        let summarizer = Summarizer::new(Arc::new(llm), "sum", 6, RetryPolicy::new(2, 0.1, 1.0));
        assert!(summarizer.summarize("keep", &[]).await.is_err());
    }
}
