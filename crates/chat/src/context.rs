//! Context assembly for one model call.
//!
//! The prompt is laid out as:
//!
//! 1. **System prompt** — always first
//! 2. **Summary** — a second system entry, only for long sessions
//! 3. **Recent window** — the newest messages, oldest first
//! 4. **Current input** — the user's new message
//!
//! Summarization covers exactly the messages older than the recent window,
//! so the two never overlap. Every lookup here degrades instead of failing:
//! a broken count, summary or history read shrinks the prompt, it never
//! blocks the reply.

use chatline_config::ContextConfig;
use chatline_core::message::{Message, Role};
use chatline_core::model::{ChatModel, ChatTurn};
use chatline_storage::MessageRepository;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ContextAssembler {
    history: Arc<MessageRepository>,
    summarizer: Arc<dyn ChatModel>,
    config: ContextConfig,
}

impl ContextAssembler {
    pub fn new(history: Arc<MessageRepository>, summarizer: Arc<dyn ChatModel>, config: ContextConfig) -> Self {
        Self {
            history,
            summarizer,
            config,
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Build the prompt for answering `input` in `session_id`.
    ///
    /// `input` may already be recorded as the session's newest message; it is
    /// then not counted as history and appears only once, last.
    pub async fn build_context(&self, session_id: i64, input: &str) -> Vec<ChatTurn> {
        let total = match self.history.count_by_session(session_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(session_id, error = %e, "Message count failed, assuming empty history");
                0
            }
        };

        let mut recent = match self.history.find_recent(session_id, self.config.window + 1).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(session_id, error = %e, "Recent history unavailable, answering from input only");
                Vec::new()
            }
        };
        let input_recorded = ends_with_input(&recent, input);
        if input_recorded {
            recent.pop();
        }
        let skip = recent.len().saturating_sub(self.config.window);
        recent.drain(..skip);
        let history_len = if input_recorded { total.saturating_sub(1) } else { total };

        let mut turns = vec![ChatTurn::system(self.config.system_prompt.clone())];
        if history_len > self.config.threshold {
            if let Some(summary) = self.summarize_older(session_id, input).await {
                turns.push(ChatTurn::system(format!("{}{}", self.config.summary_label, summary)));
            }
        }
        turns.extend(recent.iter().map(ChatTurn::from));
        turns.push(ChatTurn::user(input));
        debug!(session_id, history_len, turns = turns.len(), "Context assembled");
        turns
    }

    /// Summary of everything older than the newest `threshold` messages of
    /// history, the pending input excluded.
    async fn summarize_older(&self, session_id: i64, input: &str) -> Option<String> {
        let mut all = match self.history.find_by_session(session_id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(session_id, error = %e, "History unavailable, skipping summary");
                return None;
            }
        };
        if ends_with_input(&all, input) {
            all.pop();
        }
        if all.len() <= self.config.threshold {
            return None;
        }

        let older: Vec<ChatTurn> = all[..all.len() - self.config.threshold]
            .iter()
            .map(ChatTurn::from)
            .collect();
        debug!(session_id, count = older.len(), "Summarizing older messages");

        match tokio::time::timeout(self.config.summary_timeout(), self.summarizer.summarize(&older)).await {
            Ok(Ok(summary)) if !summary.trim().is_empty() => Some(summary),
            Ok(Ok(_)) => {
                warn!(session_id, "Model returned an empty summary");
                None
            }
            Ok(Err(e)) => {
                warn!(session_id, error = %e, "Summarization failed");
                None
            }
            Err(_) => {
                warn!(
                    session_id,
                    timeout_ms = self.config.summary_timeout_ms,
                    "Summarization timed out"
                );
                None
            }
        }
    }
}

/// Whether the newest message is the user input being answered.
fn ends_with_input(messages: &[Message], input: &str) -> bool {
    messages
        .last()
        .is_some_and(|m| m.role == Role::User && m.content == input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedModel, memory_repository};
    use chatline_core::store::MessageStore;
    use chrono::DateTime;
    use std::time::Duration;

    async fn seed(store: &dyn MessageStore, session_id: i64, n: i64) {
        for i in 0..n {
            let mut m = if i % 2 == 0 {
                Message::user(session_id, format!("q{i}"))
            } else {
                Message::assistant(session_id, format!("a{i}"))
            };
            m.created_at = DateTime::from_timestamp_millis(1_700_000_000_000 + i).unwrap();
            store.insert(&m).await.unwrap();
        }
    }

    #[tokio::test]
    async fn short_history_skips_summary() {
        let (store, repo) = memory_repository();
        seed(store.as_ref(), 1, 4).await;
        let model = Arc::new(ScriptedModel::new("ok"));
        let assembler = ContextAssembler::new(repo, model.clone(), ContextConfig::default());

        let turns = assembler.build_context(1, "next?").await;
        assert_eq!(turns.len(), 1 + 4 + 1);
        assert_eq!(turns[0].role, Role::System);
        assert_eq!(turns[1].content, "q0");
        assert_eq!(turns.last().unwrap().content, "next?");
        assert_eq!(model.summary_calls(), 0);
    }

    #[tokio::test]
    async fn long_history_summarizes_only_older_messages() {
        let (store, repo) = memory_repository();
        seed(store.as_ref(), 1, 25).await;
        let model = Arc::new(ScriptedModel::new("ok").with_summary("earlier: greetings"));
        let assembler = ContextAssembler::new(repo, model.clone(), ContextConfig::default());

        let turns = assembler.build_context(1, "and now?").await;
        assert_eq!(turns.len(), 23);
        assert_eq!(turns[1].role, Role::System);
        assert_eq!(turns[1].content, "Conversation summary: earlier: greetings");
        // Recent window: q5 .. a24
        assert_eq!(turns[2].content, "a5");
        assert_eq!(turns[21].content, "q24");

        assert_eq!(model.summary_calls(), 1);
        let summarized = model.summarized.lock().unwrap()[0].clone();
        let contents: Vec<&str> = summarized.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, ["q0", "a1", "q2", "a3", "q4"]);
    }

    #[tokio::test]
    async fn exactly_threshold_messages_does_not_summarize() {
        let (store, repo) = memory_repository();
        seed(store.as_ref(), 1, 20).await;
        let model = Arc::new(ScriptedModel::new("ok"));
        let assembler = ContextAssembler::new(repo, model.clone(), ContextConfig::default());
        let turns = assembler.build_context(1, "hi").await;
        assert_eq!(turns.len(), 22);
        assert_eq!(model.summary_calls(), 0);
    }

    #[tokio::test]
    async fn cached_current_input_is_not_repeated() {
        let (_store, repo) = memory_repository();
        repo.append_to_cache(&Message::user(1, "hello there")).await.unwrap();
        let model = Arc::new(ScriptedModel::new("ok"));
        let assembler = ContextAssembler::new(repo, model, ContextConfig::default());

        let turns = assembler.build_context(1, "hello there").await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1], ChatTurn::user("hello there"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_summary_is_dropped_after_timeout() {
        let (store, repo) = memory_repository();
        seed(store.as_ref(), 1, 30).await;
        let model = Arc::new(ScriptedModel::new("ok").with_summary_delay(Duration::from_secs(60)));
        let config = ContextConfig {
            summary_timeout_ms: 1_000,
            ..ContextConfig::default()
        };
        let assembler = ContextAssembler::new(repo, model.clone(), config);

        let turns = assembler.build_context(1, "still there?").await;
        assert_eq!(model.summary_calls(), 1);
        assert_eq!(turns.len(), 1 + 20 + 1);
        assert!(turns[1..].iter().all(|t| t.role != Role::System));
    }

    #[tokio::test]
    async fn unavailable_history_degrades_to_input_only() {
        let (store, repo) = memory_repository();
        store.set_offline(true);
        let model = Arc::new(ScriptedModel::new("ok"));
        let assembler = ContextAssembler::new(repo, model, ContextConfig::default());

        let turns = assembler.build_context(9, "anyone?").await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].content, "anyone?");
    }
}
