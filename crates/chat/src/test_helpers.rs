//! Shared test helpers for chat tests.

use async_trait::async_trait;
use chatline_cache::{InMemoryListStore, MessageCache};
use chatline_config::CacheConfig;
use chatline_core::error::ModelError;
use chatline_core::model::{ChatModel, ChatTurn, DeltaReceiver};
use chatline_storage::{InMemoryStore, MessageRepository};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// A model with a fixed reply, streamed word by word.
///
/// Records every prompt it receives and every batch it is asked to summarize.
pub struct ScriptedModel {
    reply: String,
    summary: String,
    fail_stream: bool,
    fail_mid_stream: bool,
    summary_delay: Option<Duration>,
    pub prompts: Mutex<Vec<Vec<ChatTurn>>>,
    pub summarized: Mutex<Vec<Vec<ChatTurn>>>,
}

impl ScriptedModel {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.into(),
            summary: "they talked about Rust".into(),
            fail_stream: false,
            fail_mid_stream: false,
            summary_delay: None,
            prompts: Mutex::new(Vec::new()),
            summarized: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_stream: true,
            ..Self::new("")
        }
    }

    pub fn failing_mid_stream(reply: &str) -> Self {
        Self {
            fail_mid_stream: true,
            ..Self::new(reply)
        }
    }

    pub fn with_summary(mut self, summary: &str) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_summary_delay(mut self, delay: Duration) -> Self {
        self.summary_delay = Some(delay);
        self
    }

    pub fn summary_calls(&self) -> usize {
        self.summarized.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, turns: &[ChatTurn]) -> Result<String, ModelError> {
        self.prompts.lock().unwrap().push(turns.to_vec());
        if self.fail_stream {
            return Err(ModelError::Network("connection refused".into()));
        }
        Ok(self.reply.clone())
    }

    async fn stream_chat(&self, turns: &[ChatTurn]) -> Result<DeltaReceiver, ModelError> {
        self.prompts.lock().unwrap().push(turns.to_vec());
        if self.fail_stream {
            return Err(ModelError::Network("connection refused".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        let words: Vec<String> = self
            .reply
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        let fail = self.fail_mid_stream;
        tokio::spawn(async move {
            for word in words {
                if tx.send(Ok(word)).await.is_err() {
                    return;
                }
                if fail {
                    let _ = tx
                        .send(Err(ModelError::StreamInterrupted("reset by peer".into())))
                        .await;
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn summarize(&self, turns: &[ChatTurn]) -> Result<String, ModelError> {
        self.summarized.lock().unwrap().push(turns.to_vec());
        if let Some(delay) = self.summary_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.summary.clone())
    }
}

pub fn memory_repository() -> (Arc<InMemoryStore>, Arc<MessageRepository>) {
    let store = Arc::new(InMemoryStore::new());
    let cache = Arc::new(MessageCache::new(
        Arc::new(InMemoryListStore::new()),
        &CacheConfig::default(),
    ));
    let repo = Arc::new(MessageRepository::new(store.clone(), cache));
    (store, repo)
}
