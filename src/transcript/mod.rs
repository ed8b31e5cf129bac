//! Append-only transcript sink and conversation summary generator.
//!
//! Every entry carries an explicit idempotency key (utterance id plus a
//! monotonic counter) attached at the point of generation. Duplicate keys
//! are rejected on append, so both transcript sources can report the same
//! utterance without double-recording it.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::workers::{ChatClient, ChatMessage, WorkerResult};

/// Speaker role of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Idempotency key for one transcript message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub utterance_id: String,
    pub counter: u64,
}

impl IdempotencyKey {
    pub fn new(utterance_id: impl Into<String>, counter: u64) -> Self {
        Self {
            utterance_id: utterance_id.into(),
            counter,
        }
    }
}

/// One appended transcript message.
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: SystemTime,
    pub key: IdempotencyKey,
}

/// Append-only in-memory message sink for one session.
#[derive(Debug, Default)]
pub struct TranscriptStore {
    entries: Mutex<Vec<TranscriptEntry>>,
    seen: Mutex<HashSet<IdempotencyKey>>,
    next_counter: AtomicU64,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next message counter for building idempotency keys.
    pub fn next_counter(&self) -> u64 {
        self.next_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Append a message. Returns `false` when the key was already recorded
    /// and the message was ignored.
    pub async fn append(&self, role: Role, content: impl Into<String>, key: IdempotencyKey) -> bool {
        if !self.seen.lock().await.insert(key.clone()) {
            debug!(utterance_id = %key.utterance_id, counter = key.counter, "duplicate transcript message ignored");
            return false;
        }

        self.entries.lock().await.push(TranscriptEntry {
            role,
            content: content.into(),
            timestamp: SystemTime::now(),
            key,
        });
        true
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Snapshot all entries in append order.
    pub async fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries.lock().await.clone()
    }

    /// Render the history as chat messages for the language model.
    pub async fn as_chat_messages(&self) -> Vec<ChatMessage> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|entry| ChatMessage {
                role: entry.role.to_string(),
                content: entry.content.clone(),
            })
            .collect()
    }

    /// Generate a conversation summary from the sink via the chat worker.
    pub async fn summarize(&self, chat: &ChatClient) -> WorkerResult<String> {
        let mut messages = vec![ChatMessage::system(
            "Summarize the following conversation in a few sentences. \
             Mention any reported symptoms, suspected triggers, and outcomes.",
        )];
        messages.extend(self.as_chat_messages().await);
        chat.complete(&messages).await
    }
}
