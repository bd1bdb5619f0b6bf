//! Where resolved records and unresolved items end up.
//!
//! Storage and queues are capabilities ([`RecordStore`], [`MessageQueue`]) so the worker can be
//! wired to real backends, the file-backed adapters, or in-memory fakes. The two sinks on top of
//! them never fail: every error is logged and reported back as a flag.

use async_trait::async_trait;
use std::{fmt::Debug, sync::Arc};
use tracing::{error, info, warn};

use crate::model::WeatherRecord;

pub mod file;
pub mod memory;

pub use file::{JsonTable, JsonlQueue};
pub use memory::{MemoryQueue, MemoryStore};

pub type MessageId = String;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("refusing to store a record with an empty city key")]
    EmptyKey,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Durable key-value storage of records keyed by city. Writes overwrite.
#[async_trait]
pub trait RecordStore: Send + Sync + Debug {
    async fn put(&self, record: &WeatherRecord) -> Result<(), SinkError>;

    async fn get(&self, city: &str) -> Result<Option<WeatherRecord>, SinkError>;
}

/// Acknowledged enqueue of an opaque message body.
#[async_trait]
pub trait MessageQueue: Send + Sync + Debug {
    async fn send(&self, body: String) -> Result<MessageId, SinkError>;
}

/// What happened to a delivered record; neither flag affects the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub stored: bool,
    pub published: bool,
}

/// Persists a resolved record and publishes it to the results channel.
#[derive(Debug, Clone)]
pub struct ResultSink {
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn MessageQueue>,
}

impl ResultSink {
    pub fn new(store: Arc<dyn RecordStore>, queue: Arc<dyn MessageQueue>) -> Self {
        Self { store, queue }
    }

    pub async fn store(&self, record: &WeatherRecord) -> bool {
        match self.store.put(record).await {
            Ok(()) => {
                info!(city = %record.city, "record stored");
                true
            }
            Err(err) => {
                error!(city = %record.city, error = %err, "failed to store record");
                false
            }
        }
    }

    pub async fn publish(&self, record: &WeatherRecord) -> bool {
        let body = match serde_json::to_string(record) {
            Ok(body) => body,
            Err(err) => {
                error!(city = %record.city, error = %err, "failed to encode record");
                return false;
            }
        };

        match self.queue.send(body).await {
            Ok(message_id) => {
                info!(city = %record.city, %message_id, "record published to results queue");
                true
            }
            Err(err) => {
                error!(city = %record.city, error = %err, "failed to publish record");
                false
            }
        }
    }

    /// Both operations are always attempted, independently of each other.
    pub async fn deliver(&self, record: &WeatherRecord) -> Delivery {
        let published = self.publish(record).await;
        let stored = self.store(record).await;
        Delivery { stored, published }
    }
}

/// Best-effort channel for items the provider could not resolve.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterSink {
    queue: Option<Arc<dyn MessageQueue>>,
}

impl DeadLetterSink {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue: Some(queue) }
    }

    /// A sink that drops everything; used when no dead-letter queue is configured.
    pub fn disabled() -> Self {
        Self { queue: None }
    }

    /// Never retried, never escalated.
    pub async fn publish(&self, payload: &str) -> bool {
        let Some(queue) = &self.queue else {
            warn!("no dead-letter queue configured, dropping item");
            return false;
        };

        match queue.send(payload.to_owned()).await {
            Ok(message_id) => {
                info!(%message_id, "item sent to dead-letter queue");
                true
            }
            Err(err) => {
                error!(error = %err, "failed to send item to dead-letter queue");
                false
            }
        }
    }
}
