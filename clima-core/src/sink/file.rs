//! File-backed adapters used by the command-line harness.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, io::ErrorKind, path::PathBuf};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::warn;
use uuid::Uuid;

use crate::model::WeatherRecord;

use super::{MessageId, MessageQueue, RecordStore, SinkError};

/// All records in one JSON object keyed by city.
#[derive(Debug)]
pub struct JsonTable {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<BTreeMap<String, WeatherRecord>, SinkError> {
        match fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl RecordStore for JsonTable {
    async fn put(&self, record: &WeatherRecord) -> Result<(), SinkError> {
        if record.city.is_empty() {
            return Err(SinkError::EmptyKey);
        }

        let _guard = self.guard.lock().await;
        let mut records = self.read_all().await?;
        records.insert(record.city.clone(), record.clone());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so readers never see a half-written table.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&records)?).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn get(&self, city: &str) -> Result<Option<WeatherRecord>, SinkError> {
        let _guard = self.guard.lock().await;
        Ok(self.read_all().await?.remove(city))
    }
}

/// One line per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub message_id: MessageId,
    pub body: String,
}

/// Append-only JSON-lines queue file.
#[derive(Debug)]
pub struct JsonlQueue {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonlQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Read every pending message and truncate the file.
    ///
    /// A line that is not a queued message envelope (hand-edited, or cut short by a crash) is
    /// handed over as a raw body under a fresh id, so it reaches the worker and gets validated
    /// there instead of wedging the queue.
    pub async fn drain(&self) -> Result<Vec<QueuedMessage>, SinkError> {
        let _guard = self.guard.lock().await;
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let messages = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).unwrap_or_else(|err| {
                    warn!(path = %self.path.display(), error = %err, "raw line in queue file");
                    QueuedMessage {
                        message_id: Uuid::new_v4().to_string(),
                        body: line.to_owned(),
                    }
                })
            })
            .collect::<Vec<QueuedMessage>>();

        fs::write(&self.path, b"").await?;
        Ok(messages)
    }
}

#[async_trait]
impl MessageQueue for JsonlQueue {
    async fn send(&self, body: String) -> Result<MessageId, SinkError> {
        let message = QueuedMessage {
            message_id: Uuid::new_v4().to_string(),
            body,
        };
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');

        let _guard = self.guard.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        Ok(message.message_id)
    }
}
