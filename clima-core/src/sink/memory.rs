//! In-process adapters, mainly for tests. Both support failure injection.

use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use crate::model::WeatherRecord;

use super::{MessageId, MessageQueue, RecordStore, SinkError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A poisoned map is still a valid map.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, WeatherRecord>>,
    writes: AtomicUsize,
    fail: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent `put` fails.
    pub fn inject_failure(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record(&self, city: &str) -> Option<WeatherRecord> {
        lock(&self.records).get(city).cloned()
    }

    /// Number of `put` calls that reached the map.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn put(&self, record: &WeatherRecord) -> Result<(), SinkError> {
        if record.city.is_empty() {
            return Err(SinkError::EmptyKey);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("injected store failure".into()));
        }

        lock(&self.records).insert(record.city.clone(), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, city: &str) -> Result<Option<WeatherRecord>, SinkError> {
        Ok(lock(&self.records).get(city).cloned())
    }
}

#[derive(Debug, Default)]
pub struct MemoryQueue {
    messages: Mutex<Vec<String>>,
    sequence: AtomicUsize,
    fail: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent `send` fails.
    pub fn inject_failure(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn send(&self, body: String) -> Result<MessageId, SinkError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("injected queue failure".into()));
        }

        lock(&self.messages).push(body);
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        Ok(format!("mem-{seq}"))
    }
}
