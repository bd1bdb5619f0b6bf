//! Local wiring of the whole flow on top of file-backed queues and table.

use anyhow::{Context, Result};
use serde_json::Value;
use std::{path::Path, sync::Arc};

use crate::{
    Config,
    intake::{IntakeRequest, RequestBody, handle_intake},
    model::{HttpResponse, WeatherRecord, WorkItem},
    provider::{WeatherProvider, provider_from_config},
    sink::{DeadLetterSink, JsonTable, JsonlQueue, RecordStore, ResultSink},
    worker::{Invocation, QueueRecord, Worker},
};

pub const TABLE_FILE: &str = "city.json";
pub const WORK_QUEUE_FILE: &str = "work.jsonl";
pub const RESULTS_QUEUE_FILE: &str = "results.jsonl";
pub const DEAD_LETTER_QUEUE_FILE: &str = "dead-letter.jsonl";

#[derive(Debug)]
pub struct Pipeline {
    worker: Worker,
    table: Arc<JsonTable>,
    work_queue: Arc<JsonlQueue>,
}

impl Pipeline {
    /// Build the pipeline described by `config`, talking to OpenWeather.
    pub fn open(config: &Config) -> Result<Self> {
        let provider = provider_from_config(config)?;
        let data_dir = config.data_dir()?;
        Self::with_provider(config, &data_dir, provider)
    }

    pub fn with_provider(
        config: &Config,
        data_dir: &Path,
        provider: Arc<dyn WeatherProvider>,
    ) -> Result<Self> {
        let options = config.worker_options().context("Invalid worker configuration")?;

        let table = Arc::new(JsonTable::new(data_dir.join(TABLE_FILE)));
        let work_queue = Arc::new(JsonlQueue::new(data_dir.join(WORK_QUEUE_FILE)));
        let results = Arc::new(JsonlQueue::new(data_dir.join(RESULTS_QUEUE_FILE)));
        let dead_letters = if config.storage.dead_letter_queue {
            let queue = JsonlQueue::new(data_dir.join(DEAD_LETTER_QUEUE_FILE));
            DeadLetterSink::new(Arc::new(queue))
        } else {
            DeadLetterSink::disabled()
        };

        let worker = Worker::new(provider, ResultSink::new(table.clone(), results), dead_letters)
            .with_options(options);

        Ok(Self {
            worker,
            table,
            work_queue,
        })
    }

    /// Submit a city through the intake, as an HTTP client would.
    pub async fn enqueue(&self, city: &str) -> HttpResponse {
        let body = serde_json::json!({ "city": city });
        let request = IntakeRequest::post(RequestBody::Json(body));
        handle_intake(&request, self.work_queue.as_ref()).await
    }

    /// Direct invocation for one city.
    pub async fn resolve(&self, city: &str, simulate: bool) -> HttpResponse {
        let item = if simulate {
            WorkItem::simulated(city)
        } else {
            WorkItem::new(city)
        };
        self.worker.handle_direct(&item).await
    }

    /// Run an arbitrary event, direct or batch envelope.
    pub async fn process_event(&self, event: &Value) -> Option<HttpResponse> {
        self.worker.handle(Invocation::from_event(event)).await
    }

    /// Consume everything on the work queue as one batch. Returns how many records were taken.
    pub async fn drain_work_queue(&self) -> Result<usize> {
        let messages = self.work_queue.drain().await.with_context(|| {
            format!("Failed to drain work queue: {}", self.work_queue.path().display())
        })?;

        let records: Vec<QueueRecord> = messages
            .into_iter()
            .map(|m| QueueRecord {
                message_id: Some(m.message_id),
                body: m.body,
            })
            .collect();
        let count = records.len();

        self.worker.handle_batch(records).await;
        Ok(count)
    }

    pub async fn lookup_stored(&self, city: &str) -> Result<Option<WeatherRecord>> {
        self.table
            .get(city)
            .await
            .with_context(|| format!("Failed to read stored record for {city}"))
    }
}
