//! The weather resolution worker.
//!
//! Every work item goes through the same routine, [`Worker::resolve`]:
//! validate, look up, classify, route. Direct invocations wrap it to produce an HTTP-shaped
//! reply; batch invocations fold over queue records and return nothing.

use futures::{StreamExt, future, stream};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::time::{Instant, timeout};
use tracing::{info, warn};

use crate::{
    model::{ErrorBody, HttpResponse, Outcome, WeatherRecord, WorkItem},
    provider::{ProviderError, SimulatedProvider, WeatherProvider},
    sink::{DeadLetterSink, MessageId, ResultSink},
};

pub const UPSTREAM_MALFORMED: &str = "malformed upstream response";

/// Time kept back from the provider call so routing can finish before the deadline.
pub const ROUTING_RESERVE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Bound on a single provider call.
    pub provider_timeout: Duration,
    /// Wall-clock budget for one invocation, direct or batch.
    pub invocation_budget: Duration,
    /// Batch records in flight at once; 1 keeps delivery order.
    pub batch_concurrency: usize,
    pub allow_simulation: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(10),
            invocation_budget: Duration::from_secs(30),
            batch_concurrency: 1,
            allow_simulation: false,
        }
    }
}

/// One message of a queue-delivered batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRecord {
    pub message_id: Option<MessageId>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Direct(WorkItem),
    Batch(Vec<QueueRecord>),
}

impl Invocation {
    /// An object with a `Records` array is a batch envelope; anything else is a direct item.
    pub fn from_event(event: &Value) -> Self {
        let Some(records) = event.get("Records").and_then(Value::as_array) else {
            return Invocation::Direct(WorkItem::from_value(event));
        };

        let records = records
            .iter()
            .map(|record| QueueRecord {
                message_id: record
                    .get("messageId")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                body: match record.get("body") {
                    Some(Value::String(body)) => body.clone(),
                    // An envelope entry without a string body still gets validated like any other.
                    Some(other) => other.to_string(),
                    None => String::new(),
                },
            })
            .collect();

        Invocation::Batch(records)
    }
}

#[derive(Debug, Default)]
struct BatchTally {
    started: usize,
    success: usize,
    not_found: usize,
    upstream_error: usize,
    validation_error: usize,
}

impl BatchTally {
    fn record(&mut self, outcome: &Outcome) {
        self.started += 1;
        match outcome {
            Outcome::Success(_) => self.success += 1,
            Outcome::NotFound { .. } => self.not_found += 1,
            Outcome::UpstreamError { .. } => self.upstream_error += 1,
            Outcome::ValidationError { .. } => self.validation_error += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Worker {
    provider: Arc<dyn WeatherProvider>,
    simulator: SimulatedProvider,
    results: ResultSink,
    dead_letters: DeadLetterSink,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(
        provider: Arc<dyn WeatherProvider>,
        results: ResultSink,
        dead_letters: DeadLetterSink,
    ) -> Self {
        Self {
            provider,
            simulator: SimulatedProvider,
            results,
            dead_letters,
            options: WorkerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Process one item end to end within a fresh invocation budget. Never fails.
    pub async fn resolve(&self, item: &WorkItem) -> Outcome {
        let deadline = Instant::now() + self.options.invocation_budget;
        self.resolve_before(item, deadline).await
    }

    async fn resolve_before(&self, item: &WorkItem, deadline: Instant) -> Outcome {
        let outcome = self.classify(item, deadline).await;
        self.route(item, &outcome).await;
        outcome
    }

    /// The provider gets its own timeout, shortened so that routing still fits before
    /// `deadline`.
    fn lookup_timeout(&self, deadline: Instant) -> Duration {
        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .saturating_sub(ROUTING_RESERVE);
        self.options.provider_timeout.min(remaining)
    }

    async fn classify(&self, item: &WorkItem, deadline: Instant) -> Outcome {
        let city = match item.validated_city() {
            Ok(city) => city,
            Err(reason) => {
                warn!(reason, "rejecting work item");
                return Outcome::ValidationError {
                    reason: reason.to_string(),
                };
            }
        };

        if item.simulate {
            if self.options.allow_simulation {
                let observation = self.simulator.observe(city);
                return Outcome::Success(WeatherRecord::from_observation(city, observation));
            }
            warn!(city, "simulation requested but not enabled, using the provider");
        }

        let limit = self.lookup_timeout(deadline);
        let lookup = match timeout(limit, self.provider.lookup(city)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Transport(format!(
                "provider call exceeded {limit:?}"
            ))),
        };

        match lookup {
            Ok(observation) => Outcome::Success(WeatherRecord::from_observation(city, observation)),
            Err(ProviderError::NotFound) => Outcome::NotFound {
                city: city.to_owned(),
            },
            Err(ProviderError::MalformedResponse(detail)) => {
                warn!(city, %detail, "unexpected provider response");
                Outcome::UpstreamError {
                    city: city.to_owned(),
                    detail: UPSTREAM_MALFORMED.into(),
                }
            }
            Err(ProviderError::Transport(cause)) => Outcome::UpstreamError {
                city: city.to_owned(),
                detail: cause,
            },
        }
    }

    async fn route(&self, item: &WorkItem, outcome: &Outcome) {
        match outcome {
            Outcome::Success(record) => {
                let delivery = self.results.deliver(record).await;
                info!(
                    city = %record.city,
                    stored = delivery.stored,
                    published = delivery.published,
                    "weather resolved"
                );
            }
            Outcome::NotFound { city } => {
                warn!(city = %city, "city not found, dead-lettering");
                self.dead_letters.publish(&item.original).await;
            }
            Outcome::UpstreamError { city, detail } => {
                warn!(city = %city, detail = %detail, "upstream failure, dead-lettering");
                self.dead_letters.publish(&item.original).await;
            }
            Outcome::ValidationError { .. } => {}
        }
    }

    /// Single-item invocation: resolve, then answer immediately.
    pub async fn handle_direct(&self, item: &WorkItem) -> HttpResponse {
        match timeout(self.options.invocation_budget, self.resolve(item)).await {
            Ok(outcome) => respond(&outcome),
            Err(_) => {
                warn!("direct invocation exceeded its budget");
                HttpResponse::internal_error()
            }
        }
    }

    /// Queue-delivered invocation. One record's failure never stops the others. A record is
    /// only started while there is still room to route it; the rest are left for the queue to
    /// redeliver.
    pub async fn handle_batch(&self, records: Vec<QueueRecord>) {
        let total = records.len();
        let deadline = Instant::now() + self.options.invocation_budget;

        let tally = stream::iter(records)
            .take_while(|_| future::ready(Instant::now() + ROUTING_RESERVE < deadline))
            .map(|record| self.process_record(record, deadline))
            .buffer_unordered(self.options.batch_concurrency.max(1))
            .fold(BatchTally::default(), |mut tally, outcome| {
                tally.record(&outcome);
                future::ready(tally)
            })
            .await;

        if tally.started < total {
            warn!(
                skipped = total - tally.started,
                "invocation budget exhausted before the batch finished"
            );
        }
        info!(
            total,
            success = tally.success,
            not_found = tally.not_found,
            upstream_error = tally.upstream_error,
            validation_error = tally.validation_error,
            "batch processed"
        );
    }

    async fn process_record(&self, record: QueueRecord, deadline: Instant) -> Outcome {
        let message_id = record.message_id.as_deref().unwrap_or("-");
        match WorkItem::from_body(&record.body) {
            Ok(item) => {
                let outcome = self.resolve_before(&item, deadline).await;
                info!(message_id, outcome = outcome.kind(), "record processed");
                outcome
            }
            Err(err) => {
                warn!(message_id, error = %err, "dropping undecodable record");
                Outcome::ValidationError {
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Entry point for a raw event; only direct invocations produce a response.
    pub async fn handle(&self, invocation: Invocation) -> Option<HttpResponse> {
        match invocation {
            Invocation::Direct(item) => Some(self.handle_direct(&item).await),
            Invocation::Batch(records) => {
                self.handle_batch(records).await;
                None
            }
        }
    }
}

/// Map an outcome to the direct-mode reply.
pub fn respond(outcome: &Outcome) -> HttpResponse {
    let status = outcome.status_code();
    let encoded = match outcome {
        Outcome::Success(record) => HttpResponse::json(status, record),
        Outcome::NotFound { city } => {
            let error = format!("city \"{city}\" was not found by the weather provider");
            HttpResponse::json(status, &ErrorBody::new(error))
        }
        Outcome::UpstreamError { .. } => {
            let error = "unexpected response from weather provider";
            HttpResponse::json(status, &ErrorBody::new(error))
        }
        Outcome::ValidationError { reason } => HttpResponse::json(status, &ErrorBody::new(reason)),
    };

    encoded.unwrap_or_else(|err| {
        warn!(error = %err, "failed to encode response body");
        HttpResponse::internal_error()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{CITY_REQUIRED, Observation},
        sink::{MemoryQueue, MemoryStore},
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::{
        collections::{HashMap, HashSet},
        sync::atomic::{AtomicUsize, Ordering},
    };

    #[derive(Debug, Default)]
    struct ScriptedProvider {
        answers: HashMap<String, Result<Observation, ProviderError>>,
        delay: Option<Duration>,
        hung: HashSet<String>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn found(mut self, city: &str, description: &str, temp: f64) -> Self {
            let observation = Observation {
                description: description.into(),
                temperature_c: temp,
            };
            self.answers.insert(city.into(), Ok(observation));
            self
        }

        fn failing(mut self, city: &str, err: ProviderError) -> Self {
            self.answers.insert(city.into(), Err(err));
            self
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Lookups for `city` never answer.
        fn hung(mut self, city: &str) -> Self {
            self.hung.insert(city.into());
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WeatherProvider for ScriptedProvider {
        async fn lookup(&self, city: &str) -> Result<Observation, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.hung.contains(city) {
                future::pending::<()>().await;
            }
            self.answers
                .get(city)
                .cloned()
                .unwrap_or(Err(ProviderError::NotFound))
        }
    }

    struct Harness {
        provider: Arc<ScriptedProvider>,
        store: Arc<MemoryStore>,
        results: Arc<MemoryQueue>,
        dlq: Arc<MemoryQueue>,
        worker: Worker,
    }

    fn harness(provider: ScriptedProvider) -> Harness {
        let provider = Arc::new(provider);
        let store = Arc::new(MemoryStore::new());
        let results = Arc::new(MemoryQueue::new());
        let dlq = Arc::new(MemoryQueue::new());
        let worker = Worker::new(
            provider.clone(),
            ResultSink::new(store.clone(), results.clone()),
            DeadLetterSink::new(dlq.clone()),
        );

        Harness {
            provider,
            store,
            results,
            dlq,
            worker,
        }
    }

    fn batch(bodies: &[&str]) -> Vec<QueueRecord> {
        bodies
            .iter()
            .enumerate()
            .map(|(i, body)| QueueRecord {
                message_id: Some(format!("m{i}")),
                body: body.to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn found_city_is_stored_and_published() {
        let h = harness(ScriptedProvider::default().found("Lima", "cielo claro", 22.0));

        let outcome = h.worker.resolve(&WorkItem::new("Lima")).await;

        let Outcome::Success(record) = outcome else {
            panic!("expected success")
        };
        assert_eq!(record.city, "Lima");
        assert_eq!(record.temperature, "22°C");
        assert_eq!(h.store.record("Lima"), Some(record));
        assert_eq!(h.results.len(), 1);
        assert!(h.dlq.is_empty());
    }

    #[tokio::test]
    async fn city_case_is_preserved() {
        let h = harness(ScriptedProvider::default().found("lIMa", "nublado", 19.5));

        let outcome = h.worker.resolve(&WorkItem::new("lIMa")).await;

        assert!(matches!(outcome, Outcome::Success(ref r) if r.city == "lIMa"));
        assert!(h.store.record("lIMa").is_some());
    }

    #[tokio::test]
    async fn blank_city_never_reaches_provider() {
        let h = harness(ScriptedProvider::default());
        let items = [
            WorkItem::new(""),
            WorkItem::new("   "),
            WorkItem::from_value(&json!({})),
        ];

        for item in items {
            let outcome = h.worker.resolve(&item).await;
            let expected = Outcome::ValidationError {
                reason: CITY_REQUIRED.into(),
            };
            assert_eq!(outcome, expected);
        }

        assert_eq!(h.provider.calls(), 0);
        assert!(h.store.is_empty());
        assert!(h.results.is_empty());
        assert!(h.dlq.is_empty());
    }

    #[tokio::test]
    async fn not_found_is_dead_lettered_once() {
        let h = harness(ScriptedProvider::default());
        let item = WorkItem::new("NoSuchCity123");

        let outcome = h.worker.resolve(&item).await;

        let expected = Outcome::NotFound {
            city: "NoSuchCity123".into(),
        };
        assert_eq!(outcome, expected);
        assert_eq!(h.dlq.messages(), vec![item.original.clone()]);
        assert_eq!(h.store.writes(), 0);
        assert!(h.results.is_empty());
    }

    #[tokio::test]
    async fn malformed_response_uses_generic_detail() {
        let err = ProviderError::MalformedResponse("missing main".into());
        let h = harness(ScriptedProvider::default().failing("Lima", err));

        let outcome = h.worker.resolve(&WorkItem::new("Lima")).await;

        let expected = Outcome::UpstreamError {
            city: "Lima".into(),
            detail: UPSTREAM_MALFORMED.into(),
        };
        assert_eq!(outcome, expected);
        assert_eq!(h.dlq.len(), 1);
    }

    #[tokio::test]
    async fn transport_error_keeps_cause() {
        let err = ProviderError::Transport("reset".into());
        let h = harness(ScriptedProvider::default().failing("Lima", err));

        let outcome = h.worker.resolve(&WorkItem::new("Lima")).await;

        let expected = Outcome::UpstreamError {
            city: "Lima".into(),
            detail: "reset".into(),
        };
        assert_eq!(outcome, expected);
    }

    #[tokio::test]
    async fn store_failure_does_not_downgrade_success() {
        let h = harness(ScriptedProvider::default().found("Lima", "cielo claro", 22.0));
        h.store.inject_failure();

        let outcome = h.worker.resolve(&WorkItem::new("Lima")).await;

        assert!(matches!(outcome, Outcome::Success(_)));
        assert_eq!(h.results.len(), 1);
    }

    #[tokio::test]
    async fn dead_letter_failure_does_not_change_outcome() {
        let h = harness(ScriptedProvider::default());
        h.dlq.inject_failure();

        let outcome = h.worker.resolve(&WorkItem::new("Atlantis")).await;

        let expected = Outcome::NotFound {
            city: "Atlantis".into(),
        };
        assert_eq!(outcome, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_provider_times_out_and_is_dead_lettered() {
        let h = harness(ScriptedProvider::default().hung("Lima"));

        let outcome = h.worker.resolve(&WorkItem::new("Lima")).await;

        assert!(matches!(
            outcome,
            Outcome::UpstreamError { ref detail, .. } if detail.contains("exceeded")
        ));
        assert_eq!(h.dlq.len(), 1);
    }

    #[tokio::test]
    async fn simulation_is_ignored_unless_enabled() {
        let h = harness(ScriptedProvider::default().found("Madrid", "despejado", 20.0));

        let outcome = h.worker.resolve(&WorkItem::simulated("Madrid")).await;

        assert!(matches!(outcome, Outcome::Success(ref r) if r.description == "despejado"));
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn simulation_uses_canned_table_when_enabled() {
        let mut h = harness(ScriptedProvider::default());
        h.worker = h.worker.with_options(WorkerOptions {
            allow_simulation: true,
            ..Default::default()
        });

        let outcome = h.worker.resolve(&WorkItem::simulated("Madrid")).await;

        let Outcome::Success(record) = outcome else {
            panic!("expected success")
        };
        assert_eq!(record.description, "Nublado");
        assert_eq!(record.temperature, "15°C");
        assert_eq!(h.provider.calls(), 0);
    }

    #[tokio::test]
    async fn direct_mode_status_mapping() {
        let h = harness(
            ScriptedProvider::default()
                .found("Lima", "cielo claro", 22.0)
                .failing("Quito", ProviderError::Transport("refused".into())),
        );

        let ok = h.worker.handle_direct(&WorkItem::new("Lima")).await;
        assert_eq!(ok.status_code, 200);
        assert_eq!(ok.body_json().unwrap()["clima"], "cielo claro");

        let missing = h.worker.handle_direct(&WorkItem::new("Nowhere")).await;
        assert_eq!(missing.status_code, 404);
        let error = missing.body_json().unwrap()["error"].clone();
        assert!(error.as_str().unwrap().contains("Nowhere"));

        let upstream = h.worker.handle_direct(&WorkItem::new("Quito")).await;
        assert_eq!(upstream.status_code, 502);
        assert!(upstream.body_json().unwrap()["error"].is_string());

        let invalid = h.worker.handle_direct(&WorkItem::new(" ")).await;
        assert_eq!(invalid.status_code, 400);
        assert_eq!(
            invalid.body_json().unwrap(),
            json!({ "error": "city is required" })
        );
    }

    #[tokio::test]
    async fn batch_continues_past_failures() {
        let h = harness(
            ScriptedProvider::default()
                .found("Lima", "cielo claro", 22.0)
                .found("Cusco", "lluvia ligera", 11.0),
        );

        h.worker
            .handle_batch(batch(&[
                r#"{"city":"Lima"}"#,
                r#"{"city":"Atlantis"}"#,
                "not json",
                r#"{"city":""}"#,
                r#"{"ciudad":"Cusco"}"#,
            ]))
            .await;

        assert_eq!(h.store.len(), 2);
        assert!(h.store.record("Cusco").is_some());
        assert_eq!(h.results.len(), 2);
        assert_eq!(h.dlq.messages(), vec![r#"{"city":"Atlantis"}"#.to_string()]);
    }

    #[tokio::test]
    async fn concurrent_batch_processes_every_record() {
        let mut h = harness(
            ScriptedProvider::default()
                .found("Lima", "a", 1.0)
                .found("Quito", "b", 2.0)
                .found("Bogota", "c", 3.0),
        );
        h.worker = h.worker.with_options(WorkerOptions {
            batch_concurrency: 3,
            ..Default::default()
        });

        h.worker
            .handle_batch(batch(&[
                r#"{"city":"Lima"}"#,
                r#"{"city":"Quito"}"#,
                r#"{"city":"Bogota"}"#,
            ]))
            .await;

        assert_eq!(h.store.len(), 3);
        assert_eq!(h.provider.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_leaves_remaining_records() {
        let mut h = harness(
            ScriptedProvider::default()
                .found("Lima", "a", 1.0)
                .found("Quito", "b", 2.0)
                .found("Bogota", "c", 3.0)
                .delayed(Duration::from_secs(4)),
        );
        h.worker = h.worker.with_options(WorkerOptions {
            provider_timeout: Duration::from_secs(5),
            invocation_budget: Duration::from_secs(6),
            ..Default::default()
        });

        h.worker
            .handle_batch(batch(&[
                r#"{"city":"Lima"}"#,
                r#"{"city":"Quito"}"#,
                r#"{"city":"Bogota"}"#,
            ]))
            .await;

        // Lima finishes at 4s. Quito starts with 2s left, so its lookup is cut to 1s and it
        // is dead-lettered at 5s. Bogota would have no room to route and never starts.
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.provider.calls(), 2);
        assert_eq!(h.dlq.messages(), vec![r#"{"city":"Quito"}"#.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_lookup_late_in_batch_is_dead_lettered_before_deadline() {
        let h = harness(
            ScriptedProvider::default()
                .found("Lima", "cielo claro", 22.0)
                .delayed(Duration::from_secs(4))
                .hung("Hung"),
        );
        let mut bodies = vec![r#"{"city":"Lima"}"#; 6];
        bodies.push(r#"{"city":"Hung"}"#);

        let started = Instant::now();
        h.worker.handle_batch(batch(&bodies)).await;

        // The hung lookup starts at 24s with a 30s budget and a 10s provider timeout.
        assert_eq!(h.results.len(), 6);
        assert_eq!(h.dlq.messages(), vec![r#"{"city":"Hung"}"#.to_string()]);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_timeout_shrinks_near_the_deadline() {
        let h = harness(ScriptedProvider::default());
        let now = Instant::now();

        let far = h.worker.lookup_timeout(now + Duration::from_secs(60));
        assert_eq!(far, Duration::from_secs(10));

        let near = h.worker.lookup_timeout(now + Duration::from_secs(4));
        assert_eq!(near, Duration::from_secs(3));

        let passed = h.worker.lookup_timeout(now);
        assert_eq!(passed, Duration::ZERO);
    }

    #[tokio::test]
    async fn handle_returns_response_only_for_direct_events() {
        let h = harness(ScriptedProvider::default().found("Lima", "cielo claro", 22.0));

        let direct = Invocation::from_event(&json!({ "city": "Lima" }));
        let status = h.worker.handle(direct).await.map(|r| r.status_code);
        assert_eq!(status, Some(200));

        let queued = Invocation::from_event(&json!({
            "Records": [{ "messageId": "1", "body": "{\"city\":\"Lima\"}" }]
        }));
        assert!(h.worker.handle(queued).await.is_none());
        assert_eq!(h.results.len(), 2);
    }

    #[test]
    fn batch_envelope_is_detected() {
        let event = json!({
            "Records": [{ "messageId": "abc", "body": "{\"city\":\"Lima\"}" }, {}]
        });

        let Invocation::Batch(records) = Invocation::from_event(&event) else {
            panic!("expected batch")
        };
        assert_eq!(records[0].message_id.as_deref(), Some("abc"));
        assert_eq!(records[0].body, r#"{"city":"Lima"}"#);
        assert_eq!(records[1].body, "");
    }

    #[test]
    fn anything_else_is_direct() {
        let events = [
            json!({ "city": "Lima" }),
            json!(null),
            json!({ "Records": "nope" }),
        ];

        for event in events {
            assert!(matches!(
                Invocation::from_event(&event),
                Invocation::Direct(_)
            ));
        }
    }
}
