//! Core library for the `clima` weather pipeline.
//!
//! This crate defines:
//! - The weather resolution worker (direct and batch invocation)
//! - Abstraction over weather providers, with an OpenWeather client
//! - Result and dead-letter sinks over pluggable storage and queues
//! - The intake handler that turns requests into queued work items
//! - Configuration handling
//!
//! It is used by `clima-cli`, but the worker can be embedded in any queue consumer or
//! function runtime.

pub mod config;
pub mod intake;
pub mod model;
pub mod pipeline;
pub mod provider;
pub mod sink;
pub mod worker;

pub use config::Config;
pub use intake::{IntakeRequest, RequestBody, handle_intake};
pub use model::{HttpResponse, Outcome, WeatherRecord, WorkItem};
pub use pipeline::Pipeline;
pub use provider::{ProviderError, WeatherProvider};
pub use sink::{DeadLetterSink, MessageQueue, RecordStore, ResultSink};
pub use worker::{Invocation, QueueRecord, Worker, WorkerOptions};
