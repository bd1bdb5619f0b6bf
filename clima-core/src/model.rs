use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reason reported for any work item without a usable city.
pub const CITY_REQUIRED: &str = "city is required";

#[derive(Debug, thiserror::Error)]
pub enum WorkItemError {
    #[error("work item body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// One unit of input to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub city: Option<String>,
    pub simulate: bool,
    /// Inbound JSON text exactly as received; this is what gets dead-lettered.
    pub original: String,
}

impl WorkItem {
    pub fn new(city: impl Into<String>) -> Self {
        let city = city.into();
        let original = serde_json::json!({ "city": city }).to_string();

        Self {
            city: Some(city),
            simulate: false,
            original,
        }
    }

    pub fn simulated(city: impl Into<String>) -> Self {
        let city = city.into();
        let original = serde_json::json!({ "city": city, "mock": true }).to_string();

        Self {
            city: Some(city),
            simulate: true,
            original,
        }
    }

    /// Direct invocations hand over an already decoded JSON value.
    pub fn from_value(value: &Value) -> Self {
        let city = value
            .get("city")
            .or_else(|| value.get("ciudad"))
            .and_then(Value::as_str)
            .map(str::to_owned);

        let simulate = ["mock", "simulate"]
            .iter()
            .any(|key| value.get(*key).and_then(Value::as_bool).unwrap_or(false));

        Self {
            city,
            simulate,
            original: value.to_string(),
        }
    }

    /// Queue records carry the item as a JSON-encoded string body.
    pub fn from_body(body: &str) -> Result<Self, WorkItemError> {
        let value: Value = serde_json::from_str(body)?;
        let mut item = Self::from_value(&value);
        item.original = body.to_owned();
        Ok(item)
    }

    /// The city to look up, verbatim, or the validation failure reason.
    pub fn validated_city(&self) -> Result<&str, &'static str> {
        match self.city.as_deref() {
            Some(city) if !city.trim().is_empty() => Ok(city),
            _ => Err(CITY_REQUIRED),
        }
    }
}

/// Successful answer from a weather provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub description: String,
    pub temperature_c: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub city: String,
    #[serde(rename = "clima")]
    pub description: String,
    #[serde(rename = "temperatura")]
    pub temperature: String,
    #[serde(rename = "fecha")]
    pub observed_at: DateTime<Utc>,
}

impl WeatherRecord {
    pub fn from_observation(city: &str, observation: Observation) -> Self {
        Self {
            city: city.to_owned(),
            description: observation.description,
            temperature: format_temperature(observation.temperature_c),
            observed_at: Utc::now().trunc_subsecs(3),
        }
    }
}

/// `22.0` renders as `22°C`, `21.5` as `21.5°C`.
pub fn format_temperature(celsius: f64) -> String {
    format!("{celsius}°C")
}

/// Result of processing exactly one work item.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(WeatherRecord),
    NotFound { city: String },
    UpstreamError { city: String, detail: String },
    ValidationError { reason: String },
}

impl Outcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::NotFound { .. } => "not_found",
            Outcome::UpstreamError { .. } => "upstream_error",
            Outcome::ValidationError { .. } => "validation_error",
        }
    }

    /// Only well-formed items the provider could not resolve go to the dead-letter channel.
    pub fn dead_letters(&self) -> bool {
        match self {
            Outcome::NotFound { .. } | Outcome::UpstreamError { .. } => true,
            Outcome::Success(_) | Outcome::ValidationError { .. } => false,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Outcome::Success(_) => 200,
            Outcome::NotFound { .. } => 404,
            Outcome::UpstreamError { .. } => 502,
            Outcome::ValidationError { .. } => 400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// HTTP-shaped reply returned by direct invocations and the intake handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn json<T: Serialize>(status_code: u16, body: &T) -> serde_json::Result<Self> {
        Ok(Self {
            status_code,
            headers: BTreeMap::new(),
            body: serde_json::to_string(body)?,
        })
    }

    /// Fallback for when a body cannot be encoded at all.
    pub fn internal_error() -> Self {
        Self {
            status_code: 500,
            headers: BTreeMap::new(),
            body: r#"{"error":"internal worker error"}"#.to_string(),
        }
    }

    pub fn with_headers(mut self, headers: &[(&str, &str)]) -> Self {
        self.headers.extend(
            headers
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string())),
        );
        self
    }

    pub fn body_json(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.body)
    }
}
