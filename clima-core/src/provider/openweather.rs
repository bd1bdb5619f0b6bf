use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::{config::ProviderSettings, model::Observation};

use super::{ProviderError, WeatherProvider};

#[derive(Debug, Clone)]
pub struct OpenWeatherProvider {
    api_key: String,
    base_url: String,
    units: String,
    lang: String,
    http: Client,
}

impl OpenWeatherProvider {
    pub fn new(api_key: String, settings: &ProviderSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to create HTTP client for OpenWeather")?;

        Ok(Self {
            api_key,
            base_url: settings.base_url.clone(),
            units: settings.units.clone(),
            lang: settings.lang.clone(),
            http,
        })
    }

    async fn fetch_current(&self, city: &str) -> Result<(StatusCode, String), ProviderError> {
        // `query` percent-encodes every value, so city names go out as-is.
        let res = self
            .http
            .get(&self.base_url)
            .query(&[
                ("q", city),
                ("appid", self.api_key.as_str()),
                ("units", self.units.as_str()),
                ("lang", self.lang.as_str()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let status = res.status();
        let body = res.text().await.map_err(transport_error)?;

        Ok((status, body))
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherProvider {
    async fn lookup(&self, city: &str) -> Result<Observation, ProviderError> {
        let (status, body) = self.fetch_current(city).await?;
        classify_response(status, &body)
    }
}

#[derive(Debug, Deserialize)]
struct OwMain {
    temp: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwWeather {
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OwCurrentResponse {
    /// OpenWeather reports this as a number on success and a string on errors.
    cod: Option<Value>,
    main: Option<OwMain>,
    weather: Option<Vec<OwWeather>>,
}

impl OwCurrentResponse {
    fn is_not_found(&self) -> bool {
        match &self.cod {
            Some(Value::String(code)) => code == "404",
            Some(Value::Number(code)) => code.as_u64() == Some(404),
            _ => false,
        }
    }
}

/// Turn a raw current-weather response into an observation or a typed failure.
///
/// The API signals an unknown city either with HTTP 404 or with `"cod": "404"` inside an
/// otherwise ordinary body; both map to [`ProviderError::NotFound`].
pub fn classify_response(status: StatusCode, body: &str) -> Result<Observation, ProviderError> {
    if status == StatusCode::NOT_FOUND {
        return Err(ProviderError::NotFound);
    }

    let parsed: OwCurrentResponse = serde_json::from_str(body).map_err(|err| {
        ProviderError::MalformedResponse(format!(
            "status {status}, undecodable body ({err}): {}",
            truncate_body(body)
        ))
    })?;

    if parsed.is_not_found() {
        return Err(ProviderError::NotFound);
    }

    if !status.is_success() {
        return Err(ProviderError::MalformedResponse(format!(
            "status {status}: {}",
            truncate_body(body)
        )));
    }

    let temperature_c = parsed
        .main
        .and_then(|main| main.temp)
        .ok_or_else(|| ProviderError::MalformedResponse("missing main.temp".to_string()))?;

    let description = parsed
        .weather
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|w| w.description)
        .ok_or_else(|| {
            ProviderError::MalformedResponse("missing weather[0].description".to_string())
        })?;

    Ok(Observation {
        description,
        temperature_c,
    })
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Transport("request to OpenWeather timed out".to_string())
    } else {
        ProviderError::Transport(err.to_string())
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.chars().count() > MAX {
        format!("{}...", body.chars().take(MAX).collect::<String>())
    } else {
        body.to_string()
    }
}
