use crate::{Config, model::Observation, provider::openweather::OpenWeatherProvider};
use async_trait::async_trait;
use std::{fmt::Debug, sync::Arc};

pub mod openweather;
pub mod simulated;

pub use simulated::SimulatedProvider;

/// Why a lookup did not produce an [`Observation`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("city not found by weather provider")]
    NotFound,

    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// A single-attempt weather lookup by city name. Implementations never retry.
#[async_trait]
pub trait WeatherProvider: Send + Sync + Debug {
    async fn lookup(&self, city: &str) -> Result<Observation, ProviderError>;
}

/// Construct the OpenWeather provider from config.
pub fn provider_from_config(config: &Config) -> anyhow::Result<Arc<dyn WeatherProvider>> {
    let api_key = config
        .provider
        .api_key
        .as_deref()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "No API key configured for OpenWeather.\n\
                 Hint: run `clima configure` or set OPENWEATHER_API_KEY."
            )
        })?;

    let provider = OpenWeatherProvider::new(api_key.to_owned(), &config.provider)?;

    Ok(Arc::new(provider))
}
