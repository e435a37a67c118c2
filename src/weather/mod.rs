pub mod fetcher;

use std::future::Future;

use crate::models::Observation;

pub use fetcher::WeatherClient;

#[derive(Debug, thiserror::Error)]
pub enum WeatherError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Source of current weather observations
pub trait WeatherSource {
    fn fetch_observation(&self) -> impl Future<Output = Result<Observation, WeatherError>> + Send;
}
