//! Endpoint abstraction.
//!
//! # Responsibilities
//! - Represent a single downstream endpoint (id, URL, base weight)
//! - Build endpoints from configuration
//!
//! Endpoints are owned by the caller and handed to the selector on every
//! call; health statistics live in the selector, keyed by `id`.

use serde::Serialize;
use url::Url;

use crate::config::EndpointConfig;

/// A single downstream endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Endpoint {
    /// Unique identifier; also used as breaker and pool key.
    pub id: String,
    pub url: Url,
    /// Relative selection weight before performance adjustment.
    pub weight: f64,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, url: Url, weight: f64) -> Self {
        Self {
            id: id.into(),
            url,
            weight,
        }
    }

    /// Build an endpoint from a URL string.
    pub fn parse(id: impl Into<String>, url: &str, weight: f64) -> Result<Self, url::ParseError> {
        Ok(Self::new(id, Url::parse(url)?, weight))
    }

    /// Build every configured endpoint.
    pub fn from_configs(configs: &[EndpointConfig]) -> Result<Vec<Self>, url::ParseError> {
        configs.iter().map(Self::try_from).collect()
    }
}

impl TryFrom<&EndpointConfig> for Endpoint {
    type Error = url::ParseError;

    fn try_from(config: &EndpointConfig) -> Result<Self, Self::Error> {
        Self::parse(config.id.clone(), &config.url, config.weight)
    }
}
