use eagle_common::upstream::UpstreamConfig;

use crate::error::AppError;

/// Application configuration loaded explicitly from environment variables.
///
/// The upstream credential is required; everything else has a default.
#[derive(Debug, Clone)]
pub struct Config {
    /// Socket address the HTTP server binds to (e.g. "0.0.0.0:3000").
    pub listen_addr: String,
    /// Settings for the outbound completion API.
    pub upstream: UpstreamConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `PERPLEXITY_API_KEY`: bearer token for the completion API
    ///
    /// Optional:
    /// - `LISTEN_ADDR` (default: "0.0.0.0:3000")
    /// - see [`UpstreamConfig::from_env`] for the upstream knobs
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let listen_addr = lookup("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string());
        if listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(AppError::Config(format!(
                "LISTEN_ADDR is not a socket address: {listen_addr}"
            )));
        }

        let upstream = UpstreamConfig::from_lookup(lookup)?;

        Ok(Self {
            listen_addr,
            upstream,
        })
    }
}
