use std::env;
use std::time::Duration;

use once_cell::sync::Lazy;
use rand::Rng;
use thiserror::Error;
use url::Url;

/// Default endpoint pool. Connection attempts pick one of these uniformly
/// at random; the pool is trusted by configuration (see `transport`).
static DEFAULT_ENDPOINTS: Lazy<Vec<Url>> = Lazy::new(|| {
    vec![
        Url::parse("wss://proxy2.wynd.network:4444").expect("default endpoint url"),
        Url::parse("wss://proxy2.wynd.network:4650").expect("default endpoint url"),
    ]
});

static DEFAULT_PROBE_URL: Lazy<Url> =
    Lazy::new(|| Url::parse("https://ipinfo.io/json").expect("default probe url"));

const DEFAULT_CLIENT_VERSION: &str = "4.29.0";

pub const ENV_ENDPOINTS: &str = "HOLDFAST_ENDPOINTS";
pub const ENV_PROBE_URL: &str = "HOLDFAST_PROBE_URL";
pub const ENV_CLIENT_VERSION: &str = "HOLDFAST_CLIENT_VERSION";

/// Holdfast runtime configuration, shared read-only across all sessions.
#[derive(Debug, Clone)]
pub struct Config {
    /// Secure WebSocket endpoints; one is selected per connection attempt.
    pub endpoints: Vec<Url>,
    /// Keepalive PING cadence once a session is active.
    pub ping_interval: Duration,
    /// Fixed delay between a connection dying and the next attempt.
    pub reconnect_delay: Duration,
    /// Bounds the tunnel + TLS + WebSocket upgrade of one attempt.
    pub handshake_timeout: Duration,
    /// IP-echo endpoint used by the startup egress probe.
    pub probe_url: Url,
    /// Client version reported in the AUTH reply.
    pub client_version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoints: DEFAULT_ENDPOINTS.clone(),
            ping_interval: Duration::from_secs(20),
            reconnect_delay: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(30),
            probe_url: DEFAULT_PROBE_URL.clone(),
            client_version: DEFAULT_CLIENT_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid endpoint url '{value}': {source}")]
    InvalidEndpoint {
        value: String,
        source: url::ParseError,
    },
    #[error("invalid probe url '{value}': {source}")]
    InvalidProbeUrl {
        value: String,
        source: url::ParseError,
    },
    #[error("endpoint pool is empty")]
    NoEndpoints,
}

impl Config {
    /// Load configuration, applying `HOLDFAST_*` environment overrides on
    /// top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(raw) = env::var(ENV_ENDPOINTS) {
            let mut endpoints = Vec::new();
            for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let url = Url::parse(entry).map_err(|source| ConfigError::InvalidEndpoint {
                    value: entry.to_string(),
                    source,
                })?;
                endpoints.push(url);
            }
            if endpoints.is_empty() {
                return Err(ConfigError::NoEndpoints);
            }
            config.endpoints = endpoints;
        }

        if let Ok(raw) = env::var(ENV_PROBE_URL) {
            config.probe_url = Url::parse(&raw).map_err(|source| ConfigError::InvalidProbeUrl {
                value: raw.clone(),
                source,
            })?;
        }

        if let Ok(version) = env::var(ENV_CLIENT_VERSION) {
            config.client_version = version;
        }

        Ok(config)
    }

    /// Pick one endpoint uniformly at random from the pool.
    pub fn pick_endpoint(&self) -> &Url {
        let index = rand::thread_rng().gen_range(0..self.endpoints.len());
        &self.endpoints[index]
    }
}
