// Client defaults with environment and YAML overrides.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Window after a broker ack during which a denial may still fail the
/// publish. Expiry with no denial resolves the publish as success.
pub(crate) const DEFAULT_PENDING_ACK_TTL_MS: u64 = 5_000;

/// How long a learned denial fast-fails new publishes to the same
/// topic/channel before the destination is tried again.
pub(crate) const DEFAULT_LEARNED_DENIAL_TTL_MS: u64 = 20_000;

/// Poll timeout for consumer loops; short so shutdown stays responsive.
pub(crate) const DEFAULT_POLL_TIMEOUT_MS: u64 = 256;

pub(crate) const DEFAULT_DENIAL_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub pending_ack_ttl: Duration,
    pub learned_denial_ttl: Duration,
    pub poll_timeout: Duration,
    pub denial_queue_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pending_ack_ttl: Duration::from_millis(DEFAULT_PENDING_ACK_TTL_MS),
            learned_denial_ttl: Duration::from_millis(DEFAULT_LEARNED_DENIAL_TTL_MS),
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            denial_queue_depth: DEFAULT_DENIAL_QUEUE_DEPTH,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    pending_ack_ttl_ms: Option<u64>,
    learned_denial_ttl_ms: Option<u64>,
    poll_timeout_ms: Option<u64>,
    denial_queue_depth: Option<usize>,
}

impl ClientConfig {
    /// Defaults, then `RILL_*` environment overrides, then an optional YAML
    /// file (explicit path or `RILL_CLIENT_CONFIG`).
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("RILL_CLIENT_CONFIG").ok());
        let contents = match override_path.as_deref() {
            Some(path) => match fs::read_to_string(path) {
                Ok(contents) => Some(contents),
                Err(err) => {
                    return Err(err).with_context(|| format!("read client config: {path}"));
                }
            },
            None => None,
        };
        if let Some(contents) = contents {
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_u64_env("RILL_PENDING_ACK_TTL_MS") {
            config.pending_ack_ttl = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("RILL_LEARNED_DENIAL_TTL_MS") {
            config.learned_denial_ttl = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("RILL_POLL_TIMEOUT_MS") {
            config.poll_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_usize_env("RILL_DENIAL_QUEUE_DEPTH") {
            config.denial_queue_depth = value;
        }
        config
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(value) = self.pending_ack_ttl_ms.filter(|value| *value > 0) {
            config.pending_ack_ttl = Duration::from_millis(value);
        }
        if let Some(value) = self.learned_denial_ttl_ms.filter(|value| *value > 0) {
            config.learned_denial_ttl = Duration::from_millis(value);
        }
        if let Some(value) = self.poll_timeout_ms.filter(|value| *value > 0) {
            config.poll_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.denial_queue_depth.filter(|value| *value > 0) {
            config.denial_queue_depth = value;
        }
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}
