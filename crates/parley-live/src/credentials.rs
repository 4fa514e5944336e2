//! Where the API key comes from. A session never connects until a key has
//! been confirmed.

use crate::config::LiveConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait KeySource: Send + Sync {
    /// Resolve a usable key or fail with a credentials error.
    async fn confirm(&self) -> VoiceResult<String>;
}

/// A key supplied up front (config file, `PARLEY_API_KEY`, tests).
pub struct StaticKey(String);

impl StaticKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

#[async_trait]
impl KeySource for StaticKey {
    async fn confirm(&self) -> VoiceResult<String> {
        non_empty(&self.0, "configured api_key")
    }
}

/// Reads the key from an environment variable at connect time.
pub struct EnvKey {
    var: String,
}

impl EnvKey {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl KeySource for EnvKey {
    async fn confirm(&self) -> VoiceResult<String> {
        let value = std::env::var(&self.var)
            .map_err(|_| VoiceError::Credentials(format!("{} is not set", self.var)))?;
        debug!("Using API key from {}", self.var);
        non_empty(&value, &self.var)
    }
}

/// The configured key if present, otherwise the configured variable.
pub fn key_source_for(config: &LiveConfig) -> Box<dyn KeySource> {
    match &config.api_key {
        Some(key) => Box::new(StaticKey::new(key.clone())),
        None => Box::new(EnvKey::new(config.api_key_env.clone())),
    }
}

fn non_empty(value: &str, origin: &str) -> VoiceResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(VoiceError::Credentials(format!("{} is empty", origin)));
    }
    Ok(trimmed.to_string())
}
