use crate::{env_optional, ConfigError, FromEnv};

/// Redis configuration
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub uri: String,
}

impl RedisConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

impl FromEnv for RedisConfig {
    /// Reads REDIS_URL, falling back to REDIS_HOST (no default)
    fn from_env() -> Result<Self, ConfigError> {
        env_optional("REDIS_URL")
            .or_else(|| env_optional("REDIS_HOST"))
            .map(Self::new)
            .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))
    }
}
