//! Provider connection configuration.

use std::time::Duration;

use skein_core::llm::LlmError;

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct RemoteLlmConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: String,
    /// Optional organization header.
    pub organization: Option<String>,
    /// Whole-request timeout.
    pub timeout: Duration,
}

impl RemoteLlmConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            organization: None,
            timeout: Duration::from_secs(600),
        }
    }

    /// Read the API key from an environment variable.
    pub fn from_env(env_var: &str, base_url: &str) -> Result<Self, LlmError> {
        let api_key = std::env::var(env_var).map_err(|_| {
            LlmError::Configuration(format!("environment variable {env_var} is not set"))
        })?;
        Ok(Self::new(base_url, api_key))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }
}
