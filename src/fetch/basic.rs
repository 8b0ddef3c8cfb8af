use super::client::HttpClient;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Station tables and hourly trip exports can be large; the timeout covers
/// the whole request including the body.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Plain `reqwest` client with no authentication.
pub struct BasicClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl BasicClient {
    /// Client with [`DEFAULT_TIMEOUT`]. Falls back to reqwest's defaults if
    /// the TLS backend cannot be configured.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT).unwrap_or_else(|_| Self {
            client: reqwest::Client::new(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("building HTTP client")?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for BasicClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for BasicClient {
    async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        self.client.execute(req).await
    }
}
