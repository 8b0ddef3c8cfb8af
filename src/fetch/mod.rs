//! Input acquisition: local files or `http(s)` URLs.

mod basic;
mod client;
pub mod auth;

pub use basic::{BasicClient, DEFAULT_TIMEOUT};
pub use client::HttpClient;

use anyhow::{Context, Result};
use tracing::{debug, warn};

pub fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// GETs `url` and returns the body. Non-2xx responses are errors.
pub async fn fetch_bytes<C: HttpClient + ?Sized>(client: &C, url: &str) -> Result<Vec<u8>> {
    let req = reqwest::Request::new(reqwest::Method::GET, url.parse()?);

    let start = std::time::Instant::now();
    let resp = client.execute(req).await?.error_for_status()?;
    let bytes = resp.bytes().await?.to_vec();

    let elapsed = start.elapsed();
    if elapsed.as_secs() > 15 {
        warn!(elapsed_secs = elapsed.as_secs(), url, "Fetch was slow");
    }
    Ok(bytes)
}

/// Reads `source` from the filesystem, or over HTTP when it is a URL.
#[tracing::instrument(skip(client), fields(source = %source))]
pub async fn read_source<C: HttpClient + ?Sized>(client: &C, source: &str) -> Result<Vec<u8>> {
    let bytes = if is_url(source) {
        fetch_bytes(client, source).await?
    } else {
        tokio::fs::read(source)
            .await
            .with_context(|| format!("reading {}", source))?
    };
    debug!(bytes = bytes.len(), "Source loaded");
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://data.cityofchicago.org/resource/x.csv"));
        assert!(is_url("http://localhost/trips.csv"));
        assert!(!is_url("data/trips.csv"));
        assert!(!is_url("httpdata/trips.csv"));
    }

    #[tokio::test]
    async fn test_read_source_from_file() {
        let path = format!("{}/station_features_test_source.csv", env::temp_dir().display());
        std::fs::write(&path, "name,lat,lon\n").unwrap();

        let bytes = read_source(&BasicClient::new(), &path).await.unwrap();
        assert_eq!(bytes, b"name,lat,lon\n");

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_read_source_missing_file() {
        let err = read_source(&BasicClient::new(), "/nonexistent/trips.csv").await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/trips.csv"));
    }
}
