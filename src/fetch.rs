use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use tracing::debug;

use crate::config::FetchConfig;
use crate::error::FetchError;

/// Plain HTTP GET helper used to download photo attachments.
///
/// Holds a single pooled `reqwest::Client` shared by every update.
#[derive(Clone)]
pub struct ImageFetcher {
    client: reqwest::Client,
}

impl ImageFetcher {
    pub fn new(timeout: Duration, pool_max_idle_per_host: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .build()
            .context("Failed to build image download client")?;
        Ok(Self { client })
    }

    pub fn from_config(config: &FetchConfig) -> Result<Self> {
        Self::new(config.timeout(), config.pool_max_idle_per_host)
    }

    /// Download `url` and return the full body. Anything other than
    /// `200 OK` is an error.
    ///
    /// Errors never carry the URL: Telegram file URLs embed the bot token.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.without_url()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status(status));
        }

        let body = response.bytes().await.map_err(|e| FetchError::Body(e.without_url()))?;
        debug!(bytes = body.len(), "downloaded image");
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxumStatus, routing::get, Router};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn fetcher(timeout: Duration) -> ImageFetcher {
        ImageFetcher::new(timeout, 50).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_returns_body() {
        let app = Router::new().route("/photo.jpg", get(|| async { vec![0xFFu8, 0xD8, 0xFF, 0xE0] }));
        let base = serve(app).await;

        let bytes = fetcher(Duration::from_secs(5))
            .fetch(&format!("{}/photo.jpg", base))
            .await
            .unwrap();
        assert_eq!(bytes, vec![0xFF, 0xD8, 0xFF, 0xE0]);
    }

    #[tokio::test]
    async fn test_fetch_non_ok_status_is_error() {
        let app = Router::new().route("/gone", get(|| async { (AxumStatus::NOT_FOUND, "nope") }));
        let base = serve(app).await;

        let err = fetcher(Duration::from_secs(5))
            .fetch(&format!("{}/gone", base))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status(StatusCode::NOT_FOUND)));
        assert_eq!(err.to_string(), "HTTP error: 404 Not Found");
    }

    #[tokio::test]
    async fn test_fetch_other_success_codes_are_rejected() {
        let app = Router::new().route("/accepted", get(|| async { (AxumStatus::ACCEPTED, "later") }));
        let base = serve(app).await;

        let err = fetcher(Duration::from_secs(5))
            .fetch(&format!("{}/accepted", base))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "HTTP error: 202 Accepted");
    }

    #[tokio::test]
    async fn test_fetch_times_out() {
        let app = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "too late"
            }),
        );
        let base = serve(app).await;

        let err = fetcher(Duration::from_millis(200))
            .fetch(&format!("{}/slow", base))
            .await
            .unwrap_err();
        match err {
            FetchError::Network(e) => assert!(e.is_timeout()),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = fetcher(Duration::from_secs(2))
            .fetch(&format!("http://{}/x", addr))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network(_)));
    }

    #[tokio::test]
    async fn test_fetch_error_does_not_leak_token_in_url() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = format!("http://{}/file/bot123456:SECRET-TOKEN/photos/file_1.jpg", addr);
        let err = fetcher(Duration::from_secs(2)).fetch(&url).await.unwrap_err();

        let shown = format!("Error: {}", crate::error::RelayError::from(err));
        assert!(shown.starts_with("Error: request failed"));
        assert!(!shown.contains("SECRET-TOKEN"), "token leaked: {}", shown);
        assert!(!shown.contains("bot123456"), "token leaked: {}", shown);
    }
}
