//! GitHub REST release source.
//!
//! Fetches `GET /repos/{owner}/{name}/releases/latest` with `If-None-Match`
//! set to the stored ETag. A `304 Not Modified` is reported as "no release"
//! and does not count against the unauthenticated rate limit.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, ETAG, IF_NONE_MATCH, USER_AGENT};
use serde::Deserialize;

use beacon_common::error::AppError;
use beacon_engine::ports::{ReleaseSource, SourceResponse, UpstreamRelease};

const API_VERSION: &str = "2022-11-28";

/// Release payload returned by the GitHub API (only the fields we use).
#[derive(Debug, Clone, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    name: Option<String>,
    html_url: String,
    body: Option<String>,
    published_at: Option<DateTime<Utc>>,
}

impl From<GitHubRelease> for UpstreamRelease {
    fn from(release: GitHubRelease) -> Self {
        Self {
            tag: release.tag_name,
            title: release.name.unwrap_or_default(),
            url: release.html_url,
            body: release.body.unwrap_or_default(),
            published_at: release.published_at,
        }
    }
}

pub struct GitHubReleaseSource {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl GitHubReleaseSource {
    /// `timeout` bounds every request, including reading the body.
    pub fn new(
        api_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn latest_release_url(&self, owner: &str, name: &str) -> String {
        format!("{}/repos/{}/{}/releases/latest", self.api_url, owner, name)
    }
}

#[async_trait]
impl ReleaseSource for GitHubReleaseSource {
    async fn latest_release(
        &self,
        owner: &str,
        name: &str,
        validator: Option<&str>,
    ) -> Result<SourceResponse, AppError> {
        let mut request = self
            .client
            .get(self.latest_release_url(owner, name))
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, "release-beacon")
            .header("X-GitHub-Api-Version", API_VERSION);

        if let Some(etag) = validator.filter(|v| !v.is_empty()) {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("GitHub request for {}/{} failed: {}", owner, name, e)))?;

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(SourceResponse::not_modified()),
            StatusCode::NOT_FOUND => {
                // Repository exists but has no published release yet
                tracing::debug!(owner, name, "No published release");
                Ok(SourceResponse {
                    release: None,
                    validator: etag,
                })
            }
            status if status.is_success() => {
                let release: GitHubRelease = response.json().await.map_err(|e| {
                    AppError::Upstream(format!(
                        "invalid release payload for {}/{}: {}",
                        owner, name, e
                    ))
                })?;
                Ok(SourceResponse::modified(release.into(), etag))
            }
            status => Err(AppError::Upstream(format!(
                "GitHub returned {} for {}/{}",
                status, owner, name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the raw request.
    async fn serve_once(response: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    fn source(api_url: &str) -> GitHubReleaseSource {
        GitHubReleaseSource::new(api_url, Some("secret".into()), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_github_release_conversion() {
        let json = serde_json::json!({
            "tag_name": "2.0.0",
            "name": null,
            "html_url": "https://github.com/acme/widget/releases/tag/2.0.0",
            "body": "notes",
            "published_at": "2024-05-01T12:00:00Z"
        });
        let release: UpstreamRelease = serde_json::from_value::<GitHubRelease>(json)
            .unwrap()
            .into();
        assert_eq!(release.tag, "2.0.0");
        assert_eq!(release.title, "");
        assert_eq!(release.body, "notes");
        assert!(release.published_at.is_some());
    }

    #[tokio::test]
    async fn test_modified_response_returns_release_and_etag() {
        let body = r#"{"tag_name":"2.0.0","name":"Widget 2.0","html_url":"https://github.com/acme/widget/releases/tag/2.0.0","body":"notes","published_at":null}"#;
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nETag: \"v2\"\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let (url, handle) = serve_once(response).await;

        let result = source(&url)
            .latest_release("acme", "widget", Some("\"v1\""))
            .await
            .unwrap();
        let request = handle.await.unwrap().to_lowercase();

        assert!(request.starts_with("get /repos/acme/widget/releases/latest"));
        assert!(request.contains("if-none-match: \"v1\""));
        assert!(request.contains("authorization: bearer secret"));
        assert_eq!(result.validator.as_deref(), Some("\"v2\""));
        assert_eq!(result.release.unwrap().title, "Widget 2.0");
    }

    #[tokio::test]
    async fn test_not_modified_returns_no_release() {
        let (url, handle) =
            serve_once("HTTP/1.1 304 Not Modified\r\nConnection: close\r\n\r\n".to_string()).await;

        let result = source(&url)
            .latest_release("acme", "widget", Some("\"v1\""))
            .await
            .unwrap();
        handle.await.unwrap();

        assert_eq!(result, SourceResponse::not_modified());
    }

    #[tokio::test]
    async fn test_server_error_is_upstream_error() {
        let (url, handle) = serve_once(
            "HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
        )
        .await;

        let err = source(&url)
            .latest_release("acme", "widget", None)
            .await
            .unwrap_err();
        handle.await.unwrap();

        assert!(matches!(err, AppError::Upstream(_)));
        assert!(err.to_string().contains("502"));
    }
}
