use std::{future::Future, sync::Arc};

use anyhow::Context;
use lotto_download::{ActionResponse, ActiveDownloads, StatusPayload};
use reqwest::{StatusCode, Url};

/// The movie-lottery server endpoints that front the torrent client.
pub trait DownloadBackend: Send + Sync + 'static {
    fn start_download(
        &self,
        primary_id: &str,
    ) -> impl Future<Output = anyhow::Result<ActionResponse>> + Send;

    /// `id` is a movie id, or a lottery id for jobs without one.
    fn status(&self, id: &str) -> impl Future<Output = anyhow::Result<StatusPayload>> + Send;

    fn list_active(&self) -> impl Future<Output = anyhow::Result<ActiveDownloads>> + Send;

    fn delete(&self, job_id: &str) -> impl Future<Output = anyhow::Result<ActionResponse>> + Send;
}

impl<T: DownloadBackend> DownloadBackend for Arc<T> {
    fn start_download(
        &self,
        primary_id: &str,
    ) -> impl Future<Output = anyhow::Result<ActionResponse>> + Send {
        (**self).start_download(primary_id)
    }

    fn status(&self, id: &str) -> impl Future<Output = anyhow::Result<StatusPayload>> + Send {
        (**self).status(id)
    }

    fn list_active(&self) -> impl Future<Output = anyhow::Result<ActiveDownloads>> + Send {
        (**self).list_active()
    }

    fn delete(&self, job_id: &str) -> impl Future<Output = anyhow::Result<ActionResponse>> + Send {
        (**self).delete(job_id)
    }
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base: Url,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        // Status requests deliberately carry no timeout; the next poll
        // tick supersedes a slow one.
        let client = reqwest::Client::builder()
            .user_agent(concat!("lotto-tracker/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> anyhow::Result<Self> {
        let base = Url::parse(base_url.trim())
            .with_context(|| format!("invalid backend url: {base_url}"))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("backend url cannot be a base: {base_url}");
        }
        Ok(Self { client, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn post_action(&self, action: &str, url: Url) -> anyhow::Result<ActionResponse> {
        let resp = self
            .client
            .post(url)
            .send()
            .await
            .with_context(|| format!("send {action} request"))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .with_context(|| format!("read {action} response"))?;

        if !status.is_success() {
            return Ok(ActionResponse {
                success: false,
                message: error_message_from_body(status, &body),
            });
        }
        serde_json::from_str::<ActionResponse>(&body)
            .with_context(|| format!("parse {action} response"))
    }
}

impl DownloadBackend for HttpBackend {
    async fn start_download(&self, primary_id: &str) -> anyhow::Result<ActionResponse> {
        let url = self.endpoint(&["api", "start-download", primary_id]);
        self.post_action("start download", url).await
    }

    async fn status(&self, id: &str) -> anyhow::Result<StatusPayload> {
        let url = self.endpoint(&["api", "torrent-status", id]);
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("send status request")?;
        let status = resp.status();
        let body = resp.text().await.context("read status response")?;

        if status == StatusCode::NOT_FOUND {
            let payload = serde_json::from_str::<serde_json::Value>(&body)
                .map(StatusPayload::from_value)
                .unwrap_or_default();
            return Ok(if payload.status.is_some() {
                payload
            } else {
                StatusPayload::not_found()
            });
        }
        if !status.is_success() {
            anyhow::bail!(error_message_from_body(status, &body));
        }

        let value: serde_json::Value =
            serde_json::from_str(&body).context("parse status response")?;
        Ok(StatusPayload::from_value(value))
    }

    async fn list_active(&self) -> anyhow::Result<ActiveDownloads> {
        let url = self.endpoint(&["api", "active-downloads"]);
        let value: serde_json::Value = self
            .client
            .get(url)
            .send()
            .await
            .context("fetch active downloads")?
            .error_for_status()?
            .json()
            .await
            .context("parse active downloads")?;
        Ok(ActiveDownloads::from_value(value))
    }

    async fn delete(&self, job_id: &str) -> anyhow::Result<ActionResponse> {
        let url = self.endpoint(&["api", "delete-torrent", job_id]);
        self.post_action("delete download", url).await
    }
}

/// Picks a human-readable reason out of an error response body.
fn error_message_from_body(status: StatusCode, body: &str) -> String {
    let from_json = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            ["message", "error"].iter().find_map(|k| {
                v.get(*k)
                    .and_then(|m| m.as_str())
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
            })
        });
    from_json.unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_escape_ids() {
        let b = HttpBackend::new("http://127.0.0.1:5000").unwrap();
        assert_eq!(
            b.endpoint(&["api", "torrent-status", "42"]).as_str(),
            "http://127.0.0.1:5000/api/torrent-status/42"
        );
        assert_eq!(
            b.endpoint(&["api", "delete-torrent", "a b/c"]).as_str(),
            "http://127.0.0.1:5000/api/delete-torrent/a%20b%2Fc"
        );
    }

    #[test]
    fn endpoints_keep_base_path() {
        let b = HttpBackend::new("http://host/lotto/").unwrap();
        assert_eq!(
            b.endpoint(&["api", "active-downloads"]).as_str(),
            "http://host/lotto/api/active-downloads"
        );
    }

    #[test]
    fn rejects_unusable_base() {
        assert!(HttpBackend::new("not a url").is_err());
        assert!(HttpBackend::new("mailto:someone@example.com").is_err());
    }

    #[test]
    fn error_body_message_extraction() {
        assert_eq!(
            error_message_from_body(StatusCode::BAD_REQUEST, r#"{"success": false, "message": "no torrent found"}"#),
            "no torrent found"
        );
        assert_eq!(
            error_message_from_body(StatusCode::NOT_FOUND, r#"{"error": "Lottery not found"}"#),
            "Lottery not found"
        );
        assert_eq!(
            error_message_from_body(StatusCode::INTERNAL_SERVER_ERROR, "<html>boom</html>"),
            "HTTP 500"
        );
    }
}
