//! Typed HTTP client for the backend control surface.
//!
//! All JSON routes go through one request/response path so non-2xx responses
//! turn into [`BackendError`](crate::error::BackendError)s carrying the raw
//! body. Artifact downloads are streamed; the response content type is handed
//! to the caller untouched.

pub mod history;
pub mod stats;
pub mod ws;

use futures_util::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::debug;
use url::Url;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::FileInfo;

pub use history::{HistoryEntry, HistoryResp, PromptRecord, StatusMessage, StatusRecord};
pub use stats::{DeviceInfo, StatsResp, SystemInfo};
pub use ws::{FrameSink, WsSubscription};

const PATH_PROMPT: &str = "/api/prompt";
const PATH_HISTORY: &str = "/api/history";
const PATH_VIEW: &str = "/api/view";
const PATH_SYSTEM_STATS: &str = "/api/system_stats";
// route added by the VHS extension
const PATH_VIEW_VIDEO: &str = "/api/vhs/viewvideo";
// route added by the manager extension
const PATH_REBOOT: &str = "/api/manager/reboot";

/// Response of a prompt submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueuePromptResp {
    #[serde(default)]
    pub prompt_id: String,
    #[serde(default)]
    pub number: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_errors: Option<serde_json::Value>,
}

/// Queue status returned by `GET /api/prompt`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetPromptResp {
    #[serde(default)]
    pub exec_info: crate::protocol::ExecInfo,
}

/// Submission envelope for `POST /api/prompt`.
#[derive(Debug, Clone, Serialize)]
pub struct PromptEnvelope {
    pub prompt: serde_json::Value,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<serde_json::Value>,
}

/// A streamed artifact download.
pub struct ViewPayload {
    pub content_type: String,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

/// HTTP client bound to one backend endpoint.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: Url,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.endpoint,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(path);
        url
    }

    /// Turn a non-2xx response into a backend error carrying the raw body.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let status_text = status.to_string();
        let body = response.text().await.unwrap_or_default();
        Err(Error::backend(body, &status_text))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let mut request = self.http.get(self.url(path));
        if !query.is_empty() {
            request = request.query(query);
        }
        let response = request.send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Submit a prompt to the queue.
    pub async fn queue_prompt(&self, envelope: &PromptEnvelope) -> Result<QueuePromptResp> {
        let response = self
            .http
            .post(self.url(PATH_PROMPT))
            .json(envelope)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Current queue status.
    pub async fn get_prompt(&self) -> Result<GetPromptResp> {
        self.get_json(PATH_PROMPT, &[]).await
    }

    /// Execution history, newest first, at most `max_items` entries.
    pub async fn get_history(&self, max_items: u32) -> Result<HistoryResp> {
        if max_items > 0 {
            self.get_json(PATH_HISTORY, &[("max_items", max_items.to_string().as_str())])
                .await
        } else {
            self.get_json(PATH_HISTORY, &[]).await
        }
    }

    /// System and device statistics.
    pub async fn system_stats(&self) -> Result<StatsResp> {
        self.get_json(PATH_SYSTEM_STATS, &[]).await
    }

    /// Download a rendered artifact.
    pub async fn get_view(&self, file: &FileInfo) -> Result<ViewPayload> {
        self.stream_view(PATH_VIEW, file).await
    }

    /// Download a rendered video (VHS route; the body is always webm).
    pub async fn get_view_video(&self, file: &FileInfo) -> Result<ViewPayload> {
        self.stream_view(PATH_VIEW_VIDEO, file).await
    }

    async fn stream_view(&self, path: &str, file: &FileInfo) -> Result<ViewPayload> {
        let response = self
            .http
            .get(self.url(path))
            .query(&[
                ("filename", file.filename.as_str()),
                ("subfolder", file.subfolder.as_str()),
                ("type", file.kind.as_str()),
            ])
            .send()
            .await?;
        let response = Self::check(response).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(ViewPayload {
            content_type,
            reader: Box::new(StreamReader::new(stream)),
        })
    }

    /// Ask the manager extension to restart the backend process. The response
    /// body, if any, is discarded.
    pub async fn reboot(&self) -> Result<()> {
        let response = self.http.get(self.url(PATH_REBOOT)).send().await?;
        debug!(status = %response.status(), "reboot requested");
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_prompt_resp_decodes() {
        let resp: QueuePromptResp = serde_json::from_str(
            r#"{"prompt_id": "abc", "number": 3, "node_errors": {}}"#,
        )
        .unwrap();
        assert_eq!(resp.prompt_id, "abc");
        assert_eq!(resp.number, 3);
        assert!(resp.node_errors.is_some());
    }

    #[test]
    fn get_prompt_resp_decodes_queue_depth() {
        let resp: GetPromptResp =
            serde_json::from_str(r#"{"exec_info": {"queue_remaining": 2}}"#).unwrap();
        assert_eq!(resp.exec_info.queue_remaining, 2);
    }

    #[test]
    fn envelope_omits_missing_extra_data() {
        let envelope = PromptEnvelope {
            prompt: serde_json::json!({}),
            client_id: "c1".into(),
            extra_data: None,
        };
        let raw = serde_json::to_string(&envelope).unwrap();
        assert!(!raw.contains("extra_data"));
    }
}
