//! The remote service seam: configuration check, snapshot reads and push
//! subscriptions.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crew_core::Resource;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;
use url::Url;

/// Text chunks from a push subscription. Each chunk holds one or more
/// NDJSON frames. A `MalformedEvent` item is skipped; any other error ends the
/// subscription.
pub type PushStream = BoxStream<'static, SyncResult<String>>;

/// Result of the configuration check. Only a display-safe host ever
/// crosses this boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigStatus {
    pub configured: bool,
    pub api_host: Option<String>,
}

impl ConfigStatus {
    pub fn not_configured() -> Self {
        Self::default()
    }
}

pub trait RemoteService: Send + Sync + 'static {
    fn check_configured(&self) -> impl Future<Output = SyncResult<ConfigStatus>> + Send;

    fn fetch_snapshot(
        &self,
        resource: Resource,
    ) -> impl Future<Output = SyncResult<Vec<Value>>> + Send;

    fn open_stream(
        &self,
        resource: Resource,
        cursor: Option<String>,
    ) -> impl Future<Output = SyncResult<PushStream>> + Send;
}

impl<R: RemoteService> RemoteService for Arc<R> {
    fn check_configured(&self) -> impl Future<Output = SyncResult<ConfigStatus>> + Send {
        (**self).check_configured()
    }

    fn fetch_snapshot(
        &self,
        resource: Resource,
    ) -> impl Future<Output = SyncResult<Vec<Value>>> + Send {
        (**self).fetch_snapshot(resource)
    }

    fn open_stream(
        &self,
        resource: Resource,
        cursor: Option<String>,
    ) -> impl Future<Output = SyncResult<PushStream>> + Send {
        (**self).open_stream(resource, cursor)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigResponse {
    #[serde(default)]
    configured: bool,
    #[serde(default)]
    api_host: Option<String>,
}

/// HTTP + WebSocket client for the brokering proxy.
#[derive(Clone, Debug)]
pub struct HttpRemote {
    client: reqwest::Client,
    api_url: Url,
    stream_url: Url,
}

impl HttpRemote {
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| SyncError::InvalidConfig(format!("http client: {err}")))?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            stream_url: config.stream_base()?,
        })
    }

    fn endpoint(base: &Url, segments: &[&str]) -> SyncResult<Url> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidConfig(format!("url cannot be a base: {base}")))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn config_url(&self) -> SyncResult<Url> {
        Self::endpoint(&self.api_url, &["api", "config"])
    }

    pub fn snapshot_url(&self, resource: Resource) -> SyncResult<Url> {
        Self::endpoint(&self.api_url, &["api", resource.as_str()])
    }

    pub fn stream_url(&self, resource: Resource, cursor: Option<&str>) -> SyncResult<Url> {
        let mut url = Self::endpoint(&self.stream_url, &["api", resource.as_str(), "stream"])?;
        if let Some(cursor) = cursor {
            url.query_pairs_mut().append_pair("cursor", cursor);
        }
        Ok(url)
    }
}

impl RemoteService for HttpRemote {
    async fn check_configured(&self) -> SyncResult<ConfigStatus> {
        let url = self.config_url()?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| SyncError::ConfigUnavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SyncError::ConfigUnavailable(format!(
                "config endpoint returned {}",
                response.status()
            )));
        }
        let body: ConfigResponse = response
            .json()
            .await
            .map_err(|err| SyncError::ConfigUnavailable(err.to_string()))?;
        Ok(ConfigStatus {
            configured: body.configured,
            api_host: body.api_host.filter(|host| !host.trim().is_empty()),
        })
    }

    async fn fetch_snapshot(&self, resource: Resource) -> SyncResult<Vec<Value>> {
        let url = self.snapshot_url(resource)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| SyncError::Poll(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SyncError::Poll(format!(
                "{resource} snapshot returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| SyncError::Poll(err.to_string()))?;
        snapshot_rows(resource, body)
    }

    async fn open_stream(
        &self,
        resource: Resource,
        cursor: Option<String>,
    ) -> SyncResult<PushStream> {
        let url = self.stream_url(resource, cursor.as_deref())?;
        debug!(resource = %resource, url = %url, "stream_connect");
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SyncError::Transport(err.to_string()))?;
        let stream = socket.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => Some(
                    String::from_utf8(bytes)
                        .map_err(|err| SyncError::MalformedEvent(err.to_string())),
                ),
                Ok(_) => None,
                Err(err) => Some(Err(SyncError::Transport(err.to_string()))),
            }
        });
        Ok(stream.boxed())
    }
}

/// Accept a bare array, or an object holding it under `items`, `data` or the
/// resource name.
pub fn snapshot_rows(resource: Resource, body: Value) -> SyncResult<Vec<Value>> {
    match body {
        Value::Array(rows) => Ok(rows),
        Value::Object(mut map) => {
            for key in ["items", "data", resource.as_str()] {
                if let Some(Value::Array(rows)) = map.remove(key) {
                    return Ok(rows);
                }
            }
            Err(SyncError::Poll(format!(
                "{resource} snapshot body has no row array"
            )))
        }
        other => Err(SyncError::Poll(format!(
            "{resource} snapshot body is not a list: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn remote(api_url: &str) -> HttpRemote {
        HttpRemote::new(&SyncConfig::parse(api_url).expect("config")).expect("remote")
    }

    #[test]
    fn endpoints_are_rooted_under_api() {
        let remote = remote("https://proxy.example.com/crew/");
        assert_eq!(
            remote.config_url().expect("config").as_str(),
            "https://proxy.example.com/crew/api/config"
        );
        assert_eq!(
            remote.snapshot_url(Resource::Channels).expect("snapshot").as_str(),
            "https://proxy.example.com/crew/api/channels"
        );
        assert_eq!(
            remote
                .stream_url(Resource::Messages, Some("evt 9"))
                .expect("stream")
                .as_str(),
            "wss://proxy.example.com/crew/api/messages/stream?cursor=evt+9"
        );
    }

    #[test]
    fn snapshot_rows_unwraps_common_envelopes() {
        assert_eq!(
            snapshot_rows(Resource::Agents, json!([{ "id": "a" }])).expect("array"),
            vec![json!({ "id": "a" })]
        );
        assert_eq!(
            snapshot_rows(Resource::Agents, json!({ "items": [{ "id": "b" }] })).expect("items"),
            vec![json!({ "id": "b" })]
        );
        assert_eq!(
            snapshot_rows(Resource::Messages, json!({ "messages": [] })).expect("named"),
            Vec::<Value>::new()
        );
        assert!(matches!(
            snapshot_rows(Resource::Channels, json!({ "count": 0 })),
            Err(SyncError::Poll(_))
        ));
    }
}
