//! HTTP implementation of [`PlatformApi`].

use crate::api::PlatformApi;
use crate::error::{Error, Result};
use crate::types::{ChannelBadges, ChannelKind, MessagePage, ResolveChannelResponse, ViewerCount};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use tracing::debug;
use url::Url;

/// Platform REST API client.
#[derive(Debug, Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl PlatformClient {
    /// Create a client rooted at `base_url` (no trailing slash needed).
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token: None,
        }
    }

    /// Attach a bearer token to every request.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The base URL with `segments` appended, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// GET the endpoint at `segments` with `query` and decode the JSON body.
    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<T> {
        let url = self.endpoint(segments)?;
        debug!("GET {} {:?}", url, query);

        let mut request = self.http.get(url).query(query);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(Error::Api(format!(
                "API returned status {}: {}",
                response.status(),
                response.text().await.unwrap_or_default()
            )));
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl PlatformApi for PlatformClient {
    async fn resolve_channel(&self, kind: ChannelKind, ref_id: &str) -> Result<String> {
        let resp: ResolveChannelResponse = self
            .get_json(
                &["chat", "channels", "resolve"],
                &[("kind", kind.as_str()), ("refId", ref_id)],
            )
            .await?;

        resp.channel_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::ChannelNotFound(format!("{} {}", kind, ref_id)))
    }

    async fn fetch_messages(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<MessagePage> {
        let limit = limit.to_string();
        let mut query = vec![("limit", limit.as_str())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }

        let page: MessagePage = self
            .get_json(&["chat", "channels", channel_id, "messages"], &query)
            .await?;

        if let Some(foreign) = page.messages.iter().find(|m| m.channel_id != channel_id) {
            return Err(Error::InvalidResponse(format!(
                "message {} belongs to channel {}, expected {}",
                foreign.id, foreign.channel_id, channel_id
            )));
        }

        debug!(
            "Fetched {} messages for channel {} (next cursor: {:?})",
            page.messages.len(),
            channel_id,
            page.next_cursor
        );
        Ok(page)
    }

    async fn fetch_badges(&self, channel_id: &str) -> Result<ChannelBadges> {
        let raw: HashMap<String, Vec<String>> = self
            .get_json(&["chat", "channels", channel_id, "badges"], &[])
            .await?;

        Ok(raw
            .into_iter()
            .map(|(user_id, badges)| (user_id, badges.into_iter().collect()))
            .collect())
    }

    async fn fetch_viewer_counts(&self) -> Result<Vec<ViewerCount>> {
        self.get_json(&["matches", "viewers"], &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the raw request head.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut head = Vec::new();
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&head).to_string()
        });

        (base, handle)
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = PlatformClient::new("https://api.example.com/");
        assert_eq!(client.base_url(), "https://api.example.com");
    }

    #[tokio::test]
    async fn test_resolve_channel_sends_kind_and_ref() {
        let (base, server) = serve_once("200 OK", r#"{"channelId":"c-77"}"#).await;
        let client = PlatformClient::new(base).with_bearer_token("secret");

        let id = client.resolve_channel(ChannelKind::Match, "42").await.unwrap();
        assert_eq!(id, "c-77");

        let head = server.await.unwrap();
        assert!(head.starts_with("GET /chat/channels/resolve?kind=match&refId=42 "));
        assert!(head.to_lowercase().contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn test_resolve_channel_missing_id() {
        let (base, _server) = serve_once("200 OK", r#"{}"#).await;
        let client = PlatformClient::new(base);

        let err = client
            .resolve_channel(ChannelKind::Competition, "7")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelNotFound(_)));
    }

    #[tokio::test]
    async fn test_fetch_messages_with_cursor() {
        let body = r#"{"messages":[{"id":"m2","channelId":"c1","authorId":"u","body":"b","createdAt":"2024-05-01T10:00:01Z"}],"nextCursor":"k2"}"#;
        let (base, server) = serve_once("200 OK", body).await;
        let client = PlatformClient::new(base);

        let page = client.fetch_messages("c1", Some("k1"), 20).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("k2"));

        let head = server.await.unwrap();
        assert!(head.starts_with("GET /chat/channels/c1/messages?limit=20&cursor=k1 "));
    }

    #[tokio::test]
    async fn test_channel_id_is_path_encoded() {
        let (base, server) = serve_once("200 OK", r#"{"messages":[]}"#).await;
        let client = PlatformClient::new(format!("{}/api/", base));

        client.fetch_messages("c/1?x#y", None, 5).await.unwrap();

        let head = server.await.unwrap();
        assert!(head.starts_with("GET /api/chat/channels/c%2F1%3Fx%23y/messages?limit=5 "));
    }

    #[test]
    fn test_invalid_base_url() {
        let client = PlatformClient::new("not a url");
        assert!(matches!(client.endpoint(&["matches"]), Err(Error::Url(_))));
    }

    #[tokio::test]
    async fn test_fetch_messages_rejects_foreign_channel() {
        let body = r#"{"messages":[{"id":"m2","channelId":"other","authorId":"u","body":"b","createdAt":"2024-05-01T10:00:01Z"}]}"#;
        let (base, _server) = serve_once("200 OK", body).await;
        let client = PlatformClient::new(base);

        let err = client.fetch_messages("c1", None, 20).await.unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_non_success_status_is_api_error() {
        let (base, _server) = serve_once("503 Service Unavailable", r#"{"error":"down"}"#).await;
        let client = PlatformClient::new(base);

        let err = client.fetch_viewer_counts().await.unwrap_err();
        match err {
            Error::Api(msg) => assert!(msg.contains("503")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_badges_collects_sets() {
        let (base, _server) = serve_once("200 OK", r#"{"u1":["mod","vip","mod"]}"#).await;
        let client = PlatformClient::new(base);

        let badges = client.fetch_badges("c1").await.unwrap();
        let u1 = badges.get("u1").unwrap();
        assert_eq!(u1.len(), 2);
        assert!(u1.contains("mod"));
    }
}
