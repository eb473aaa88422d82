//! WebSocket implementation of the [`Transport`] seam.
//!
//! Connects to `{base_url}/{namespace}` and speaks JSON text frames
//! (see [`crate::protocol`]).

use crate::error::{Error, Result};
use crate::protocol::{InboundEvent, OutboundEvent};
use crate::transport::{Transport, TransportConnection};
use crate::types::Namespace;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{
    client_async_tls_with_config,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

/// Default TCP connect timeout per resolved address.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket transport. One instance serves every namespace.
#[derive(Debug, Clone)]
pub struct WsTransport {
    base_url: Url,
    bearer_token: Option<String>,
    connect_timeout: Duration,
}

impl WsTransport {
    /// Create a transport rooted at `base_url` (e.g. `wss://rt.example.com/ws`).
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: Url::parse(base_url)?,
            bearer_token: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Attach a bearer token to every handshake.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Endpoint URL for a namespace.
    pub fn endpoint(&self, namespace: Namespace) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Generic(format!("URL cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .push(namespace.as_str());
        Ok(url)
    }

    /// Resolve the host and open a TCP stream, trying IPv4 addresses first.
    async fn connect_tcp(&self, url: &Url) -> Result<TcpStream> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::Generic("No host in URL".to_string()))?;
        let port = url.port_or_known_default().unwrap_or(443);

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::Generic(format!("DNS resolution failed: {}", e)))?
            .collect();

        // Prefer IPv4 to avoid IPv6 timeout issues
        let mut sorted_addrs: Vec<SocketAddr> =
            addrs.iter().filter(|a| a.is_ipv4()).copied().collect();
        sorted_addrs.extend(addrs.iter().filter(|a| a.is_ipv6()).copied());

        debug!("Resolved {} (IPv4 first): {:?}", host, sorted_addrs);

        for addr in &sorted_addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    debug!("TCP connected to {}", addr);
                    return Ok(stream);
                }
                Ok(Err(e)) => debug!("TCP connect to {} failed: {}", addr, e),
                Err(_) => debug!("TCP connect to {} timed out", addr),
            }
        }

        Err(Error::Generic(format!(
            "All connection attempts to {} failed",
            host
        )))
    }

    fn tls_connector() -> Result<Connector> {
        let mut root_store = rustls::RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            let _ = root_store.add(cert);
        }

        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Generic(format!("TLS config error: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Connector::Rustls(Arc::new(config)))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, namespace: Namespace) -> Result<Box<dyn TransportConnection>> {
        let url = self.endpoint(namespace)?;
        info!("[{}] Connecting to WebSocket: {}", namespace, url);

        let tcp_stream = self.connect_tcp(&url).await?;

        let mut request = url.as_str().into_client_request()?;
        if let Some(token) = &self.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| Error::Generic(format!("Invalid bearer token: {}", e)))?;
            request.headers_mut().insert("Authorization", value);
        }

        let connector = if url.scheme() == "wss" {
            Some(Self::tls_connector()?)
        } else {
            None
        };

        let (stream, response) =
            client_async_tls_with_config(request, tcp_stream, None, connector).await?;

        debug!(
            "[{}] WebSocket handshake complete, status: {:?}",
            namespace,
            response.status()
        );

        Ok(Box::new(WsConnection { namespace, stream }))
    }
}

/// A live WebSocket session.
pub struct WsConnection {
    namespace: Namespace,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportConnection for WsConnection {
    async fn send(&mut self, event: &OutboundEvent) -> Result<()> {
        let frame = event.to_frame()?;
        self.stream.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<InboundEvent>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => match InboundEvent::from_frame(&text) {
                    Ok(event) => return Some(Ok(event)),
                    Err(e) => {
                        warn!("[{}] Skipping malformed frame: {}", self.namespace, e);
                    }
                },
                Ok(Message::Ping(data)) => {
                    debug!("[{}] Received ping, sending pong", self.namespace);
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        return Some(Err(e.into()));
                    }
                }
                Ok(Message::Pong(_)) => {
                    debug!("[{}] Received pong", self.namespace);
                }
                Ok(Message::Close(frame)) => {
                    info!("[{}] Received close frame: {:?}", self.namespace, frame);
                    return None;
                }
                Ok(Message::Binary(_)) | Ok(Message::Frame(_)) => {
                    // Not part of the protocol
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn heartbeat(&mut self) -> Result<()> {
        debug!("[{}] Sending ping", self.namespace);
        self.stream.send(Message::Ping(vec![])).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let close_frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "Shutdown".into(),
        };
        if let Err(e) = self.stream.close(Some(close_frame)).await {
            debug!("[{}] Close handshake failed: {}", self.namespace, e);
        }
    }
}
