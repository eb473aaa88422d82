//! Scripted in-memory transport for tests.
//!
//! `MockTransport` is handed to the code under test; the paired `MockServer`
//! lets the test push events, fail connects, drop the live connection and
//! inspect everything the client sent.

use crate::error::{Error, Result};
use crate::protocol::{InboundEvent, OutboundEvent};
use crate::transport::{Transport, TransportConnection};
use crate::types::Namespace;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

type InboundTx = mpsc::UnboundedSender<Result<InboundEvent>>;

#[derive(Default)]
struct Shared {
    fail_remaining: usize,
    attempts: usize,
    sent: Vec<OutboundEvent>,
    current: Option<InboundTx>,
    closed: bool,
}

struct Inner {
    shared: Mutex<Shared>,
    gate: watch::Sender<bool>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Client side of the scripted transport.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

/// Test side of the scripted transport.
#[derive(Clone)]
pub struct MockServer {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub fn new() -> (MockTransport, MockServer) {
        let (gate, _) = watch::channel(true);
        let inner = Arc::new(Inner {
            shared: Mutex::new(Shared::default()),
            gate,
        });
        (
            MockTransport {
                inner: inner.clone(),
            },
            MockServer { inner },
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _namespace: Namespace) -> Result<Box<dyn TransportConnection>> {
        let mut gate = self.inner.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| Error::Generic("mock gate dropped".to_string()))?;

        let mut shared = self.inner.lock();
        shared.attempts += 1;
        if shared.fail_remaining > 0 {
            shared.fail_remaining -= 1;
            return Err(Error::Generic("mock connect refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        shared.current = Some(tx);
        shared.closed = false;
        Ok(Box::new(MockConnection {
            inner: self.inner.clone(),
            inbound: rx,
        }))
    }
}

struct MockConnection {
    inner: Arc<Inner>,
    inbound: mpsc::UnboundedReceiver<Result<InboundEvent>>,
}

#[async_trait]
impl TransportConnection for MockConnection {
    async fn send(&mut self, event: &OutboundEvent) -> Result<()> {
        self.inner.lock().sent.push(event.clone());
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<InboundEvent>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        let mut shared = self.inner.lock();
        shared.closed = true;
        shared.current = None;
    }
}

impl MockServer {
    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.inner.lock().fail_remaining = n;
    }

    /// Park connect attempts until [`MockServer::release_connects`].
    pub fn hold_connects(&self) {
        self.inner.gate.send_replace(false);
    }

    pub fn release_connects(&self) {
        self.inner.gate.send_replace(true);
    }

    /// Push an event on the live connection. Returns false when none is live.
    pub fn push(&self, name: &str, data: Value) -> bool {
        match &self.inner.lock().current {
            Some(tx) => tx.send(Ok(InboundEvent::new(name, data))).is_ok(),
            None => false,
        }
    }

    /// Fail the live connection as if the network dropped.
    pub fn drop_connection(&self) {
        if let Some(tx) = self.inner.lock().current.take() {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().current.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.lock().attempts
    }

    /// Every event the client wrote, across connections.
    pub fn sent(&self) -> Vec<OutboundEvent> {
        self.inner.lock().sent.clone()
    }

    pub fn sent_names(&self) -> Vec<String> {
        self.inner.lock().sent.iter().map(|e| e.name.clone()).collect()
    }

    pub fn clear_sent(&self) {
        self.inner.lock().sent.clear();
    }

    /// Wait until at least `n` events were written.
    pub async fn wait_for_sent(&self, n: usize) {
        for _ in 0..10_000 {
            if self.inner.lock().sent.len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("expected {} sent events, got {:?}", n, self.sent_names());
    }

    /// Wait until a connection is live.
    pub async fn wait_for_connection(&self) {
        for _ in 0..10_000 {
            if self.is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("no connection was established");
    }
}
