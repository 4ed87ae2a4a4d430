//! In-memory transport mock for testing the sync manager.
//!
//! Records connect attempts (with timestamps, for backoff assertions)
//! and hands tests a server-side handle to push frames or close the
//! connection.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::transport::{SocketConnection, SocketTransport};
use super::SyncError;

enum ServerFrame {
    Text(String),
    Close,
}

/// Server side of one accepted mock connection.
#[derive(Clone)]
pub struct MockServerHandle {
    tx: mpsc::UnboundedSender<ServerFrame>,
}

impl MockServerHandle {
    /// Push a text frame to the client.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.tx.send(ServerFrame::Text(text.into()));
    }

    /// Close the connection from the server side.
    pub fn close(&self) {
        let _ = self.tx.send(ServerFrame::Close);
    }
}

#[derive(Default)]
struct MockTransportState {
    refuse: usize,
    servers: Vec<MockServerHandle>,
    connect_times: Vec<Instant>,
    urls: Vec<String>,
    sent: Vec<String>,
}

/// Scriptable transport.
#[derive(Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockTransportState>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, MockTransportState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refuse the next `n` connect attempts.
    pub fn refuse_next(&self, n: usize) {
        self.lock().refuse = n;
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connect_times.len()
    }

    /// Timestamps of every connect attempt, accepted or refused.
    pub fn connect_times(&self) -> Vec<Instant> {
        self.lock().connect_times.clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.lock().urls.clone()
    }

    /// Everything clients sent, across all connections.
    pub fn sent_messages(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Server handle for the most recent accepted connection.
    pub fn latest_server(&self) -> Option<MockServerHandle> {
        self.lock().servers.last().cloned()
    }
}

struct MockConnection {
    rx: mpsc::UnboundedReceiver<ServerFrame>,
    state: Arc<Mutex<MockTransportState>>,
}

#[async_trait]
impl SocketConnection for MockConnection {
    async fn send_text(&mut self, text: String) -> Result<(), SyncError> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .sent
            .push(text);
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String, SyncError>> {
        match self.rx.recv().await {
            Some(ServerFrame::Text(text)) => Some(Ok(text)),
            Some(ServerFrame::Close) | None => None,
        }
    }
}

#[async_trait]
impl SocketTransport for MockTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn SocketConnection>, SyncError> {
        let (tx, rx) = {
            let mut state = self.lock();
            state.connect_times.push(Instant::now());
            state.urls.push(url.to_string());

            if state.refuse > 0 {
                state.refuse -= 1;
                return Err(SyncError::Connect("connection refused".to_string()));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            state.servers.push(MockServerHandle { tx: tx.clone() });
            (tx, rx)
        };
        drop(tx);

        Ok(Box::new(MockConnection {
            rx,
            state: self.state.clone(),
        }))
    }
}
