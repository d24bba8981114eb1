//! Cross-instance invalidation
//!
//! Wire format and background listener for the invalidation channel. Every
//! write on one node publishes `"{node_id}:{key}"`; every node's listener
//! drops that key from its own L1 unless the message is its own echo.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::traits::{L2CacheBackend, MessageStream};

/// Default pub/sub channel for invalidation messages
pub const DEFAULT_CHANNEL: &str = "cache:invalidation";

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// One invalidation event: `key` was written or deleted by `node_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationMessage {
    pub node_id: String,
    pub key: String,
}

impl InvalidationMessage {
    pub fn new(node_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            key: key.into(),
        }
    }

    /// Serialize to the `"{node_id}:{key}"` wire form
    #[must_use]
    pub fn encode(&self) -> String {
        format!("{}:{}", self.node_id, self.key)
    }

    /// Parse the wire form
    ///
    /// Splits on the first `:` so keys may contain colons themselves. Node ids
    /// never do. A payload without a separator, with an empty node id or with
    /// an empty key is rejected.
    pub fn parse(payload: &str) -> Option<Self> {
        let (node_id, key) = payload.split_once(':')?;
        if node_id.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self::new(node_id, key))
    }
}

/// Supervised background task consuming the invalidation channel
///
/// Per-message handler errors are logged and never end the loop. When the
/// subscription stream ends the listener resubscribes after a delay. Dropping
/// the listener aborts the task; `shutdown` stops it and waits for it.
pub struct InvalidationListener {
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl InvalidationListener {
    /// Spawn the listener on an already established subscription
    pub fn start<F, Fut>(
        l2: Arc<dyn L2CacheBackend>,
        channel: String,
        stream: MessageStream,
        handler: F,
    ) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move {
            let mut stream = Some(stream);

            loop {
                if let Some(active) = stream.take() {
                    if Self::consume(&channel, active, &handler, &mut shutdown_rx).await {
                        break;
                    }
                    warn!(channel = %channel, "Invalidation stream ended, resubscribing");
                }

                tokio::select! {
                    () = tokio::time::sleep(RESUBSCRIBE_DELAY) => {},
                    _ = shutdown_rx.recv() => break,
                }

                match l2.subscribe(&channel).await {
                    Ok(Some(fresh)) => {
                        info!(channel = %channel, "Resubscribed to invalidation channel");
                        stream = Some(fresh);
                    }
                    Ok(None) => warn!(channel = %channel, "Invalidation channel unavailable, retrying"),
                    Err(e) => error!(channel = %channel, error = %e, "Resubscribe failed, retrying"),
                }
            }

            info!(channel = %channel, "Invalidation listener stopped");
        });

        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Drain one subscription; returns `true` when shutdown was requested
    async fn consume<F, Fut>(
        channel: &str,
        mut stream: MessageStream,
        handler: &F,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> bool
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        loop {
            tokio::select! {
                next = stream.next() => {
                    let Some(payload) = next else {
                        return false;
                    };
                    if let Err(e) = handler(payload).await {
                        warn!(channel = %channel, error = %e, "Invalidation message skipped");
                    }
                }
                _ = shutdown_rx.recv() => return true,
            }
        }
    }

    /// Whether the background task is still alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the task and wait until it has exited
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Invalidation listener panicked");
                }
            }
        }
    }
}

impl Drop for InvalidationListener {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
