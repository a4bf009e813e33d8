//! The cooperative run loop.
//!
//! One task owns the node and the transport. Every iteration fires actors
//! and advances state machines ([`Node::tick`]), sends what the node queued,
//! optionally checkpoints, then waits for one inbound frame, an actor timer
//! or the inactivity timeout, whichever comes first.
//!
//! Connection loss is always recoverable: the node reverts in-flight
//! requests and the loop reconnects to the next proxy URI after
//! `reconnect_delay`. Only a stop request ends the loop.

use std::time::Duration;

use minnow_transport::{NetworkProvider, TransportClient, TransportError};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::actor::ActorRegistry;
use crate::config::NodeConfig;
use crate::error::{ConfigError, NodeError};
use crate::node::{Node, NodeState};
use crate::persist::StateStore;

/// Requests a running [`Scheduler`] to stop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl StopHandle {
    /// Ask the loop to stop after the current iteration.
    pub fn stop(&self) {
        // The scheduler keeps its own sender, so the channel stays open.
        let _ = self.tx.send(());
    }
}

/// Owner of a node and its proxy connection.
pub struct Scheduler<N: NetworkProvider> {
    node: Node,
    client: TransportClient<N>,
    store: Option<Box<dyn StateStore>>,
    next_uri: usize,
    stop_tx: mpsc::UnboundedSender<()>,
    stop_rx: mpsc::UnboundedReceiver<()>,
}

enum Wake {
    Stop,
    Frame(bytes::Bytes),
    Idle,
    Lost(TransportError),
}

impl<N: NetworkProvider> Scheduler<N> {
    /// Drive `node` over `network`.
    pub fn new(node: Node, network: N) -> Self {
        let client = TransportClient::new(network, node.config().transport().clone());
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        Self {
            node,
            client,
            store: None,
            next_uri: 0,
            stop_tx,
            stop_rx,
        }
    }

    /// Build the node from `store` when it holds a snapshot, fresh otherwise.
    pub async fn restore(
        config: NodeConfig,
        registry: ActorRegistry,
        network: N,
        store: Box<dyn StateStore>,
    ) -> Result<Self, NodeError> {
        let node = match store.load().await? {
            Some(snapshot) => Node::restore(config, registry, snapshot)?,
            None => Node::new(config, registry),
        };
        Ok(Self::new(node, network).with_store(store))
    }

    /// Persist state to `store`.
    pub fn with_store(mut self, store: Box<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Handle for stopping the loop from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// The node driven by this scheduler.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// The node, mutably, for deploying actors before or between runs.
    pub fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }

    /// Run until stopped. The node state is saved on the way out.
    pub async fn run(&mut self) -> Result<(), NodeError> {
        let uris = self.node.config().proxy_uris().to_vec();
        if uris.is_empty() {
            return Err(ConfigError::Invalid("no proxy URI configured".to_string()).into());
        }
        let delay = self.node.config().reconnect_delay();
        let mut failed = 0usize;

        tracing::info!(node = %self.node.id(), proxies = uris.len(), "scheduler started");
        while self.node.state() != NodeState::Stop {
            if !self.client.is_connected() {
                let uri = &uris[self.next_uri % uris.len()];
                self.next_uri = self.next_uri.wrapping_add(1);
                let connected = tokio::select! {
                    _ = self.stop_rx.recv() => {
                        self.node.stop();
                        break;
                    }
                    r = self.client.connect(uri, self.node.id()) => r,
                };
                match connected {
                    Ok(proxy_id) => {
                        failed = 0;
                        self.node.on_connected(&proxy_id);
                    }
                    Err(e) => {
                        tracing::warn!(proxy = %uri, error = %e, "connect failed");
                        failed += 1;
                        if failed % uris.len() == 0 && !self.pause(delay).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            if let Err(e) = self.step().await {
                tracing::warn!(error = %e, "connection lost");
                self.client.disconnect();
                self.node.on_disconnected();
                if !self.pause(delay).await {
                    break;
                }
            }
        }

        self.client.disconnect();
        self.save().await;
        tracing::info!(node = %self.node.id(), "scheduler stopped");
        Ok(())
    }

    /// One iteration on a connected transport.
    async fn step(&mut self) -> Result<(), TransportError> {
        let now = Instant::now();
        let fired = self.node.tick(now);

        for frame in self.node.take_outbox() {
            self.client.send(&frame).await?;
        }

        if self.node.config().checkpoint() && self.node.take_dirty() {
            self.save().await;
        }

        let wait = if fired {
            Duration::ZERO
        } else {
            self.wait_time(now)
        };
        match self.wait(wait).await {
            Wake::Stop => self.node.stop(),
            Wake::Frame(frame) => {
                if let Err(e) = self.node.handle_frame(&frame) {
                    tracing::warn!(error = %e, "dropped inbound frame");
                }
            }
            Wake::Idle => {}
            Wake::Lost(e) => return Err(e),
        }
        Ok(())
    }

    fn wait_time(&self, now: Instant) -> Duration {
        let inactivity = self.node.config().inactivity_timeout();
        match self.node.next_deadline() {
            Some(deadline) => inactivity.min(deadline.saturating_duration_since(now)),
            None => inactivity,
        }
    }

    async fn wait(&mut self, wait: Duration) -> Wake {
        tokio::select! {
            _ = self.stop_rx.recv() => Wake::Stop,
            r = tokio::time::timeout(wait, self.client.receive()) => match r {
                Ok(Ok(frame)) => Wake::Frame(frame),
                Ok(Err(e)) => Wake::Lost(e),
                Err(_) => Wake::Idle,
            },
        }
    }

    /// Sleep before reconnecting; false when a stop arrived meanwhile.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.stop_rx.recv() => {
                self.node.stop();
                false
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn save(&mut self) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let snapshot = match self.node.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "failed to snapshot node");
                return;
            }
        };
        if let Err(e) = store.save(&snapshot).await {
            tracing::error!(error = %e, "failed to save node state");
        }
    }
}
