//! Mock broker implementation for testing.
//!
//! Behaves like a single RabbitMQ node whose answers can be switched at
//! runtime: ack, nack, refuse connections, channels or confirm mode, or
//! reject publishes on closed channels.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    BrokerConnection, BrokerConnector, BrokerError, Confirmation, OutboundMessage, PendingConfirm,
    PublishChannel, Result, RetryTrigger,
};

/// How the mock broker answers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MockBehavior {
    /// Accept connections and ack every publish.
    #[default]
    Ack,
    /// Accept connections and nack every publish.
    Nack,
    /// Refuse to open connections.
    RefuseConnection,
    /// Open connections but refuse to open channels on them.
    RefuseChannel,
    /// Open connections and channels but refuse confirm mode.
    RefuseConfirmMode,
    /// Reject every publish as if the channel had been closed.
    ClosedChannel,
}

#[derive(Default)]
struct MockState {
    behavior: RwLock<MockBehavior>,
    confirm_delay: RwLock<Duration>,
    published: RwLock<Vec<(String, OutboundMessage)>>,
    channels: RwLock<Vec<Arc<MockChannel>>>,
    /// Trigger handed to each opened connection, in open order.
    triggers: RwLock<Vec<RetryTrigger>>,
    connect_attempts: AtomicUsize,
    connections_opened: AtomicUsize,
    connections_closed: AtomicUsize,
    channels_opened: AtomicUsize,
    channels_closed: AtomicUsize,
}

/// Mock broker for testing.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MockBroker {
    state: Arc<MockState>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::default())
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        let state = MockState {
            behavior: RwLock::new(behavior),
            confirm_delay: RwLock::new(Duration::from_millis(1)),
            ..Default::default()
        };
        Self {
            state: Arc::new(state),
        }
    }

    pub async fn set_behavior(&self, behavior: MockBehavior) {
        *self.state.behavior.write().await = behavior;
    }

    /// Time between accepting a publish and sending its confirmation.
    pub async fn set_confirm_delay(&self, delay: Duration) {
        *self.state.confirm_delay.write().await = delay;
    }

    /// Close every open channel from the broker side, notifying the owner of
    /// each channel the way a real broker connection would.
    pub async fn close_channels(&self) {
        let channels = std::mem::take(&mut *self.state.channels.write().await);
        for channel in channels {
            if !channel.closed.swap(true, Ordering::SeqCst) {
                self.state.channels_closed.fetch_add(1, Ordering::SeqCst);
                channel.trigger.request_reconnect();
            }
        }
    }

    /// Report a transport error on the `index`-th connection ever opened,
    /// whether or not it is still in use.
    pub async fn raise_connection_error(&self, index: usize) {
        if let Some(trigger) = self.state.triggers.read().await.get(index) {
            trigger.request_reconnect();
        }
    }

    pub async fn published(&self) -> Vec<(String, OutboundMessage)> {
        self.state.published.read().await.clone()
    }

    pub async fn published_count(&self) -> usize {
        self.state.published.read().await.len()
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> usize {
        self.state.connections_closed.load(Ordering::SeqCst)
    }

    pub fn channels_opened(&self) -> usize {
        self.state.channels_opened.load(Ordering::SeqCst)
    }

    pub fn channels_closed(&self) -> usize {
        self.state.channels_closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnector for MockBroker {
    async fn open(&self, _url: &str, trigger: RetryTrigger) -> Result<Box<dyn BrokerConnection>> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if *self.state.behavior.read().await == MockBehavior::RefuseConnection {
            return Err(BrokerError::Transport("Mock connection refused".to_string()));
        }
        self.state.connections_opened.fetch_add(1, Ordering::SeqCst);
        self.state.triggers.write().await.push(trigger.clone());
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
            trigger,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
    trigger: RetryTrigger,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn open_channel(&self) -> Result<Arc<dyn PublishChannel>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed);
        }
        if *self.state.behavior.read().await == MockBehavior::RefuseChannel {
            return Err(BrokerError::Transport("Mock channel refused".to_string()));
        }
        let channel = Arc::new(MockChannel {
            state: Arc::clone(&self.state),
            trigger: self.trigger.clone(),
            closed: AtomicBool::new(false),
        });
        self.state.channels_opened.fetch_add(1, Ordering::SeqCst);
        self.state.channels.write().await.push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed);
        }
        self.state.connections_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockChannel {
    state: Arc<MockState>,
    trigger: RetryTrigger,
    closed: AtomicBool,
}

#[async_trait]
impl PublishChannel for MockChannel {
    async fn enable_confirms(&self) -> Result<()> {
        if *self.state.behavior.read().await == MockBehavior::RefuseConfirmMode {
            return Err(BrokerError::Transport(
                "Mock confirm mode refused".to_string(),
            ));
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<PendingConfirm> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed);
        }
        let confirmation = match *self.state.behavior.read().await {
            MockBehavior::ClosedChannel => return Err(BrokerError::ChannelClosed),
            MockBehavior::Nack => Confirmation::Nack,
            _ => Confirmation::Ack,
        };

        self.state
            .published
            .write()
            .await
            .push((exchange.to_string(), message));

        let delay = *self.state.confirm_delay.read().await;
        Ok(PendingConfirm::new(Box::pin(async move {
            tokio::time::sleep(delay).await;
            confirmation
        })))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed);
        }
        self.state.channels_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
