//! Broker connection supervisor.
//!
//! Owns the single (connection, channel) pair used for publishing and keeps
//! it alive. Failures anywhere (initial connect, broker-side close, transport
//! errors) end up as a `RetrySignal::Reconnect` on a single-slot queue that a
//! background worker drains:
//!
//! ```text
//!  Idle ──connect──> Connecting ──ok──> Live
//!                        │                 │ broker closed / error
//!                        └─fail─> RetryPending <┘
//!                                     │ backoff, then Connecting
//!  any ──shutdown──> Stopped
//! ```
//!
//! Publishers take a snapshot of the current channel with [`Supervisor::channel`];
//! only the worker (and the initial connect) replace it, as one swap of the
//! whole session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{
    BrokerConnection, BrokerConnector, BrokerEndpoint, BrokerError, PublishChannel, RetrySignal,
    RetryTrigger,
};

/// Errors raised while establishing the broker session.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to connect to broker: {0}")]
    Connect(BrokerError),

    #[error("Failed to enable publisher confirms: {0}")]
    ConfirmMode(BrokerError),

    #[error("Supervisor is stopped")]
    Stopped,
}

/// Lifecycle of the supervised broker link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Nothing attempted yet.
    Idle,
    /// A connect attempt is in flight.
    Connecting,
    /// A confirm-mode channel is installed.
    Live,
    /// The last attempt failed; a retry is scheduled.
    RetryPending,
    /// Shut down; no further attempts will be made.
    Stopped,
}

/// Pacing for consecutive failed reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry after a failure.
    pub min_delay: Duration,
    /// Delay cap.
    pub max_delay: Duration,
    /// Randomize delays to avoid synchronized reconnect storms.
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl ReconnectConfig {
    fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(usize::MAX);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

/// One live connection and the confirm-mode channel opened on it.
struct Session {
    connection: Box<dyn BrokerConnection>,
    channel: Arc<dyn PublishChannel>,
    /// Trigger handed to the transport for this session only.
    trigger: RetryTrigger,
}

impl Session {
    /// Close channel then connection. Errors are logged, never returned.
    async fn close(&self, reason: &str) {
        self.trigger.retire();
        info!(reason, "Closing broker channel");
        if let Err(e) = self.channel.close().await {
            warn!(error = %e, reason, "Failed to close broker channel");
        }
        info!(reason, "Closing broker connection");
        if let Err(e) = self.connection.close().await {
            warn!(error = %e, reason, "Failed to close broker connection");
        }
    }
}

struct Shared {
    endpoint: BrokerEndpoint,
    connector: Arc<dyn BrokerConnector>,
    session: RwLock<Option<Arc<Session>>>,
    trigger: RetryTrigger,
    state: watch::Sender<LinkState>,
    stopped: AtomicBool,
}

impl Shared {
    async fn connect(&self) -> Result<(), SupervisorError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SupervisorError::Stopped);
        }

        self.state.send_replace(LinkState::Connecting);
        info!(
            url = %self.endpoint.redacted_url(),
            exchange = %self.endpoint.exchange,
            "Connecting to broker"
        );

        let session = match self.open_session().await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                error!(error = %e, "Failed to connect to broker, waiting for a retry");
                self.state.send_replace(LinkState::RetryPending);
                self.trigger.request_reconnect();
                return Err(e);
            }
        };

        let previous = {
            let mut current = self.session.write().await;
            if self.stopped.load(Ordering::SeqCst) {
                drop(current);
                session.close("supervisor stopped during connect").await;
                return Err(SupervisorError::Stopped);
            }
            let previous = current.replace(Arc::clone(&session));
            // Errors the old transport raises from here on are expected.
            if let Some(previous) = &previous {
                previous.trigger.retire();
            }
            previous
        };

        self.state.send_replace(LinkState::Live);
        info!(exchange = %self.endpoint.exchange, "Broker channel ready with publisher confirms");

        if let Some(previous) = previous {
            previous.close("superseded by reconnect").await;
        }
        Ok(())
    }

    /// Open connection, channel, and confirm mode. Anything opened before a
    /// failing step is closed before returning.
    async fn open_session(&self) -> Result<Session, SupervisorError> {
        let trigger = self.trigger.scoped();
        let connection = match self.connector.open(&self.endpoint.url, trigger.clone()).await {
            Ok(connection) => connection,
            Err(e) => {
                trigger.retire();
                return Err(SupervisorError::Connect(e));
            }
        };

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                trigger.retire();
                if let Err(close_err) = connection.close().await {
                    warn!(error = %close_err, "Failed to close broker connection after channel error");
                }
                return Err(SupervisorError::Connect(e));
            }
        };

        if let Err(e) = channel.enable_confirms().await {
            let session = Session {
                connection,
                channel,
                trigger,
            };
            session.close("confirm mode refused").await;
            return Err(SupervisorError::ConfirmMode(e));
        }

        Ok(Session {
            connection,
            channel,
            trigger,
        })
    }
}

/// Supervises the broker connection and publishing channel.
pub struct Supervisor {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Start the retry worker and make the first connect attempt.
    ///
    /// A failed first attempt is logged and left to the retry worker; the
    /// supervisor is returned either way.
    pub async fn start<C>(endpoint: BrokerEndpoint, connector: C, reconnect: ReconnectConfig) -> Self
    where
        C: BrokerConnector + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        let (state, _) = watch::channel(LinkState::Idle);

        let shared = Arc::new(Shared {
            endpoint,
            connector: Arc::new(connector),
            session: RwLock::new(None),
            trigger: RetryTrigger::new(tx),
            state,
            stopped: AtomicBool::new(false),
        });

        let worker = tokio::spawn(retry_worker(Arc::clone(&shared), rx, reconnect));

        // Failure already scheduled a retry and was logged.
        let _ = shared.connect().await;

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Attempt to (re)establish the session now.
    ///
    /// On failure a retry is requested on the worker and the error is
    /// returned immediately.
    pub async fn connect(&self) -> Result<(), SupervisorError> {
        self.shared.connect().await
    }

    /// Snapshot of the channel currently used for publishing.
    pub async fn channel(&self) -> Option<Arc<dyn PublishChannel>> {
        self.shared
            .session
            .read()
            .await
            .as_ref()
            .map(|session| Arc::clone(&session.channel))
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.shared.endpoint
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    /// Watch link state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    /// Ask the retry worker for a fresh session without blocking.
    pub fn request_reconnect(&self) {
        self.shared.trigger.request_reconnect();
    }

    /// Close the session and stop the retry worker.
    ///
    /// Safe to call when never connected and safe to call more than once.
    pub async fn shutdown(&self) {
        let Some(worker) = self.worker.lock().await.take() else {
            debug!("Supervisor already shut down");
            return;
        };

        self.shared.stopped.store(true, Ordering::SeqCst);

        let session = self.shared.session.write().await.take();
        match session {
            Some(session) => session.close("shutdown").await,
            None => debug!("No broker session to close"),
        }

        if !self.shared.trigger.stop().await {
            debug!("Retry worker already gone");
        }
        if let Err(e) = worker.await {
            error!(error = %e, "Retry worker terminated abnormally");
        }
        self.shared.state.send_replace(LinkState::Stopped);
    }
}

impl Drop for Supervisor {
    /// Without a `shutdown` the worker would keep the queue alive forever.
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            debug!("Supervisor dropped without shutdown, aborting retry worker");
            self.shared.stopped.store(true, Ordering::SeqCst);
            worker.abort();
        }
    }
}

/// Drain retry signals until `Stop`.
async fn retry_worker(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<RetrySignal>,
    reconnect: ReconnectConfig,
) {
    let backoff_builder = reconnect.backoff();
    let mut backoff = backoff_builder.build();

    'signals: while let Some(signal) = rx.recv().await {
        if signal == RetrySignal::Stop {
            break;
        }

        if *shared.state.borrow() == LinkState::RetryPending {
            let delay = backoff.next().unwrap_or(reconnect.max_delay);
            debug!(backoff_ms = %delay.as_millis(), "Waiting before reconnect");

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    signal = rx.recv() => match signal {
                        Some(RetrySignal::Reconnect) => continue,
                        Some(RetrySignal::Stop) | None => break 'signals,
                    },
                }
            }
        }

        warn!("Recreating broker connection");
        match shared.connect().await {
            Ok(()) => backoff = backoff_builder.build(),
            Err(SupervisorError::Stopped) => break,
            Err(_) => {}
        }
    }

    rx.close();
    shared.state.send_replace(LinkState::Stopped);
    warn!("Stopped listening for broker reconnect requests");
}
