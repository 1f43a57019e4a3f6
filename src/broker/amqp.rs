//! AMQP (RabbitMQ) broker transport.
//!
//! One lapin connection per `open`, channels in publisher-confirm mode, and
//! persistent publications with an empty routing key.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, error, warn};

use super::{
    BrokerConnection, BrokerConnector, BrokerError, Confirmation, HeaderValue, OutboundMessage,
    PendingConfirm, PublishChannel, Result, RetryTrigger,
};

/// AMQP delivery mode for messages the broker must write to disk.
const PERSISTENT_DELIVERY_MODE: u8 = 2;
/// Reply code sent when this process closes a channel or connection.
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn open(&self, url: &str, trigger: RetryTrigger) -> Result<Box<dyn BrokerConnection>> {
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to connect: {}", e)))?;

        let closing = Arc::new(AtomicBool::new(false));
        conn.on_error(error_watcher(&closing, &trigger, "connection"));

        Ok(Box::new(AmqpConnection {
            conn,
            trigger,
            closing,
        }))
    }
}

/// Route transport errors to the retry trigger unless we are closing on purpose.
fn error_watcher(
    closing: &Arc<AtomicBool>,
    trigger: &RetryTrigger,
    what: &'static str,
) -> impl FnMut(lapin::Error) + Send + 'static {
    let closing = Arc::clone(closing);
    let trigger = trigger.clone();
    move |err| {
        if closing.load(Ordering::SeqCst) {
            debug!(error = %err, what, "AMQP error during close ignored");
            return;
        }
        warn!(error = %err, what, "AMQP transport failed, requesting reconnect");
        trigger.request_reconnect();
    }
}

struct AmqpConnection {
    conn: Connection,
    trigger: RetryTrigger,
    closing: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn PublishChannel>> {
        let channel = self
            .conn
            .create_channel()
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to create channel: {}", e)))?;

        channel.on_error(error_watcher(&self.closing, &self.trigger, "channel"));

        Ok(Arc::new(AmqpChannel {
            channel,
            closing: Arc::clone(&self.closing),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        if !self.conn.status().connected() {
            return Err(BrokerError::ConnectionClosed);
        }
        self.conn
            .close(REPLY_SUCCESS, "ingress closing")
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to close connection: {}", e)))
    }
}

struct AmqpChannel {
    channel: Channel,
    closing: Arc<AtomicBool>,
}

#[async_trait]
impl PublishChannel for AmqpChannel {
    async fn enable_confirms(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to enable confirms: {}", e)))
    }

    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<PendingConfirm> {
        if !self.channel.status().connected() {
            return Err(BrokerError::ChannelClosed);
        }

        let properties = publish_properties(&message);
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                "",
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to publish: {}", e)))?;

        Ok(PendingConfirm::new(Box::pin(async move {
            match confirm.await {
                Ok(confirmation) if confirmation.is_ack() => Confirmation::Ack,
                Ok(_) => Confirmation::Nack,
                Err(e) => {
                    error!(error = %e, "Publish confirmation failed");
                    Confirmation::Nack
                }
            }
        })))
    }

    async fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        if !self.channel.status().connected() {
            return Err(BrokerError::ChannelClosed);
        }
        self.channel
            .close(REPLY_SUCCESS, "ingress closing")
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to close channel: {}", e)))
    }
}

/// Build AMQP properties for an outbound message.
fn publish_properties(message: &OutboundMessage) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type(ShortString::from(message.content_type.clone()))
        .with_headers(field_table(&message.headers));

    if message.persistent {
        properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE)
    } else {
        properties
    }
}

/// Convert message headers into an AMQP field table.
fn field_table(headers: &BTreeMap<String, HeaderValue>) -> FieldTable {
    let table: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(key, value)| {
            let value = match value {
                HeaderValue::String(s) => AMQPValue::LongString(s.clone().into()),
                HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
                HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
            };
            (ShortString::from(key.clone()), value)
        })
        .collect();
    FieldTable::from(table)
}
