//! amqp-ingress - HTTP ingress for a RabbitMQ-backed event broker
//!
//! Accepts CloudEvents over HTTP and publishes them to a single exchange
//! with publisher confirms. A request is answered `202 Accepted` only after
//! the broker has confirmed the persistent message.

pub mod broker;
pub mod config;
pub mod event;
pub mod ingress;
pub mod publish;
pub mod stats;
pub mod supervisor;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod utils;
