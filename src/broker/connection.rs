//! Broker connection management.
//!
//! [`connect_with_retry`] drives a fixed retry budget with a fixed delay
//! between attempts. Each failed attempt is logged; once the budget is spent
//! the last error is returned to the caller as fatal.
//!
//! [`BrokerConnection`] owns one connection+channel for one publisher or
//! listener. It moves through `connect -> use -> close` exactly once: a
//! closed connection cannot be reconnected, a fresh `BrokerConnection` is
//! needed instead.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::transport::{Channel, Connector};
use crate::utils::error::BrokerError;

/// Where and how to reach the broker. Immutable once a connection is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    pub connection_timeout: Option<Duration>,
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            connection_timeout: None,
        }
    }
}

impl BrokerEndpoint {
    /// `host:port`, used in logs and errors. Never includes credentials.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The virtual host to open, `/` when none is configured.
    pub fn vhost(&self) -> &str {
        match self.virtual_host.as_str() {
            "" => "/",
            other => other,
        }
    }
}

/// Fixed connection retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(3),
        }
    }
}

/// Runs `attempt` until it succeeds or `policy.max_attempts` attempts failed.
///
/// The closure receives the 1-based attempt number.
pub async fn connect_with_retry<T, E, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let budget = policy.max_attempts.max(1);
    let mut current = 1;

    loop {
        match attempt(current).await {
            Ok(value) => {
                if current > 1 {
                    info!(attempts = current, "connected after retrying");
                }
                return Ok(value);
            }
            Err(err) => {
                let remaining = budget - current;
                if remaining == 0 {
                    error!(attempts = current, error = %err, "connection retry budget exhausted");
                    return Err(err);
                }
                warn!(
                    attempt = current,
                    remaining,
                    delay_ms = policy.delay.as_millis() as u64,
                    error = %err,
                    "error connecting to broker, retrying"
                );
                tokio::time::sleep(policy.delay).await;
                current += 1;
            }
        }
    }
}

/// One connection+channel, exclusively owned by a publisher or listener.
pub struct BrokerConnection<C: Connector> {
    connector: Arc<C>,
    endpoint: BrokerEndpoint,
    retry: RetryPolicy,
    channel: Option<C::Channel>,
    closed: bool,
}

impl<C: Connector> BrokerConnection<C> {
    pub fn new(connector: Arc<C>, endpoint: BrokerEndpoint, retry: RetryPolicy) -> Self {
        Self {
            connector,
            endpoint,
            retry,
            channel: None,
            closed: false,
        }
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Connects with the configured retry budget.
    ///
    /// Fails with [`BrokerError::AlreadyConnected`] when a channel is already
    /// open and with [`BrokerError::Closed`] once this connection was closed.
    pub async fn connect(&mut self) -> Result<&C::Channel, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        if self.channel.is_some() {
            return Err(BrokerError::AlreadyConnected);
        }

        let connector: &C = &self.connector;
        let endpoint = &self.endpoint;
        let channel = connect_with_retry(&self.retry, |attempt| {
            debug!(attempt, endpoint = %endpoint.address(), "connecting to broker");
            connector.connect(endpoint)
        })
        .await?;

        Ok(self.channel.insert(channel))
    }

    /// The open channel.
    pub fn channel(&self) -> Result<&C::Channel, BrokerError> {
        match &self.channel {
            Some(channel) => Ok(channel),
            None if self.closed => Err(BrokerError::Closed),
            None => Err(BrokerError::NotConnected),
        }
    }

    /// Closes channel and connection. A second call is a no-op.
    pub async fn close(&mut self) -> Result<(), BrokerError> {
        self.closed = true;
        match self.channel.take() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}
