//! The `client` module holds the two broker clients built on a
//! [`BrokerConnection`](crate::broker::connection::BrokerConnection).
//!
//! - [`Publisher`] sends one message at a time, optionally waiting for a
//!   broker confirmation.
//! - [`Listener`] consumes a queue, hands each message to a
//!   [`DeliveryHandler`] and settles it, retrying requested requeues through
//!   a [`NackRetryTracker`].

pub mod listener;
pub mod publisher;
pub mod retry;

pub use listener::{DeliveryHandler, Disposition, Listener, ListenerState};
pub use publisher::Publisher;
pub use retry::{NackDecision, NackRetryPolicy, NackRetryTracker, RetryKey};
