use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::transport::Delivery;

/// Bounded retry for deliveries the handler asked to requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackRetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for NackRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_secs(2),
        }
    }
}

/// Identifies one message across redeliveries.
///
/// A requeued message comes back with a new delivery tag, so the tag cannot
/// be used. The `message-id` property is preferred; messages without one are
/// keyed by a hash of their body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RetryKey {
    MessageId(String),
    Body(u64),
}

impl RetryKey {
    pub fn for_delivery(delivery: &Delivery) -> Self {
        match &delivery.properties.message_id {
            Some(id) => RetryKey::MessageId(id.clone()),
            None => {
                let mut hasher = DefaultHasher::new();
                delivery.body.hash(&mut hasher);
                RetryKey::Body(hasher.finish())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackDecision {
    /// Wait `delay`, then nack with requeue. `attempt` is 1-based.
    Requeue { attempt: u32, delay: Duration },
    /// Budget spent: nack without requeue.
    Drop { attempts: u32 },
}

/// Per-message requeue counts, owned by one listener.
///
/// Entries are evicted as soon as a message reaches a terminal ack or nack.
#[derive(Debug, Default)]
pub struct NackRetryTracker {
    policy: NackRetryPolicy,
    attempts: HashMap<RetryKey, u32>,
}

impl NackRetryTracker {
    pub fn new(policy: NackRetryPolicy) -> Self {
        Self {
            policy,
            attempts: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &NackRetryPolicy {
        &self.policy
    }

    /// Requeues already granted to `key`.
    pub fn attempts(&self, key: &RetryKey) -> u32 {
        self.attempts.get(key).copied().unwrap_or(0)
    }

    /// Number of messages with retries in flight.
    pub fn tracked(&self) -> usize {
        self.attempts.len()
    }

    pub fn on_requeue_request(&mut self, key: &RetryKey) -> NackDecision {
        let done = self.attempts(key);
        if done < self.policy.max_retries {
            self.attempts.insert(key.clone(), done + 1);
            NackDecision::Requeue {
                attempt: done + 1,
                delay: self.policy.delay,
            }
        } else {
            self.attempts.remove(key);
            NackDecision::Drop { attempts: done }
        }
    }

    /// Forgets `key` after a terminal ack or nack.
    pub fn settle(&mut self, key: &RetryKey) {
        self.attempts.remove(key);
    }
}
