pub mod connection;
#[cfg(any(test, feature = "memory-broker"))]
pub mod memory;
pub mod message;
pub mod topology;

pub use connection::{BrokerConnection, BrokerEndpoint, RetryPolicy};
#[cfg(any(test, feature = "memory-broker"))]
pub use memory::MemoryBroker;
pub use message::{Message, MessageProperties, Payload};
pub use topology::{Topology, TopologyConfig};
