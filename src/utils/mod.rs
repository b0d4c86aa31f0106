//! The `utils` module provides the shared error types and logging setup used
//! across `crispy`.

pub mod error;
pub mod logging;

#[cfg(test)]
mod tests {
    use super::error::{BrokerError, TopologyError};
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
    }

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert_eq!(logging::parse_level("WARNING"), tracing::Level::WARN);
        assert_eq!(logging::parse_level(" trace "), tracing::Level::TRACE);
        assert_eq!(logging::parse_level("verbose"), tracing::Level::INFO);
    }

    #[test]
    fn topology_errors_convert_into_broker_errors() {
        let err: BrokerError = TopologyError::MissingQueue.into();
        assert!(matches!(err, BrokerError::Topology(TopologyError::MissingQueue)));
        assert_eq!(err.to_string(), "a queue name is required to consume messages");
    }
}
