use std::io::Write;
use std::time::Duration;

use serial_test::serial;

use super::settings::Settings;
use super::{load_config, load_config_from};
use crate::transport::ExchangeKind;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.broker.host, "localhost");
    assert_eq!(settings.broker.port, 5672);
    assert_eq!(settings.broker.connect_attempts, 10);
    assert_eq!(settings.listener.queue, "article_queue");
    assert_eq!(settings.listener.kind, ExchangeKind::Topic);
    assert_eq!(settings.publisher.routing_key, "summary.article");
    assert!(settings.publisher.confirm_delivery);
    assert_eq!(settings.pipeline.batch_size, 5);
    assert_eq!(settings.pipeline.required_fields, ["content"]);
    assert_eq!(settings.log_level, "info");
}

#[test]
fn test_settings_convert_to_domain_values() {
    let settings = Settings::default();

    let endpoint = settings.broker.endpoint();
    assert_eq!(endpoint.address(), "localhost:5672");
    assert_eq!(endpoint.vhost(), "/");
    assert_eq!(endpoint.username, "guest");

    let retry = settings.broker.retry_policy();
    assert_eq!(retry.max_attempts, 10);
    assert_eq!(retry.delay, Duration::from_secs(3));

    let listener = settings.listener.topology().unwrap();
    assert_eq!(listener.require_queue().unwrap(), "article_queue");
    assert_eq!(listener.prefetch_count, 1);

    let nack = settings.listener.nack_policy();
    assert_eq!(nack.max_retries, 5);
    assert_eq!(nack.delay, Duration::from_secs(2));

    let pipeline = settings.pipeline.pipeline_config();
    assert_eq!(pipeline.fetch.workers, 4);
    assert_eq!(pipeline.store.workers, 1);
    assert_eq!(pipeline.fetch.idle_timeout, Duration::from_secs(900));
}

#[test]
fn test_publisher_dead_letter_settings() {
    let mut settings = Settings::default();
    settings.publisher.dead_letter.enabled = true;
    settings.publisher.dead_letter.message_ttl_ms = Some(60_000);

    let topology = settings.publisher.topology().unwrap();
    let args = &topology.queue.unwrap().arguments;
    assert_eq!(args.dead_letter_exchange.as_deref(), Some("summary_exchange"));
    assert_eq!(args.dead_letter_routing_key.as_deref(), Some("summary.article"));
    assert_eq!(args.message_ttl, Some(60_000));
}

#[test]
#[serial]
fn test_load_config_without_sources_uses_defaults() {
    temp_env::with_vars_unset(["CRISPY_BROKER__HOST", "CRISPY_PIPELINE__BATCH_SIZE"], || {
        let settings = load_config_from("does/not/exist").unwrap();
        assert_eq!(settings, Settings::default());
    });
}

#[test]
#[serial]
fn test_environment_overrides_defaults() {
    temp_env::with_vars(
        [
            ("CRISPY_BROKER__HOST", Some("rabbitmq")),
            ("CRISPY_BROKER__PORT", Some("5673")),
            ("CRISPY_LISTENER__KIND", Some("direct")),
            ("CRISPY_PIPELINE__BATCH_SIZE", Some("8")),
            ("CRISPY_PIPELINE__REQUIRED_FIELDS", Some("content,url")),
            ("CRISPY_LOG_LEVEL", Some("debug")),
        ],
        || {
            let settings = load_config().unwrap();
            assert_eq!(settings.broker.host, "rabbitmq");
            assert_eq!(settings.broker.port, 5673);
            assert_eq!(settings.listener.kind, ExchangeKind::Direct);
            assert_eq!(settings.pipeline.batch_size, 8);
            assert_eq!(settings.pipeline.required_fields, ["content", "url"]);
            assert_eq!(settings.log_level, "debug");
            // untouched keys keep their defaults
            assert_eq!(settings.broker.username, "guest");
            assert_eq!(settings.pipeline.fetch_workers, 4);
        },
    );
}

#[test]
#[serial]
fn test_file_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crispy.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        r#"
log_level = "warn"

[summarizer]
url = "http://summarizer:8080/api"

[publisher.dead_letter]
enabled = true
exchange = "summary_dlx"
"#
    )
    .unwrap();

    let settings = load_config_from(path.to_str().unwrap()).unwrap();
    assert_eq!(settings.log_level, "warn");
    assert_eq!(settings.summarizer.url, "http://summarizer:8080/api");
    assert_eq!(settings.summarizer.timeout_secs, 1200);

    let topology = settings.publisher.topology().unwrap();
    assert_eq!(topology.dead_letter_exchange.unwrap().name, "summary_dlx");
}
