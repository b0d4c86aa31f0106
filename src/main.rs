use std::sync::Arc;

use anyhow::Context;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crispy::broker::connection::BrokerConnection;
use crispy::client::listener::Listener;
use crispy::config::load_config;
use crispy::persistence::SummaryStore;
use crispy::pipeline::{HttpSummarizer, Pipeline, StoreStage};
use crispy::transport::amqp::AmqpConnector;
use crispy::utils::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let settings = load_config().context("failed to load configuration")?;
    logging::init(&settings.log_level);

    let store = SummaryStore::open(&settings.store.path)
        .with_context(|| format!("failed to open summary store at {}", settings.store.path))?;
    let summarizer = Arc::new(HttpSummarizer::new(
        settings.summarizer.url.clone(),
        settings.summarizer.timeout(),
    )?);

    let connector = Arc::new(AmqpConnector);
    let endpoint = settings.broker.endpoint();
    let retry = settings.broker.retry_policy();

    let store_stage = StoreStage::new(
        Handle::current(),
        Arc::clone(&connector),
        endpoint.clone(),
        retry,
        settings.publisher.topology()?,
        store.clone(),
    )
    .confirm_delivery(settings.publisher.confirm_delivery);
    let pipeline = Pipeline::new(
        settings.pipeline.pipeline_config(),
        Handle::current(),
        summarizer,
        store_stage,
    );

    let mut listener = Listener::new(
        BrokerConnection::new(connector, endpoint.clone(), retry),
        settings.listener.topology()?,
    )
    .with_nack_policy(settings.listener.nack_policy());

    let shutdown = listener.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            shutdown.cancel();
        }
    });

    info!(
        broker = %endpoint.address(),
        summarizer = %settings.summarizer.url,
        batch_size = settings.pipeline.batch_size,
        "crispy started"
    );
    let result = listener.on_message(pipeline.batcher()).await;
    if let Err(err) = &result {
        error!(error = %err, "article listener stopped");
    }

    if let Err(err) = listener.close().await {
        warn!(error = %err, "failed to close article listener");
    }
    tokio::task::spawn_blocking(move || pipeline.shutdown()).await?;
    store.flush()?;
    info!("crispy stopped");

    result.context("article listener failed")
}
