use std::error::Error;
use std::sync::Arc;

use ripple_core::{
    ConsumeContext, Handler, HandlerResult, Listener, Monitor, Routes, Runtime, Settings,
    TopicPartition, metrics,
};
use ripple_kafka::{KafkaConfig, KafkaConsumer, KafkaProducer};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

mod cmdline;
mod setup_tracing;

const VERSION_INFO: &str = env!("RIPPLE_VERSION_INFO");

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    let matches = cmdline::root_cli().get_matches();
    match matches.subcommand_name() {
        Some("version") => {
            println!("{VERSION_INFO}");
            return Ok(());
        }
        Some("consume") => {}
        other => return Err(format!("Unknown subcommand {other:?}").into()),
    }

    info!(version = VERSION_INFO, "Starting ripple");
    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Gracefully Exiting...");
    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let settings = Settings::load()?;
    let routes = Routes::from_settings(&settings)?;

    let kafka_config = KafkaConfig::from_settings(&settings);
    let consumer = KafkaConsumer::connect(&kafka_config)?;
    let producer = KafkaProducer::connect(&kafka_config)?;

    let monitor = Monitor::default();
    let recorder = metrics::spawn(&monitor);

    let runtime = Arc::new(Runtime::new(
        &settings,
        routes,
        Arc::new(consumer.client()),
        Arc::new(producer),
        LogHandler,
        monitor,
    ));

    let cln_token = CancellationToken::new();
    let shutdown_cln_token = cln_token.clone();
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    let result = Listener::new(consumer, runtime).run(cln_token).await;
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }
    // the recorder stops once the runtime released its monitor
    recorder.abort();
    debug!(metrics = %metrics::encode_metrics()?, "Final metrics");

    result?;
    Ok(())
}

/// Logs every consumed batch, the default business logic of the binary.
struct LogHandler;

impl Handler for LogHandler {
    async fn consume(&self, ctx: &ConsumeContext<'_>) -> HandlerResult {
        let messages = ctx.messages();
        info!(
            partition = %ctx.partition(),
            segment = ctx.segment(),
            attempt = ctx.attempt(),
            first = messages.first().map(|m| m.offset),
            last = messages.last().map(|m| m.offset),
            "Consumed batch"
        );
        Ok(())
    }

    async fn revoked(&self, partition: &TopicPartition) {
        info!(%partition, "Partition revoked");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = ?e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(error = ?e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
