use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rust_service_bus::{
    log_message, AmqpConnector, ClientRegistry, Publisher, ReceiverStrategy, SenderStrategy,
    Settings, Subscriber,
};

#[derive(Parser)]
#[command(name = "RustServiceBus", about = "Publish to and subscribe from queues and topics")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one message to the configured topic (or a queue)
    Publish {
        /// Message content, sent as-is
        message: String,

        /// Send to a queue instead of SB_TOPIC_NAME (name defaults to SB_QUEUE_NAME)
        #[arg(long, value_name = "NAME")]
        queue: Option<Option<String>>,
    },
    /// Listen on the configured topic subscription (or a queue) until Ctrl-C
    Subscribe {
        /// Listen on a queue instead of SB_TOPIC_NAME/SB_SUBSCRIPTION_NAME
        /// (name defaults to SB_QUEUE_NAME)
        #[arg(long, value_name = "NAME")]
        queue: Option<Option<String>>,
    },
}

fn init_tracing() {
    // Keep the AMQP client quiet unless asked otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,lapin=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// `--queue NAME` wins, bare `--queue` falls back to SB_QUEUE_NAME.
fn queue_name(settings: &Settings, flag: Option<Option<String>>) -> Result<Option<String>> {
    match flag {
        None => Ok(None),
        Some(Some(name)) => Ok(Some(name)),
        Some(None) => Ok(Some(settings.require_queue()?.to_string())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let settings = Settings::load().context("Failed to load settings")?;
    let id = settings.connection_id()?;
    let registry = ClientRegistry::new(AmqpConnector::from_settings(&settings));

    match cli.command {
        Command::Publish { message, queue } => {
            let (name, strategy) = match queue_name(&settings, queue)? {
                Some(queue) => (queue, SenderStrategy::Queue),
                None => (settings.require_topic()?.to_string(), SenderStrategy::Topic),
            };
            let publisher = Publisher::connect(&registry, &id, name, strategy).await?;
            publisher.send(&message).await?;
        }
        Command::Subscribe { queue } => {
            let (subscriber, subscription) = match queue_name(&settings, queue)? {
                Some(queue) => (
                    Subscriber::connect(&registry, &id, queue, ReceiverStrategy::Queue).await?,
                    None,
                ),
                None => {
                    let topic = settings.require_topic()?;
                    let subscription = settings.require_subscription()?;
                    (
                        Subscriber::connect(&registry, &id, topic, ReceiverStrategy::Topic).await?,
                        Some(subscription),
                    )
                }
            };

            let listener = subscriber.start_listening(log_message, subscription)?;
            let cancel = listener.cancellation_token();
            let finished = listener.join();
            tokio::pin!(finished);

            tokio::select! {
                outcome = &mut finished => return Ok(outcome?),
                _ = tokio::signal::ctrl_c() => {
                    info!("Program terminated.");
                    cancel.cancel();
                }
            }
            finished.await?;
        }
    }

    Ok(())
}
