use amqp_keeper::{handler_fn, Client, Config, Delivery, MemoryBroker};
use anyhow::Result;
use clap::Parser;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(about = "Publishes messages and consumes them with a supervised consumer")]
struct Cli {
    #[arg(short, value_name = "FILE")]
    config: Option<String>,

    #[arg(long)]
    memory: bool,

    #[arg(short = 'n', default_value_t = 1024)]
    message_count: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    amqp_keeper::setup_logger();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => amqp_keeper::config::parse_config(path)?,
        None => Config::from_env(),
    };

    if config.queue.is_empty() {
        config.queue = "q_pubsub".to_owned();
    }

    let client = if cli.memory {
        Client::with_connector(config, MemoryBroker::new())
    } else {
        Client::new(config)
    };

    client.declare_entities(true).set_silence_mode(true);
    client.connect().await?;

    let counter = Arc::new(AtomicU32::new(0));
    let consumer = client
        .new_consumer(
            handler_fn({
                let counter = counter.clone();

                move |delivery: Delivery| {
                    let counter = counter.clone();

                    async move {
                        if delivery.ack().await.is_ok() {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            }),
            "ctag",
        )
        .set_maintain(false)
        .set_timeout(Duration::from_secs(2));

    let message = "This will be the test message what we send over multiple times";
    let start = Instant::now();

    let consuming = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.init().await }
    });

    for _ in 0..cli.message_count {
        client.publish(message, "").await?;
    }

    // The consumer stops after 2 idle seconds.
    consuming.await??;

    println!(
        "Send and receive {} of {} messages: {:?}",
        counter.load(Ordering::SeqCst),
        cli.message_count,
        Instant::elapsed(&start)
    );

    client.close().await;

    Ok(())
}
