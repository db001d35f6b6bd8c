use amqp_keeper::{Client, Config, MemoryBroker};
use anyhow::Result;
use clap::Parser;
use log::info;

#[derive(Parser)]
#[command(about = "Publishes one message to the configured queue")]
struct Cli {
    /// TOML config file, the AMQP_* environment variables are used without it
    #[arg(short, value_name = "FILE")]
    config: Option<String>,

    /// Run against the in-process broker
    #[arg(long)]
    memory: bool,

    #[arg(default_value = "Hey man")]
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    amqp_keeper::setup_logger();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => amqp_keeper::config::parse_config(path)?,
        None => Config::from_env(),
    };

    let client = if cli.memory {
        Client::with_connector(config, MemoryBroker::new())
    } else {
        Client::new(config)
    };

    client.declare_entities(true);

    // Exits the process when the broker cannot be reached.
    client.connect().await?;

    client.publish(&cli.message, "").await?;

    info!("Message sent to queue {}", client.get_queue_name());

    client.close().await;

    Ok(())
}
