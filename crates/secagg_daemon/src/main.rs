use anyhow::Context;
use clap::{Parser, Subcommand};
use secagg_core::ClientId;
use secagg_daemon::client::Client;
use secagg_daemon::config::Config;
use secagg_daemon::registry::{self, KeyDirectory};
use secagg_daemon::round;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "secagg")]
#[command(about = "Dropout-tolerant secure aggregation for federated learning")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "secagg.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the aggregator for the configured number of rounds.
    Aggregator,
    /// Run one client for the configured number of rounds.
    Client {
        /// Client id; overrides the config file.
        #[arg(long)]
        id: Option<String>,
        /// Delivery port; overrides the config file.
        #[arg(long)]
        delivery_port: Option<u16>,
        /// JSON file holding the input vector; overrides the config file.
        #[arg(long)]
        input: Option<PathBuf>,
        /// Signing key file; overrides the config file.
        #[arg(long)]
        key: Option<PathBuf>,
    },
    /// Generate an ed25519 signing key and print the public half as hex.
    Keygen {
        /// Where to write the 32-byte secret key.
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Aggregator => {
            let config = Config::load(&cli.config)?;
            round::run_aggregator(config).await?
        }
        Commands::Client {
            id,
            delivery_port,
            input,
            key,
        } => {
            let mut config = Config::load(&cli.config)?;
            if let Some(id) = id {
                config.client.id = id;
            }
            if let Some(port) = delivery_port {
                config.client.delivery_port = port;
            }
            if let Some(path) = input {
                config.client.input_path = Some(path);
            }
            if let Some(path) = key {
                config.client.key_path = path;
            }
            run_client(config).await?
        }
        Commands::Keygen { out } => {
            let key = registry::load_or_generate_signing_key(&out)?;
            println!("{}", hex::encode(key.verifying_key().to_bytes()));
            0
        }
    };

    std::process::exit(code);
}

async fn run_client(config: Config) -> anyhow::Result<i32> {
    let input = load_input(&config)?;
    let signing_key = registry::load_or_generate_signing_key(&config.client.key_path)?;
    let directory = KeyDirectory::load(&config.directory_path)?;

    let mut client = Client::bind(
        ClientId::from(config.client.id.as_str()),
        signing_key,
        directory,
        config.protocol.clone(),
        config.network.clone(),
        config.client.delivery_port,
    )
    .await?;

    for round in 0..config.protocol.rounds {
        info!(round, id = %client.id(), "starting round");
        if let Err(e) = client.run_round(&input).await {
            error!(round, id = %client.id(), error = %e, "round failed");
            return Ok(1);
        }
        info!(round, id = %client.id(), "round complete");
        client.reset();
    }
    Ok(0)
}

fn load_input(config: &Config) -> anyhow::Result<Vec<f64>> {
    let expected: usize = config.protocol.shape.iter().sum();
    let path = config
        .client
        .input_path
        .as_ref()
        .context("client.input_path is required")?;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading input {}", path.display()))?;
    let vector: Vec<f64> = serde_json::from_str(&content)
        .with_context(|| format!("parsing input {}", path.display()))?;
    anyhow::ensure!(
        vector.len() == expected,
        "input has {} elements, shape requires {expected}",
        vector.len()
    );
    Ok(vector)
}
