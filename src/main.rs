use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rxchain::config::NodeConfig;
use rxchain::consensus::Difficulty;
use rxchain::http::{self, AppState};
use rxchain::scheduler::spawn_auto_sealer;
use rxchain::signature::sign_claim;
use rxchain::types::{Prescription, TransactionClaim};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rxchain", version, about = "Prescription ledger node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP node
    Serve {
        /// TOML configuration file; defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override `network.listen_addr`
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Override the difficulty as a number of leading zero hex digits
        #[arg(long)]
        difficulty: Option<u32>,
    },
    /// Compute a prescription signature on the prescriber's side
    Sign {
        #[arg(long)]
        secret: String,
        #[arg(long)]
        writer: String,
        #[arg(long)]
        counterparty: Option<String>,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        drug: String,
        #[arg(long)]
        dosage: String,
        #[arg(long)]
        quantity: String,
        /// Print a complete /new_transaction body instead of the bare signature
        #[arg(long)]
        json: bool,
        /// Network key to embed in the JSON body
        #[arg(long, requires = "json")]
        network_key: Option<String>,
    },
    /// Print the default configuration as TOML
    DefaultConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            config,
            listen,
            difficulty,
        } => serve(config, listen, difficulty).await,
        Command::Sign {
            secret,
            writer,
            counterparty,
            subject,
            drug,
            dosage,
            quantity,
            json,
            network_key,
        } => {
            let claim = TransactionClaim {
                writer,
                counterparty,
                subject,
                payload: Prescription {
                    drug_name: drug,
                    dosage,
                    quantity,
                },
            };
            let signature = sign_claim(&claim, &secret);
            if json {
                let body = serde_json::json!({
                    "network_key": network_key,
                    "prescriber_public_key": claim.writer,
                    "pharmacy_public_key": claim.counterparty,
                    "patient_id": claim.subject,
                    "drug_name": claim.payload.drug_name,
                    "dosage": claim.payload.dosage,
                    "quantity": claim.payload.quantity,
                    "signature": signature,
                });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                println!("{signature}");
            }
            Ok(())
        }
        Command::DefaultConfig => {
            print!("{}", NodeConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn serve(
    config_path: Option<PathBuf>,
    listen: Option<SocketAddr>,
    difficulty: Option<u32>,
) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &config_path {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(zeros) = difficulty {
        config.consensus.difficulty = Difficulty::HexZeros(zeros);
        config.validate()?;
    }
    let addr = match listen {
        Some(addr) => addr,
        None => config
            .network
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen_addr {}", config.network.listen_addr))?,
    };

    let runtime = config.build_runtime()?;
    info!(
        difficulty = %config.consensus.difficulty,
        workers = config.consensus.workers,
        writers = config.credentials.writers.len(),
        "ledger initialized"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let sealer = config.auto_seal_interval().map(|interval| {
        spawn_auto_sealer(runtime.clone(), interval, config.seal_timeout(), stop_rx)
    });

    let shutdown = {
        let runtime = runtime.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            // Unblock in-flight /mine requests and the auto-sealer before
            // graceful shutdown waits on them.
            runtime.cancel_seals();
            let _ = stop_tx.send(true);
        }
    };

    let state = AppState::new(runtime, &config);
    http::serve(state, addr, shutdown)
        .await
        .context("http server failed")?;

    if let Some(handle) = sealer {
        handle.await.context("auto-sealer panicked")?;
    }
    Ok(())
}
