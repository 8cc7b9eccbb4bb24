use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use warden_backend::NativeCrypto;
use warden_core::AgentConfiguration;
use warden_engine::HealthSnapshot;

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Warden CLI - IPsec agent configuration and status")]
#[command(version = warden_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate { path: PathBuf },
    /// Print the connections a configuration defines
    Show { path: PathBuf },
    /// Query a running agent's health endpoint
    Status {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        url: String,
    },
    /// Show the native parameters for an IKE proposal
    Crypto { proposal: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => handle_validate(path),
        Commands::Show { path } => handle_show(path),
        Commands::Status { url } => handle_status(&url).await,
        Commands::Crypto { proposal } => handle_crypto(&proposal),
    }
}

fn load(path: &Path) -> Result<AgentConfiguration> {
    warden_core::load(path).with_context(|| format!("{} is not usable", path.display()))
}

fn handle_validate(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    println!(
        "✅ {} is valid ({} connection(s))",
        path.display(),
        config.connections().len()
    );
    Ok(())
}

fn handle_show(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    println!("📋 {}", path.display());
    for line in config.summary() {
        println!("  {}", line);
    }
    println!(
        "  logging: {} to {}",
        config.log_level(),
        config.log_sink()
    );
    match config.health_api_port() {
        Some(port) => println!("  health api: port {}", port),
        None => println!("  health api: disabled"),
    }
    println!(
        "  poll every {:?}, command timeout {:?}",
        config.poll_interval(),
        config.command_timeout()
    );
    Ok(())
}

async fn handle_status(url: &str) -> Result<()> {
    let endpoint = format!(
        "{}{}",
        url.trim_end_matches('/'),
        warden_core::endpoints::STATUS
    );
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let snapshot: HealthSnapshot = client
        .get(&endpoint)
        .send()
        .await
        .with_context(|| format!("agent not reachable at {endpoint}"))?
        .error_for_status()?
        .json()
        .await
        .context("unexpected response from agent")?;

    println!("📊 Agent status");
    println!("  link:  {}", snapshot.status);
    println!("  agent: {}", snapshot.agent_state);
    Ok(())
}

fn handle_crypto(proposal: &str) -> Result<()> {
    let native = NativeCrypto::from_proposal(proposal);
    let rendered = serde_json::to_string_pretty(&json!({
        "proposal": proposal,
        "native": native,
    }))?;
    println!("{}", rendered);
    Ok(())
}
