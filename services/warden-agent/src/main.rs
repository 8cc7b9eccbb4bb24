//! # Warden Agent
//!
//! ```bash
//! # Run with the config.json next to the binary
//! sudo ./warden-agent
//!
//! # Validate a configuration without touching the host
//! ./warden-agent -c /etc/warden/config.yaml --check
//!
//! # Dry run with the simulated backend
//! WARDEN_LOG_LEVEL=debug ./warden-agent --backend memory
//! ```

use clap::Parser;
use warden_agent::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // No subscriber exists until the configuration is loaded; a load
    // failure surfaces on stderr through the returned error.
    warden_agent::run(Args::parse()).await
}
