//! ttserver
//!
//! Serves finger and gopher content from templates and static files.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net::listener ──▶ proxy_protocol ──▶ tls ──▶ Connection
//!                                                               │
//!                                                               ▼
//!                                              handler (finger / gopher)
//!                                                               │
//!                                                               ▼
//!     cron ──(forced refresh)──────────────────────────▶ resolver
//!                                                     │    │    │
//!                                           TTL cache ◀┘    │    └▶ fetch pool ──▶ HTTP
//!                                                          ▼
//!                                                 template / file
//!
//!     lifecycle::Manager ── signals ──▶ Space { cache, cron, listener }
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use ttserver::Manager;

#[derive(Parser)]
#[command(name = "ttserver", version, about = "Finger and gopher content server", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let manager = match Manager::start(cli.config).await {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("ttserver: {e}");
            return ExitCode::FAILURE;
        }
    };

    match manager.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Exiting");
            ExitCode::FAILURE
        }
    }
}
