// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Writes a default delivery configuration file.
//!
//! ```text
//! cfggen                      # ./config.toml
//! cfggen -f /etc/proxy/replication.toml
//! cfggen --stdout --json
//! ```

use clap::Parser;
use replication_delivery::DeliveryConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cfggen", about = "Generate a default replication delivery config")]
struct Args {
    /// Output file.
    #[arg(short = 'f', long = "file-name", default_value = "config.toml")]
    file_name: PathBuf,

    /// Print to stdout instead of writing a file.
    #[arg(long)]
    stdout: bool,

    /// Render JSON instead of TOML (stdout only).
    #[arg(long, requires = "stdout")]
    json: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = DeliveryConfig::default();

    if args.stdout {
        let rendered = if args.json {
            config.to_json_string()
        } else {
            config.to_toml_string()
        };
        return match rendered {
            Ok(text) => {
                println!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "Failed to render config");
                ExitCode::FAILURE
            }
        };
    }

    match config.write(&args.file_name) {
        Ok(()) => {
            info!(path = %args.file_name.display(), "Wrote default config");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(path = %args.file_name.display(), error = %e, "Failed to write config");
            ExitCode::FAILURE
        }
    }
}
