//! # Map CLI: coordinator process
//!
//! Discovers Engines in the configured slot directories and serves batch
//! requests from the Caller until told to stop.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin map -- --config dispatch.toml
//! DISPATCH_EXCHANGE_DIR=/shared cargo run --bin map
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use tokio_eval_dispatch::config::loader;
use tokio_eval_dispatch::scheduler::Ticker;
use tokio_eval_dispatch::Coordinator;

/// Parsed CLI arguments.
struct Args {
    /// Optional TOML config; defaults plus environment otherwise.
    config: Option<PathBuf>,
}

/// Parse command-line arguments manually (no external arg parser dependency).
fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires a value".to_string());
                }
                config = Some(PathBuf::from(&args[i]));
            }
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("unknown argument: {other}\n{}", usage())),
        }
        i += 1;
    }

    Ok(Args { config })
}

fn usage() -> String {
    [
        "Usage: map [OPTIONS]",
        "",
        "Options:",
        "  --config, -c <FILE>   Dispatch config (TOML)",
        "  --help, -h            Show this help message",
    ]
    .join("\n")
}

#[tokio::main]
async fn main() {
    let _ = tokio_eval_dispatch::init_tracing();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
    };

    let loaded = match &args.config {
        Some(path) => loader::load_from_file(path),
        None => loader::load_default(),
    };
    let config = match loaded {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    let mut ticker = Ticker::new(config.polling_interval());
    let mut map = match Coordinator::from_config(Arc::clone(&config)).await {
        Ok(map) => map,
        Err(e) => {
            tracing::error!(error = %e, "Could not open upstream channel");
            std::process::exit(1);
        }
    };

    if let Err(e) = map.run(&mut ticker).await {
        tracing::error!(error = %e, violation = e.is_protocol_violation(), "Map terminated");
        std::process::exit(1);
    }
}
