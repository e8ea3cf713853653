//! # Engine CLI: worker process
//!
//! Publishes a discovery descriptor and evaluates tasks sent by the Map
//! until it receives `stop`.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin engine -- --config dispatch.toml --dir engine_1
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use tokio_eval_dispatch::config::loader;
use tokio_eval_dispatch::scheduler::Ticker;
use tokio_eval_dispatch::{ChannelFactory, Engine};

/// Parsed CLI arguments.
struct Args {
    /// Optional TOML config.
    config: Option<PathBuf>,
    /// Overrides `engine.dir`.
    dir: Option<PathBuf>,
}

/// Parse command-line arguments manually (no external arg parser dependency).
fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = None;
    let mut dir = None;

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
            "--dir" | "-d" => {
                i += 1;
                if i >= args.len() {
                    return Err("--dir requires a value".to_string());
                }
                dir = Some(PathBuf::from(&args[i]));
            }
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("unknown argument: {other}\n{}", usage())),
        }
        i += 1;
    }

    Ok(Args { config, dir })
}

fn usage() -> String {
    [
        "Usage: engine [OPTIONS]",
        "",
        "Options:",
        "  --config, -c <FILE>   Dispatch config (TOML)",
        "  --dir, -d <DIR>       Slot directory to publish into (overrides engine.dir)",
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
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };
    if let Some(dir) = args.dir {
        config.engine.dir = dir;
    }

    let factory = ChannelFactory::new(Arc::new(config.clone()));
    let mut engine = match Engine::from_config(&config, &factory).await {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "Could not open engine channel");
            std::process::exit(1);
        }
    };

    let mut ticker = Ticker::new(config.polling_interval());
    if let Err(e) = engine.run(&mut ticker).await {
        tracing::error!(engine_id = %engine.id(), error = %e, "Engine terminated");
        std::process::exit(1);
    }
}
