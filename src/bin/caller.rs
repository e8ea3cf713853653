//! # Caller CLI: submit one batch, or stop the Map
//!
//! Reads a JSON list of parameter vectors, evaluates it through the Map and
//! prints the objective vectors as JSON on stdout.
//!
//! ## Usage
//!
//! ```bash
//! echo '[[0.1, 0.03], [0.12, 0.05]]' > batch.json
//! cargo run --bin caller -- --config dispatch.toml --params batch.json
//! cargo run --bin caller -- --config dispatch.toml --stop
//! ```

use std::path::{Path, PathBuf};
use tokio_eval_dispatch::config::loader;
use tokio_eval_dispatch::CallerAdapter;

/// Parsed CLI arguments.
struct Args {
    /// Optional TOML config.
    config: Option<PathBuf>,
    /// JSON file holding the batch.
    params: Option<PathBuf>,
    /// Keep the Map running after the batch.
    keep_alive: bool,
}

/// Parse command-line arguments manually (no external arg parser dependency).
fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = None;
    let mut params = None;
    let mut keep_alive = false;
    let mut stop_only = false;

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
            "--params" | "-p" => {
                i += 1;
                if i >= args.len() {
                    return Err("--params requires a value".to_string());
                }
                params = Some(PathBuf::from(&args[i]));
            }
            "--keep-alive" => keep_alive = true,
            "--stop" => stop_only = true,
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("unknown argument: {other}\n{}", usage())),
        }
        i += 1;
    }

    if params.is_none() && !stop_only {
        return Err(format!("either --params or --stop is required\n{}", usage()));
    }

    Ok(Args {
        config,
        params,
        keep_alive,
    })
}

fn usage() -> String {
    [
        "Usage: caller [OPTIONS]",
        "",
        "Options:",
        "  --config, -c <FILE>   Dispatch config (TOML)",
        "  --params, -p <FILE>   JSON list of parameter vectors to evaluate",
        "  --keep-alive          Do not stop the Map after the batch",
        "  --stop                Only send stop to the Map",
        "  --help, -h            Show this help message",
    ]
    .join("\n")
}

fn read_batch(path: &Path) -> Result<Vec<Vec<f64>>, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    serde_json::from_str(&text).map_err(|e| format!("{} is not a list of vectors: {e}", path.display()))
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
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    let batch = match args.params.as_deref().map(read_batch).transpose() {
        Ok(batch) => batch,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
    };

    let mut caller = match CallerAdapter::from_config(config).await {
        Ok(caller) => caller,
        Err(e) => {
            tracing::error!(error = %e, "Could not open caller channel");
            std::process::exit(1);
        }
    };

    let mut code = 0;
    if let Some(batch) = batch {
        match caller.evaluate(batch).await {
            Ok(objs) => match serde_json::to_string(&objs) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("cannot encode objectives: {e}");
                    code = 1;
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "Batch failed");
                code = 1;
            }
        }
    }

    if args.keep_alive {
        caller.release().await;
    } else {
        caller.close().await;
    }
    std::process::exit(code);
}
