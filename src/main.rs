//! FerroDB - an in-memory key-value store with TTL, multiple databases,
//! role-based access control, and a durable append-only log.
//!
//! Architecture:
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TCP Clients (RESP / inline)                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Listener / ConnectionHandler (server)           │
//! │        (frame decode, auth + ACL enforcement, replies)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Engine                              │
//! │      (command dispatch, single writer lock, replay)          │
//! └───────────────────────────┬───────────────────────┬─────────┘
//!                              ▼                       ▼
//! ┌──────────────────────────────────┐ ┌────────────────────────────────┐
//! │              Store                │ │              Aol                │
//! │  (sharded-by-db in-memory maps)   │ │  (append-only log + rewrite)   │
//! └──────────────────────────────────┘ └────────────────────────────────┘

use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use ferrodb::{Config, Engine, Listener};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut port_override: Option<String> = None;
    let mut data_dir_override: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--data-dir" | "-d" => {
                if i + 1 < args.len() {
                    data_dir_override = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("FerroDB - an in-memory key-value store with TTL and a durable log");
                println!();
                println!("Usage: ferrodb [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config PATH     YAML config file to load");
                println!("  -p, --port PORT       Port to listen on (default: 6380)");
                println!("  -d, --data-dir DIR    Data directory (default: data)");
                println!("  -h, --help            Show this help");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    // Load the config file first, then layer flag overrides on top, so
    // `--port`/`--data-dir` aren't silently discarded by `--config`.
    let mut config = match &config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(port) = port_override {
        config.listen_addr = format!(":{port}");
    }
    if let Some(data_dir) = data_dir_override {
        config.data_dir = data_dir;
    }

    info!("starting FerroDB...");
    let engine = Arc::new(Engine::new(&config)?);
    let listener = Listener::new(engine, &config);
    listener.run().await?;

    Ok(())
}
