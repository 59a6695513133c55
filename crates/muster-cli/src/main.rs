use clap::{Parser, Subcommand};
use muster_gateway::GatewayServer;
use muster_runtime::{Engine, FileStateStore, RuntimeConfig, StateStore};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "muster", about = "Muster — multi-agent task orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "muster.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator and its HTTP gateway
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Parse the config file and print what would be loaded
    Check,
}

#[derive(Deserialize)]
struct MusterConfig {
    #[serde(default = "default_data_dir")]
    data_dir: PathBuf,
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    runtime: RuntimeConfig,
}

impl Default for MusterConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server: ServerConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Deserialize)]
struct ServerConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}

async fn load_config(path: &PathBuf) -> anyhow::Result<MusterConfig> {
    if !path.exists() {
        info!(path = %path.display(), "No config file found, using defaults");
        return Ok(MusterConfig::default());
    }
    let config_str = tokio::fs::read_to_string(path).await.map_err(|e| {
        anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
    })?;
    Ok(toml::from_str(&config_str)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or(config.server.host);
            let port = port.unwrap_or(config.server.port);

            let engine = Arc::new(Engine::new(config.runtime).await?);

            // Recover the task and agent tables from the last shutdown.
            let store = FileStateStore::new(config.data_dir.join("snapshot.json"));
            match store.load().await {
                Ok(Some(snapshot)) => {
                    info!(
                        tasks = snapshot.tasks.len(),
                        agents = snapshot.agents.len(),
                        "Restoring snapshot"
                    );
                    engine.restore(snapshot).await;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Snapshot unreadable, starting fresh"),
            }

            let handles = engine.spawn();
            let app = GatewayServer::build(engine.clone());

            let addr = format!("{}:{}", host, port);
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!("Muster gateway listening on {}", addr);

            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;

            info!("Shutting down, saving snapshot");
            store.save(&engine.snapshot().await).await?;
            engine.stop();
            for handle in handles {
                let _ = handle.await;
            }
        }
        Commands::Check => {
            println!("Config: {}", cli.config.display());
            println!("Data dir: {}", config.data_dir.display());
            println!(
                "Listen: {}:{}",
                config.server.host, config.server.port
            );
            println!("Resources:");
            if config.runtime.resources.is_empty() {
                println!("  (none declared)");
            } else {
                for decl in &config.runtime.resources {
                    println!("  {} ({}) capacity {}", decl.id, decl.kind, decl.capacity);
                }
            }
            println!("Alert rules: {}", config.runtime.rules.len());
        }
    }

    Ok(())
}
