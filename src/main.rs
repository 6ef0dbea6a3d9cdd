mod ai_sdk;
mod cancel;
mod client;
mod config;
mod context;
mod error;
mod events;
mod file_selector;
mod lifecycle;
mod protocol;
mod repo_locator;
mod repo_source;
mod server;
mod session;
mod sse;
mod streamer;
#[cfg(test)]
mod test_support;
mod ui;

use clap::{Parser, Subcommand};
use client::{BridgeClient, ClientConfig};
use config::SettingsStore;
use server::ServerConfig;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

type MainResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "repochat", version, about = "Ask questions about a git repository")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator that clones repositories and talks to the model.
    Serve {
        #[arg(long, env = "REPOCHAT_LISTEN", default_value = "127.0.0.1:7878")]
        listen: String,
        /// Where working copies are cloned, one directory per repository name.
        #[arg(long, env = "REPOCHAT_CLONE_ROOT")]
        clone_root: Option<PathBuf>,
        #[arg(long, env = "REPOCHAT_SETTINGS")]
        settings: Option<PathBuf>,
        /// OpenAI-compatible API base URL; saved to the settings file.
        #[arg(long, env = "REPOCHAT_BASE_URL")]
        base_url: Option<String>,
        #[arg(long, env = "REPOCHAT_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },
    /// Open the chat panel against a running coordinator.
    Panel {
        #[arg(long, env = "REPOCHAT_SERVER", default_value = "http://127.0.0.1:7878")]
        server: String,
        /// Repository to open, like the URL of a browser tab.
        #[arg(long)]
        url: Option<String>,
        #[arg(long, env = "REPOCHAT_SETTINGS")]
        settings: Option<PathBuf>,
    },
    /// Show or change the stored settings.
    Config {
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, env = "REPOCHAT_SETTINGS")]
        settings: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> MainResult<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            listen,
            clone_root,
            settings,
            base_url,
            api_key,
        } => {
            init_logging();
            server::run(ServerConfig {
                listen,
                clone_root: clone_root.unwrap_or_else(|| std::env::temp_dir().join("repochat")),
                settings_path: settings.unwrap_or_else(SettingsStore::default_path),
                base_url,
                api_key,
            })
            .await
        }
        Commands::Panel {
            server,
            url,
            settings,
        } => {
            let settings_path = settings.unwrap_or_else(SettingsStore::default_path);
            init_file_logging(&log_file_path(&settings_path))?;
            let store = SettingsStore::open(&settings_path)?;
            let client = BridgeClient::connect(ClientConfig { base_url: server }).await?;
            tracing::info!(connection_id = client.connection_id(), "Panel started");

            let result = ui::run_panel(client.clone(), store, url);
            if let Err(err) = client.disconnect().await {
                tracing::warn!(error = %err, "Failed to close connection");
            }
            result
        }
        Commands::Config {
            base_url,
            api_key,
            model,
            settings,
        } => {
            let store = SettingsStore::open(settings.unwrap_or_else(SettingsStore::default_path))?;
            if base_url.is_some() || api_key.is_some() || model.is_some() {
                store.update(|settings| {
                    if let Some(base_url) = base_url {
                        settings.client_options.base_url = base_url;
                    }
                    if let Some(api_key) = api_key {
                        settings.client_options.api_key = api_key;
                    }
                    if let Some(model) = model {
                        settings.selected_model = model;
                    }
                })?;
            }

            let settings = store.get();
            println!("base URL: {}", settings.client_options.base_url);
            println!(
                "API key:  {}",
                if settings.client_options.api_key.is_empty() {
                    "(none)"
                } else {
                    "(set)"
                }
            );
            println!(
                "model:    {}",
                if settings.selected_model.is_empty() {
                    "(none)"
                } else {
                    settings.selected_model.as_str()
                }
            );
            Ok(())
        }
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init();
}

// The panel owns the terminal, so its logs go to a file.
fn init_file_logging(log_path: &Path) -> MainResult<()> {
    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(log_file))
        .try_init();

    Ok(())
}

fn log_file_path(settings_path: &Path) -> PathBuf {
    settings_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join("panel.log")
}
