//! Persistent settings shared by the coordinator and the panel.
//!
//! Settings live in a JSON file; in-process changes are published through a
//! `tokio::sync::watch` channel so subscribers always see a complete snapshot.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, info};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientOptions {
    #[serde(rename = "baseURL")]
    pub base_url: String,
    pub api_key: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub client_options: ClientOptions,
    pub selected_model: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("settings file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub struct SettingsStore {
    path: Option<PathBuf>,
    tx: watch::Sender<Settings>,
}

impl SettingsStore {
    /// Opens the store at `path`; a missing file yields defaults.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let settings = read_settings(&path)?.unwrap_or_default();
        let (tx, _) = watch::channel(settings);
        debug!(path = %path.display(), "Opened settings store");
        Ok(Self {
            path: Some(path),
            tx,
        })
    }

    pub fn in_memory(settings: Settings) -> Self {
        let (tx, _) = watch::channel(settings);
        Self { path: None, tx }
    }

    pub fn default_path() -> PathBuf {
        match dirs::config_dir() {
            Some(dir) => dir.join("repochat").join("settings.json"),
            None => PathBuf::from("repochat-settings.json"),
        }
    }

    pub fn get(&self) -> Settings {
        self.tx.borrow().clone()
    }

    pub fn set(&self, settings: Settings) -> Result<(), SettingsError> {
        if let Some(path) = &self.path {
            write_settings(path, &settings)?;
        }
        self.tx.send_if_modified(|current| {
            if *current == settings {
                false
            } else {
                *current = settings;
                true
            }
        });
        Ok(())
    }

    pub fn update(&self, apply: impl FnOnce(&mut Settings)) -> Result<(), SettingsError> {
        let mut settings = self.get();
        apply(&mut settings);
        self.set(settings)
    }

    /// Re-reads the backing file, notifying subscribers when it changed on disk.
    pub fn reload(&self) -> Result<bool, SettingsError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let Some(settings) = read_settings(path)? else {
            return Ok(false);
        };
        let changed = self.tx.send_if_modified(|current| {
            if *current == settings {
                false
            } else {
                *current = settings;
                true
            }
        });
        if changed {
            info!(path = %path.display(), "Settings changed on disk");
        }
        Ok(changed)
    }

    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }
}

fn read_settings(path: &Path) -> Result<Option<Settings>, SettingsError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SettingsError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn write_settings(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let io_err = |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    // The file holds the completion API key.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let body = serde_json::to_string_pretty(settings).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut file = options.open(path).map_err(io_err)?;
    use std::io::Write;
    file.write_all(body.as_bytes()).map_err(io_err)?;
    Ok(())
}
