//! Client settings read from `<config dir>/rusty_fcp/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::auth::{HostRecord, SshDirCredentialStore};
use crate::connection::ConnectOptions;
use crate::error::{Error, Result};
use crate::types::{TransferConfig, WriteMode};

const APP_DIR: &str = "rusty_fcp";
const CONFIG_FILE: &str = "config.json";

/// Settings shared by every session
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Buffer size for read/write operations in bytes
    pub io_size: usize,
    pub connect_timeout_secs: u64,
    /// Directory for SSH control sockets
    pub control_dir: PathBuf,
    /// Directory holding private keys
    pub ssh_dir: PathBuf,
    /// Defaults to `known_hosts` inside `ssh_dir`
    pub known_hosts: Option<PathBuf>,
    pub hosts: Vec<HostRecord>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let ssh_dir = dirs::home_dir()
            .map(|home| home.join(".ssh"))
            .unwrap_or_else(|| PathBuf::from(".ssh"));
        Self {
            io_size: TransferConfig::default().io_size,
            connect_timeout_secs: 60,
            control_dir: std::env::temp_dir().join(APP_DIR),
            ssh_dir,
            known_hosts: None,
            hosts: Vec::new(),
        }
    }
}

/// Location of the config file when none is given
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

impl ClientConfig {
    /// Reads `path`, or the default location when `path` is `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - An explicit `path` does not exist ([`Error::PathNotFound`])
    /// - The file cannot be read
    /// - The JSON does not describe a config ([`Error::Validation`])
    ///
    /// # Example
    ///
    /// ```ignore
    /// let config = ClientConfig::load(None)?;
    /// let dialer = OpensshDialer::new(&config.control_dir, config.known_hosts_path());
    /// ```
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match default_config_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_json(&text)
                .map_err(|e| Error::Validation(format!("{}: {e}", path.display()))),
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config file at {:?}, using defaults", path);
                Ok(Self::default())
            }
            Err(e) => Err(Error::from_io(path, e)),
        }
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        self.known_hosts
            .clone()
            .unwrap_or_else(|| self.ssh_dir.join("known_hosts"))
    }

    pub fn transfer_config(&self, write_mode: WriteMode) -> TransferConfig {
        TransferConfig::new(self.io_size, write_mode)
    }

    pub fn connect_options(&self, identity: Option<String>) -> ConnectOptions {
        ConnectOptions {
            identity,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn credential_store(&self) -> SshDirCredentialStore {
        SshDirCredentialStore::new(&self.ssh_dir, self.hosts.clone())
    }
}
