//! Configuration for post offices and the central post office.
//!
//! Both sides load TOML files. The broker keeps its client roster in a
//! separate secrets file so `manage.write` can persist roster changes
//! without touching the main configuration.

use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// What to do when a bounded queue is full and another message arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the message being enqueued.
    #[default]
    DropNewest,
    /// Drop the oldest queued message to make room.
    DropOldest,
}

/// Parameters for one post office process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoConfig {
    pub name: String,
    /// Shared secret, base64.
    pub secret: String,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    pub cpo_host: String,
    #[serde(default = "default_port")]
    pub cpo_port: u16,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl PoConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_po_name(&self.name)?;
        decode_secret(&self.secret)?;
        if self.queue_size == 0 {
            return Err(ConfigError::Invalid("queue_size must be at least 1".into()));
        }
        if self.cpo_host.is_empty() {
            return Err(ConfigError::Invalid("cpo_host is missing".into()));
        }
        if self.cpo_port == 0 {
            return Err(ConfigError::Invalid("cpo_port must be non-zero".into()));
        }
        Ok(())
    }

    pub fn secret_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        decode_secret(&self.secret)
    }
}

/// Parameters for the central post office.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpoConfig {
    pub name: String,
    #[serde(default = "default_local_address")]
    pub local_address: String,
    /// Listening port; 0 binds an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl CpoConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_po_name(&self.name)?;
        if self.local_address.is_empty() {
            return Err(ConfigError::Invalid("local_address is missing".into()));
        }
        if self.ping_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "ping_interval_ms must be non-zero".into(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "max_message_size must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// One configured broker client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEntry {
    pub name: String,
    /// Shared secret, base64.
    pub secret: String,
    #[serde(default)]
    pub manager: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ClientsFile {
    #[serde(default)]
    clients: Vec<ClientEntry>,
}

pub fn load_cpo_config(path: &Path) -> Result<CpoConfig, ConfigError> {
    let contents = read(path)?;
    let config: CpoConfig = parse(path, &contents)?;
    config.validate()?;
    Ok(config)
}

pub fn load_po_config(path: &Path) -> Result<PoConfig, ConfigError> {
    let contents = read(path)?;
    let config: PoConfig = parse(path, &contents)?;
    config.validate()?;
    Ok(config)
}

/// Load the broker's client roster, validating each entry.
pub fn load_clients(path: &Path) -> Result<Vec<ClientEntry>, ConfigError> {
    let contents = read(path)?;
    let file: ClientsFile = parse(path, &contents)?;
    for client in &file.clients {
        validate_po_name(&client.name)?;
        decode_secret(&client.secret)?;
    }
    Ok(file.clients)
}

/// Persist the broker's client roster atomically (temp file + rename).
pub fn write_clients(path: &Path, clients: &[ClientEntry]) -> Result<(), ConfigError> {
    let file = ClientsFile {
        clients: clients.to_vec(),
    };
    let contents = toml::to_string_pretty(&file)
        .map_err(|e| ConfigError::Invalid(format!("failed to render clients: {e}")))?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents.as_bytes()).map_err(|source| ConfigError::Write {
        path: tmp.display().to_string(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| ConfigError::Write {
        path: path.display().to_string(),
        source,
    })
}

pub fn decode_secret(secret_base64: &str) -> Result<Vec<u8>, ConfigError> {
    if secret_base64.is_empty() {
        return Err(ConfigError::Invalid("secret is missing".into()));
    }
    STANDARD
        .decode(secret_base64)
        .map_err(|e| ConfigError::Invalid(format!("secret is not valid base64: {e}")))
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn parse<T: serde::de::DeserializeOwned>(path: &Path, contents: &str) -> Result<T, ConfigError> {
    toml::from_str(contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn validate_po_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::Invalid("name is missing".into()));
    }
    if name.contains('.') {
        return Err(ConfigError::Invalid(format!(
            "name may not contain a period: {name}"
        )));
    }
    Ok(())
}

fn default_queue_size() -> usize {
    100
}

fn default_port() -> u16 {
    4000
}

fn default_local_address() -> String {
    "0.0.0.0".into()
}

fn default_ping_interval_ms() -> u64 {
    5000
}

fn default_max_message_size() -> usize {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn po_config_validation_catches_bad_fields() {
        let good = PoConfig {
            name: "alpha".into(),
            secret: STANDARD.encode(b"secret"),
            queue_size: 10,
            cpo_host: "localhost".into(),
            cpo_port: 4000,
            overflow: OverflowPolicy::DropNewest,
        };
        assert!(good.validate().is_ok());

        let mut bad = good.clone();
        bad.name = "al.pha".into();
        assert!(bad.validate().is_err());

        let mut bad = good.clone();
        bad.secret = "*** not base64 ***".into();
        assert!(bad.validate().is_err());

        let mut bad = good.clone();
        bad.queue_size = 0;
        assert!(bad.validate().is_err());

        let mut bad = good;
        bad.cpo_port = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn clients_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clients.toml");
        let clients = vec![
            ClientEntry {
                name: "alpha".into(),
                secret: STANDARD.encode(b"one"),
                manager: false,
            },
            ClientEntry {
                name: "manager".into(),
                secret: STANDARD.encode(b"two"),
                manager: true,
            },
        ];

        write_clients(&path, &clients).unwrap();
        let loaded = load_clients(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "alpha");
        assert!(loaded[1].manager);
    }

    #[test]
    fn cpo_config_parses_with_defaults() {
        let config: CpoConfig = toml::from_str("name = \"central\"").unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.ping_interval_ms, 5000);
        assert_eq!(config.max_message_size, 5000);
        assert_eq!(config.local_address, "0.0.0.0");
        assert!(config.validate().is_ok());
    }
}
