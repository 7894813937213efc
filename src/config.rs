use crate::client::ClientSettings;
use crate::command::dispatcher::DispatchSettings;
use crate::command::signing::HmacSigner;
use crate::device::history::DEFAULT_CAPACITY;
use crate::mqtt::config::{BackoffSchedule, BrokerAddress, ConnectOptions, Credentials, LastWill};
use crate::mqtt::topic::APP_STATUS_TOPIC;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const CONFIG_DIR: &str = ".config/lockbridge";
const CONFIG_FILE: &str = "config.toml";

pub const BROKER_USER_ENV: &str = "LOCKBRIDGE_BROKER_USER";
pub const BROKER_PASSWORD_ENV: &str = "LOCKBRIDGE_BROKER_PASSWORD";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub device: DeviceConfig,
    pub commands: CommandConfig,
    pub history: HistoryConfig,
    pub signing: SigningConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub backoff: BackoffSchedule,
    /// Retained offline notice on `app/status` if the session dies uncleanly
    pub last_will: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "broker.hivemq.com".into(),
            port: 1883,
            client_id_prefix: "lockbridge".into(),
            keep_alive_secs: 60,
            connect_timeout_secs: 30,
            backoff: BackoffSchedule::default(),
            last_will: true,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub device_id: String,
    pub user_id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: "lock-001".into(),
            user_id: "user-001".into(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CommandConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct SigningConfig {
    /// Hex encoded HMAC key; commands go out unsigned without one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl AppConfig {
    pub fn broker_address(&self) -> BrokerAddress {
        BrokerAddress::new(self.broker.host.clone(), self.broker.port)
    }

    pub fn connect_options(&self) -> ConnectOptions {
        let client_id = format!(
            "{}-{}",
            self.broker.client_id_prefix,
            chrono::Utc::now().timestamp_millis()
        );
        let last_will = self.broker.last_will.then(|| LastWill {
            topic: APP_STATUS_TOPIC.into(),
            payload: serde_json::json!({ "status": "offline", "clientId": client_id }).to_string(),
            retain: true,
        });

        ConnectOptions {
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            connect_timeout: Duration::from_secs(self.broker.connect_timeout_secs),
            backoff: self.broker.backoff.clone(),
            presence_topic: last_will.as_ref().map(|will| will.topic.clone()),
            last_will,
            client_id,
            ..ConnectOptions::default()
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            default_timeout: Duration::from_millis(self.commands.timeout_ms),
            max_retries: self.commands.max_retries,
            retry_delay: Duration::from_millis(self.commands.retry_delay_ms),
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            user_id: self.device.user_id.clone(),
            dispatch: self.dispatch_settings(),
            history_capacity: self.history.capacity,
        }
    }

    pub fn signer(&self) -> Result<Option<HmacSigner>> {
        self.signing
            .key
            .as_deref()
            .map(|key| HmacSigner::from_hex(key).map_err(|e| eyre!("Invalid signing key: {}", e)))
            .transpose()
    }
}

/// Broker credentials from the environment; empty when unset
pub fn credentials_from_env() -> Credentials {
    let username = std::env::var(BROKER_USER_ENV).unwrap_or_default();
    let password = std::env::var(BROKER_PASSWORD_ENV).unwrap_or_default();
    Credentials::new(username, password)
}

pub fn get_home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| eyre!("Could not determine home directory"))
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = get_home_dir()?;
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    Ok(path)
}

pub fn load_from(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| eyre!("Failed to read config {}: {}", path.display(), e))?;
    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| eyre!("Failed to parse config {}: {}", path.display(), e))?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

pub fn save_to(config: &AppConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
    }
    let content =
        toml::to_string_pretty(config).map_err(|e| eyre!("Failed to serialize config: {}", e))?;
    fs::write(path, content)
        .map_err(|e| eyre!("Failed to write config {}: {}", path.display(), e))?;
    Ok(())
}

/// Writes the defaults if there is no config file yet
pub fn ensure_default_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    info!("No config at {}, writing defaults", path.display());
    save_to(&AppConfig::default(), path)
}

/// Loads `path`, or the default location when `None`
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };
    ensure_default_config(&path)?;
    load_from(&path)
}
