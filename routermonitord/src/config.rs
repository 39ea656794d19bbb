use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use serde::Deserialize;
use shared::protocol::DEFAULT_VENDOR_URL;
use crate::error::ConfigError;
use crate::inventory::SortKey;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/routermonitor/routermonitor.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub dhcp: DhcpConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub vendor: VendorConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// Which DHCP server to read, and how to reach it
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DhcpConfig {
    Pfsense(PfsenseConfig),
    DdWrt(DdWrtConfig),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PfsenseConfig {
    /// Leases status page, e.g. https://192.168.1.1/status_dhcp_leases.php
    pub url: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DdWrtConfig {
    pub host: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_lease_file")]
    pub lease_file: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_ssh_command")]
    pub ssh_command: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InventoryConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_table")]
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VendorConfig {
    #[serde(default = "default_vendor_url")]
    pub url: String,
    #[serde(default = "default_min_spacing")]
    pub min_spacing_ms: u64,
    #[serde(default = "default_vendor_timeout")]
    pub timeout_secs: u64,
    /// Column width for the vendor column in listings
    #[serde(default = "default_field_width")]
    pub field_width: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
    /// How often the loop wakes to check the config file and the schedule
    #[serde(default = "default_tick")]
    pub tick_secs: u64,
    pub lock_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_sort_by")]
    pub sort_by: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NotifyConfig {
    /// argv; subject and message are appended as the last two arguments
    pub command: Option<Vec<String>>,
}

fn default_date_format() -> String {
    "%Y/%m/%d %H:%M:%S".to_string()
}

fn default_true() -> bool {
    true
}

fn default_http_timeout() -> u64 {
    15
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_lease_file() -> String {
    "/tmp/dnsmasq.leases".to_string()
}

fn default_connect_timeout() -> u64 {
    1
}

fn default_ssh_command() -> String {
    "ssh".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/routermonitor/routermonitor.db")
}

fn default_table() -> String {
    "clients".to_string()
}

fn default_vendor_url() -> String {
    DEFAULT_VENDOR_URL.to_string()
}

fn default_min_spacing() -> u64 {
    600
}

fn default_vendor_timeout() -> u64 {
    10
}

fn default_field_width() -> usize {
    30
}

fn default_update_interval() -> u64 {
    600
}

fn default_tick() -> u64 {
    5
}

fn default_sort_by() -> String {
    "hostname".to_string()
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            table: default_table(),
        }
    }
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            url: default_vendor_url(),
            min_spacing_ms: default_min_spacing(),
            timeout_secs: default_vendor_timeout(),
            field_width: default_field_width(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: default_update_interval(),
            tick_secs: default_tick(),
            lock_file: None,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            sort_by: default_sort_by(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.update_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "service.update_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.service.tick_secs == 0 {
            return Err(ConfigError::Invalid(
                "service.tick_secs must be greater than zero".to_string(),
            ));
        }
        self.sort_key()?;
        match &self.dhcp {
            DhcpConfig::Pfsense(pf) if pf.url.is_empty() => {
                Err(ConfigError::Invalid("dhcp.url must not be empty".to_string()))
            }
            DhcpConfig::DdWrt(dd) if dd.host.is_empty() => {
                Err(ConfigError::Invalid("dhcp.host must not be empty".to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn sort_key(&self) -> Result<SortKey, ConfigError> {
        self.display
            .sort_by
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown display.sort_by {:?}", self.display.sort_by)))
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.service.update_interval_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.service.tick_secs)
    }

    pub fn min_lookup_spacing(&self) -> Duration {
        Duration::from_millis(self.vendor.min_spacing_ms)
    }

    /// Lock file guarding the inventory against a second writer
    pub fn lock_path(&self) -> PathBuf {
        self.service.lock_file.clone().unwrap_or_else(|| {
            let mut path = self.inventory.db_path.clone().into_os_string();
            path.push(".lock");
            PathBuf::from(path)
        })
    }
}

/// Keeps the current config and reloads it when the file's mtime moves.
pub struct ConfigWatcher {
    path: PathBuf,
    modified: Option<SystemTime>,
    current: Config,
}

impl ConfigWatcher {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let modified = modified_time(&path);
        let current = Config::load(&path)?;
        Ok(Self { path, modified, current })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.current
    }

    /// Ok(true) when a changed file was loaded. On a failed load the previous
    /// config stays active and the new mtime is remembered, so a broken edit
    /// is reported once rather than on every tick.
    pub fn reload_if_changed(&mut self) -> Result<bool, ConfigError> {
        let modified = modified_time(&self.path);
        if modified == self.modified {
            return Ok(false);
        }
        self.modified = modified;

        let config = Config::load(&self.path)?;
        self.current = config;
        Ok(true)
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
