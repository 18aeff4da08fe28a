//! Driver configuration stored as TOML under the user's config directory
//!
//! A default file is written on first start so the match table and report
//! layout can be edited without rebuilding.

use crate::driver::BindingSettings;
use crate::driver::binding::DEFAULT_DEVICE_NAME;
use crate::report::{RawReport, ReportError, ReportLayout};
use crate::usb::DeviceId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/usbmouse";
const CONFIG_FILE: &str = "driver.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid report layout: {0}")]
    Layout(#[from] ReportError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Device played back by the demo binary
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ReplayConfig {
    /// Endpoint polling interval, also the pace of the replay
    pub interval_ms: u8,
    pub reports: Vec<RawReport>,
    pub device: DeviceId,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10,
            reports: vec![
                [0x00, 0x01, 0x05, 0x00, 0xFB, 0x00, 0x00, 0x00],
                [0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00],
                [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00],
                [0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
                [0x00, 0x00, 0xFE, 0x00, 0x02, 0x00, 0xFF, 0x00],
            ],
            device: DeviceId::new(0x1038, 0x1702),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    /// Name the input device is registered under
    pub device_name: String,
    pub event_queue_capacity: usize,
    /// Vendor/product pairs the driver binds to
    pub match_table: Vec<DeviceId>,
    pub layout: ReportLayout,
    pub replay: ReplayConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            event_queue_capacity: 1000,
            match_table: vec![DeviceId::new(0x1038, 0x1702)],
            layout: ReportLayout::default(),
            replay: ReplayConfig::default(),
        }
    }
}

impl DriverConfig {
    /// `~/.config/usbmouse/driver.toml`, relative to `.` without a home directory.
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| {
            warn!("Could not determine home directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.layout.validate()?;
        if self.match_table.is_empty() {
            return Err(ConfigError::Invalid("match_table is empty".to_string()));
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn binding_settings(&self) -> BindingSettings {
        BindingSettings {
            device_name: self.device_name.clone(),
            layout: self.layout,
        }
    }

    /// Loads the config at `path`, writing the defaults there first if the
    /// file does not exist.
    pub async fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        let io_err = |source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if !tokio::fs::try_exists(path).await.map_err(io_err)? {
            info!("Creating default configuration at {}", path.display());
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
            let config = Self::default();
            tokio::fs::write(path, config.to_toml_string()?)
                .await
                .map_err(io_err)?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(path).await.map_err(io_err)?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded configuration from {}: {:?}", path.display(), config);
        Ok(config)
    }
}
