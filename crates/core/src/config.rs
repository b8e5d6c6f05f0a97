use crate::{MultibootError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MOUNT_POINT_ENV: &str = "MULTIBOOT_MOUNT_POINT";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mount_point: PathBuf,
    pub probe_mount_point: PathBuf,
    pub partition_start: String,
    pub volume_label: Option<String>,
    pub settle: SettleConfig,
    pub format_retries: u32,
    pub bootloader_retries: u32,
    pub grub_target: String,
    pub copy_buffer_bytes: usize,
    pub progress_interval_ms: u64,
    pub hash_manifest: bool,
    pub menu: MenuConfig,
}

/// Pauses around partition-table re-reads, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettleConfig {
    pub before_reread_ms: u64,
    pub after_reread_ms: u64,
    pub retry_before_reread_ms: u64,
    pub retry_after_reread_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MenuConfig {
    pub timeout_secs: u32,
    pub empty_timeout_secs: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from("/mnt/multiboot_usb_creator_temp"),
            probe_mount_point: PathBuf::from("/mnt/multiboot_usb_creator_probe"),
            partition_start: "1MiB".to_string(),
            volume_label: Some("MULTIBOOT".to_string()),
            settle: SettleConfig::default(),
            format_retries: 1,
            bootloader_retries: 1,
            grub_target: "i386-pc".to_string(),
            copy_buffer_bytes: 1024 * 1024,
            progress_interval_ms: 250,
            hash_manifest: false,
            menu: MenuConfig::default(),
        }
    }
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            before_reread_ms: 3000,
            after_reread_ms: 3000,
            retry_before_reread_ms: 5000,
            retry_after_reread_ms: 2000,
        }
    }
}

impl SettleConfig {
    /// No pauses at all; used by tests and dry environments.
    pub fn immediate() -> Self {
        Self {
            before_reread_ms: 0,
            after_reread_ms: 0,
            retry_before_reread_ms: 0,
            retry_after_reread_ms: 0,
        }
    }
}

impl Default for MenuConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            empty_timeout_secs: 5,
        }
    }
}

impl EngineConfig {
    /// Defaults, overlaid by a JSON file when given, then by the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let data = std::fs::read_to_string(path).map_err(|err| {
                    MultibootError::Config(format!("read {}: {}", path.display(), err))
                })?;
                serde_json::from_str::<EngineConfig>(&data).map_err(|err| {
                    MultibootError::Config(format!("parse {}: {}", path.display(), err))
                })?
            }
            None => EngineConfig::default(),
        };
        if let Ok(value) = std::env::var(MOUNT_POINT_ENV) {
            if !value.trim().is_empty() {
                config.mount_point = PathBuf::from(value);
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mount_point == self.probe_mount_point {
            return Err(MultibootError::Config(
                "mount_point and probe_mount_point must differ".to_string(),
            ));
        }
        if !self.mount_point.is_absolute() || !self.probe_mount_point.is_absolute() {
            return Err(MultibootError::Config(
                "mount points must be absolute paths".to_string(),
            ));
        }
        if self.copy_buffer_bytes == 0 {
            return Err(MultibootError::Config(
                "copy_buffer_bytes must be > 0".to_string(),
            ));
        }
        if let Some(label) = &self.volume_label {
            if label.len() > 11 {
                return Err(MultibootError::Config(
                    "volume_label must be 11 characters or less".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

pub fn millis(value: u64) -> Duration {
    Duration::from_millis(value)
}
