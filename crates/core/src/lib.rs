use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

pub mod config;
pub mod context;
pub mod device;
pub mod error;

pub use config::{EngineConfig, MenuConfig, SettleConfig};
pub use context::{
    ChannelSink, CopyProgress, Event, EventSink, LogLevel, MemorySink, NullSink,
    OperationContext,
};
pub use device::{resolve_partition, BlockDevice, PartitionNaming};
pub use error::{MultibootError, Result};

pub const DEVICE_GRAPH_SCHEMA_VERSION: &str = "1.0.0";

/// Directory on the data partition that holds one file per bootable image.
pub const IMAGE_DIR: &str = "isos";
/// Boot directory handed to the boot-loader installer.
pub const BOOT_DIR: &str = "boot";
/// Menu configuration file, relative to the partition root.
pub const MENU_FILE: &str = "boot/grub/grub.cfg";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceGraph {
    pub graph_id: Uuid,
    pub schema_version: String,
    pub host: HostInfo,
    pub disks: Vec<Disk>,
    pub generated_at_utc: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HostInfo {
    pub os: String,
    pub os_version: String,
    pub machine: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Disk {
    pub id: String,
    pub path: PathBuf,
    pub friendly_name: String,
    pub size_bytes: u64,
    pub is_system_disk: bool,
    pub removable: bool,
    pub transport: Option<String>,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Partition {
    pub id: String,
    pub label: Option<String>,
    pub fs: Option<String>,
    pub size_bytes: u64,
    pub mount_points: Vec<String>,
}

impl DeviceGraph {
    pub fn new(host: HostInfo, disks: Vec<Disk>) -> Self {
        Self {
            graph_id: Uuid::new_v4(),
            schema_version: DEVICE_GRAPH_SCHEMA_VERSION.to_string(),
            host,
            disks,
            generated_at_utc: now_utc_rfc3339(),
        }
    }

    pub fn find_disk(&self, device_path: &Path) -> Option<&Disk> {
        let name = device_path.file_name()?.to_str()?;
        self.disks.iter().find(|disk| disk.id == name)
    }
}

/// A bootable image chosen by the user, identified on the device by its base name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageAsset {
    pub source_path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
}

impl ImageAsset {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(MultibootError::InvalidInput(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                MultibootError::InvalidInput(format!("{} has no usable file name", path.display()))
            })?
            .to_string();
        Ok(Self {
            source_path: path.to_path_buf(),
            file_name,
            size_bytes: metadata.len(),
        })
    }
}

/// Structural convention a live image follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BootFamily {
    DebianLive,
    UbuntuCasper,
    FedoraIsolinux,
    ArchLinux,
    SyslinuxGeneric,
    ClonezillaLive,
    Unknown,
}

impl BootFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootFamily::DebianLive => "debian-live",
            BootFamily::UbuntuCasper => "ubuntu-casper",
            BootFamily::FedoraIsolinux => "fedora-isolinux",
            BootFamily::ArchLinux => "arch-linux",
            BootFamily::SyslinuxGeneric => "syslinux-generic",
            BootFamily::ClonezillaLive => "clonezilla-live",
            BootFamily::Unknown => "unknown",
        }
    }
}

impl fmt::Display for BootFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Verify,
    List,
    Add,
    Remove,
    Preview,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Verify => "verify",
            OperationKind::List => "list",
            OperationKind::Add => "add",
            OperationKind::Remove => "remove",
            OperationKind::Preview => "preview",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Steps of a device operation, in the order a creation run passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    UnmountDevice,
    Partition,
    Settle,
    Format,
    Mount,
    Verify,
    InstallBootLoader,
    CopyImages,
    AddImage,
    RemoveImage,
    WriteMenu,
    Release,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::UnmountDevice => "unmount device",
            Phase::Partition => "partition",
            Phase::Settle => "settle",
            Phase::Format => "format",
            Phase::Mount => "mount",
            Phase::Verify => "verify",
            Phase::InstallBootLoader => "install boot loader",
            Phase::CopyImages => "copy images",
            Phase::AddImage => "add image",
            Phase::RemoveImage => "remove image",
            Phase::WriteMenu => "write menu",
            Phase::Release => "release",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn image_asset_uses_base_name_and_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ubuntu-22.04.iso");
        fs::write(&path, vec![0u8; 4096]).unwrap();

        let asset = ImageAsset::from_path(&path).unwrap();
        assert_eq!(asset.file_name, "ubuntu-22.04.iso");
        assert_eq!(asset.size_bytes, 4096);
        assert_eq!(asset.source_path, path);
    }

    #[test]
    fn image_asset_rejects_directories() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            ImageAsset::from_path(dir.path()),
            Err(MultibootError::InvalidInput(_))
        ));
    }

    #[test]
    fn phases_order_like_a_creation_run() {
        assert!(Phase::Partition < Phase::Format);
        assert!(Phase::Format < Phase::InstallBootLoader);
        assert!(Phase::CopyImages < Phase::WriteMenu);
    }
}
