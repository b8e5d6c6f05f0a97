use anyhow::{Context, Result};
use multiboot_core::device::{naming_for, PartitionNaming};
use multiboot_core::{DeviceGraph, Disk, HostInfo, Partition};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub mod command;
pub mod grub;
pub mod mount;
pub mod partition;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use command::{CommandOutput, CommandRunner, Shell, SystemRunner};
pub use grub::install_boot_loader;
pub use mount::{with_mount, MountGuard, MountRequest};
pub use partition::format_device;

/// Tools the device pipeline shells out to.
pub const REQUIRED_TOOLS: &[&str] = &[
    "parted",
    "partprobe",
    "mkfs.fat",
    "grub-install",
    "mount",
    "umount",
];

pub fn missing_tools() -> Vec<&'static str> {
    REQUIRED_TOOLS
        .iter()
        .copied()
        .filter(|tool| which::which(tool).is_err())
        .collect()
}

pub fn build_device_graph() -> Result<DeviceGraph> {
    let host = HostInfo {
        os: "linux".to_string(),
        os_version: read_os_release(),
        machine: read_machine(),
    };
    let disks = enumerate_disks()?;
    Ok(DeviceGraph::new(host, disks))
}

/// Disks the user may pick as a target: removable and not hosting `/`.
pub fn removable_disks(graph: &DeviceGraph) -> Vec<&Disk> {
    graph
        .disks
        .iter()
        .filter(|disk| disk.removable && !disk.is_system_disk)
        .collect()
}

fn enumerate_disks() -> Result<Vec<Disk>> {
    let data = fs::read_to_string("/proc/self/mounts").unwrap_or_default();
    let mounts = parse_mounts(&data);
    let labels = read_labels();
    let mut disks = Vec::new();
    let entries = fs::read_dir("/sys/block").context("read /sys/block")?;
    for entry in entries {
        let entry = entry?;
        let disk_name = entry.file_name().to_string_lossy().to_string();
        if is_virtual_disk(&disk_name, entry.path()) {
            continue;
        }
        let size_bytes = read_u64(entry.path().join("size"))
            .map(|sectors| sectors.saturating_mul(512))
            .unwrap_or(0);
        let removable = read_u64(entry.path().join("removable")).unwrap_or(0) == 1;
        let model = read_string(entry.path().join("device/model"))
            .unwrap_or_else(|| disk_name.clone());
        let transport = read_transport(&disk_name, &entry.path());
        let partitions = enumerate_partitions(entry.path(), &mounts, &labels)?;
        let is_system_disk = partitions
            .iter()
            .any(|partition| partition.mount_points.iter().any(|mount| mount == "/"));
        disks.push(Disk {
            path: PathBuf::from("/dev").join(&disk_name),
            id: disk_name,
            friendly_name: model,
            size_bytes,
            removable,
            is_system_disk,
            transport,
            partitions,
        });
    }
    disks.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(disks)
}

fn enumerate_partitions(
    disk_path: PathBuf,
    mounts: &HashMap<String, Vec<MountInfo>>,
    labels: &HashMap<String, String>,
) -> Result<Vec<Partition>> {
    let mut partitions = Vec::new();
    let entries = fs::read_dir(&disk_path).context("read disk entries")?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.join("partition").exists() {
            continue;
        }
        let part_name = entry.file_name().to_string_lossy().to_string();
        let size_bytes = read_u64(path.join("size"))
            .map(|sectors| sectors.saturating_mul(512))
            .unwrap_or(0);
        let mount_infos = mounts.get(&part_name).cloned().unwrap_or_default();
        let mount_points = mount_infos
            .iter()
            .map(|info| info.mount_point.clone())
            .collect();
        let fs_type = mount_infos.first().map(|info| info.fs_type.clone());
        let label = labels.get(&part_name).cloned();
        partitions.push(Partition {
            id: part_name,
            label,
            fs: fs_type,
            size_bytes,
            mount_points,
        });
    }
    partitions.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(partitions)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub device: PathBuf,
    pub mount_point: String,
    pub fs_type: String,
}

/// Parses `/proc/self/mounts` text, keyed by the device's base name.
pub fn parse_mounts(data: &str) -> HashMap<String, Vec<MountInfo>> {
    let mut mounts: HashMap<String, Vec<MountInfo>> = HashMap::new();
    for line in data.lines() {
        let mut parts = line.split_whitespace();
        let device = match parts.next() {
            Some(value) => value,
            None => continue,
        };
        let mount_point = match parts.next() {
            Some(value) => unescape_mount(value),
            None => continue,
        };
        let fs_type = match parts.next() {
            Some(value) => value.to_string(),
            None => continue,
        };
        if !device.starts_with("/dev/") {
            continue;
        }
        let name = Path::new(device)
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("")
            .to_string();
        if name.is_empty() {
            continue;
        }
        mounts.entry(name).or_default().push(MountInfo {
            device: PathBuf::from(device),
            mount_point,
            fs_type,
        });
    }
    mounts
}

/// True when `candidate` names `disk` itself or one of its numbered partitions.
pub fn belongs_to_disk(disk: &str, candidate: &str) -> bool {
    let Some(rest) = candidate.strip_prefix(disk) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    let digits = match naming_for(disk) {
        PartitionNaming::Suffix => rest,
        PartitionNaming::Infix => match rest.strip_prefix('p') {
            Some(digits) => digits,
            None => return false,
        },
    };
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

/// Mount points currently held by `device` or any of its partitions.
pub fn mounted_children(device: &Path, mount_table: &str) -> Vec<MountInfo> {
    let Some(disk) = device.file_name().and_then(|name| name.to_str()) else {
        return Vec::new();
    };
    let mut children: Vec<MountInfo> = parse_mounts(mount_table)
        .into_iter()
        .filter(|(name, _)| belongs_to_disk(disk, name))
        .flat_map(|(_, infos)| infos)
        .collect();
    children.sort_by(|a, b| a.mount_point.cmp(&b.mount_point));
    children
}

pub fn read_mount_table() -> String {
    fs::read_to_string("/proc/self/mounts").unwrap_or_default()
}

fn read_labels() -> HashMap<String, String> {
    let mut labels = HashMap::new();
    let path = Path::new("/dev/disk/by-label");
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            if let Ok(target) = fs::read_link(entry.path()) {
                if let Some(name) = target.file_name().and_then(|v| v.to_str()) {
                    labels.insert(
                        name.to_string(),
                        entry.file_name().to_string_lossy().to_string(),
                    );
                }
            }
        }
    }
    labels
}

fn read_transport(name: &str, sys_path: &Path) -> Option<String> {
    if let Ok(target) = fs::canonicalize(sys_path) {
        if target.to_string_lossy().contains("/usb") {
            return Some("usb".to_string());
        }
    }
    if name.starts_with("nvme") {
        Some("nvme".to_string())
    } else if name.starts_with("mmcblk") {
        Some("mmc".to_string())
    } else {
        None
    }
}

fn read_os_release() -> String {
    let data = fs::read_to_string("/etc/os-release").unwrap_or_default();
    let mut name = None;
    let mut version = None;
    for line in data.lines() {
        if line.starts_with("NAME=") && name.is_none() {
            name = Some(trim_os_value(line));
        } else if line.starts_with("VERSION=") && version.is_none() {
            version = Some(trim_os_value(line));
        }
    }
    match (name, version) {
        (Some(name), Some(version)) => format!("{} {}", name, version),
        (Some(name), None) => name,
        _ => "unknown".to_string(),
    }
}

fn trim_os_value(line: &str) -> String {
    let value = line.splitn(2, '=').nth(1).unwrap_or("").trim();
    value.trim_matches('"').to_string()
}

fn read_machine() -> String {
    let vendor = read_string("/sys/devices/virtual/dmi/id/sys_vendor");
    let product = read_string("/sys/devices/virtual/dmi/id/product_name");
    match (vendor, product) {
        (Some(vendor), Some(product)) => format!("{} {}", vendor, product),
        (Some(vendor), None) => vendor,
        (None, Some(product)) => product,
        _ => read_string("/proc/sys/kernel/hostname").unwrap_or_else(|| "unknown".to_string()),
    }
}

fn read_string(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path).ok().map(|value| value.trim().to_string())
}

fn read_u64(path: impl AsRef<Path>) -> Option<u64> {
    read_string(path).and_then(|value| value.parse::<u64>().ok())
}

fn unescape_mount(value: &str) -> String {
    let mut output = String::new();
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            let mut octal = String::new();
            for _ in 0..3 {
                if let Some(next) = chars.peek() {
                    if next.is_ascii_digit() {
                        octal.push(*next);
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
            if octal.len() == 3 {
                if let Ok(byte) = u8::from_str_radix(&octal, 8) {
                    output.push(byte as char);
                    continue;
                }
            }
            output.push('\\');
            output.push_str(&octal);
        } else {
            output.push(ch);
        }
    }
    output
}

fn is_virtual_disk(name: &str, path: PathBuf) -> bool {
    if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram") {
        return true;
    }
    if let Ok(target) = fs::canonicalize(path.join("device")) {
        if target.to_string_lossy().contains("/virtual/") {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
/dev/nvme0n1p2 / ext4 rw,relatime 0 0
/dev/sdb1 /media/user/USB\\040KEY vfat rw 0 0
/dev/sdb2 /media/user/data ext4 rw 0 0
/dev/sdba1 /media/other vfat rw 0 0
tmpfs /tmp tmpfs rw 0 0
";

    #[test]
    fn parses_escaped_mount_points() {
        let mounts = parse_mounts(MOUNTS);
        assert_eq!(mounts["sdb1"][0].mount_point, "/media/user/USB KEY");
        assert_eq!(mounts["sdb1"][0].fs_type, "vfat");
        assert!(!mounts.contains_key("tmpfs"));
    }

    #[test]
    fn children_exclude_similarly_named_disks() {
        let children = mounted_children(Path::new("/dev/sdb"), MOUNTS);
        let devices: Vec<_> = children.iter().map(|info| info.device.clone()).collect();
        assert_eq!(
            devices,
            vec![PathBuf::from("/dev/sdb1"), PathBuf::from("/dev/sdb2")]
        );
    }

    #[test]
    fn infix_children_need_the_p() {
        assert!(belongs_to_disk("nvme0n1", "nvme0n1p2"));
        assert!(belongs_to_disk("nvme0n1", "nvme0n1"));
        assert!(!belongs_to_disk("nvme0n1", "nvme0n12"));
        assert!(!belongs_to_disk("mmcblk0", "mmcblk0boot0"));
        assert!(belongs_to_disk("sdc", "sdc10"));
        assert!(!belongs_to_disk("sdc", "sdcd1"));
    }

    #[test]
    fn unescape_keeps_unknown_sequences() {
        assert_eq!(unescape_mount("/a\\011b"), "/a\tb");
        assert_eq!(unescape_mount("/a\\xb"), "/a\\xb");
    }
}
