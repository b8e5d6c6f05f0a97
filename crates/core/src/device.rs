use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How a device family numbers its partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionNaming {
    /// `sdb` -> `sdb1`
    Suffix,
    /// `nvme0n1` -> `nvme0n1p1`
    Infix,
}

/// Ordered (prefix, rule) table; first match wins.
const NAMING_RULES: &[(&str, PartitionNaming)] = &[
    ("nvme", PartitionNaming::Infix),
    ("mmcblk", PartitionNaming::Infix),
    ("loop", PartitionNaming::Infix),
    ("nbd", PartitionNaming::Infix),
    ("md", PartitionNaming::Infix),
    ("sd", PartitionNaming::Suffix),
    ("hd", PartitionNaming::Suffix),
    ("vd", PartitionNaming::Suffix),
    ("xvd", PartitionNaming::Suffix),
];

pub fn naming_for(base_name: &str) -> PartitionNaming {
    for (prefix, rule) in NAMING_RULES {
        if base_name.starts_with(prefix) {
            return *rule;
        }
    }
    // A trailing digit would make a bare numeric suffix ambiguous.
    if base_name.ends_with(|c: char| c.is_ascii_digit()) {
        PartitionNaming::Infix
    } else {
        PartitionNaming::Suffix
    }
}

/// Path of partition `number` on `device_path`.
pub fn partition_path(device_path: &Path, number: u32) -> PathBuf {
    let base = device_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let suffix = match naming_for(&base) {
        PartitionNaming::Suffix => format!("{}", number),
        PartitionNaming::Infix => format!("p{}", number),
    };
    let mut value = device_path.as_os_str().to_os_string();
    value.push(suffix);
    PathBuf::from(value)
}

/// First-partition path for a whole-disk device path.
pub fn resolve_partition(device_path: &Path) -> PathBuf {
    partition_path(device_path, 1)
}

/// A whole-disk target. The partition path is always re-derived from `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub path: PathBuf,
}

impl BlockDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn partition_path(&self) -> PathBuf {
        resolve_partition(&self.path)
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    pub fn display(&self) -> std::path::Display<'_> {
        self.path.display()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(device: &str) -> String {
        resolve_partition(Path::new(device)).display().to_string()
    }

    #[test]
    fn numeric_suffix_families() {
        assert_eq!(part("/dev/sdb"), "/dev/sdb1");
        assert_eq!(part("/dev/sdaa"), "/dev/sdaa1");
        assert_eq!(part("/dev/hdc"), "/dev/hdc1");
        assert_eq!(part("/dev/vdb"), "/dev/vdb1");
        assert_eq!(part("/dev/xvdf"), "/dev/xvdf1");
    }

    #[test]
    fn infix_families() {
        assert_eq!(part("/dev/nvme0n1"), "/dev/nvme0n1p1");
        assert_eq!(part("/dev/mmcblk0"), "/dev/mmcblk0p1");
        assert_eq!(part("/dev/loop7"), "/dev/loop7p1");
        assert_eq!(part("/dev/nbd0"), "/dev/nbd0p1");
        assert_eq!(part("/dev/md127"), "/dev/md127p1");
    }

    #[test]
    fn unknown_names_fall_back_on_trailing_digit() {
        assert_eq!(part("/dev/mapper/usbkey"), "/dev/mapper/usbkey1");
        assert_eq!(part("/dev/ublkb0"), "/dev/ublkb0p1");
    }

    #[test]
    fn block_device_rederives_partition() {
        let device = BlockDevice::new("/dev/mmcblk1");
        assert_eq!(device.partition_path(), PathBuf::from("/dev/mmcblk1p1"));
        assert_eq!(device.name(), "mmcblk1");
        assert_eq!(partition_path(&device.path, 2), PathBuf::from("/dev/mmcblk1p2"));
    }
}
