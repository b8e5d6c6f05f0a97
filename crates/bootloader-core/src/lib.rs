use multiboot_core::{BootFamily, OperationContext};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub mod menu;

pub use menu::{display_title, generate, MenuDocument, MenuEntry};

/// Boot files found inside one image, relative to the image root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootProfile {
    pub family: BootFamily,
    pub kernel: Option<String>,
    pub initrds: Vec<String>,
}

impl BootProfile {
    pub fn unknown() -> Self {
        Self {
            family: BootFamily::Unknown,
            kernel: None,
            initrds: Vec::new(),
        }
    }
}

/// Classifies an image file that lives on the host.
pub trait ImageProbe {
    fn probe(&self, ctx: &mut OperationContext, image: &Path) -> BootProfile;
}

struct Signature {
    family: BootFamily,
    kernel: &'static str,
    /// Alternatives; the first one present is used.
    initrds: &'static [&'static str],
}

/// Marker table, tested in order; the first complete match wins.
const SIGNATURES: &[Signature] = &[
    Signature {
        family: BootFamily::DebianLive,
        kernel: "live/vmlinuz",
        initrds: &["live/initrd.img"],
    },
    Signature {
        family: BootFamily::UbuntuCasper,
        kernel: "casper/vmlinuz",
        initrds: &["casper/initrd", "casper/initrd.lz", "casper/initrd.gz"],
    },
    Signature {
        family: BootFamily::FedoraIsolinux,
        kernel: "isolinux/vmlinuz",
        initrds: &["isolinux/initrd.img"],
    },
    Signature {
        family: BootFamily::FedoraIsolinux,
        kernel: "images/pxeboot/vmlinuz",
        initrds: &["images/pxeboot/initrd.img"],
    },
    Signature {
        family: BootFamily::ArchLinux,
        kernel: "arch/boot/x86_64/vmlinuz-linux",
        initrds: &["arch/boot/x86_64/initramfs-linux.img"],
    },
    Signature {
        family: BootFamily::SyslinuxGeneric,
        kernel: "syslinux/vmlinuz",
        initrds: &["syslinux/initrd.img", "syslinux/initram.igz"],
    },
];

const CLONEZILLA_MARKER: &str = "Clonezilla-Live-Version";
const ARCH_MICROCODE: &[&str] = &["arch/boot/intel-ucode.img", "arch/boot/amd-ucode.img"];

/// Classifies a mounted image tree by its marker files.
pub fn classify_tree(root: &Path) -> BootProfile {
    for signature in SIGNATURES {
        if !root.join(signature.kernel).is_file() {
            continue;
        }
        let Some(initrd) = signature
            .initrds
            .iter()
            .find(|candidate| root.join(candidate).is_file())
        else {
            continue;
        };

        let mut family = signature.family;
        let mut initrds = Vec::new();
        match family {
            BootFamily::DebianLive if root.join(CLONEZILLA_MARKER).is_file() => {
                family = BootFamily::ClonezillaLive;
            }
            BootFamily::ArchLinux => {
                initrds.extend(
                    ARCH_MICROCODE
                        .iter()
                        .filter(|ucode| root.join(ucode).is_file())
                        .map(|ucode| ucode.to_string()),
                );
            }
            _ => {}
        }
        initrds.push(initrd.to_string());
        tracing::debug!(root = %root.display(), family = %family, "classified image tree");
        return BootProfile {
            family,
            kernel: Some(signature.kernel.to_string()),
            initrds,
        };
    }
    BootProfile::unknown()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn tree(files: &[&str]) -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        for file in files {
            let path = dir.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, b"x").unwrap();
        }
        dir
    }

    #[test]
    fn casper_prefers_plain_initrd() {
        let dir = tree(&["casper/vmlinuz", "casper/initrd.lz", "casper/initrd"]);
        let profile = classify_tree(dir.path());
        assert_eq!(profile.family, BootFamily::UbuntuCasper);
        assert_eq!(profile.kernel.as_deref(), Some("casper/vmlinuz"));
        assert_eq!(profile.initrds, vec!["casper/initrd".to_string()]);
    }

    #[test]
    fn debian_live_beats_casper() {
        let dir = tree(&[
            "live/vmlinuz",
            "live/initrd.img",
            "casper/vmlinuz",
            "casper/initrd",
        ]);
        assert_eq!(classify_tree(dir.path()).family, BootFamily::DebianLive);
    }

    #[test]
    fn clonezilla_refines_debian_live() {
        let dir = tree(&["live/vmlinuz", "live/initrd.img", "Clonezilla-Live-Version"]);
        assert_eq!(classify_tree(dir.path()).family, BootFamily::ClonezillaLive);
    }

    #[test]
    fn fedora_variants() {
        let a = tree(&["isolinux/vmlinuz", "isolinux/initrd.img"]);
        let b = tree(&["images/pxeboot/vmlinuz", "images/pxeboot/initrd.img"]);
        assert_eq!(classify_tree(a.path()).family, BootFamily::FedoraIsolinux);
        let profile = classify_tree(b.path());
        assert_eq!(profile.family, BootFamily::FedoraIsolinux);
        assert_eq!(profile.kernel.as_deref(), Some("images/pxeboot/vmlinuz"));
    }

    #[test]
    fn isolinux_kernel_without_initrd_falls_through() {
        let dir = tree(&["isolinux/vmlinuz", "syslinux/vmlinuz", "syslinux/initram.igz"]);
        let profile = classify_tree(dir.path());
        assert_eq!(profile.family, BootFamily::SyslinuxGeneric);
        assert_eq!(profile.initrds, vec!["syslinux/initram.igz".to_string()]);
    }

    #[test]
    fn arch_loads_present_microcode_first() {
        let dir = tree(&[
            "arch/boot/x86_64/vmlinuz-linux",
            "arch/boot/x86_64/initramfs-linux.img",
            "arch/boot/amd-ucode.img",
        ]);
        let profile = classify_tree(dir.path());
        assert_eq!(profile.family, BootFamily::ArchLinux);
        assert_eq!(
            profile.initrds,
            vec![
                "arch/boot/amd-ucode.img".to_string(),
                "arch/boot/x86_64/initramfs-linux.img".to_string()
            ]
        );
    }

    #[test]
    fn syslinux_prefers_initrd_img() {
        let dir = tree(&["syslinux/vmlinuz", "syslinux/initram.igz", "syslinux/initrd.img"]);
        assert_eq!(
            classify_tree(dir.path()).initrds,
            vec!["syslinux/initrd.img".to_string()]
        );
    }

    #[test]
    fn empty_tree_is_unknown() {
        let dir = tree(&["README.txt"]);
        assert_eq!(classify_tree(dir.path()), BootProfile::unknown());
    }
}
