use crate::BootProfile;
use multiboot_core::{BootFamily, MenuConfig, IMAGE_DIR};
use std::collections::BTreeSet;
use std::fmt::Write;
use std::path::Path;

const EMPTY_TITLE: &str = "No bootable ISO images found";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuEntry {
    pub title: String,
    pub file_name: String,
    pub profile: BootProfile,
}

/// The whole `grub.cfg`: a fixed preamble plus one stanza per image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuDocument {
    pub timeout_secs: u32,
    pub empty_timeout_secs: u32,
    pub entries: Vec<MenuEntry>,
}

impl MenuDocument {
    /// Entries come out sorted by file name with duplicates removed, so any
    /// ordering of the same set yields the same document.
    pub fn build<'n>(
        file_names: impl IntoIterator<Item = &'n str>,
        config: &MenuConfig,
        mut classify: impl FnMut(&str) -> BootProfile,
    ) -> Self {
        let names: BTreeSet<&str> = file_names.into_iter().collect();
        let entries = names
            .into_iter()
            .map(|name| MenuEntry {
                title: display_title(name),
                file_name: name.to_string(),
                profile: classify(name),
            })
            .collect();
        Self {
            timeout_secs: config.timeout_secs,
            empty_timeout_secs: config.empty_timeout_secs,
            entries,
        }
    }

    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return render_placeholder(self.empty_timeout_secs);
        }
        let mut out = String::new();
        let _ = writeln!(out, "set timeout={}", self.timeout_secs);
        out.push_str("set default=0\n");
        out.push_str("insmod all_video\n");
        out.push_str("insmod gfxterm\n");
        out.push_str("terminal_output gfxterm\n");
        out.push_str("loadfont unicode\n");
        out.push_str("insmod loopback\n");
        out.push_str("insmod iso9660\n");
        for entry in &self.entries {
            out.push('\n');
            render_entry(&mut out, entry);
        }
        out
    }
}

/// Renders the menu for `file_names`, classifying each one through `classify`.
pub fn generate<'n>(
    file_names: impl IntoIterator<Item = &'n str>,
    config: &MenuConfig,
    classify: impl FnMut(&str) -> BootProfile,
) -> String {
    MenuDocument::build(file_names, config, classify).render()
}

fn render_placeholder(timeout_secs: u32) -> String {
    format!(
        "set timeout={}\nset default=0\n\nmenuentry \"{}\" {{\n    echo \"Add ISO files to the /{}/ directory of this drive.\"\n    sleep 10\n}}\n",
        timeout_secs, EMPTY_TITLE, IMAGE_DIR
    )
}

fn render_entry(out: &mut String, entry: &MenuEntry) {
    let _ = writeln!(out, "menuentry \"{}\" {{", grub_quote(&entry.title));
    let _ = writeln!(
        out,
        "    set isofile=\"/{}/{}\"",
        IMAGE_DIR,
        grub_quote(&entry.file_name)
    );
    match (&entry.profile.kernel, entry.profile.family) {
        (Some(kernel), family) if family != BootFamily::Unknown => {
            out.push_str("    loopback loop $isofile\n");
            if family == BootFamily::ArchLinux {
                out.push_str("    probe -u $root --set=uuid_current_part\n");
            }
            let _ = writeln!(out, "    linux (loop)/{} {}", kernel, kernel_params(family));
            let initrds: Vec<String> = entry
                .profile
                .initrds
                .iter()
                .map(|initrd| format!("(loop)/{}", initrd))
                .collect();
            let _ = writeln!(out, "    initrd {}", initrds.join(" "));
        }
        _ => {
            out.push_str("    echo \"No known boot method for $isofile.\"\n");
            out.push_str("    echo \"Add a manual entry to /boot/grub/grub.cfg.\"\n");
            out.push_str("    echo \"Press any key to return to the menu...\"\n");
            out.push_str("    read\n");
        }
    }
    out.push_str("}\n");
}

fn kernel_params(family: BootFamily) -> &'static str {
    match family {
        BootFamily::DebianLive => "boot=live findiso=$isofile components quiet splash",
        BootFamily::ClonezillaLive => {
            "boot=live union=overlay username=user config components noswap toram=filesystem.squashfs findiso=$isofile quiet"
        }
        BootFamily::UbuntuCasper => "boot=casper iso-scan/filename=$isofile quiet splash toram --",
        BootFamily::FedoraIsolinux => "iso-scan/filename=$isofile rd.live.image quiet splash",
        BootFamily::ArchLinux => {
            "img_dev=/dev/disk/by-uuid/$uuid_current_part img_loop=$isofile archisobasedir=arch quiet splash"
        }
        BootFamily::SyslinuxGeneric => "isoloop=$isofile noeject noprompt quiet splash",
        BootFamily::Unknown => "",
    }
}

/// Menu title for an image: final extension dropped, `_` and `-` turned into spaces.
pub fn display_title(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(file_name);
    stem.replace(['_', '-'], " ")
}

/// Escapes text for a double-quoted GRUB word.
fn grub_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '"' | '$') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
