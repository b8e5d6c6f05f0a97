use multiboot_bootloader_core::{generate, ImageProbe};
use multiboot_core::{
    ImageAsset, MenuConfig, MultibootError, OperationContext, Result, IMAGE_DIR, MENU_FILE,
};
use multiboot_imaging::{copy_asset, CopiedAsset, CopyOptions, PARTIAL_SUFFIX};
use multiboot_safety::ConfirmationGate;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added(CopiedAsset),
    /// The name was taken and the user declined to overwrite it.
    Cancelled,
}

pub fn image_dir(root: &Path) -> PathBuf {
    root.join(IMAGE_DIR)
}

pub fn menu_path(root: &Path) -> PathBuf {
    root.join(MENU_FILE)
}

/// Why `root` is not a multiboot drive, or `None` when it is one.
pub fn layout_problem(root: &Path) -> Option<String> {
    if !menu_path(root).is_file() {
        return Some(format!("missing {}", MENU_FILE));
    }
    if !image_dir(root).is_dir() {
        return Some(format!("missing {}/ directory", IMAGE_DIR));
    }
    None
}

/// Regular `.iso` files directly under `dir`, sorted by name.
pub fn iso_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if is_iso_name(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

pub fn is_iso_name(name: &str) -> bool {
    !name.ends_with(PARTIAL_SUFFIX)
        && Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("iso"))
            .unwrap_or(false)
}

pub fn list_assets(root: &Path) -> Result<Vec<String>> {
    iso_names(&image_dir(root))
}

/// On-device names are bare file names.
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(MultibootError::InvalidInput(format!(
            "{:?} is not a plain file name",
            name
        )));
    }
    Ok(())
}

/// Names that would be copied must also be listed: a plain `.iso` file name.
pub fn validate_image_name(name: &str) -> Result<()> {
    validate_file_name(name)?;
    if !is_iso_name(name) {
        return Err(MultibootError::InvalidInput(format!(
            "{} is not an .iso image",
            name
        )));
    }
    Ok(())
}

/// Checks a creation batch. FAT names are case-insensitive, so `A.iso` and
/// `a.iso` would land on the same file.
pub fn validate_batch(assets: &[ImageAsset]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for asset in assets {
        validate_image_name(&asset.file_name)?;
        if !seen.insert(asset.file_name.to_lowercase()) {
            return Err(MultibootError::InvalidInput(format!(
                "more than one selected image is named {}",
                asset.file_name
            )));
        }
    }
    Ok(())
}

pub fn add_asset(
    ctx: &mut OperationContext,
    root: &Path,
    asset: &ImageAsset,
    gate: &dyn ConfirmationGate,
    options: &CopyOptions,
) -> Result<AddOutcome> {
    validate_image_name(&asset.file_name)?;
    let dir = image_dir(root);
    let dest = dir.join(&asset.file_name);
    if dest.exists() {
        if !gate.confirm_overwrite(&asset.file_name) {
            ctx.info(format!("kept existing {}", asset.file_name));
            return Ok(AddOutcome::Cancelled);
        }
        ctx.warn(format!("overwriting {}", asset.file_name));
    }
    warn_if_short(ctx, &dir, asset.size_bytes);
    let copied = copy_asset(ctx, asset, &dir, options)?;
    Ok(AddOutcome::Added(copied))
}

/// Deletes `file_name`; a missing file is only a warning. Returns whether
/// anything was removed.
pub fn remove_asset(ctx: &mut OperationContext, root: &Path, file_name: &str) -> Result<bool> {
    validate_file_name(file_name)?;
    let path = image_dir(root).join(file_name);
    if !path.is_file() {
        ctx.warn(format!("{} is not on the device", file_name));
        return Ok(false);
    }
    fs::remove_file(&path)?;
    ctx.info(format!("removed {}", file_name));
    Ok(true)
}

pub fn warn_if_short(ctx: &mut OperationContext, dir: &Path, needed: u64) {
    match multiboot_imaging::free_space_bytes(dir) {
        Ok(Some(free)) if free < needed => ctx.warn(format!(
            "{} has {} bytes free, {} needed",
            dir.display(),
            free,
            needed
        )),
        Ok(_) => {}
        Err(err) => ctx.warn(format!("free space check failed: {}", err)),
    }
}

/// Regenerates the whole menu from the current listing. Returns the entry count.
pub fn regenerate_menu(
    ctx: &mut OperationContext,
    root: &Path,
    config: &MenuConfig,
    probe: &dyn ImageProbe,
) -> Result<usize> {
    let names = list_assets(root)?;
    let dir = image_dir(root);
    let text = generate(names.iter().map(String::as_str), config, |name| {
        let profile = probe.probe(ctx, &dir.join(name));
        ctx.info(format!("{} classified as {}", name, profile.family));
        profile
    });
    write_menu(root, &text)?;
    ctx.info(format!("wrote {} with {} entries", MENU_FILE, names.len()));
    Ok(names.len())
}

/// Replaces the menu file in one rename so a reader never sees half of it.
pub fn write_menu(root: &Path, text: &str) -> Result<()> {
    let path = menu_path(root);
    let parent = path.parent().unwrap_or(root);
    fs::create_dir_all(parent)?;
    let temp = parent.join(".grub.cfg.tmp");
    let mut file = fs::File::create(&temp)?;
    file.write_all(text.as_bytes())?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp, &path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use multiboot_bootloader_core::BootProfile;
    use multiboot_core::{MemorySink, OperationKind};
    use multiboot_safety::{NonInteractiveGate, SafetyContext};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    struct NoProbe;

    impl ImageProbe for NoProbe {
        fn probe(&self, _ctx: &mut OperationContext, _image: &Path) -> BootProfile {
            BootProfile::unknown()
        }
    }

    fn context() -> OperationContext {
        OperationContext::new(OperationKind::Add, Arc::new(MemorySink::new()))
    }

    fn options() -> CopyOptions {
        CopyOptions {
            buffer_bytes: 4096,
            progress_interval: Duration::ZERO,
            hash: false,
        }
    }

    fn gate(allow_overwrite: bool) -> NonInteractiveGate {
        NonInteractiveGate {
            context: SafetyContext {
                allow_overwrite,
                ..SafetyContext::default()
            },
        }
    }

    fn drive() -> tempfile::TempDir {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("isos")).unwrap();
        write_menu(root.path(), "set timeout=5\n").unwrap();
        root
    }

    fn source(dir: &Path, name: &str, bytes: &[u8]) -> ImageAsset {
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        ImageAsset::from_path(path).unwrap()
    }

    #[test]
    fn listing_filters_and_sorts() {
        let root = drive();
        let isos = root.path().join("isos");
        for name in ["b.iso", "A.ISO", "notes.txt", "c.iso.partial"] {
            fs::write(isos.join(name), b"x").unwrap();
        }
        fs::create_dir(isos.join("dir.iso")).unwrap();
        assert_eq!(list_assets(root.path()).unwrap(), vec!["A.ISO", "b.iso"]);
    }

    #[test]
    fn layout_needs_menu_and_image_dir() {
        let root = tempdir().unwrap();
        assert!(layout_problem(root.path()).is_some());
        write_menu(root.path(), "x").unwrap();
        assert_eq!(layout_problem(root.path()), Some("missing isos/ directory".to_string()));
        fs::create_dir(root.path().join("isos")).unwrap();
        assert_eq!(layout_problem(root.path()), None);
    }

    #[test]
    fn add_then_list_contains_name_once() {
        let root = drive();
        let src = tempdir().unwrap();
        let asset = source(src.path(), "new.iso", b"payload");
        let mut ctx = context();

        let outcome = add_asset(&mut ctx, root.path(), &asset, &gate(false), &options()).unwrap();
        assert!(matches!(outcome, AddOutcome::Added(ref copied) if copied.bytes == 7));
        let names = list_assets(root.path()).unwrap();
        assert_eq!(names.iter().filter(|name| *name == "new.iso").count(), 1);
    }

    #[test]
    fn add_refuses_names_the_listing_would_hide() {
        let root = drive();
        let src = tempdir().unwrap();
        let asset = source(src.path(), "rescue.img", b"payload");
        let mut ctx = context();

        assert!(matches!(
            add_asset(&mut ctx, root.path(), &asset, &gate(true), &options()),
            Err(MultibootError::InvalidInput(_))
        ));
        assert!(!root.path().join("isos/rescue.img").exists());
    }

    #[test]
    fn batch_names_must_be_unique_ignoring_case() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        let a = source(first.path(), "x.iso", b"first");
        let b = source(second.path(), "X.ISO", b"second");
        let c = source(second.path(), "y.iso", b"third");

        assert!(validate_batch(&[a.clone(), c.clone()]).is_ok());
        assert!(matches!(
            validate_batch(&[a, c, b]),
            Err(MultibootError::InvalidInput(message)) if message.contains("X.ISO")
        ));
    }

    #[test]
    fn declined_overwrite_keeps_original_bytes() {
        let root = drive();
        fs::write(root.path().join("isos/same.iso"), b"original").unwrap();
        let src = tempdir().unwrap();
        let asset = source(src.path(), "same.iso", b"replacement");
        let mut ctx = context();

        let outcome = add_asset(&mut ctx, root.path(), &asset, &gate(false), &options()).unwrap();
        assert_eq!(outcome, AddOutcome::Cancelled);
        assert_eq!(fs::read(root.path().join("isos/same.iso")).unwrap(), b"original");
    }

    #[test]
    fn confirmed_overwrite_replaces_bytes() {
        let root = drive();
        fs::write(root.path().join("isos/same.iso"), b"original").unwrap();
        let src = tempdir().unwrap();
        let asset = source(src.path(), "same.iso", b"replacement");
        let mut ctx = context();

        add_asset(&mut ctx, root.path(), &asset, &gate(true), &options()).unwrap();
        assert_eq!(fs::read(root.path().join("isos/same.iso")).unwrap(), b"replacement");
    }

    #[test]
    fn remove_is_idempotent() {
        let root = drive();
        fs::write(root.path().join("isos/a.iso"), b"x").unwrap();
        let mut ctx = context();

        assert!(remove_asset(&mut ctx, root.path(), "a.iso").unwrap());
        assert!(list_assets(root.path()).unwrap().is_empty());
        assert!(!remove_asset(&mut ctx, root.path(), "a.iso").unwrap());
        assert!(ctx.log_lines().iter().any(|line| line == "a.iso is not on the device"));
    }

    #[test]
    fn remove_rejects_paths() {
        let root = drive();
        let mut ctx = context();
        for name in ["../etc/passwd", "..", "sub/a.iso", ""] {
            assert!(matches!(
                remove_asset(&mut ctx, root.path(), name),
                Err(MultibootError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn regenerate_writes_placeholder_for_empty_drive() {
        let root = drive();
        let mut ctx = context();
        let count = regenerate_menu(&mut ctx, root.path(), &MenuConfig::default(), &NoProbe).unwrap();
        assert_eq!(count, 0);
        let text = fs::read_to_string(menu_path(root.path())).unwrap();
        assert!(text.starts_with("set timeout=5\n"));
        assert!(!root.path().join("boot/grub/.grub.cfg.tmp").exists());
    }
}
