use multiboot_core::{EngineConfig, ImageAsset, MultibootError, OperationContext, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub buffer_bytes: usize,
    pub progress_interval: Duration,
    pub hash: bool,
}

impl From<&EngineConfig> for CopyOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            buffer_bytes: config.copy_buffer_bytes,
            progress_interval: config.progress_interval(),
            hash: config.hash_manifest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopiedAsset {
    pub file_name: String,
    pub bytes: u64,
    pub sha256: Option<String>,
}

/// Copies every asset into `dest_dir` in input order. A failed asset is
/// logged and skipped; only an empty result is an error.
pub fn copy_assets(
    ctx: &mut OperationContext,
    assets: &[ImageAsset],
    dest_dir: &Path,
    options: &CopyOptions,
) -> Result<Vec<CopiedAsset>> {
    let total: u64 = assets.iter().map(|asset| asset.size_bytes).sum();
    ctx.start_copy_batch(total);
    ctx.info(format!("copying {} image(s), {} bytes", assets.len(), total));

    let mut copied = Vec::new();
    for asset in assets {
        let (before, _) = ctx.aggregate();
        match copy_one(ctx, asset, dest_dir, options) {
            Ok(done) => copied.push(done),
            Err(err) => {
                let (after, _) = ctx.aggregate();
                ctx.abandon_asset(asset.size_bytes, after.saturating_sub(before));
                ctx.error(format!("skipping {}: {}", asset.file_name, err));
            }
        }
    }
    if copied.is_empty() {
        return Err(MultibootError::NoAssetsCopied);
    }
    Ok(copied)
}

/// Copies a single asset; failures propagate.
pub fn copy_asset(
    ctx: &mut OperationContext,
    asset: &ImageAsset,
    dest_dir: &Path,
    options: &CopyOptions,
) -> Result<CopiedAsset> {
    ctx.start_copy_batch(asset.size_bytes);
    copy_one(ctx, asset, dest_dir, options)
}

fn copy_one(
    ctx: &mut OperationContext,
    asset: &ImageAsset,
    dest_dir: &Path,
    options: &CopyOptions,
) -> Result<CopiedAsset> {
    let dest = dest_dir.join(&asset.file_name);
    let partial = partial_path(dest_dir, &asset.file_name);
    ctx.info(format!(
        "copy {} -> {}",
        asset.source_path.display(),
        dest.display()
    ));
    let result = stream(ctx, asset, &partial, options).and_then(|done| {
        fs::rename(&partial, &dest)
            .map_err(|err| with_path(err, "rename", &partial))
            .map(|_| done)
    });
    match &result {
        Ok(done) => tracing::debug!(file = %done.file_name, bytes = done.bytes, "image copied"),
        Err(err) => {
            tracing::warn!(file = %asset.file_name, error = %err, "copy failed, removing partial file");
            let _ = fs::remove_file(&partial);
        }
    }
    result
}

fn stream(
    ctx: &mut OperationContext,
    asset: &ImageAsset,
    partial: &Path,
    options: &CopyOptions,
) -> Result<CopiedAsset> {
    let mut reader =
        File::open(&asset.source_path).map_err(|err| with_path(err, "open", &asset.source_path))?;
    let mut writer = File::create(partial).map_err(|err| with_path(err, "create", partial))?;
    let mut buffer = vec![0u8; options.buffer_bytes.max(1)];
    let mut hasher = options.hash.then(Sha256::new);
    let total = asset.size_bytes;

    let mut copied = 0u64;
    let mut emitted = 0u64;
    ctx.emit_progress(ctx.progress(&asset.file_name, 0, total));
    let mut last_tick = Instant::now();

    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|err| with_path(err, "read", &asset.source_path))?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..read])
            .map_err(|err| with_path(err, "write", partial))?;
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&buffer[..read]);
        }
        copied += read as u64;
        ctx.add_copied(read as u64);
        if last_tick.elapsed() >= options.progress_interval {
            ctx.emit_progress(ctx.progress(&asset.file_name, copied, total.max(copied)));
            emitted = copied;
            last_tick = Instant::now();
        }
    }
    writer.sync_all().map_err(|err| with_path(err, "sync", partial))?;
    if copied != emitted {
        ctx.emit_progress(ctx.progress(&asset.file_name, copied, total.max(copied)));
    }

    Ok(CopiedAsset {
        file_name: asset.file_name.clone(),
        bytes: copied,
        sha256: hasher.map(|hasher| to_hex(&hasher.finalize())),
    })
}

pub fn partial_path(dest_dir: &Path, file_name: &str) -> PathBuf {
    dest_dir.join(format!("{}{}", file_name, PARTIAL_SUFFIX))
}

fn with_path(err: io::Error, action: &str, path: &Path) -> MultibootError {
    MultibootError::Io(io::Error::new(
        err.kind(),
        format!("{} {}: {}", action, path.display(), err),
    ))
}

pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Bytes available to unprivileged writers on the filesystem holding `path`.
pub fn free_space_bytes(path: &Path) -> Result<Option<u64>> {
    #[cfg(unix)]
    {
        use libc::statvfs;
        use std::ffi::CString;
        use std::mem::MaybeUninit;

        let c_path = CString::new(path.display().to_string())
            .map_err(|_| MultibootError::InvalidInput(format!("invalid path {}", path.display())))?;
        let mut stats = MaybeUninit::<libc::statvfs>::zeroed();
        let result = unsafe { statvfs(c_path.as_ptr(), stats.as_mut_ptr()) };
        if result != 0 {
            return Ok(None);
        }
        let stats = unsafe { stats.assume_init() };
        let free = (stats.f_bavail as u64).saturating_mul(stats.f_frsize as u64);
        Ok(Some(free))
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multiboot_core::{Event, MemorySink, OperationKind};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn options(interval: Duration) -> CopyOptions {
        CopyOptions {
            buffer_bytes: 1024,
            progress_interval: interval,
            hash: false,
        }
    }

    fn asset(dir: &Path, name: &str, len: usize) -> ImageAsset {
        let path = dir.join(name);
        fs::write(&path, vec![7u8; len]).unwrap();
        ImageAsset::from_path(path).unwrap()
    }

    fn progress(sink: &MemorySink) -> Vec<multiboot_core::CopyProgress> {
        sink.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Progress(progress) => Some(progress),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn copies_in_order_with_monotonic_progress() {
        let src = tempdir().unwrap();
        let dest = tempdir().unwrap();
        let assets = vec![asset(src.path(), "b.iso", 4096), asset(src.path(), "a.iso", 1500)];
        let sink = Arc::new(MemorySink::new());
        let mut ctx = OperationContext::new(OperationKind::Create, sink.clone());

        let copied = copy_assets(&mut ctx, &assets, dest.path(), &options(Duration::ZERO)).unwrap();
        let names: Vec<_> = copied.iter().map(|done| done.file_name.as_str()).collect();
        assert_eq!(names, vec!["b.iso", "a.iso"]);
        assert_eq!(fs::read(dest.path().join("b.iso")).unwrap().len(), 4096);
        assert!(!partial_path(dest.path(), "b.iso").exists());

        let ticks = progress(&sink);
        assert!(ticks.windows(2).all(|pair| pair[0].aggregate_copied <= pair[1].aggregate_copied));
        let last = ticks.last().unwrap();
        assert_eq!(last.aggregate_copied, 5596);
        assert_eq!(last.aggregate_total, 5596);
        assert_eq!(last.asset_copied, 1500);
    }

    #[test]
    fn slow_interval_still_reports_first_and_last() {
        let src = tempdir().unwrap();
        let dest = tempdir().unwrap();
        let assets = vec![asset(src.path(), "one.iso", 10_000)];
        let sink = Arc::new(MemorySink::new());
        let mut ctx = OperationContext::new(OperationKind::Create, sink.clone());

        copy_assets(&mut ctx, &assets, dest.path(), &options(Duration::from_secs(3600))).unwrap();
        let ticks = progress(&sink);
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].asset_copied, 0);
        assert_eq!(ticks[1].asset_copied, 10_000);
    }

    #[test]
    fn failed_asset_is_skipped() {
        let src = tempdir().unwrap();
        let dest = tempdir().unwrap();
        let good = asset(src.path(), "good.iso", 2048);
        let mut gone = asset(src.path(), "gone.iso", 512);
        gone.source_path = src.path().join("missing.iso");
        let mut ctx = OperationContext::new(OperationKind::Create, Arc::new(MemorySink::new()));

        let copied = copy_assets(&mut ctx, &[gone, good], dest.path(), &options(Duration::ZERO)).unwrap();
        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].file_name, "good.iso");
        assert_eq!(ctx.aggregate(), (2048, 2048));
        assert!(!dest.path().join("gone.iso").exists());
        assert!(ctx.log_lines().iter().any(|line| line.starts_with("skipping gone.iso")));
    }

    #[test]
    fn failure_after_streaming_keeps_counters_monotonic() {
        let src = tempdir().unwrap();
        let dest = tempdir().unwrap();
        // A non-empty directory in the way makes the final rename fail.
        fs::create_dir(dest.path().join("clash.iso")).unwrap();
        fs::write(dest.path().join("clash.iso/keep"), b"x").unwrap();
        let assets = vec![asset(src.path(), "clash.iso", 3000), asset(src.path(), "next.iso", 1000)];
        let sink = Arc::new(MemorySink::new());
        let mut ctx = OperationContext::new(OperationKind::Create, sink.clone());

        let copied = copy_assets(&mut ctx, &assets, dest.path(), &options(Duration::ZERO)).unwrap();
        assert_eq!(copied.len(), 1);
        assert!(!partial_path(dest.path(), "clash.iso").exists());

        let ticks = progress(&sink);
        assert!(ticks.windows(2).all(|pair| pair[0].aggregate_copied <= pair[1].aggregate_copied));
        assert!(ticks.iter().all(|tick| tick.aggregate_copied <= tick.aggregate_total));
        assert_eq!(ctx.aggregate(), (4000, 4000));
    }

    #[test]
    fn nothing_copied_is_an_error() {
        let dest = tempdir().unwrap();
        let missing = ImageAsset {
            source_path: dest.path().join("nope.iso"),
            file_name: "nope.iso".to_string(),
            size_bytes: 10,
        };
        let mut ctx = OperationContext::new(OperationKind::Create, Arc::new(MemorySink::new()));
        assert!(matches!(
            copy_assets(&mut ctx, &[missing], dest.path(), &options(Duration::ZERO)),
            Err(MultibootError::NoAssetsCopied)
        ));
        assert!(matches!(
            copy_assets(&mut ctx, &[], dest.path(), &options(Duration::ZERO)),
            Err(MultibootError::NoAssetsCopied)
        ));
    }

    #[test]
    fn hash_matches_streamed_digest() {
        let src = tempdir().unwrap();
        let dest = tempdir().unwrap();
        let source = asset(src.path(), "h.iso", 3000);
        let mut ctx = OperationContext::new(OperationKind::Add, Arc::new(MemorySink::new()));
        let opts = CopyOptions {
            hash: true,
            ..options(Duration::ZERO)
        };
        let done = copy_asset(&mut ctx, &source, dest.path(), &opts).unwrap();
        assert_eq!(done.sha256, Some(hash_file(&source.source_path).unwrap()));
    }

    #[test]
    fn free_space_of_tempdir_is_known() {
        let dir = tempdir().unwrap();
        assert!(free_space_bytes(dir.path()).unwrap().is_some());
    }
}
