use multiboot_bootloader_core::{generate, ImageProbe};
use multiboot_core::{
    now_utc_rfc3339, BlockDevice, Disk, EngineConfig, EventSink, ImageAsset, MultibootError,
    OperationContext, OperationKind, Phase, Result, BOOT_DIR,
};
use multiboot_host_linux::{
    format_device, install_boot_loader, with_mount, CommandRunner, MountRequest, Shell,
};
use multiboot_imaging::{copy_assets, CopiedAsset, CopyOptions};
use multiboot_safety::ConfirmationGate;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, TryLockError};

pub mod inventory;
pub mod probe;

pub use inventory::AddOutcome;
pub use probe::LoopMountProbe;

const DATA_FS: &str = "vfat";

/// Result of one operation together with its operation log.
#[derive(Debug)]
pub struct OperationRun<T> {
    pub operation: OperationKind,
    pub result: Result<T>,
    pub log: Vec<String>,
    pub started_at_utc: String,
    pub finished_at_utc: String,
}

impl<T> OperationRun<T> {
    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

#[derive(Debug, Clone)]
pub struct CreateSummary {
    pub partition: PathBuf,
    pub copied: Vec<CopiedAsset>,
    pub menu_entries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compatibility {
    pub compatible: bool,
    pub assets: Vec<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// Nothing by that name was on the device; the menu was still rewritten.
    Absent,
}

/// Runs device operations one at a time against a shared mount point.
pub struct Engine {
    runner: Arc<dyn CommandRunner>,
    config: EngineConfig,
    sink: Arc<dyn EventSink>,
    probe: Box<dyn ImageProbe + Send + Sync>,
    busy: Mutex<()>,
}

impl Engine {
    pub fn new(runner: Arc<dyn CommandRunner>, config: EngineConfig, sink: Arc<dyn EventSink>) -> Self {
        let probe = LoopMountProbe::new(runner.clone(), config.probe_mount_point.clone());
        Self {
            runner,
            config,
            sink,
            probe: Box::new(probe),
            busy: Mutex::new(()),
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn ImageProbe + Send + Sync>) -> Self {
        self.probe = probe;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Repartitions `device` and fills it with `assets`. `disk` is the
    /// enumerated view of the target, when known, for the confirmation gate.
    pub fn create(
        &self,
        device: &BlockDevice,
        assets: &[ImageAsset],
        gate: &dyn ConfirmationGate,
        disk: Option<&Disk>,
    ) -> OperationRun<CreateSummary> {
        self.run(OperationKind::Create, |ctx| {
            if assets.is_empty() {
                return Err(MultibootError::InvalidInput("no images selected".to_string()));
            }
            inventory::validate_batch(assets)?;
            if !gate.confirm_destructive(&device.path, disk) {
                ctx.warn(format!("creation on {} declined", device.display()));
                return Err(MultibootError::UserCancelled);
            }
            ctx.info(format!(
                "target={} images={}",
                device.display(),
                assets.len()
            ));

            let shell = Shell::new(self.runner.as_ref());
            let partition = format_device(&shell, ctx, device, &self.config)?;
            let request = MountRequest::new(&partition, &self.config.mount_point).fs_type(DATA_FS);
            let options = CopyOptions::from(&self.config);

            let (copied, menu_entries) = with_mount(&shell, ctx, &request, |ctx, root| {
                ctx.run_phase(Phase::InstallBootLoader, |ctx| {
                    install_boot_loader(&shell, ctx, device, &root.join(BOOT_DIR), &self.config)
                })?;
                let copied = ctx.run_phase(Phase::CopyImages, |ctx| {
                    let dir = inventory::image_dir(root);
                    fs::create_dir_all(&dir)?;
                    let needed = assets.iter().map(|asset| asset.size_bytes).sum();
                    inventory::warn_if_short(ctx, &dir, needed);
                    copy_assets(ctx, assets, &dir, &options)
                })?;
                let entries = ctx.run_phase(Phase::WriteMenu, |ctx| {
                    inventory::regenerate_menu(ctx, root, &self.config.menu, self.probe.as_ref())
                })?;
                Ok((copied, entries))
            })?;

            Ok(CreateSummary {
                partition,
                copied,
                menu_entries,
            })
        })
    }

    /// Checks whether `device` already carries the multiboot layout.
    pub fn verify(&self, device: &BlockDevice) -> OperationRun<Compatibility> {
        self.run(OperationKind::Verify, |ctx| self.inspect(ctx, device))
    }

    /// Images on a compatible device.
    pub fn list(&self, device: &BlockDevice) -> OperationRun<Vec<String>> {
        self.run(OperationKind::List, |ctx| {
            let compatibility = self.inspect(ctx, device)?;
            if !compatibility.compatible {
                return Err(MultibootError::IncompatibleDevice {
                    device: device.display().to_string(),
                    reason: compatibility.reason.unwrap_or_default(),
                });
            }
            Ok(compatibility.assets)
        })
    }

    pub fn add(
        &self,
        device: &BlockDevice,
        asset: &ImageAsset,
        gate: &dyn ConfirmationGate,
    ) -> OperationRun<AddOutcome> {
        self.run(OperationKind::Add, |ctx| {
            inventory::validate_image_name(&asset.file_name)?;
            let options = CopyOptions::from(&self.config);
            self.manage(ctx, device, |ctx, root| {
                let outcome = ctx.run_phase(Phase::AddImage, |ctx| {
                    inventory::add_asset(ctx, root, asset, gate, &options)
                })?;
                let changed = matches!(outcome, AddOutcome::Added(_));
                Ok((outcome, changed))
            })
        })
    }

    pub fn remove(&self, device: &BlockDevice, file_name: &str) -> OperationRun<RemoveOutcome> {
        self.run(OperationKind::Remove, |ctx| {
            inventory::validate_file_name(file_name)?;
            self.manage(ctx, device, |ctx, root| {
                let removed = ctx.run_phase(Phase::RemoveImage, |ctx| {
                    inventory::remove_asset(ctx, root, file_name)
                })?;
                let outcome = if removed {
                    RemoveOutcome::Removed
                } else {
                    RemoveOutcome::Absent
                };
                Ok((outcome, true))
            })
        })
    }

    /// Renders the menu a drive holding the `.iso` files of `dir` would get.
    pub fn preview(&self, dir: &Path) -> OperationRun<String> {
        self.run(OperationKind::Preview, |ctx| {
            let names = inventory::iso_names(dir)?;
            let probe = self.probe.as_ref();
            Ok(generate(names.iter().map(String::as_str), &self.config.menu, |name| {
                let profile = probe.probe(ctx, &dir.join(name));
                ctx.info(format!("{} classified as {}", name, profile.family));
                profile
            }))
        })
    }

    fn inspect(&self, ctx: &mut OperationContext, device: &BlockDevice) -> Result<Compatibility> {
        let shell = Shell::new(self.runner.as_ref());
        let partition = device.partition_path();
        let request = MountRequest::new(&partition, &self.config.mount_point)
            .fs_type(DATA_FS)
            .options("ro");
        with_mount(&shell, ctx, &request, |ctx, root| {
            ctx.run_phase(Phase::Verify, |ctx| {
                if let Some(reason) = inventory::layout_problem(root) {
                    ctx.warn(format!("{} is not a multiboot drive: {}", device.display(), reason));
                    return Ok(Compatibility {
                        compatible: false,
                        assets: Vec::new(),
                        reason: Some(reason),
                    });
                }
                let assets = inventory::list_assets(root)?;
                ctx.info(format!("{} image(s) on {}", assets.len(), device.display()));
                Ok(Compatibility {
                    compatible: true,
                    assets,
                    reason: None,
                })
            })
        })
    }

    /// Mounts a prepared drive, re-checks its layout, runs `change` and
    /// rewrites the menu when `change` reports a modification.
    fn manage<T>(
        &self,
        ctx: &mut OperationContext,
        device: &BlockDevice,
        change: impl FnOnce(&mut OperationContext, &Path) -> Result<(T, bool)>,
    ) -> Result<T> {
        let shell = Shell::new(self.runner.as_ref());
        let partition = device.partition_path();
        let request = MountRequest::new(&partition, &self.config.mount_point).fs_type(DATA_FS);
        with_mount(&shell, ctx, &request, |ctx, root| {
            ctx.run_phase(Phase::Verify, |_| match inventory::layout_problem(root) {
                Some(reason) => Err(MultibootError::IncompatibleDevice {
                    device: device.display().to_string(),
                    reason,
                }),
                None => Ok(()),
            })?;
            let (value, changed) = change(ctx, root)?;
            if changed {
                ctx.run_phase(Phase::WriteMenu, |ctx| {
                    inventory::regenerate_menu(ctx, root, &self.config.menu, self.probe.as_ref())
                })?;
            }
            Ok(value)
        })
    }

    fn run<T>(
        &self,
        operation: OperationKind,
        body: impl FnOnce(&mut OperationContext) -> Result<T>,
    ) -> OperationRun<T> {
        let started_at_utc = now_utc_rfc3339();
        let mut ctx = OperationContext::new(operation, self.sink.clone());
        let result = match self.busy.try_lock() {
            Ok(_guard) => body(&mut ctx),
            Err(TryLockError::Poisoned(poisoned)) => {
                let _guard = poisoned.into_inner();
                body(&mut ctx)
            }
            Err(TryLockError::WouldBlock) => Err(MultibootError::Busy),
        };

        match &result {
            Ok(_) => {
                tracing::info!(operation = %operation, elapsed_ms = ctx.elapsed().as_millis() as u64, "operation finished");
                ctx.finish(true, format!("{} completed", operation));
            }
            // The running operation owns the sink's lifecycle events.
            Err(MultibootError::Busy) => {
                tracing::warn!(operation = %operation, "refused, another operation is running");
            }
            Err(err) => {
                tracing::error!(operation = %operation, error = %err, "operation failed");
                ctx.finish(false, err.to_string());
            }
        }

        OperationRun {
            operation,
            result,
            log: ctx.log_lines().to_vec(),
            started_at_utc,
            finished_at_utc: now_utc_rfc3339(),
        }
    }
}
