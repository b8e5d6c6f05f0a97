use multiboot_bootloader_core::{classify_tree, BootProfile, ImageProbe};
use multiboot_core::OperationContext;
use multiboot_host_linux::mount::mount;
use multiboot_host_linux::{CommandRunner, MountRequest, Shell};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Loop-mounts each image read-only at a dedicated mount point and
/// classifies the tree it exposes.
pub struct LoopMountProbe {
    runner: Arc<dyn CommandRunner>,
    mount_point: PathBuf,
}

impl LoopMountProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            mount_point: mount_point.into(),
        }
    }
}

impl ImageProbe for LoopMountProbe {
    fn probe(&self, ctx: &mut OperationContext, image: &Path) -> BootProfile {
        let shell = Shell::new(self.runner.as_ref());
        let request = MountRequest::new(image, &self.mount_point)
            .fs_type("iso9660")
            .options("loop,ro");
        match mount(&shell, ctx, &request) {
            Ok(guard) => {
                let profile = classify_tree(guard.path());
                guard.release(ctx);
                profile
            }
            Err(err) => {
                ctx.warn(format!("cannot inspect {}: {}", image.display(), err));
                BootProfile::unknown()
            }
        }
    }
}
