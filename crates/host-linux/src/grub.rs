use crate::command::Shell;
use multiboot_core::{BlockDevice, EngineConfig, MultibootError, OperationContext, Result};
use std::path::Path;

/// Installs GRUB for legacy BIOS boot with its files under `boot_dir`.
/// Retries use `--force` to get past grub-install's own sanity refusals.
pub fn install_boot_loader(
    shell: &Shell<'_>,
    ctx: &mut OperationContext,
    device: &BlockDevice,
    boot_dir: &Path,
    config: &EngineConfig,
) -> Result<()> {
    let boot_arg = format!("--boot-directory={}", boot_dir.display());
    let target_arg = format!("--target={}", config.grub_target);
    let disk = device.display().to_string();

    let mut attempt = 0;
    loop {
        let mut argv = vec!["grub-install", boot_arg.as_str(), target_arg.as_str(), "--no-floppy"];
        if attempt > 0 {
            argv.push("--force");
        }
        argv.push(&disk);

        match shell.must_run(ctx, &argv) {
            Ok(_) => return Ok(()),
            Err(MultibootError::ExternalTool { .. }) if attempt < config.bootloader_retries => {
                attempt += 1;
                ctx.warn(format!("grub-install failed, retrying with --force ({})", attempt));
            }
            Err(err) => return Err(err),
        }
    }
}
