use crate::command::Shell;
use crate::mount::unmount_or_detach;
use crate::{mounted_children, read_mount_table};
use multiboot_core::config::millis;
use multiboot_core::{BlockDevice, EngineConfig, MultibootError, OperationContext, Phase, Result};
use std::path::{Path, PathBuf};
use std::thread;

/// Repartitions `device` with one bootable FAT32 partition and returns its path.
/// Every existing byte on the device is lost.
pub fn format_device(
    shell: &Shell<'_>,
    ctx: &mut OperationContext,
    device: &BlockDevice,
    config: &EngineConfig,
) -> Result<PathBuf> {
    let disk = device.display().to_string();

    ctx.run_phase(Phase::UnmountDevice, |ctx| {
        unmount_children(shell, ctx, device, &read_mount_table());
        Ok(())
    })?;

    ctx.run_phase(Phase::Partition, |ctx| {
        shell.must_run(ctx, &["parted", "-s", &disk, "mklabel", "msdos"])?;
        shell.must_run(
            ctx,
            &[
                "parted",
                "-s",
                &disk,
                "mkpart",
                "primary",
                "fat32",
                &config.partition_start,
                "100%",
            ],
        )?;
        shell.must_run(ctx, &["parted", "-s", &disk, "set", "1", "boot", "on"])?;
        Ok(())
    })?;

    ctx.run_phase(Phase::Settle, |ctx| {
        settle(
            shell,
            ctx,
            device,
            config.settle.before_reread_ms,
            config.settle.after_reread_ms,
        );
        Ok(())
    })?;

    let partition = device.partition_path();
    ctx.run_phase(Phase::Format, |ctx| {
        make_filesystem(shell, ctx, device, &partition, config)
    })?;
    Ok(partition)
}

/// Unmounts every entry of `mount_table` that belongs to `device`, detaching
/// busy ones.
fn unmount_children(
    shell: &Shell<'_>,
    ctx: &mut OperationContext,
    device: &BlockDevice,
    mount_table: &str,
) {
    let children = mounted_children(&device.path, mount_table);
    if children.is_empty() {
        ctx.info(format!("no mounted partitions on {}", device.display()));
    }
    for child in children {
        let source = child.device.display().to_string();
        if !unmount_or_detach(shell, ctx, &source) {
            ctx.warn(format!("{} was busy, detached it", source));
        }
    }
}

/// Pause, ask the kernel to re-read the table, pause again.
fn settle(
    shell: &Shell<'_>,
    ctx: &mut OperationContext,
    device: &BlockDevice,
    before_ms: u64,
    after_ms: u64,
) {
    pause(before_ms);
    let disk = device.display().to_string();
    shell.try_run(ctx, &["partprobe", &disk]);
    pause(after_ms);
}

fn pause(ms: u64) {
    if ms > 0 {
        thread::sleep(millis(ms));
    }
}

fn make_filesystem(
    shell: &Shell<'_>,
    ctx: &mut OperationContext,
    device: &BlockDevice,
    partition: &Path,
    config: &EngineConfig,
) -> Result<()> {
    let part = partition.display().to_string();
    let mut argv = vec!["mkfs.fat", "-F32"];
    if let Some(label) = config.volume_label.as_deref() {
        argv.push("-n");
        argv.push(label);
    }
    argv.push(&part);

    let mut attempt = 0;
    loop {
        match shell.must_run(ctx, &argv) {
            Ok(_) => return Ok(()),
            Err(MultibootError::ExternalTool { .. }) if attempt < config.format_retries => {
                attempt += 1;
                ctx.warn(format!(
                    "filesystem creation on {} failed, settling before retry {}",
                    part, attempt
                ));
                settle(
                    shell,
                    ctx,
                    device,
                    config.settle.retry_before_reread_ms,
                    config.settle.retry_after_reread_ms,
                );
            }
            Err(err) => return Err(err),
        }
    }
}
