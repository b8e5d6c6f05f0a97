use crate::command::{CommandRunner, Shell};
use multiboot_core::{MultibootError, OperationContext, Phase, Result};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct MountRequest<'p> {
    pub source: &'p Path,
    pub mount_point: &'p Path,
    /// Tried first; on failure the mount is retried with type detection.
    pub fs_type: Option<&'p str>,
    pub options: Option<&'p str>,
}

impl<'p> MountRequest<'p> {
    pub fn new(source: &'p Path, mount_point: &'p Path) -> Self {
        Self {
            source,
            mount_point,
            fs_type: None,
            options: None,
        }
    }

    pub fn fs_type(mut self, fs_type: &'p str) -> Self {
        self.fs_type = Some(fs_type);
        self
    }

    pub fn options(mut self, options: &'p str) -> Self {
        self.options = Some(options);
        self
    }

    fn argv(&self, with_type: bool) -> Vec<String> {
        let mut argv = vec!["mount".to_string()];
        if with_type {
            if let Some(fs_type) = self.fs_type {
                argv.push("-t".to_string());
                argv.push(fs_type.to_string());
            }
        }
        if let Some(options) = self.options {
            argv.push("-o".to_string());
            argv.push(options.to_string());
        }
        argv.push(self.source.display().to_string());
        argv.push(self.mount_point.display().to_string());
        argv
    }
}

/// Holds the mount point until released. Dropping an unreleased guard
/// (a panic inside the body) falls back to a lazy unmount.
pub struct MountGuard<'r> {
    runner: &'r dyn CommandRunner,
    mount_point: PathBuf,
    released: bool,
}

impl<'r> MountGuard<'r> {
    pub fn path(&self) -> &Path {
        &self.mount_point
    }

    /// Graceful unmount, then a forced lazy one. Returns whether the
    /// graceful unmount worked.
    pub fn release(mut self, ctx: &mut OperationContext) -> bool {
        self.released = true;
        let shell = Shell::new(self.runner);
        let target = self.mount_point.display().to_string();
        unmount_or_detach(&shell, ctx, &target)
    }
}

/// Plain `umount`, then `sync` and a forced lazy detach when the target is
/// busy. Returns whether the plain unmount succeeded.
pub(crate) fn unmount_or_detach(shell: &Shell<'_>, ctx: &mut OperationContext, target: &str) -> bool {
    if shell.try_run(ctx, &["umount", target]) {
        return true;
    }
    shell.try_run(ctx, &["sync"]);
    if !shell.try_run(ctx, &["umount", "-l", "-f", target]) {
        ctx.warn(format!("{} may still be mounted", target));
    }
    false
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            let target = self.mount_point.display().to_string();
            Shell::new(self.runner).try_run_quiet(&["umount", "-l", &target]);
        }
    }
}

/// Clears a stale mount, creates the mount point and mounts `request.source`.
pub fn mount<'r>(
    shell: &Shell<'r>,
    ctx: &mut OperationContext,
    request: &MountRequest<'_>,
) -> Result<MountGuard<'r>> {
    let target = request.mount_point.display().to_string();
    shell.try_run_quiet(&["umount", &target]);
    fs::create_dir_all(request.mount_point)?;

    let mut attempts = Vec::new();
    if request.fs_type.is_some() {
        attempts.push(request.argv(true));
    }
    attempts.push(request.argv(false));

    for argv in attempts {
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        if shell.try_run(ctx, &argv) {
            return Ok(MountGuard {
                runner: shell.runner(),
                mount_point: request.mount_point.to_path_buf(),
                released: false,
            });
        }
    }
    Err(MultibootError::Mount {
        source_path: request.source.to_path_buf(),
        mount_point: request.mount_point.to_path_buf(),
    })
}

/// Runs `body` with the partition mounted. The mount point is released on
/// every exit path before the body's result is returned.
pub fn with_mount<T>(
    shell: &Shell<'_>,
    ctx: &mut OperationContext,
    request: &MountRequest<'_>,
    body: impl FnOnce(&mut OperationContext, &Path) -> Result<T>,
) -> Result<T> {
    let guard = ctx.run_phase(Phase::Mount, |ctx| mount(shell, ctx, request))?;
    let result = body(ctx, guard.path());
    ctx.run_phase(Phase::Release, |ctx| {
        guard.release(ctx);
        Ok(())
    })?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingRunner;
    use multiboot_core::{MemorySink, OperationKind};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn context() -> OperationContext {
        OperationContext::new(OperationKind::Verify, Arc::new(MemorySink::new()))
    }

    #[test]
    fn falls_back_to_detected_filesystem() {
        let runner = RecordingRunner::new();
        runner.fail_times("mount", 1);
        let shell = Shell::new(&runner);
        let mut ctx = context();
        let dir = tempdir().unwrap();
        let mount_point = dir.path().join("mnt");
        let request = MountRequest::new(Path::new("/dev/sdx1"), &mount_point).fs_type("vfat");

        let value = with_mount(&shell, &mut ctx, &request, |_, root| {
            assert!(root.is_dir());
            Ok(7)
        })
        .unwrap();
        assert_eq!(value, 7);

        let mounts = runner.calls_to("mount");
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0][1..3], ["-t".to_string(), "vfat".to_string()]);
        assert_eq!(mounts[1][1], "/dev/sdx1");
        assert_eq!(runner.programs().last().map(String::as_str), Some("umount"));
    }

    #[test]
    fn unmounts_when_body_fails() {
        let runner = RecordingRunner::new();
        let shell = Shell::new(&runner);
        let mut ctx = context();
        let dir = tempdir().unwrap();
        let request = MountRequest::new(Path::new("/dev/sdx1"), dir.path());

        let result: Result<()> = with_mount(&shell, &mut ctx, &request, |_, _| {
            Err(MultibootError::NoAssetsCopied)
        });
        assert!(matches!(result, Err(MultibootError::NoAssetsCopied)));
        let umounts = runner.calls_to("umount");
        // stale clear plus release
        assert_eq!(umounts.len(), 2);
    }

    #[test]
    fn forced_unmount_after_graceful_failure() {
        let runner = RecordingRunner::new();
        let shell = Shell::new(&runner);
        let mut ctx = context();
        let dir = tempdir().unwrap();
        let request = MountRequest::new(Path::new("/dev/sdx1"), dir.path());

        let guard = mount(&shell, &mut ctx, &request).unwrap();
        runner.fail_times("umount", 1);
        assert!(!guard.release(&mut ctx));
        let last = runner.calls().last().cloned().unwrap();
        assert_eq!(last[..3], ["umount".to_string(), "-l".to_string(), "-f".to_string()]);
    }

    #[test]
    fn mount_failure_is_a_mount_error() {
        let runner = RecordingRunner::new();
        runner.fail_times("mount", 2);
        let shell = Shell::new(&runner);
        let mut ctx = context();
        let dir = tempdir().unwrap();
        let request = MountRequest::new(Path::new("/dev/sdx1"), dir.path()).fs_type("vfat");

        let result = with_mount(&shell, &mut ctx, &request, |_, _| Ok(()));
        let err = result.unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Mount));
        assert!(matches!(err.root(), MultibootError::Mount { .. }));
        // nothing was mounted, so nothing is released
        assert_eq!(runner.calls_to("umount").len(), 1);
    }

    #[test]
    fn dropped_guard_unmounts_lazily() {
        let runner = RecordingRunner::new();
        let shell = Shell::new(&runner);
        let mut ctx = context();
        let dir = tempdir().unwrap();
        let request = MountRequest::new(Path::new("/dev/sdx1"), dir.path());

        drop(mount(&shell, &mut ctx, &request).unwrap());
        let last = runner.calls().last().cloned().unwrap();
        assert_eq!(last[..2], ["umount".to_string(), "-l".to_string()]);
    }
}
