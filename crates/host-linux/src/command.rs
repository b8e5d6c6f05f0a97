use multiboot_core::{MultibootError, OperationContext, Result};
use std::process::Command;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Executes one external tool. A missing executable is `ToolNotFound`;
/// a non-zero exit is reported through `CommandOutput::code`.
pub trait CommandRunner: Send + Sync {
    fn execute(&self, argv: &[String]) -> Result<CommandOutput>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn execute(&self, argv: &[String]) -> Result<CommandOutput> {
        let Some(program) = argv.first() else {
            return Err(MultibootError::InvalidInput("empty command line".to_string()));
        };
        let resolved =
            which::which(program).map_err(|_| MultibootError::ToolNotFound(program.clone()))?;
        let output = Command::new(resolved).args(&argv[1..]).output()?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Failure policy at the call site: `must_run` for required steps,
/// `try_run` for best-effort ones.
#[derive(Clone, Copy)]
pub struct Shell<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> Shell<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &'a dyn CommandRunner {
        self.runner
    }

    /// Runs a required step; a non-zero exit becomes `ExternalTool`.
    pub fn must_run(&self, ctx: &mut OperationContext, argv: &[&str]) -> Result<CommandOutput> {
        let argv = to_owned(argv);
        ctx.info(format!("$ {}", argv.join(" ")));
        let output = match self.runner.execute(&argv) {
            Ok(output) => output,
            Err(err) => {
                ctx.error(err.to_string());
                return Err(err);
            }
        };
        log_stderr(ctx, &output);
        if output.success() {
            Ok(output)
        } else {
            Err(MultibootError::ExternalTool {
                argv,
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Runs a best-effort step; failures are logged as warnings and reported as `false`.
    pub fn try_run(&self, ctx: &mut OperationContext, argv: &[&str]) -> bool {
        let argv = to_owned(argv);
        let line = argv.join(" ");
        ctx.info(format!("$ {}", line));
        match self.runner.execute(&argv) {
            Ok(output) => {
                log_stderr(ctx, &output);
                if !output.success() {
                    ctx.warn(format!("ignored failure of `{}`", line));
                }
                output.success()
            }
            Err(err) => {
                ctx.warn(format!("ignored failure of `{}`: {}", line, err));
                false
            }
        }
    }

    /// Like `try_run`, but kept out of the operation log.
    pub fn try_run_quiet(&self, argv: &[&str]) -> bool {
        let argv = to_owned(argv);
        match self.runner.execute(&argv) {
            Ok(output) => {
                tracing::debug!(command = %argv.join(" "), code = ?output.code, "quiet command");
                output.success()
            }
            Err(err) => {
                tracing::debug!(command = %argv.join(" "), error = %err, "quiet command");
                false
            }
        }
    }
}

fn to_owned(argv: &[&str]) -> Vec<String> {
    argv.iter().map(|arg| arg.to_string()).collect()
}

fn log_stderr(ctx: &mut OperationContext, output: &CommandOutput) {
    for line in output.stderr.lines() {
        let line = line.trim();
        if !line.is_empty() {
            ctx.info(line.to_string());
        }
    }
}
