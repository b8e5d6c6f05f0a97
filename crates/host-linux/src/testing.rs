//! Scripted runner for exercising the pipeline without touching real devices.

use crate::command::{CommandOutput, CommandRunner};
use multiboot_core::{MultibootError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

type Hook = Box<dyn Fn(&[String]) + Send + Sync>;

/// Records every invocation and succeeds unless told otherwise.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<Vec<String>>>,
    failures: Mutex<HashMap<String, u32>>,
    missing: Mutex<HashSet<String>>,
    hooks: Mutex<Vec<(String, Hook)>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` invocations of `program` exit with code 1.
    pub fn fail_times(&self, program: &str, times: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(program.to_string(), times);
        }
    }

    pub fn missing(&self, program: &str) {
        if let Ok(mut missing) = self.missing.lock() {
            missing.insert(program.to_string());
        }
    }

    /// Runs `hook` with the argv of each successful invocation of `program`.
    pub fn on_success(&self, program: &str, hook: impl Fn(&[String]) + Send + Sync + 'static) {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.push((program.to_string(), Box::new(hook)));
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|argv| argv.first().map(String::as_str) == Some(program))
            .collect()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|argv| argv.first().cloned())
            .collect()
    }
}

impl CommandRunner for RecordingRunner {
    fn execute(&self, argv: &[String]) -> Result<CommandOutput> {
        let program = argv.first().cloned().unwrap_or_default();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(argv.to_vec());
        }
        if self
            .missing
            .lock()
            .map(|missing| missing.contains(&program))
            .unwrap_or(false)
        {
            return Err(MultibootError::ToolNotFound(program));
        }
        let should_fail = match self.failures.lock() {
            Ok(mut failures) => match failures.get_mut(&program) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            },
            Err(_) => false,
        };
        if should_fail {
            return Ok(CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: format!("simulated failure of {}", program),
            });
        }
        if let Ok(hooks) = self.hooks.lock() {
            for (name, hook) in hooks.iter() {
                if *name == program {
                    hook(argv);
                }
            }
        }
        Ok(CommandOutput {
            code: Some(0),
            ..CommandOutput::default()
        })
    }
}
