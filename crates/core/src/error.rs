use crate::Phase;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MultibootError {
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("`{}` exited with {}: {stderr}", .argv.join(" "), display_code(.code))]
    ExternalTool {
        argv: Vec<String>,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unable to mount {} at {}", .source_path.display(), .mount_point.display())]
    Mount {
        source_path: PathBuf,
        mount_point: PathBuf,
    },

    #[error("no images were copied to the device")]
    NoAssetsCopied,

    #[error("operation cancelled by user")]
    UserCancelled,

    #[error("{device} is not a multiboot drive: {reason}")]
    IncompatibleDevice { device: String, reason: String },

    #[error("{phase} failed: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: Box<MultibootError>,
    },

    #[error("another device operation is already running")]
    Busy,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MultibootError {
    /// Phase the failure was reported in, if it came from a required step.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            MultibootError::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Innermost error, skipping phase wrappers.
    pub fn root(&self) -> &MultibootError {
        match self {
            MultibootError::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), MultibootError::UserCancelled)
    }
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, MultibootError>;
