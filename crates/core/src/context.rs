use crate::{MultibootError, OperationKind, Phase, Result};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Smallest elapsed time used for rate math.
const MIN_ELAPSED: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    PhaseStarted(Phase),
    PhaseSucceeded(Phase),
    PhaseFailed { phase: Phase, reason: String },
    Progress(CopyProgress),
    Log { level: LogLevel, line: String },
    Finished {
        operation: OperationKind,
        success: bool,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One byte-progress tick for the image currently being copied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyProgress {
    pub file_name: String,
    pub asset_copied: u64,
    pub asset_total: u64,
    pub aggregate_copied: u64,
    pub aggregate_total: u64,
    /// Time since the copy batch started.
    pub elapsed: Duration,
}

impl CopyProgress {
    fn elapsed_secs(&self) -> f64 {
        self.elapsed.max(MIN_ELAPSED).as_secs_f64()
    }

    /// Bytes per second over the copy batch; `None` when nothing moved yet.
    pub fn speed(&self) -> Option<f64> {
        let speed = self.aggregate_copied as f64 / self.elapsed_secs();
        if speed.is_finite() && speed > 0.0 {
            Some(speed)
        } else {
            None
        }
    }

    pub fn eta_asset(&self) -> Option<Duration> {
        remaining(self.asset_total, self.asset_copied, self.speed())
    }

    pub fn eta_total(&self) -> Option<Duration> {
        remaining(self.aggregate_total, self.aggregate_copied, self.speed())
    }
}

fn remaining(total: u64, copied: u64, speed: Option<f64>) -> Option<Duration> {
    let speed = speed?;
    let secs = total.saturating_sub(copied) as f64 / speed;
    if secs.is_finite() {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

/// Receives lifecycle events in emission order.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Forwards events to a display thread.
pub struct ChannelSink {
    sender: Mutex<Sender<Event>>,
}

impl ChannelSink {
    pub fn new(sender: Sender<Event>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        if let Ok(sender) = self.sender.lock() {
            let _ = sender.send(event);
        }
    }
}

#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Log { line, .. } => Some(line),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// State of one device operation, passed explicitly into every step.
pub struct OperationContext {
    operation: OperationKind,
    started: Instant,
    copy_started: Option<Instant>,
    phase: Option<Phase>,
    aggregate_copied: u64,
    aggregate_total: u64,
    log: Vec<String>,
    sink: Arc<dyn EventSink>,
}

impl OperationContext {
    pub fn new(operation: OperationKind, sink: Arc<dyn EventSink>) -> Self {
        Self {
            operation,
            started: Instant::now(),
            copy_started: None,
            phase: None,
            aggregate_copied: 0,
            aggregate_total: 0,
            log: Vec::new(),
            sink,
        }
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    pub fn phase(&self) -> Option<Phase> {
        self.phase
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn log_lines(&self) -> &[String] {
        &self.log
    }

    pub fn info(&mut self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!(operation = %self.operation, "{}", line);
        self.push(LogLevel::Info, line);
    }

    pub fn warn(&mut self, line: impl Into<String>) {
        let line = line.into();
        tracing::warn!(operation = %self.operation, "{}", line);
        self.push(LogLevel::Warn, line);
    }

    pub fn error(&mut self, line: impl Into<String>) {
        let line = line.into();
        tracing::error!(operation = %self.operation, "{}", line);
        self.push(LogLevel::Error, line);
    }

    fn push(&mut self, level: LogLevel, line: String) {
        self.log.push(line.clone());
        self.sink.emit(Event::Log { level, line });
    }

    /// Runs a required step. A failure is logged, reported as `PhaseFailed`
    /// and returned wrapped with the phase name.
    pub fn run_phase<T>(
        &mut self,
        phase: Phase,
        step: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.phase = Some(phase);
        self.sink.emit(Event::PhaseStarted(phase));
        match step(self) {
            Ok(value) => {
                self.sink.emit(Event::PhaseSucceeded(phase));
                Ok(value)
            }
            Err(err) => {
                let reason = err.to_string();
                self.error(format!("{} failed: {}", phase, reason));
                self.sink.emit(Event::PhaseFailed { phase, reason });
                match err {
                    already @ MultibootError::Phase { .. } => Err(already),
                    other => Err(MultibootError::Phase {
                        phase,
                        source: Box::new(other),
                    }),
                }
            }
        }
    }

    /// Resets the aggregate counters and the copy clock before a batch of copies.
    pub fn start_copy_batch(&mut self, total_bytes: u64) {
        self.aggregate_copied = 0;
        self.aggregate_total = total_bytes;
        self.copy_started = Some(Instant::now());
    }

    pub fn add_copied(&mut self, bytes: u64) {
        self.aggregate_copied = self.aggregate_copied.saturating_add(bytes);
    }

    /// Drops the uncopied rest of an abandoned asset from the aggregate
    /// total. Bytes already counted stay counted, so `aggregate_copied`
    /// never decreases within a batch.
    pub fn abandon_asset(&mut self, asset_total: u64, asset_copied: u64) {
        let rest = asset_total.saturating_sub(asset_copied);
        self.aggregate_total = self
            .aggregate_total
            .saturating_sub(rest)
            .max(self.aggregate_copied);
    }

    pub fn aggregate(&self) -> (u64, u64) {
        (self.aggregate_copied, self.aggregate_total)
    }

    pub fn progress(&self, file_name: &str, asset_copied: u64, asset_total: u64) -> CopyProgress {
        CopyProgress {
            file_name: file_name.to_string(),
            asset_copied,
            asset_total,
            aggregate_copied: self.aggregate_copied,
            aggregate_total: self.aggregate_total,
            elapsed: self.copy_elapsed(),
        }
    }

    /// Time since `start_copy_batch`, or since the operation began when no
    /// batch was started.
    pub fn copy_elapsed(&self) -> Duration {
        self.copy_started.unwrap_or(self.started).elapsed()
    }

    pub fn emit_progress(&self, progress: CopyProgress) {
        self.sink.emit(Event::Progress(progress));
    }

    pub fn finish(&self, success: bool, message: impl Into<String>) {
        self.sink.emit(Event::Finished {
            operation: self.operation,
            success,
            message: message.into(),
        });
    }
}
