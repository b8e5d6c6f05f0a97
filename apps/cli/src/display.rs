use anyhow::{anyhow, Result};
use multiboot_core::{CopyProgress, Event};
use std::io::Write;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

const POLL: Duration = Duration::from_millis(100);

/// Renders engine events on stderr until the worker finishes, then returns its value.
pub fn pump<T>(events: &Receiver<Event>, worker: JoinHandle<T>) -> Result<T> {
    let mut display = ProgressDisplay::default();
    loop {
        match events.recv_timeout(POLL) {
            Ok(event) => {
                let finished = matches!(event, Event::Finished { .. });
                display.show(&event);
                if finished {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if worker.is_finished() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    for event in events.try_iter() {
        display.show(&event);
    }
    display.end_line();
    worker
        .join()
        .map_err(|_| anyhow!("operation worker panicked"))
}

#[derive(Default)]
struct ProgressDisplay {
    on_progress_line: bool,
}

impl ProgressDisplay {
    fn show(&mut self, event: &Event) {
        match event {
            Event::PhaseStarted(phase) => {
                self.end_line();
                eprintln!("==> {}", phase);
            }
            Event::PhaseFailed { phase, reason } => {
                self.end_line();
                eprintln!("!!! {} failed: {}", phase, reason);
            }
            Event::Progress(progress) => {
                eprint!("\r{}", progress_line(progress));
                let _ = std::io::stderr().flush();
                self.on_progress_line = true;
            }
            Event::Finished { success, message, .. } => {
                self.end_line();
                if *success {
                    eprintln!("{}", message);
                }
            }
            Event::PhaseSucceeded(_) | Event::Log { .. } => {}
        }
    }

    fn end_line(&mut self) {
        if self.on_progress_line {
            eprintln!();
            self.on_progress_line = false;
        }
    }
}

pub fn progress_line(progress: &CopyProgress) -> String {
    let percent = if progress.asset_total == 0 {
        100.0
    } else {
        progress.asset_copied as f64 * 100.0 / progress.asset_total as f64
    };
    let speed = progress
        .speed()
        .map(|speed| format!("{}/s", human_bytes(speed as u64)))
        .unwrap_or_else(|| "--/s".to_string());
    format!(
        "{} {:5.1}% {} of {} | {} | ETA {} (all {})",
        progress.file_name,
        percent,
        human_bytes(progress.aggregate_copied),
        human_bytes(progress.aggregate_total),
        speed,
        format_eta(progress.eta_asset()),
        format_eta(progress.eta_total()),
    )
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        Some(eta) => {
            let secs = eta.as_secs();
            format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
        None => "--:--:--".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn unknown_eta_is_dashed() {
        assert_eq!(format_eta(None), "--:--:--");
        assert_eq!(format_eta(Some(Duration::from_secs(3725))), "01:02:05");
    }

    #[test]
    fn progress_line_reads_well() {
        let line = progress_line(&CopyProgress {
            file_name: "a.iso".to_string(),
            asset_copied: 512,
            asset_total: 1024,
            aggregate_copied: 512,
            aggregate_total: 2048,
            elapsed: Duration::from_secs(1),
        });
        assert_eq!(
            line,
            "a.iso  50.0% 512 B of 2.0 KiB | 512 B/s | ETA 00:00:01 (all 00:00:03)"
        );
    }
}
