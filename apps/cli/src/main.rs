use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use multiboot_core::{
    BlockDevice, ChannelSink, DeviceGraph, Disk, EngineConfig, ImageAsset, MultibootError,
};
use multiboot_host_linux::{build_device_graph, missing_tools, removable_disks, SystemRunner};
use multiboot_report::{create_report_bundle, ReportArtifact, RunRecord};
use multiboot_safety::{
    can_write_to_disk, require_confirmation_token, ConfirmationGate, NonInteractiveGate,
    SafetyContext, SafetyDecision,
};
use multiboot_workflow_engine::{AddOutcome, Engine, OperationRun, RemoveOutcome};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing_subscriber::EnvFilter;

mod display;

#[derive(Parser)]
#[command(name = "multiboot", version, about = "Create and manage multiboot USB drives")]
struct Cli {
    /// JSON file overriding the built-in engine settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Write a report bundle for each device operation under this directory.
    #[arg(long, global = true)]
    report_base: Option<PathBuf>,
    /// Answer confirmation prompts with yes.
    #[arg(long, short = 'y', global = true)]
    yes: bool,
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List block devices.
    Devices {
        /// Include fixed disks.
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Report external tools missing from PATH.
    CheckTools,
    /// Erase a device and make it a multiboot drive holding the given images.
    Create {
        device: String,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Check whether a device already has the multiboot layout.
    Verify { device: String },
    /// List the images on a multiboot drive.
    List { device: String },
    /// Copy one image onto a multiboot drive.
    Add {
        device: String,
        image: PathBuf,
        /// Replace an image with the same name without asking.
        #[arg(long)]
        overwrite: bool,
    },
    /// Delete one image from a multiboot drive.
    Remove { device: String, name: String },
    /// Print the boot menu a drive holding the images of a directory would get.
    Menu { dir: PathBuf },
    /// Print the SHA-256 of a file.
    Hash { path: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = EngineConfig::load(cli.config.as_deref()).context("load configuration")?;
    let app = App {
        config,
        report_base: cli.report_base,
        assume_yes: cli.yes,
    };

    match cli.command {
        Commands::Devices { all, json } => devices(all, json),
        Commands::CheckTools => check_tools(),
        Commands::Create { device, images } => app.create(&device, &images),
        Commands::Verify { device } => app.verify(&device),
        Commands::List { device } => app.list(&device),
        Commands::Add {
            device,
            image,
            overwrite,
        } => app.add(&device, &image, overwrite),
        Commands::Remove { device, name } => app.remove(&device, &name),
        Commands::Menu { dir } => app.menu(&dir),
        Commands::Hash { path } => {
            let digest = multiboot_imaging::hash_file(&path)?;
            println!("{}  {}", digest, path.display());
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,multiboot=info"))
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn devices(all: bool, json: bool) -> Result<()> {
    let graph = build_device_graph()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&graph)?);
        return Ok(());
    }
    let disks: Vec<&Disk> = if all {
        graph.disks.iter().collect()
    } else {
        removable_disks(&graph)
    };
    if disks.is_empty() {
        println!("no removable devices found");
        return Ok(());
    }
    for disk in disks {
        let mut flags = Vec::new();
        if disk.removable {
            flags.push("removable");
        }
        if disk.is_system_disk {
            flags.push("system");
        }
        println!(
            "{:<14} {:>10}  {:<6} {} [{}]",
            disk.path.display(),
            display::human_bytes(disk.size_bytes),
            disk.transport.as_deref().unwrap_or("-"),
            disk.friendly_name,
            flags.join(",")
        );
        for partition in &disk.partitions {
            println!(
                "  {:<12} {:>10}  {:<6} {}",
                partition.id,
                display::human_bytes(partition.size_bytes),
                partition.fs.as_deref().unwrap_or("-"),
                partition.mount_points.join(" ")
            );
        }
    }
    Ok(())
}

fn check_tools() -> Result<()> {
    let missing = missing_tools();
    if missing.is_empty() {
        println!("all required tools found");
        return Ok(());
    }
    for tool in &missing {
        println!("missing: {}", tool);
    }
    bail!("{} required tool(s) missing", missing.len())
}

/// `sdb` and `/dev/sdb` name the same device.
fn device_path(device: &str) -> PathBuf {
    let path = Path::new(device);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        Path::new("/dev").join(device)
    }
}

fn prompt(question: &str) -> bool {
    eprint!("{}", question);
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    let answer = answer.trim();
    answer.eq_ignore_ascii_case("yes") || answer.eq_ignore_ascii_case("y")
}

/// Asks on the terminal, then applies the same system-disk rule as the
/// non-interactive gate.
struct PromptGate {
    allow_overwrite: bool,
}

impl ConfirmationGate for PromptGate {
    fn confirm_destructive(&self, device: &Path, disk: Option<&Disk>) -> bool {
        let description = disk
            .map(|disk| {
                format!(
                    "{} ({})",
                    disk.friendly_name,
                    display::human_bytes(disk.size_bytes)
                )
            })
            .unwrap_or_else(|| "unknown device".to_string());
        let question = format!(
            "All data on {} [{}] will be erased. Continue? [yes/no] ",
            device.display(),
            description
        );
        if !prompt(&question) {
            return false;
        }
        let context = SafetyContext {
            force_mode: true,
            confirmation_token: Some(require_confirmation_token()),
            allow_overwrite: self.allow_overwrite,
        };
        let is_system_disk = disk.map(|disk| disk.is_system_disk).unwrap_or(false);
        match can_write_to_disk(&context, is_system_disk) {
            SafetyDecision::Allow => true,
            SafetyDecision::Deny(reason) => {
                eprintln!("{}", reason);
                false
            }
        }
    }

    fn confirm_overwrite(&self, file_name: &str) -> bool {
        self.allow_overwrite
            || prompt(&format!(
                "{} is already on the device. Overwrite? [yes/no] ",
                file_name
            ))
    }
}

struct App {
    config: EngineConfig,
    report_base: Option<PathBuf>,
    assume_yes: bool,
}

struct Target {
    device: BlockDevice,
    graph: Option<DeviceGraph>,
}

impl Target {
    fn disk(&self) -> Option<&Disk> {
        self.graph.as_ref()?.find_disk(&self.device.path)
    }
}

impl App {
    fn gate(&self, allow_overwrite: bool) -> Box<dyn ConfirmationGate + Send + Sync> {
        if self.assume_yes {
            Box::new(NonInteractiveGate {
                context: SafetyContext {
                    force_mode: true,
                    confirmation_token: Some(require_confirmation_token()),
                    allow_overwrite,
                },
            })
        } else {
            Box::new(PromptGate { allow_overwrite })
        }
    }

    fn target(&self, device: &str) -> Target {
        let device = BlockDevice::new(device_path(device));
        let graph = match build_device_graph() {
            Ok(graph) => Some(graph),
            Err(err) => {
                tracing::warn!(error = %err, "device enumeration failed");
                None
            }
        };
        Target { device, graph }
    }

    /// Runs `op` on a worker thread while the main thread renders its events.
    fn execute<T, F>(&self, op: F) -> Result<OperationRun<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Engine) -> OperationRun<T> + Send + 'static,
    {
        let (sender, events) = mpsc::channel();
        let engine = Arc::new(Engine::new(
            Arc::new(SystemRunner),
            self.config.clone(),
            Arc::new(ChannelSink::new(sender)),
        ));
        let worker = thread::spawn(move || op(&engine));
        display::pump(&events, worker)
    }

    fn report<T>(
        &self,
        run: &OperationRun<T>,
        target: Option<&Target>,
        assets: Vec<String>,
        artifacts: &[ReportArtifact],
    ) {
        let Some(base) = &self.report_base else {
            return;
        };
        let record = RunRecord {
            operation: run.operation.to_string(),
            device: target.map(|target| target.device.display().to_string()),
            success: run.result.is_ok(),
            message: match &run.result {
                Ok(_) => format!("{} completed", run.operation),
                Err(err) => err.to_string(),
            },
            failed_phase: run
                .result
                .as_ref()
                .err()
                .and_then(MultibootError::phase)
                .map(|phase| phase.to_string()),
            assets,
            started_at_utc: run.started_at_utc.clone(),
            finished_at_utc: run.finished_at_utc.clone(),
        };
        let graph = target.and_then(|target| target.graph.as_ref());
        match create_report_bundle(base, &record, graph, &run.log, artifacts) {
            Ok(paths) => eprintln!("report: {}", paths.root.display()),
            Err(err) => tracing::warn!(error = %err, "report bundle not written"),
        }
    }

    fn create(&self, device: &str, images: &[PathBuf]) -> Result<()> {
        let missing = missing_tools();
        if !missing.is_empty() {
            bail!("required tools missing: {}", missing.join(", "));
        }
        let assets = images
            .iter()
            .map(ImageAsset::from_path)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let target = self.target(device);
        match target.disk() {
            Some(disk) if !disk.removable => {
                tracing::warn!(device = %target.device.display(), "target is not reported as removable")
            }
            None => tracing::warn!(device = %target.device.display(), "target not found among enumerated disks"),
            _ => {}
        }

        let gate = self.gate(false);
        let device = target.device.clone();
        let disk = target.disk().cloned();
        let names: Vec<String> = assets.iter().map(|asset| asset.file_name.clone()).collect();
        let run = self.execute(move |engine| {
            engine.create(&device, &assets, gate.as_ref(), disk.as_ref())
        })?;

        let mut artifacts = Vec::new();
        if let Ok(summary) = &run.result {
            if summary.copied.iter().any(|copied| copied.sha256.is_some()) {
                artifacts.push(ReportArtifact::json("copy_manifest.json", &summary.copied)?);
            }
        }
        self.report(&run, Some(&target), names, &artifacts);
        let summary = run.into_result()?;
        println!(
            "{} ready: {} image(s) copied, {} menu entr{}",
            summary.partition.display(),
            summary.copied.len(),
            summary.menu_entries,
            if summary.menu_entries == 1 { "y" } else { "ies" }
        );
        Ok(())
    }

    fn verify(&self, device: &str) -> Result<()> {
        let target = self.target(device);
        let block = target.device.clone();
        let run = self.execute(move |engine| engine.verify(&block))?;
        let assets = run
            .result
            .as_ref()
            .map(|compatibility| compatibility.assets.clone())
            .unwrap_or_default();
        self.report(&run, Some(&target), assets, &[]);
        let compatibility = run.into_result()?;
        if !compatibility.compatible {
            bail!(
                "{} is not a multiboot drive: {}",
                target.device.display(),
                compatibility.reason.unwrap_or_default()
            );
        }
        println!(
            "{} is a multiboot drive with {} image(s)",
            target.device.display(),
            compatibility.assets.len()
        );
        Ok(())
    }

    fn list(&self, device: &str) -> Result<()> {
        let target = self.target(device);
        let block = target.device.clone();
        let run = self.execute(move |engine| engine.list(&block))?;
        let assets = run.result.as_ref().cloned().unwrap_or_default();
        self.report(&run, Some(&target), assets, &[]);
        for name in run.into_result()? {
            println!("{}", name);
        }
        Ok(())
    }

    fn add(&self, device: &str, image: &Path, overwrite: bool) -> Result<()> {
        let asset = ImageAsset::from_path(image)?;
        let target = self.target(device);
        let block = target.device.clone();
        let gate = self.gate(overwrite);
        let name = asset.file_name.clone();
        let run = self.execute(move |engine| engine.add(&block, &asset, gate.as_ref()))?;

        let mut artifacts = Vec::new();
        if let Ok(AddOutcome::Added(copied)) = &run.result {
            if copied.sha256.is_some() {
                artifacts.push(ReportArtifact::json("copy_manifest.json", &[copied])?);
            }
        }
        self.report(&run, Some(&target), vec![name.clone()], &artifacts);
        match run.into_result()? {
            AddOutcome::Added(copied) => println!("added {} ({} bytes)", copied.file_name, copied.bytes),
            AddOutcome::Cancelled => println!("kept the existing {}", name),
        }
        Ok(())
    }

    fn remove(&self, device: &str, name: &str) -> Result<()> {
        let target = self.target(device);
        let block = target.device.clone();
        let file_name = name.to_string();
        let run = self.execute(move |engine| engine.remove(&block, &file_name))?;
        self.report(&run, Some(&target), vec![name.to_string()], &[]);
        match run.into_result()? {
            RemoveOutcome::Removed => println!("removed {}", name),
            RemoveOutcome::Absent => println!("{} was not on the device", name),
        }
        Ok(())
    }

    fn menu(&self, dir: &Path) -> Result<()> {
        let dir = dir.to_path_buf();
        let run = self.execute(move |engine| engine.preview(&dir))?;
        print!("{}", run.into_result()?);
        Ok(())
    }
}
