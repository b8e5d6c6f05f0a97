use anyhow::{Context, Result};
use multiboot_core::{now_utc_rfc3339, DeviceGraph, DEVICE_GRAPH_SCHEMA_VERSION};
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ReportPaths {
    pub run_id: String,
    pub root: PathBuf,
    pub run_json: PathBuf,
    pub logs_path: PathBuf,
    pub device_graph_json: Option<PathBuf>,
    pub artifacts: Vec<PathBuf>,
}

/// Outcome of one device operation as recorded in `run.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub operation: String,
    pub device: Option<String>,
    pub success: bool,
    pub message: String,
    pub failed_phase: Option<String>,
    pub assets: Vec<String>,
    pub started_at_utc: String,
    pub finished_at_utc: String,
}

#[derive(Debug, Clone)]
pub struct ReportArtifact {
    pub name: String,
    pub contents: Vec<u8>,
}

impl ReportArtifact {
    pub fn json<T: Serialize>(name: &str, value: &T) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            contents: serde_json::to_vec_pretty(value)?,
        })
    }
}

#[derive(Debug, Serialize)]
struct RunMetadata<'a> {
    run_id: String,
    created_at_utc: String,
    device_graph_schema_version: String,
    run: &'a RunRecord,
}

/// Writes `reports/<run id>/` under `base` with `run.json`, `logs.txt`,
/// the device graph when known, and any artifacts.
pub fn create_report_bundle(
    base: impl AsRef<Path>,
    record: &RunRecord,
    device_graph: Option<&DeviceGraph>,
    logs: &[String],
    artifacts: &[ReportArtifact],
) -> Result<ReportPaths> {
    let run_id = Uuid::new_v4().to_string();
    let root = base.as_ref().join("reports").join(&run_id);
    std::fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;

    let run_json = root.join("run.json");
    let logs_path = root.join("logs.txt");

    let run_meta = RunMetadata {
        run_id: run_id.clone(),
        created_at_utc: now_utc_rfc3339(),
        device_graph_schema_version: DEVICE_GRAPH_SCHEMA_VERSION.to_string(),
        run: record,
    };
    std::fs::write(&run_json, serde_json::to_string_pretty(&run_meta)?)
        .with_context(|| format!("write {}", run_json.display()))?;

    let mut log_data = logs.join("\n");
    if !log_data.is_empty() {
        log_data.push('\n');
    }
    std::fs::write(&logs_path, log_data)
        .with_context(|| format!("write {}", logs_path.display()))?;

    let device_graph_json = match device_graph {
        Some(graph) => {
            let path = root.join("device_graph.json");
            std::fs::write(&path, serde_json::to_string_pretty(graph)?)
                .with_context(|| format!("write {}", path.display()))?;
            Some(path)
        }
        None => None,
    };

    let mut written = Vec::new();
    for artifact in artifacts {
        let name = Path::new(&artifact.name)
            .file_name()
            .with_context(|| format!("artifact name {:?} has no file name", artifact.name))?;
        let path = root.join(name);
        std::fs::write(&path, &artifact.contents)
            .with_context(|| format!("write {}", path.display()))?;
        written.push(path);
    }

    Ok(ReportPaths {
        run_id,
        root,
        run_json,
        logs_path,
        device_graph_json,
        artifacts: written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record() -> RunRecord {
        RunRecord {
            operation: "create".to_string(),
            device: Some("/dev/sdx".to_string()),
            success: true,
            message: "done".to_string(),
            failed_phase: None,
            assets: vec!["a.iso".to_string()],
            started_at_utc: now_utc_rfc3339(),
            finished_at_utc: now_utc_rfc3339(),
        }
    }

    #[test]
    fn writes_run_logs_and_artifacts() {
        let dir = tempdir().unwrap();
        let manifest = ReportArtifact::json("copy_manifest.json", &vec!["a.iso"]).unwrap();
        let paths = create_report_bundle(
            dir.path(),
            &record(),
            None,
            &["$ parted -s /dev/sdx mklabel msdos".to_string()],
            &[manifest],
        )
        .unwrap();

        assert!(paths.root.starts_with(dir.path().join("reports")));
        let run: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.run_json).unwrap()).unwrap();
        assert_eq!(run["run"]["operation"], "create");
        assert_eq!(run["run_id"], paths.run_id.as_str());
        assert_eq!(
            std::fs::read_to_string(&paths.logs_path).unwrap(),
            "$ parted -s /dev/sdx mklabel msdos\n"
        );
        assert!(paths.device_graph_json.is_none());
        assert_eq!(paths.artifacts, vec![paths.root.join("copy_manifest.json")]);
    }

    #[test]
    fn artifact_names_cannot_escape_the_bundle() {
        let dir = tempdir().unwrap();
        let artifact = ReportArtifact {
            name: "../../evil.txt".to_string(),
            contents: b"x".to_vec(),
        };
        let paths = create_report_bundle(dir.path(), &record(), None, &[], &[artifact]).unwrap();
        assert_eq!(paths.artifacts, vec![paths.root.join("evil.txt")]);
    }
}
