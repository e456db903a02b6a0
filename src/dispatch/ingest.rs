//! Post-exit ingestion: artifact metadata and the telemetry sidecar.
//!
//! Workers write files under `<artifact_root>/run_<run_id>/`. After each
//! job exits, the dispatcher records metadata rows for new files and parses
//! the well-known telemetry sidecar for per-model token counts. File
//! content never enters the store.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::ArtifactKind;
use crate::store::NewArtifact;

/// Well-known counters file a worker may leave in its run directory.
pub const TELEMETRY_SIDECAR: &str = "telemetry.json";

/// Per-run artifact directory.
pub fn run_dir(artifact_root: &Path, run_id: Uuid) -> PathBuf {
    artifact_root.join(format!("run_{}", run_id))
}

/// Token counters for one model, as reported by the worker.
/// Counts only; the sidecar schema has no field for message content.
#[derive(Debug, Clone, Deserialize)]
pub struct SidecarLlmCall {
    pub model_id: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub error_kind: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetrySidecar {
    #[serde(default)]
    pub llm_calls: Vec<SidecarLlmCall>,
}

/// Parse the telemetry sidecar for a run, if present. A malformed sidecar
/// is logged and treated as absent.
pub async fn read_telemetry(artifact_root: &Path, run_id: Uuid) -> Option<TelemetrySidecar> {
    let path = run_dir(artifact_root, run_id).join(TELEMETRY_SIDECAR);
    let raw = tokio::fs::read(&path).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(sidecar) => Some(sidecar),
        Err(e) => {
            tracing::warn!(run_id = %run_id, error = %e, "ignoring malformed telemetry sidecar");
            None
        }
    }
}

/// Read and then delete the sidecar. Jobs run sequentially and each worker
/// writes its own counters, so consuming the file after every job keeps a
/// multi-job run from double counting.
pub async fn consume_telemetry(artifact_root: &Path, run_id: Uuid) -> Option<TelemetrySidecar> {
    let sidecar = read_telemetry(artifact_root, run_id).await?;
    let path = run_dir(artifact_root, run_id).join(TELEMETRY_SIDECAR);
    if let Err(e) = tokio::fs::remove_file(&path).await {
        tracing::warn!(run_id = %run_id, error = %e, "failed to consume telemetry sidecar");
    }
    Some(sidecar)
}

/// Enumerate files under the run directory as artifact metadata rows.
/// Paths are stored relative to the artifact root. The telemetry sidecar is
/// a control file, not an artifact.
pub async fn collect_artifacts(artifact_root: &Path, run_id: Uuid) -> Vec<NewArtifact> {
    let dir = run_dir(artifact_root, run_id);
    let mut artifacts = Vec::new();
    let mut stack = vec![dir];

    while let Some(current) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&current).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                stack.push(path);
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) == Some(TELEMETRY_SIDECAR) {
                continue;
            }
            let Ok(relative) = path.strip_prefix(artifact_root) else {
                continue;
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            artifacts.push(NewArtifact {
                run_id,
                kind: ArtifactKind::from_path(&relative),
                path: relative.clone(),
                size_bytes: meta.len() as i64,
                mime_type: mime_guess::from_path(&path)
                    .first_or_octet_stream()
                    .to_string(),
            });
        }
    }

    artifacts.sort_by(|a, b| a.path.cmp(&b.path));
    artifacts
}

/// Resolve a stored artifact path against the artifact root, refusing
/// anything that would escape it.
pub fn resolve_artifact_path(
    artifact_root: &Path,
    relative: &str,
) -> Result<PathBuf, OrchestratorError> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(OrchestratorError::validation(
            "artifact path must be relative to the artifact root",
        ));
    }
    for component in candidate.components() {
        match component {
            std::path::Component::Normal(_) => {}
            _ => {
                return Err(OrchestratorError::validation(
                    "artifact path contains forbidden components",
                ))
            }
        }
    }
    Ok(artifact_root.join(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collects_files_with_relative_paths_and_mime() {
        let tmp = tempfile::tempdir().unwrap();
        let run_id = Uuid::new_v4();
        let dir = run_dir(tmp.path(), run_id);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("report.md"), b"# report")
            .await
            .unwrap();
        tokio::fs::write(dir.join("services.json"), b"{}")
            .await
            .unwrap();
        tokio::fs::write(dir.join(TELEMETRY_SIDECAR), b"{\"llm_calls\":[]}")
            .await
            .unwrap();

        let artifacts = collect_artifacts(tmp.path(), run_id).await;
        assert_eq!(artifacts.len(), 2, "sidecar is not an artifact");

        let report = artifacts
            .iter()
            .find(|a| a.path.ends_with("report.md"))
            .unwrap();
        assert_eq!(report.kind, ArtifactKind::Report);
        assert_eq!(report.path, format!("run_{}/report.md", run_id));
        assert_eq!(report.size_bytes, 8);
        assert_eq!(report.mime_type, "text/markdown");

        let json = artifacts
            .iter()
            .find(|a| a.path.ends_with("services.json"))
            .unwrap();
        assert_eq!(json.kind, ArtifactKind::Data);
    }

    #[tokio::test]
    async fn missing_run_dir_yields_no_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let artifacts = collect_artifacts(tmp.path(), Uuid::new_v4()).await;
        assert!(artifacts.is_empty());
    }

    #[tokio::test]
    async fn telemetry_parses_counters_only() {
        let tmp = tempfile::tempdir().unwrap();
        let run_id = Uuid::new_v4();
        let dir = run_dir(tmp.path(), run_id);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join(TELEMETRY_SIDECAR),
            serde_json::json!({
                "llm_calls": [{
                    "model_id": "mistral-7b",
                    "endpoint": "vllm",
                    "prompt_tokens": 150,
                    "completion_tokens": 50,
                    "total_tokens": 200,
                    "duration_ms": 1800
                }]
            })
            .to_string(),
        )
        .await
        .unwrap();

        let sidecar = read_telemetry(tmp.path(), run_id).await.unwrap();
        assert_eq!(sidecar.llm_calls.len(), 1);
        let call = &sidecar.llm_calls[0];
        assert_eq!(call.model_id, "mistral-7b");
        assert_eq!(call.total_tokens, 200);
        assert!(call.success);
    }

    #[tokio::test]
    async fn malformed_telemetry_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let run_id = Uuid::new_v4();
        let dir = run_dir(tmp.path(), run_id);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join(TELEMETRY_SIDECAR), b"not json")
            .await
            .unwrap();
        assert!(read_telemetry(tmp.path(), run_id).await.is_none());
    }

    #[test]
    fn artifact_paths_cannot_escape_the_root() {
        let root = Path::new("/srv/logs");
        assert!(resolve_artifact_path(root, "run_1/report.md").is_ok());
        assert!(resolve_artifact_path(root, "../etc/passwd").is_err());
        assert!(resolve_artifact_path(root, "run_1/../../etc/passwd").is_err());
        assert!(resolve_artifact_path(root, "/etc/passwd").is_err());
    }
}
