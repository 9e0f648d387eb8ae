//! Crash-recovery snapshots. The whole store is serialized to JSON and
//! written atomically (temp file, then rename); counters and rate-limit
//! windows are deliberately not persisted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use mesh_core::job::{Job, ModelArtifact};
use mesh_core::node::{ClusterNode, ProviderMachine};
use serde::{Deserialize, Serialize};

use crate::AppState;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub jobs: Vec<Job>,
    pub artifacts: Vec<ModelArtifact>,
    pub machines: Vec<ProviderMachine>,
    pub assignments: Vec<ClusterNode>,
}

pub fn capture(state: &AppState) -> Snapshot {
    let (jobs, artifacts) = state.jobs.snapshot();
    Snapshot {
        jobs,
        artifacts,
        machines: state.registry.list(),
        assignments: state.cluster.snapshot(),
    }
}

pub fn restore(state: &AppState, snapshot: Snapshot) {
    state.jobs.restore(snapshot.jobs, snapshot.artifacts);
    state.registry.restore(snapshot.machines);
    state.cluster.restore(snapshot.assignments);
}

pub fn save(path: &Path, snapshot: &Snapshot) -> Result<(), PersistError> {
    let encoded = serde_json::to_vec(snapshot)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, encoded)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Missing file is a clean first start, not an error.
pub fn load(path: &Path) -> Result<Option<Snapshot>, PersistError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Periodic snapshot writer; failures are logged and retried next tick.
pub fn spawn_snapshot_task(state: Arc<AppState>, path: PathBuf) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.snapshot_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let snapshot = capture(&state);
            if let Err(e) = save(&path, &snapshot) {
                tracing::warn!(path = %path.display(), error = %e, "snapshot write failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::ids::JobId;
    use mesh_core::job::JobStatus;

    fn job(id: u64) -> Job {
        Job {
            id: JobId(id),
            model_arch: "mlp".into(),
            status: JobStatus::Created,
            reward_pool: 1.5,
            created_at: 0,
            external: None,
        }
    }

    #[test]
    fn snapshot_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("mesh-snap-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");

        let snapshot = Snapshot {
            jobs: vec![job(1), job(2)],
            ..Snapshot::default()
        };
        save(&path, &snapshot).unwrap();
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.jobs.len(), 2);
        assert_eq!(loaded.jobs[0].id, JobId(1));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_snapshot_is_a_clean_start() {
        let path = Path::new("/nonexistent/mesh-state.json");
        assert!(load(path).unwrap().is_none());
    }
}
