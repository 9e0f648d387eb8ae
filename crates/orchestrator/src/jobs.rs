//! Job store: lifecycle state, contributed updates, and the aggregated
//! model artifact per job. Aggregation runs synchronously on every recorded
//! update so the artifact is never behind the update log.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use mesh_core::fedavg::{fedavg, FedAvgError};
use mesh_core::ids::JobId;
use mesh_core::job::{ExternalModelRef, Job, JobStatus, ModelArtifact, TensorSet, Update};

#[derive(Default)]
pub struct JobStore {
    jobs: DashMap<JobId, Job>,
    updates: DashMap<JobId, Vec<Update>>,
    artifacts: DashMap<JobId, ModelArtifact>,
    next_id: AtomicU64,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Self::default()
        }
    }

    /// Create a job. Initial weights, when given, seed the artifact; they
    /// are not an update and stop counting once real updates arrive.
    pub fn create(
        &self,
        model_arch: String,
        reward_pool: f64,
        initial_weights: Option<TensorSet>,
        external: Option<ExternalModelRef>,
        now: u64,
    ) -> Job {
        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let job = Job {
            id,
            model_arch,
            status: JobStatus::Created,
            reward_pool,
            created_at: now,
            external,
        };
        self.jobs.insert(id, job.clone());
        if let Some(weights) = initial_weights {
            self.artifacts.insert(
                id,
                ModelArtifact {
                    job_id: id,
                    weights,
                    updated_at: now,
                },
            );
        }
        job
    }

    /// Materialize a job first seen as a chain event. Idempotent: an
    /// existing job keeps its state, except that a zero reward pool is
    /// backfilled from the event.
    pub fn materialize_from_chain(&self, id: JobId, reward_pool: f64, now: u64) -> Job {
        let mut entry = self.jobs.entry(id).or_insert_with(|| Job {
            id,
            model_arch: "default".into(),
            status: JobStatus::Created,
            reward_pool,
            created_at: now,
            external: None,
        });
        if entry.reward_pool == 0.0 && reward_pool > 0.0 {
            entry.reward_pool = reward_pool;
        }
        self.bump_next_id(id);
        entry.clone()
    }

    fn bump_next_id(&self, id: JobId) {
        // Locally created ids must never collide with chain-assigned ones.
        let mut current = self.next_id.load(Ordering::SeqCst);
        while current <= id.0 {
            match self.next_id.compare_exchange(
                current,
                id.0 + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.get(&id).map(|j| j.clone())
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    pub fn set_status(&self, id: JobId, status: JobStatus) -> bool {
        match self.jobs.get_mut(&id) {
            Some(mut job) => {
                job.status = status;
                true
            }
            None => false,
        }
    }

    /// Record a contribution and re-aggregate. The artifact becomes the
    /// mean of every non-null weight set submitted so far; a shape mismatch
    /// rejects the update without touching stored state.
    pub fn record_update(
        &self,
        id: JobId,
        weights: Option<TensorSet>,
        val_accuracy: f32,
        contributor: Option<String>,
        now: u64,
    ) -> Result<usize, FedAvgError> {
        let mut log = self.updates.entry(id).or_default();

        if let Some(incoming) = &weights {
            let mut sets: Vec<TensorSet> = log
                .iter()
                .filter_map(|u| u.weights.clone())
                .collect();
            sets.push(incoming.clone());
            let merged = fedavg(&sets)?;
            self.artifacts.insert(
                id,
                ModelArtifact {
                    job_id: id,
                    weights: merged,
                    updated_at: now,
                },
            );
        }

        log.push(Update {
            job_id: id,
            weights,
            val_accuracy,
            contributor,
            created_at: now,
        });
        Ok(log.len())
    }

    pub fn artifact(&self, id: JobId) -> Option<ModelArtifact> {
        self.artifacts.get(&id).map(|a| a.clone())
    }

    pub fn update_count(&self, id: JobId) -> usize {
        self.updates.get(&id).map(|u| u.len()).unwrap_or(0)
    }

    pub fn latest_accuracy(&self, id: JobId) -> Option<f32> {
        self.updates
            .get(&id)
            .and_then(|u| u.last().map(|u| u.val_accuracy))
    }

    pub fn snapshot(&self) -> (Vec<Job>, Vec<ModelArtifact>) {
        (
            self.jobs.iter().map(|j| j.clone()).collect(),
            self.artifacts.iter().map(|a| a.clone()).collect(),
        )
    }

    pub fn restore(&self, jobs: Vec<Job>, artifacts: Vec<ModelArtifact>) {
        for job in jobs {
            self.bump_next_id(job.id);
            self.jobs.insert(job.id, job);
        }
        for artifact in artifacts {
            self.artifacts.insert(artifact.job_id, artifact);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_assigns_sequential_ids() {
        let store = JobStore::new();
        let a = store.create("mlp".into(), 10.0, None, None, 0);
        let b = store.create("mlp".into(), 10.0, None, None, 0);
        assert_eq!(a.id, JobId(1));
        assert_eq!(b.id, JobId(2));
        assert_eq!(a.status, JobStatus::Created);
    }

    #[test]
    fn materialize_is_idempotent_and_backfills_zero_reward() {
        let store = JobStore::new();
        let first = store.materialize_from_chain(JobId(7), 0.0, 10);
        assert_eq!(first.reward_pool, 0.0);

        store.set_status(JobId(7), JobStatus::Running);
        let again = store.materialize_from_chain(JobId(7), 125.5, 20);
        assert_eq!(again.reward_pool, 125.5);
        assert_eq!(again.status, JobStatus::Running);
        assert_eq!(again.created_at, 10);

        // A funded job is not overwritten by a later event.
        let third = store.materialize_from_chain(JobId(7), 999.0, 30);
        assert_eq!(third.reward_pool, 125.5);
    }

    #[test]
    fn materialized_chain_id_does_not_collide_with_local_creation() {
        let store = JobStore::new();
        store.materialize_from_chain(JobId(5), 1.0, 0);
        let local = store.create("mlp".into(), 0.0, None, None, 0);
        assert_eq!(local.id, JobId(6));
    }

    #[test]
    fn first_update_becomes_the_artifact() {
        let store = JobStore::new();
        let job = store.create("mlp".into(), 0.0, None, None, 0);
        store
            .record_update(job.id, Some(vec![vec![2.0, 4.0]]), 0.5, None, 1)
            .unwrap();
        assert_eq!(store.artifact(job.id).unwrap().weights, vec![vec![2.0, 4.0]]);
    }

    #[test]
    fn initial_weights_seed_the_artifact_but_are_not_an_update() {
        let store = JobStore::new();
        let job = store.create(
            "mlp".into(),
            0.0,
            Some(vec![vec![0.0, 0.0]]),
            None,
            0,
        );
        assert_eq!(store.artifact(job.id).unwrap().weights, vec![vec![0.0, 0.0]]);
        assert_eq!(store.update_count(job.id), 0);

        // The seed does not drag down the mean of real contributions.
        store
            .record_update(job.id, Some(vec![vec![1.0, 1.0]]), 0.5, None, 1)
            .unwrap();
        store
            .record_update(job.id, Some(vec![vec![3.0, 3.0]]), 0.6, None, 2)
            .unwrap();
        assert_eq!(store.artifact(job.id).unwrap().weights, vec![vec![2.0, 2.0]]);
    }

    #[test]
    fn artifact_is_the_mean_of_all_recorded_updates() {
        let store = JobStore::new();
        let job = store.create("mlp".into(), 0.0, None, None, 0);
        for w in [0.0_f32, 3.0, 6.0] {
            store
                .record_update(job.id, Some(vec![vec![w]]), 0.5, None, 1)
                .unwrap();
        }
        // (0 + 3 + 6) / 3, not a pairwise fold.
        assert_eq!(store.artifact(job.id).unwrap().weights, vec![vec![3.0]]);
    }

    #[test]
    fn second_update_averages_with_current_artifact() {
        let store = JobStore::new();
        let job = store.create("mlp".into(), 0.0, None, None, 0);
        store
            .record_update(job.id, Some(vec![vec![2.0, 4.0]]), 0.5, None, 1)
            .unwrap();
        store
            .record_update(job.id, Some(vec![vec![4.0, 8.0]]), 0.6, None, 2)
            .unwrap();
        assert_eq!(store.artifact(job.id).unwrap().weights, vec![vec![3.0, 6.0]]);
        assert_eq!(store.update_count(job.id), 2);
        assert_eq!(store.latest_accuracy(job.id), Some(0.6));
    }

    #[test]
    fn mismatched_update_leaves_artifact_and_log_untouched() {
        let store = JobStore::new();
        let job = store.create("mlp".into(), 0.0, None, None, 0);
        store
            .record_update(job.id, Some(vec![vec![2.0, 4.0]]), 0.5, None, 1)
            .unwrap();
        let err = store.record_update(job.id, Some(vec![vec![1.0]]), 0.9, None, 2);
        assert!(err.is_err());
        assert_eq!(store.artifact(job.id).unwrap().weights, vec![vec![2.0, 4.0]]);
        assert_eq!(store.update_count(job.id), 1);
    }

    #[test]
    fn weightless_update_is_logged_without_an_artifact() {
        let store = JobStore::new();
        let job = store.create("mlp".into(), 0.0, None, None, 0);
        store
            .record_update(job.id, None, 0.7, Some("hf".into()), 1)
            .unwrap();
        assert!(store.artifact(job.id).is_none());
        assert_eq!(store.update_count(job.id), 1);
    }

    #[test]
    fn restore_preserves_id_sequence() {
        let store = JobStore::new();
        let donor = JobStore::new();
        let job = donor.create("mlp".into(), 3.0, None, None, 0);
        let (jobs, artifacts) = donor.snapshot();

        store.restore(jobs, artifacts);
        assert_eq!(store.get(job.id).unwrap().model_arch, "mlp");
        let next = store.create("cnn".into(), 0.0, None, None, 0);
        assert_eq!(next.id, JobId(2));
    }
}
