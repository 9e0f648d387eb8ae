use serde::{Deserialize, Serialize};

use crate::ids::JobId;

/// A set of flattened weight tensors, one inner vector per tensor.
pub type TensorSet = Vec<Vec<f32>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Failed,
}

/// Reference to a model hosted on an external collaborator. The credential
/// blob is stored opaque; the orchestrator never decrypts it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalModelRef {
    pub model_id: Option<String>,
    pub dataset_id: Option<String>,
    pub credential_enc: Option<Vec<u8>>,
    pub private: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub model_arch: String,
    pub status: JobStatus,
    /// Reward pool in payment-token units (decimal, not base units).
    pub reward_pool: f64,
    pub created_at: u64,
    pub external: Option<ExternalModelRef>,
}

/// One training contribution. Immutable once recorded; weights are absent
/// for jobs whose training happens entirely on an external collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub job_id: JobId,
    pub weights: Option<TensorSet>,
    pub val_accuracy: f32,
    pub contributor: Option<String>,
    pub created_at: u64,
}

/// Current aggregated weights for a job. At most one per job, upserted by
/// aggregation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub job_id: JobId,
    pub weights: TensorSet,
    pub updated_at: u64,
}
