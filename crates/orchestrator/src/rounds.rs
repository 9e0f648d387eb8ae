//! Round dispatch: fan training and publish tasks out to a job's assigned
//! worker endpoints and reduce the per-endpoint outcomes. One endpoint's
//! failure never hides the results of the others.

use std::time::Duration;

use futures::future::join_all;
use mesh_core::ids::JobId;
use mesh_core::job::JobStatus;
use mesh_core::node::ClusterNode;
use serde::Serialize;
use serde_json::json;

use crate::error::ApiError;
use crate::jobs::JobStore;

const TRAIN_TIMEOUT: Duration = Duration::from_secs(120);
const PUSH_TIMEOUT: Duration = Duration::from_secs(60);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one worker call: HTTP status and body on an answer, transport
/// error text otherwise.
#[derive(Clone, Debug, Serialize)]
pub struct DispatchResult {
    pub endpoint: String,
    pub status: Option<u16>,
    pub ok: bool,
    pub body: Option<serde_json::Value>,
    pub error: Option<String>,
}

pub struct RoundCoordinator {
    http: reqwest::Client,
    control_key: Option<String>,
}

impl RoundCoordinator {
    pub fn new(http: reqwest::Client, control_key: Option<String>) -> Self {
        Self { http, control_key }
    }

    async fn call_worker(
        &self,
        endpoint: &str,
        path: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> DispatchResult {
        let url = format!("http://{endpoint}{path}");
        let mut request = self.http.post(&url).json(body).timeout(timeout);
        if let Some(key) = &self.control_key {
            request = request.header("x-api-key", key);
        }
        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let ok = response.status().is_success();
                let body = response.json::<serde_json::Value>().await.ok();
                DispatchResult {
                    endpoint: endpoint.to_string(),
                    status: Some(status),
                    ok,
                    body,
                    error: None,
                }
            }
            Err(e) => DispatchResult {
                endpoint: endpoint.to_string(),
                status: None,
                ok: false,
                body: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Dispatch a training round to every assigned node concurrently. The
    /// job is marked running up front; the round fails only when no node at
    /// all accepts the task.
    pub async fn start_round(
        &self,
        jobs: &JobStore,
        job_id: JobId,
        nodes: &[ClusterNode],
        steps: u32,
    ) -> Result<Vec<DispatchResult>, ApiError> {
        if nodes.is_empty() {
            return Err(ApiError::Validation(format!(
                "job {} has no assigned nodes",
                job_id.0
            )));
        }
        jobs.set_status(job_id, JobStatus::Running);

        let body = json!({ "job_id": job_id.0, "steps": steps });
        let calls = nodes
            .iter()
            .map(|n| self.call_worker(&n.endpoint, "/task/train", &body, TRAIN_TIMEOUT));
        let results = join_all(calls).await;

        let succeeded = results.iter().filter(|r| r.ok).count();
        tracing::info!(
            job_id = job_id.0,
            nodes = nodes.len(),
            succeeded,
            "round dispatched"
        );
        if succeeded == 0 {
            return Err(ApiError::AllNodesFailed {
                message: format!("all {} nodes failed to start the round", nodes.len()),
                results,
            });
        }
        Ok(results)
    }

    /// Ask nodes to publish the current model to the external collaborator,
    /// one at a time, stopping at the first success. Publishing is
    /// idempotent on the remote side but redundant pushes waste quota.
    pub async fn push_external(
        &self,
        job_id: JobId,
        nodes: &[ClusterNode],
    ) -> Result<Vec<DispatchResult>, ApiError> {
        if nodes.is_empty() {
            return Err(ApiError::Validation(format!(
                "job {} has no assigned nodes",
                job_id.0
            )));
        }

        let body = json!({ "job_id": job_id.0 });
        let mut results = Vec::new();
        for node in nodes {
            let result = self
                .call_worker(&node.endpoint, "/task/push_hf", &body, PUSH_TIMEOUT)
                .await;
            let ok = result.ok;
            results.push(result);
            if ok {
                return Ok(results);
            }
        }
        Err(ApiError::AllNodesFailed {
            message: format!("all {} nodes failed to publish", nodes.len()),
            results,
        })
    }

    /// Tell each node to launch an aggregation-framework client dialing
    /// `server_address`. Same collect semantics as a training round.
    pub async fn start_clients(
        &self,
        job_id: JobId,
        nodes: &[ClusterNode],
        server_address: &str,
    ) -> Result<Vec<DispatchResult>, ApiError> {
        if nodes.is_empty() {
            return Err(ApiError::Validation(format!(
                "job {} has no assigned nodes",
                job_id.0
            )));
        }

        let body = json!({ "job_id": job_id.0, "server_address": server_address });
        let calls = nodes
            .iter()
            .map(|n| self.call_worker(&n.endpoint, "/task/flower_client", &body, CONTROL_TIMEOUT));
        let results = join_all(calls).await;

        if results.iter().all(|r| !r.ok) {
            return Err(ApiError::AllNodesFailed {
                message: format!("all {} nodes failed to start clients", nodes.len()),
                results,
            });
        }
        Ok(results)
    }

    /// Forward an operator control command to a single worker endpoint.
    pub async fn control(&self, endpoint: &str, body: &serde_json::Value) -> DispatchResult {
        self.call_worker(endpoint, "/control", body, CONTROL_TIMEOUT)
            .await
    }

    /// Direct dispatch used by event-driven automation; failures are logged
    /// and swallowed, never propagated into the poll loop.
    pub async fn dispatch_train(&self, job_id: JobId, nodes: &[ClusterNode], steps: u32) {
        let body = json!({ "job_id": job_id.0, "steps": steps });
        for node in nodes {
            let result = self
                .call_worker(&node.endpoint, "/task/train", &body, TRAIN_TIMEOUT)
                .await;
            if !result.ok {
                tracing::warn!(
                    job_id = job_id.0,
                    endpoint = %node.endpoint,
                    error = result.error.as_deref().unwrap_or("http error"),
                    "auto round dispatch failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(endpoint: &str) -> ClusterNode {
        ClusterNode {
            job_id: JobId(1),
            machine_id: Some(mesh_core::ids::MachineId(1)),
            endpoint: endpoint.to_string(),
            created_at: 0,
        }
    }

    fn coordinator() -> RoundCoordinator {
        RoundCoordinator::new(reqwest::Client::new(), None)
    }

    #[tokio::test]
    async fn round_without_nodes_is_a_validation_error() {
        let jobs = JobStore::new();
        let err = coordinator().start_round(&jobs, JobId(1), &[], 1).await;
        assert!(matches!(err, Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn unreachable_nodes_yield_all_failed_with_per_node_results() {
        let jobs = JobStore::new();
        let job = jobs.create("mlp".into(), 0.0, None, None, 0);
        // Nothing listens on these ports; both dispatches fail on transport.
        let nodes = vec![node("127.0.0.1:1"), node("127.0.0.1:2")];

        let err = coordinator().start_round(&jobs, job.id, &nodes, 3).await;
        match err {
            Err(ApiError::AllNodesFailed { results, .. }) => {
                assert_eq!(results.len(), 2);
                assert!(results.iter().all(|r| !r.ok && r.error.is_some()));
            }
            other => panic!("expected AllNodesFailed, got {other:?}"),
        }
        // The job was still marked running before dispatch.
        assert_eq!(jobs.get(job.id).unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn push_stops_at_first_success() {
        use axum::{routing::post, Router};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/task/push_hf",
            post(|| async { axum::Json(serde_json::json!({"pushed": true})) }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let nodes = vec![
            node("127.0.0.1:1"),
            node(&addr.to_string()),
            node("127.0.0.1:2"),
        ];
        let results = coordinator().push_external(JobId(1), &nodes).await.unwrap();
        // First node fails, second succeeds, third is never contacted.
        assert_eq!(results.len(), 2);
        assert!(!results[0].ok);
        assert!(results[1].ok);
    }
}
