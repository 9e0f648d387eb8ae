//! HTTP surface. Handlers resolve an identity (and required scopes) up
//! front, delegate to the stores and coordinators, and return JSON; every
//! failure path goes through [`ApiError`].

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use mesh_core::ids::{JobId, MachineId};
use mesh_core::job::ExternalModelRef;
use mesh_core::node::NodeStatus;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::rate_limit::rate_limit_layer;
use crate::{unix_now, AppState};

pub const SCOPE_JOB_CREATE: &str = "job:create";
pub const SCOPE_JOB_READ: &str = "job:read";
pub const SCOPE_JOB_UPDATE: &str = "job:update";
pub const SCOPE_ROUND_START: &str = "round:start";
pub const SCOPE_ROUND_PUSH: &str = "round:push";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/healthz", get(healthz))
        .route("/auth/token", post(issue_token))
        .route("/job", post(create_job))
        .route("/job/{id}/model", get(job_model))
        .route("/job/{id}/status", get(job_status))
        .route("/job/{id}/external", get(job_external))
        .route("/job/{id}/update", post(job_update))
        .route("/cluster/{job_id}", get(cluster_nodes))
        .route("/cluster/assign", post(cluster_assign))
        .route("/cluster/rent_and_assign", post(cluster_rent_and_assign))
        .route("/cluster/provision", post(cluster_provision))
        .route("/round/{id}/start", post(round_start))
        .route("/round/{id}/push_hf", post(round_push))
        .route("/round/{id}/start_flower", post(round_start_flower))
        .route("/provider/register", post(provider_register))
        .route("/provider/", get(provider_list))
        .route("/nodes/ping", post(node_ping))
        .route("/nodes/", get(node_list))
        .route("/nodes/{id}/logs", get(node_logs))
        .route("/nodes/{id}/control", post(node_control))
        .route("/ws/nodes", get(crate::ws::nodes_stream))
        .route("/ws/nodes/{id}/logs", get(crate::ws::node_log_stream))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_layer,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::request_context,
        ))
        .with_state(state)
}

async fn service_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let contracts = state
        .chain
        .as_ref()
        .map(|c| c.configured_contracts())
        .unwrap_or_default();
    Json(json!({
        "service": "mesh-orchestrator",
        "version": env!("CARGO_PKG_VERSION"),
        "contracts": contracts,
    }))
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct TokenRequest {
    subject: String,
    #[serde(default)]
    scopes: Vec<String>,
}

async fn issue_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TokenRequest>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authorize_issue(&headers)?;
    if body.subject.is_empty() {
        return Err(ApiError::Validation("subject must be non-empty".into()));
    }
    let (token, expires_in) = state
        .auth
        .issue_token(&body.subject, body.scopes, unix_now())?;
    Ok(Json(json!({
        "access_token": token,
        "token_type": "bearer",
        "expires_in": expires_in,
    })))
}

#[derive(Deserialize)]
struct ExternalModelRequest {
    model_id: Option<String>,
    dataset_id: Option<String>,
    credential: Option<String>,
    #[serde(default)]
    private: bool,
}

#[derive(Deserialize)]
struct CreateJobRequest {
    #[serde(default = "default_arch")]
    model_arch: String,
    #[serde(default)]
    reward_pool: f64,
    initial_weights: Option<Vec<Vec<f32>>>,
    external: Option<ExternalModelRequest>,
}

fn default_arch() -> String {
    "default".to_string()
}

async fn create_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateJobRequest>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authenticate(&headers, &[SCOPE_JOB_CREATE])?;
    if body.reward_pool < 0.0 {
        return Err(ApiError::Validation("reward_pool must be non-negative".into()));
    }
    let external = body.external.map(|e| ExternalModelRef {
        model_id: e.model_id,
        dataset_id: e.dataset_id,
        // Stored opaque; decryption happens on worker nodes only.
        credential_enc: e.credential.map(String::into_bytes),
        private: e.private,
    });
    let job = state.jobs.create(
        body.model_arch,
        body.reward_pool,
        body.initial_weights,
        external,
        unix_now(),
    );
    tracing::info!(job_id = job.id.0, "job created");
    Ok(Json(json!({
        "job_id": job.id.0,
        "status": job.status,
        "reward_pool": job.reward_pool,
    })))
}

async fn job_model(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authenticate(&headers, &[SCOPE_JOB_READ])?;
    let artifact = state
        .jobs
        .artifact(JobId(id))
        .ok_or_else(|| ApiError::NotFound(format!("no model for job {id}")))?;
    Ok(Json(json!({
        "job_id": id,
        "weights": artifact.weights,
        "updated_at": artifact.updated_at,
    })))
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authenticate(&headers, &[SCOPE_JOB_READ])?;
    let job = state
        .jobs
        .get(JobId(id))
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))?;
    Ok(Json(json!({
        "job_id": id,
        "status": job.status,
        "model_arch": job.model_arch,
        "reward_pool": job.reward_pool,
        "updates": state.jobs.update_count(JobId(id)),
        "latest_accuracy": state.jobs.latest_accuracy(JobId(id)),
        "nodes": state.cluster.assigned(JobId(id)).len(),
        "has_model": state.jobs.artifact(JobId(id)).is_some(),
        "aggregator_active": state.aggregators.is_running(JobId(id)),
    })))
}

async fn job_external(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authenticate(&headers, &[SCOPE_JOB_READ])?;
    let job = state
        .jobs
        .get(JobId(id))
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))?;
    let external = job
        .external
        .ok_or_else(|| ApiError::NotFound(format!("job {id} has no external model")))?;
    Ok(Json(json!({
        "job_id": id,
        "model_id": external.model_id,
        "dataset_id": external.dataset_id,
        "private": external.private,
        "has_credential": external.credential_enc.is_some(),
    })))
}

#[derive(Deserialize)]
struct UpdateRequest {
    weights: Option<Vec<Vec<f32>>>,
    val_accuracy: f32,
    contributor: Option<String>,
}

async fn job_update(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<UpdateRequest>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authenticate(&headers, &[SCOPE_JOB_UPDATE])?;
    if !state.jobs.contains(JobId(id)) {
        return Err(ApiError::NotFound(format!("job {id} not found")));
    }
    let updates = state.jobs.record_update(
        JobId(id),
        body.weights,
        body.val_accuracy,
        body.contributor,
        unix_now(),
    )?;
    Ok(Json(json!({
        "job_id": id,
        "updates": updates,
        "aggregated": state.jobs.artifact(JobId(id)).is_some(),
    })))
}

async fn cluster_nodes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(job_id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authenticate(&headers, &[SCOPE_JOB_READ])?;
    let nodes = state.cluster.assigned(JobId(job_id));
    Ok(Json(json!({ "job_id": job_id, "nodes": nodes })))
}

#[derive(Deserialize)]
struct AssignRequest {
    job_id: u64,
    machine_ids: Vec<u64>,
    renter: Option<String>,
}

async fn cluster_assign(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AssignRequest>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authenticate(&headers, &[SCOPE_JOB_UPDATE])?;
    let job_id = JobId(body.job_id);
    if !state.jobs.contains(job_id) {
        return Err(ApiError::NotFound(format!("job {} not found", body.job_id)));
    }
    let machine_ids: Vec<MachineId> = body.machine_ids.into_iter().map(MachineId).collect();
    let assigned = state
        .cluster
        .assign(
            &state.registry,
            job_id,
            &machine_ids,
            body.renter.as_deref(),
            unix_now(),
        )
        .await?;
    Ok(Json(json!({ "job_id": body.job_id, "assigned": assigned })))
}

#[derive(Deserialize)]
struct RentAssignRequest {
    job_id: u64,
    machine_ids: Vec<u64>,
    hours: u64,
    private_key: String,
}

async fn cluster_rent_and_assign(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RentAssignRequest>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authenticate(&headers, &[SCOPE_JOB_UPDATE])?;
    let job_id = JobId(body.job_id);
    if !state.jobs.contains(job_id) {
        return Err(ApiError::NotFound(format!("job {} not found", body.job_id)));
    }
    let machine_ids: Vec<MachineId> = body.machine_ids.into_iter().map(MachineId).collect();
    let report = state
        .cluster
        .rent_and_assign(
            &state.registry,
            job_id,
            machine_ids,
            body.hours,
            &body.private_key,
            unix_now(),
        )
        .await?;
    Ok(Json(serde_json::to_value(report).map_err(|e| {
        ApiError::Internal(format!("response encoding: {e}"))
    })?))
}

#[derive(Deserialize)]
struct ProvisionRequest {
    job_id: u64,
    hosts: Vec<String>,
    ssh_user: Option<String>,
    image: String,
    #[serde(default = "default_worker_port")]
    port: u16,
    #[serde(default)]
    env: Vec<(String, String)>,
}

fn default_worker_port() -> u16 {
    9000
}

async fn cluster_provision(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ProvisionRequest>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authenticate(&headers, &[SCOPE_JOB_UPDATE])?;
    let job_id = JobId(body.job_id);
    if !state.jobs.contains(job_id) {
        return Err(ApiError::NotFound(format!("job {} not found", body.job_id)));
    }
    let report = state
        .cluster
        .provision(
            job_id,
            &body.hosts,
            body.ssh_user.as_deref(),
            &body.image,
            body.port,
            &body.env,
            unix_now(),
        )
        .await?;
    Ok(Json(serde_json::to_value(report).map_err(|e| {
        ApiError::Internal(format!("response encoding: {e}"))
    })?))
}

#[derive(Deserialize, Default)]
struct RoundStartRequest {
    #[serde(default = "default_steps")]
    steps: u32,
}

fn default_steps() -> u32 {
    1
}

async fn round_start(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    body: Option<Json<RoundStartRequest>>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authenticate(&headers, &[SCOPE_ROUND_START])?;
    let job_id = JobId(id);
    if !state.jobs.contains(job_id) {
        return Err(ApiError::NotFound(format!("job {id} not found")));
    }
    let steps = body.map(|Json(b)| b.steps).unwrap_or_else(default_steps);
    let nodes = state.cluster.assigned(job_id);
    let results = state
        .rounds
        .start_round(&state.jobs, job_id, &nodes, steps)
        .await?;
    Ok(Json(json!({ "job_id": id, "results": results })))
}

async fn round_push(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authenticate(&headers, &[SCOPE_ROUND_PUSH])?;
    let job_id = JobId(id);
    if !state.jobs.contains(job_id) {
        return Err(ApiError::NotFound(format!("job {id} not found")));
    }
    let nodes = state.cluster.assigned(job_id);
    let results = state.rounds.push_external(job_id, &nodes).await?;
    Ok(Json(json!({ "job_id": id, "results": results })))
}

#[derive(Deserialize, Default)]
struct FlowerStartRequest {
    host: Option<String>,
    port: Option<u16>,
    rounds: Option<u32>,
}

async fn round_start_flower(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    body: Option<Json<FlowerStartRequest>>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authenticate(&headers, &[SCOPE_ROUND_START])?;
    let job_id = JobId(id);
    if !state.jobs.contains(job_id) {
        return Err(ApiError::NotFound(format!("job {id} not found")));
    }
    let nodes = state.cluster.assigned(job_id);
    if nodes.is_empty() {
        return Err(ApiError::Validation(format!("job {id} has no assigned nodes")));
    }
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let host = body.host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = body.port.unwrap_or(8089);
    let rounds = body.rounds.unwrap_or(3);

    let server_address = state.aggregators.start(job_id, &host, port, rounds)?;
    state.jobs.set_status(job_id, mesh_core::job::JobStatus::Running);
    let results = state
        .rounds
        .start_clients(job_id, &nodes, &server_address)
        .await?;
    Ok(Json(json!({
        "job_id": id,
        "server_address": server_address,
        "results": results,
    })))
}

#[derive(Deserialize)]
struct RegisterRequest {
    machine_id: u64,
    provider_address: String,
    #[serde(default)]
    specs: String,
    endpoint: Option<String>,
}

async fn provider_register(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authenticate(&headers, &[])?;
    if body.provider_address.is_empty() {
        return Err(ApiError::Validation("provider_address must be non-empty".into()));
    }
    state.registry.register(
        MachineId(body.machine_id),
        body.provider_address,
        body.specs,
        body.endpoint,
        unix_now(),
    );
    Ok(Json(json!({ "machine_id": body.machine_id, "registered": true })))
}

#[derive(Deserialize, Default)]
struct ProviderQuery {
    address: Option<String>,
}

async fn provider_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authenticate(&headers, &[])?;
    let mut views = state.registry.views(query.address.as_deref(), unix_now());
    // Best-effort marketplace metadata; a chain hiccup must not hide nodes.
    if let Some(chain) = &state.chain {
        for view in &mut views {
            match chain.machine_listing(view.machine_id.0).await {
                Ok(listing) => {
                    view.price_per_hour_wei = Some(listing.price_per_hour.to_string());
                    view.listed = listing.listed;
                }
                Err(e) => {
                    tracing::debug!(machine_id = view.machine_id.0, error = %e, "listing lookup failed")
                }
            }
        }
    }
    Ok(Json(json!({ "machines": views })))
}

#[derive(Deserialize)]
struct PingRequest {
    machine_id: u64,
    provider_address: Option<String>,
    endpoint: Option<String>,
    status: Option<NodeStatus>,
    metrics: Option<Value>,
}

async fn node_ping(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PingRequest>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authenticate(&headers, &[])?;
    state.registry.heartbeat(
        MachineId(body.machine_id),
        body.provider_address,
        body.endpoint,
        body.status,
        body.metrics,
        unix_now(),
    );
    Ok(Json(json!({ "machine_id": body.machine_id, "ok": true })))
}

async fn node_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state.auth.authenticate(&headers, &[])?;
    Ok(Json(json!({ "nodes": state.registry.realtime_views(unix_now()) })))
}

/// Proxy the worker's own log surface; the orchestrator holds heartbeat
/// history, not worker process logs.
async fn node_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authenticate(&headers, &[])?;
    let machine = state
        .registry
        .get(MachineId(id))
        .ok_or_else(|| ApiError::NotFound(format!("machine {id} not found")))?;
    let endpoint = machine
        .endpoint
        .filter(|e| !e.is_empty())
        .ok_or_else(|| ApiError::Validation(format!("machine {id} has no endpoint")))?;

    let url = format!("http://{endpoint}/logs");
    let response = state
        .http
        .get(&url)
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| ApiError::AllNodesFailed {
            message: format!("machine {id} log fetch failed"),
            results: vec![crate::rounds::DispatchResult {
                endpoint: endpoint.clone(),
                status: None,
                ok: false,
                body: None,
                error: Some(e.to_string()),
            }],
        })?;
    let logs = response
        .json::<Value>()
        .await
        .unwrap_or_else(|_| json!({ "raw": "unparseable log payload" }));
    Ok(Json(json!({ "machine_id": id, "logs": logs })))
}

#[derive(Deserialize)]
struct ControlRequest {
    command: String,
}

async fn node_control(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<ControlRequest>,
) -> Result<Json<Value>, ApiError> {
    state.auth.authenticate(&headers, &[SCOPE_JOB_UPDATE])?;
    let machine = state
        .registry
        .get(MachineId(id))
        .ok_or_else(|| ApiError::NotFound(format!("machine {id} not found")))?;
    let endpoint = machine
        .endpoint
        .filter(|e| !e.is_empty())
        .ok_or_else(|| ApiError::Validation(format!("machine {id} has no endpoint")))?;

    let result = state
        .rounds
        .control(&endpoint, &json!({ "command": body.command }))
        .await;
    if !result.ok {
        return Err(ApiError::AllNodesFailed {
            message: format!("control command failed on machine {id}"),
            results: vec![result],
        });
    }
    Ok(Json(json!({ "machine_id": id, "result": result })))
}
