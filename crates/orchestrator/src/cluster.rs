//! Cluster management: job→endpoint assignments, on-chain rental
//! validation, the guarded rent-and-assign flow, and remote provisioning of
//! worker containers.
//!
//! Assignment is all-or-nothing per job: rows are built and validated in
//! full before the job's prior set is replaced in a single map write.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use chain_client::{confirmed_rentals, ChainClient, ChainError, RentalOutcome};
use dashmap::DashMap;
use mesh_core::ids::{JobId, MachineId};
use mesh_core::node::ClusterNode;
use serde::Serialize;

use crate::error::ApiError;
use crate::registry::NodeRegistry;
use crate::remote::RemoteExec;

const HEALTH_POLL_ATTEMPTS: u32 = 5;
const HEALTH_POLL_BACKOFF: Duration = Duration::from_millis(800);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

pub const MIN_RENT_HOURS: u64 = 1;
pub const MAX_RENT_HOURS: u64 = 720;

#[derive(Clone, Debug, Serialize)]
pub struct ProvisionHostResult {
    pub host: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProvisionReport {
    pub results: Vec<ProvisionHostResult>,
    pub healthy_endpoints: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RentReport {
    pub renter: String,
    pub total_cost: String,
    pub approve_tx: Option<String>,
    pub rent_txs: Vec<String>,
    pub assigned: Vec<ClusterNode>,
}

pub struct ClusterManager {
    nodes: DashMap<JobId, Vec<ClusterNode>>,
    chain: Option<Arc<ChainClient>>,
    remote: Arc<dyn RemoteExec>,
    http: reqwest::Client,
    allow_insecure_rent: bool,
    worker_api_key: Option<String>,
}

impl ClusterManager {
    pub fn new(
        chain: Option<Arc<ChainClient>>,
        remote: Arc<dyn RemoteExec>,
        http: reqwest::Client,
        allow_insecure_rent: bool,
        worker_api_key: Option<String>,
    ) -> Self {
        Self {
            nodes: DashMap::new(),
            chain,
            remote,
            http,
            allow_insecure_rent,
            worker_api_key,
        }
    }

    pub fn assigned(&self, job_id: JobId) -> Vec<ClusterNode> {
        self.nodes.get(&job_id).map(|n| n.clone()).unwrap_or_default()
    }

    pub fn has_assignment(&self, job_id: JobId) -> bool {
        self.nodes.get(&job_id).map_or(false, |n| !n.is_empty())
    }

    /// Machine ids from `machine_ids` with a confirming rental event. With
    /// no chain configured, or when the event query fails, nothing can be
    /// confirmed, so the set is empty and callers reject the machines.
    pub async fn validate_rentals(
        &self,
        machine_ids: &[MachineId],
        renter: Option<Address>,
    ) -> HashSet<MachineId> {
        let Some(chain) = &self.chain else {
            return HashSet::new();
        };
        let events = match chain.rental_events().await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(error = %e, "rental event query failed, confirming nothing");
                return HashSet::new();
            }
        };
        confirmed_rentals(&events, machine_ids, renter)
    }

    /// Replace `job_id`'s assignment with `machine_ids`. When a renter is
    /// supplied every machine must have a confirming rental event; every
    /// machine must be registered with a non-empty endpoint. Any failure
    /// leaves the prior assignment untouched.
    pub async fn assign(
        &self,
        registry: &NodeRegistry,
        job_id: JobId,
        machine_ids: &[MachineId],
        renter: Option<&str>,
        now: u64,
    ) -> Result<Vec<ClusterNode>, ApiError> {
        if machine_ids.is_empty() {
            return Err(ApiError::Validation("machine_ids must be non-empty".into()));
        }

        if let Some(renter) = renter {
            let renter: Address = renter
                .parse()
                .map_err(|_| ApiError::Validation(format!("invalid renter address: {renter}")))?;
            let confirmed = self.validate_rentals(machine_ids, Some(renter)).await;
            let unconfirmed: Vec<u64> = machine_ids
                .iter()
                .filter(|m| !confirmed.contains(m))
                .map(|m| m.0)
                .collect();
            if !unconfirmed.is_empty() {
                return Err(ApiError::Validation(format!(
                    "machines not rented by caller: {unconfirmed:?}"
                )));
            }
        }

        let mut rows = Vec::with_capacity(machine_ids.len());
        for &machine_id in machine_ids {
            let machine = registry.get(machine_id).ok_or_else(|| {
                ApiError::Validation(format!("machine {} is not registered", machine_id.0))
            })?;
            let endpoint = machine
                .endpoint
                .filter(|e| !e.is_empty())
                .ok_or_else(|| {
                    ApiError::Validation(format!("machine {} has no endpoint", machine_id.0))
                })?;
            rows.push(ClusterNode {
                job_id,
                machine_id: Some(machine_id),
                endpoint,
                created_at: now,
            });
        }

        self.nodes.insert(job_id, rows.clone());
        Ok(rows)
    }

    /// Persist an already-validated endpoint set, replacing the prior
    /// assignment. Used by provisioning, which vets endpoints by health
    /// check rather than registry lookup.
    fn replace_with_endpoints(&self, job_id: JobId, endpoints: &[String], now: u64) {
        let rows = endpoints
            .iter()
            .map(|endpoint| ClusterNode {
                job_id,
                machine_id: None,
                endpoint: endpoint.clone(),
                created_at: now,
            })
            .collect();
        self.nodes.insert(job_id, rows);
    }

    /// Rent machines on-chain with a caller-supplied key, then assign them.
    /// Disabled unless the insecure-mode flag is set: the raw private key
    /// transits the server.
    pub async fn rent_and_assign(
        &self,
        registry: &NodeRegistry,
        job_id: JobId,
        machine_ids: Vec<MachineId>,
        hours: u64,
        renter_key: &str,
        now: u64,
    ) -> Result<RentReport, ApiError> {
        if !self.allow_insecure_rent {
            return Err(ApiError::Forbidden("rent API is disabled".into()));
        }
        if !(MIN_RENT_HOURS..=MAX_RENT_HOURS).contains(&hours) {
            return Err(ApiError::Validation(format!(
                "hours must be between {MIN_RENT_HOURS} and {MAX_RENT_HOURS}"
            )));
        }
        let mut seen = HashSet::new();
        let machine_ids: Vec<MachineId> = machine_ids
            .into_iter()
            .filter(|m| seen.insert(*m))
            .collect();
        if machine_ids.is_empty() {
            return Err(ApiError::Validation("machine_ids must be non-empty".into()));
        }
        let chain = self
            .chain
            .as_ref()
            .ok_or_else(|| ApiError::Internal("chain client not configured".into()))?;

        let raw_ids: Vec<u64> = machine_ids.iter().map(|m| m.0).collect();
        let outcome: RentalOutcome = chain
            .rent_machines(&raw_ids, hours, renter_key)
            .await
            .map_err(|e| match e {
                ChainError::InvalidConfig(msg) => ApiError::Validation(msg),
                other => ApiError::Internal(other.to_string()),
            })?;

        // Re-validate post-submission to catch confirmation races or reorgs
        // before recording the assignment.
        let confirmed = self
            .validate_rentals(&machine_ids, Some(outcome.renter))
            .await;
        let missing: Vec<u64> = machine_ids
            .iter()
            .filter(|m| !confirmed.contains(m))
            .map(|m| m.0)
            .collect();
        if !missing.is_empty() {
            return Err(ApiError::Internal(format!(
                "rentals not yet confirmed on chain: {missing:?}"
            )));
        }

        let assigned = self.assign(registry, job_id, &machine_ids, None, now).await?;
        Ok(RentReport {
            renter: format!("{:#x}", outcome.renter),
            total_cost: outcome.total_required.to_string(),
            approve_tx: outcome.approve_tx,
            rent_txs: outcome.rent_txs,
            assigned,
        })
    }

    /// Start a worker container on each host and keep only the hosts whose
    /// health endpoint answers. Per-host failures are recorded, never fatal
    /// to the rest of the set; the healthy subset replaces the job's
    /// assignment when non-empty.
    pub async fn provision(
        &self,
        job_id: JobId,
        hosts: &[String],
        ssh_user: Option<&str>,
        image: &str,
        port: u16,
        env: &[(String, String)],
        now: u64,
    ) -> Result<ProvisionReport, ApiError> {
        if hosts.is_empty() {
            return Err(ApiError::Validation("hosts must be non-empty".into()));
        }
        if image.is_empty() {
            return Err(ApiError::Validation("image must be non-empty".into()));
        }

        let command = self.container_command(image, port, env);
        let mut results = Vec::with_capacity(hosts.len());
        let mut healthy = Vec::new();

        for host in hosts {
            let target = match ssh_user {
                Some(user) if !host.contains('@') => format!("{user}@{host}"),
                _ => host.clone(),
            };
            let detail = match self.remote.run(&target, &command).await {
                Ok(_) => {
                    let endpoint = format!("{}:{}", strip_user(host), port);
                    if self.await_healthy(&endpoint).await {
                        healthy.push(endpoint);
                        "started".to_string()
                    } else {
                        "started (no health)".to_string()
                    }
                }
                Err(e) => {
                    tracing::warn!(host = %host, error = %e, "provisioning failed");
                    results.push(ProvisionHostResult {
                        host: host.clone(),
                        ok: false,
                        detail: e.to_string(),
                    });
                    continue;
                }
            };
            results.push(ProvisionHostResult {
                host: host.clone(),
                ok: true,
                detail,
            });
        }

        if !healthy.is_empty() {
            self.replace_with_endpoints(job_id, &healthy, now);
        }
        Ok(ProvisionReport {
            results,
            healthy_endpoints: healthy,
        })
    }

    fn container_command(&self, image: &str, port: u16, env: &[(String, String)]) -> String {
        let mut envs = String::new();
        envs.push_str(&format!(" -e PORT={port}"));
        if let Some(key) = &self.worker_api_key {
            envs.push_str(&format!(" -e API_KEY={}", shell_quote(key)));
        }
        for (k, v) in env {
            envs.push_str(&format!(" -e {}={}", k, shell_quote(v)));
        }
        format!(
            "docker rm -f mesh-worker >/dev/null 2>&1 || true; \
             docker run -d --name mesh-worker --restart unless-stopped \
             -p {port}:{port}{envs} {image}"
        )
    }

    async fn await_healthy(&self, endpoint: &str) -> bool {
        let url = format!("http://{endpoint}/health");
        for attempt in 0..HEALTH_POLL_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(HEALTH_POLL_BACKOFF).await;
            }
            let ok = self
                .http
                .get(&url)
                .timeout(HEALTH_TIMEOUT)
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            if ok {
                return true;
            }
        }
        false
    }

    pub fn snapshot(&self) -> Vec<ClusterNode> {
        self.nodes.iter().flat_map(|e| e.value().clone()).collect()
    }

    pub fn restore(&self, rows: Vec<ClusterNode>) {
        for row in rows {
            self.nodes.entry(row.job_id).or_default().push(row);
        }
    }
}

fn strip_user(host: &str) -> &str {
    host.rsplit('@').next().unwrap_or(host)
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
