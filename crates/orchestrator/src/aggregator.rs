//! Lifecycle of external aggregation-server processes (one per job). The
//! server command comes from configuration and is launched as a child
//! process; workers are pointed at a network-reachable dial address rather
//! than the raw bind address.

use std::collections::HashMap;

use mesh_core::ids::JobId;
use parking_lot::Mutex;
use tokio::process::{Child, Command};

use crate::error::ApiError;

/// Address workers should dial for a server bound to `host:port`. Loopback
/// and any-interface binds are unreachable from other hosts, so they are
/// rewritten to the configured alias.
pub fn client_dial_address(host: &str, port: u16, alias: &str) -> String {
    match host {
        "0.0.0.0" | "127.0.0.1" | "localhost" | "::" | "[::]" => format!("{alias}:{port}"),
        other => format!("{other}:{port}"),
    }
}

pub struct AggregatorRegistry {
    command: Option<String>,
    alias: String,
    children: Mutex<HashMap<JobId, Child>>,
}

impl AggregatorRegistry {
    pub fn new(command: Option<String>, alias: String) -> Self {
        Self {
            command,
            alias,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the aggregation server for `job_id` bound to `host:port` and
    /// return the address workers should dial. A server already running for
    /// the job is replaced.
    pub fn start(
        &self,
        job_id: JobId,
        host: &str,
        port: u16,
        rounds: u32,
    ) -> Result<String, ApiError> {
        let command = self
            .command
            .as_deref()
            .ok_or_else(|| ApiError::Internal("aggregator command not configured".into()))?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("AGG_JOB_ID", job_id.0.to_string())
            .env("AGG_HOST", host)
            .env("AGG_PORT", port.to_string())
            .env("AGG_ROUNDS", rounds.to_string())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ApiError::Internal(format!("failed to spawn aggregator: {e}")))?;

        let mut children = self.children.lock();
        if let Some(mut previous) = children.insert(job_id, child) {
            if let Err(e) = previous.start_kill() {
                tracing::warn!(job_id = job_id.0, error = %e, "failed to kill previous aggregator");
            }
        }
        tracing::info!(job_id = job_id.0, host, port, "aggregation server started");
        Ok(client_dial_address(host, port, &self.alias))
    }

    pub fn stop(&self, job_id: JobId) -> bool {
        let mut children = self.children.lock();
        match children.remove(&job_id) {
            Some(mut child) => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(job_id = job_id.0, error = %e, "failed to kill aggregator");
                }
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.children.lock().contains_key(&job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_and_wildcard_binds_are_rewritten() {
        assert_eq!(client_dial_address("0.0.0.0", 8080, "server"), "server:8080");
        assert_eq!(client_dial_address("127.0.0.1", 8080, "server"), "server:8080");
        assert_eq!(client_dial_address("localhost", 9999, "agg"), "agg:9999");
        assert_eq!(
            client_dial_address("10.1.2.3", 8080, "server"),
            "10.1.2.3:8080"
        );
    }

    #[tokio::test]
    async fn start_and_stop_track_the_child_process() {
        let registry = AggregatorRegistry::new(Some("sleep 30".into()), "server".into());
        let dial = registry.start(JobId(1), "0.0.0.0", 8080, 3).unwrap();
        assert_eq!(dial, "server:8080");
        assert!(registry.is_running(JobId(1)));

        assert!(registry.stop(JobId(1)));
        assert!(!registry.is_running(JobId(1)));
        assert!(!registry.stop(JobId(1)));
    }

    #[tokio::test]
    async fn missing_command_is_an_internal_error() {
        let registry = AggregatorRegistry::new(None, "server".into());
        assert!(matches!(
            registry.start(JobId(1), "0.0.0.0", 8080, 1),
            Err(ApiError::Internal(_))
        ));
    }
}
