use serde::{Deserialize, Serialize};

use crate::ids::{JobId, MachineId};

/// A node is considered stale (reported `offline`) once its last heartbeat
/// is older than this.
pub const STALE_AFTER_SECS: u64 = 300;

/// Tighter threshold used when deciding whether a node is usable right now,
/// e.g. for the realtime node views.
pub const USABLE_WITHIN_SECS: u64 = 180;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Offline,
    Online,
    Training,
}

/// A provider machine known to the registry, upserted on registration or
/// first heartbeat. Never hard-deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderMachine {
    pub machine_id: MachineId,
    pub provider_address: String,
    /// Free-form spec string as reported by the provider (usually JSON).
    pub specs: String,
    pub endpoint: Option<String>,
    pub created_at: u64,
    pub last_seen: Option<u64>,
    pub status: NodeStatus,
    pub metrics: Option<serde_json::Value>,
    pub price_per_hour_wei: Option<String>,
    pub listed: bool,
}

impl ProviderMachine {
    /// Status derived from heartbeat recency: `offline` when the machine has
    /// never been heard from or its last heartbeat is older than
    /// `staleness_secs`, otherwise the reported status.
    pub fn effective_status(&self, now: u64, staleness_secs: u64) -> NodeStatus {
        match self.last_seen {
            Some(seen) if now.saturating_sub(seen) <= staleness_secs => self.status,
            _ => NodeStatus::Offline,
        }
    }
}

/// The binding of one endpoint to one job. A job's assignment set is always
/// replaced wholesale, never patched. Provisioned endpoints have no
/// marketplace machine behind them, hence the optional id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub job_id: JobId,
    pub machine_id: Option<MachineId>,
    pub endpoint: String,
    pub created_at: u64,
}

/// Point-in-time liveness/metrics report, retained as a log per machine.
/// `seq` increases monotonically per machine; timestamps alone cannot order
/// heartbeats landing within the same second.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    pub machine_id: MachineId,
    pub seq: u64,
    pub timestamp: u64,
    pub status: NodeStatus,
    pub metrics: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(last_seen: Option<u64>, status: NodeStatus) -> ProviderMachine {
        ProviderMachine {
            machine_id: MachineId(1),
            provider_address: "0xabc".into(),
            specs: "{}".into(),
            endpoint: Some("10.0.0.1:9000".into()),
            created_at: 0,
            last_seen,
            status,
            metrics: None,
            price_per_hour_wei: None,
            listed: false,
        }
    }

    #[test]
    fn never_seen_machine_is_offline() {
        let m = machine(None, NodeStatus::Online);
        assert_eq!(m.effective_status(1_000, STALE_AFTER_SECS), NodeStatus::Offline);
    }

    #[test]
    fn stale_heartbeat_overrides_reported_online() {
        let m = machine(Some(1_000), NodeStatus::Online);
        assert_eq!(
            m.effective_status(1_000 + STALE_AFTER_SECS + 1, STALE_AFTER_SECS),
            NodeStatus::Offline
        );
    }

    #[test]
    fn recent_heartbeat_keeps_reported_status() {
        let m = machine(Some(1_000), NodeStatus::Training);
        assert_eq!(m.effective_status(1_100, STALE_AFTER_SECS), NodeStatus::Training);
    }

    #[test]
    fn usable_window_is_tighter_than_staleness() {
        let m = machine(Some(1_000), NodeStatus::Online);
        let now = 1_000 + USABLE_WITHIN_SECS + 1;
        assert_eq!(m.effective_status(now, USABLE_WITHIN_SECS), NodeStatus::Offline);
        assert_eq!(m.effective_status(now, STALE_AFTER_SECS), NodeStatus::Online);
    }
}
