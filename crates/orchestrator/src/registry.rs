//! Provider machine registry. Machines appear on explicit registration or
//! on first heartbeat, are updated in place afterwards, and are never
//! hard-deleted. Status shown to observers is derived from heartbeat
//! recency, not from the last reported value alone.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mesh_core::ids::MachineId;
use mesh_core::node::{
    NodeHeartbeat, NodeStatus, ProviderMachine, STALE_AFTER_SECS, USABLE_WITHIN_SECS,
};
use serde::Serialize;

use crate::broadcast::{NodeDelta, RealtimeBroadcaster};

const HEARTBEAT_LOG_CAP: usize = 100;

#[derive(Clone, Debug, Serialize)]
pub struct NodeView {
    pub machine_id: MachineId,
    pub provider_address: String,
    pub endpoint: Option<String>,
    pub status: NodeStatus,
    pub last_seen: Option<u64>,
    pub specs: String,
    pub metrics: Option<serde_json::Value>,
    pub price_per_hour_wei: Option<String>,
    pub listed: bool,
}

fn view(m: &ProviderMachine, now: u64, staleness: u64) -> NodeView {
    NodeView {
        machine_id: m.machine_id,
        provider_address: m.provider_address.clone(),
        endpoint: m.endpoint.clone(),
        status: m.effective_status(now, staleness),
        last_seen: m.last_seen,
        specs: m.specs.clone(),
        metrics: m.metrics.clone(),
        price_per_hour_wei: m.price_per_hour_wei.clone(),
        listed: m.listed,
    }
}

pub struct NodeRegistry {
    machines: DashMap<MachineId, ProviderMachine>,
    heartbeats: DashMap<MachineId, Vec<NodeHeartbeat>>,
    broadcaster: Arc<RealtimeBroadcaster>,
}

impl NodeRegistry {
    pub fn new(broadcaster: Arc<RealtimeBroadcaster>) -> Self {
        Self {
            machines: DashMap::new(),
            heartbeats: DashMap::new(),
            broadcaster,
        }
    }

    /// Upsert by machine id: a known id has its provider, specs, and
    /// endpoint replaced in place.
    pub fn register(
        &self,
        machine_id: MachineId,
        provider_address: String,
        specs: String,
        endpoint: Option<String>,
        now: u64,
    ) {
        match self.machines.entry(machine_id) {
            Entry::Occupied(mut e) => {
                let m = e.get_mut();
                m.provider_address = provider_address;
                m.specs = specs;
                m.endpoint = endpoint;
            }
            Entry::Vacant(e) => {
                e.insert(ProviderMachine {
                    machine_id,
                    provider_address,
                    specs,
                    endpoint,
                    created_at: now,
                    last_seen: None,
                    status: NodeStatus::Offline,
                    metrics: None,
                    price_per_hour_wei: None,
                    listed: false,
                });
            }
        }
    }

    /// Record a heartbeat, auto-registering unknown machines: workers may
    /// start pinging before their explicit registration lands. Publishes a
    /// best-effort realtime delta.
    pub fn heartbeat(
        &self,
        machine_id: MachineId,
        provider_address: Option<String>,
        endpoint: Option<String>,
        status: Option<NodeStatus>,
        metrics: Option<serde_json::Value>,
        now: u64,
    ) {
        let status = status.unwrap_or(NodeStatus::Online);
        {
            let mut entry = self
                .machines
                .entry(machine_id)
                .or_insert_with(|| ProviderMachine {
                    machine_id,
                    provider_address: provider_address.clone().unwrap_or_default(),
                    specs: String::new(),
                    endpoint: None,
                    created_at: now,
                    last_seen: None,
                    status: NodeStatus::Offline,
                    metrics: None,
                    price_per_hour_wei: None,
                    listed: false,
                });
            entry.last_seen = Some(now);
            entry.status = status;
            if let Some(addr) = provider_address {
                entry.provider_address = addr;
            }
            if let Some(ep) = endpoint {
                entry.endpoint = Some(ep);
            }
            if metrics.is_some() {
                entry.metrics = metrics.clone();
            }
        }

        let mut log = self.heartbeats.entry(machine_id).or_default();
        let seq = log.last().map(|h| h.seq + 1).unwrap_or(0);
        log.push(NodeHeartbeat {
            machine_id,
            seq,
            timestamp: now,
            status,
            metrics: metrics.clone(),
        });
        if log.len() > HEARTBEAT_LOG_CAP {
            let excess = log.len() - HEARTBEAT_LOG_CAP;
            log.drain(..excess);
        }
        drop(log);

        self.broadcaster.publish(NodeDelta {
            machine_id,
            status,
            metrics,
            timestamp: now,
        });
    }

    pub fn get(&self, machine_id: MachineId) -> Option<ProviderMachine> {
        self.machines.get(&machine_id).map(|m| m.clone())
    }

    pub fn list(&self) -> Vec<ProviderMachine> {
        self.machines.iter().map(|m| m.clone()).collect()
    }

    /// Up to `limit` machines with a non-empty endpoint, for auto-assignment.
    pub fn with_endpoints(&self, limit: usize) -> Vec<ProviderMachine> {
        self.machines
            .iter()
            .filter(|m| m.endpoint.as_deref().is_some_and(|e| !e.is_empty()))
            .take(limit)
            .map(|m| m.clone())
            .collect()
    }

    /// Listing view with the 5-minute staleness threshold, optionally
    /// filtered by provider address.
    pub fn views(&self, provider_address: Option<&str>, now: u64) -> Vec<NodeView> {
        self.machines
            .iter()
            .filter(|m| provider_address.map_or(true, |a| m.provider_address == a))
            .map(|m| view(&m, now, STALE_AFTER_SECS))
            .collect()
    }

    /// Realtime view with the tighter usable-now threshold.
    pub fn realtime_views(&self, now: u64) -> Vec<NodeView> {
        self.machines
            .iter()
            .map(|m| view(&m, now, USABLE_WITHIN_SECS))
            .collect()
    }

    pub fn recent_heartbeats(&self, machine_id: MachineId, limit: usize) -> Vec<NodeHeartbeat> {
        self.heartbeats
            .get(&machine_id)
            .map(|log| log.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn restore(&self, machines: Vec<ProviderMachine>) {
        for m in machines {
            self.machines.insert(m.machine_id, m);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(Arc::new(RealtimeBroadcaster::new()))
    }

    #[test]
    fn heartbeat_auto_registers_unknown_machine_once() {
        let reg = registry();
        reg.heartbeat(MachineId(5), Some("0xabc".into()), Some("h:9000".into()), None, None, 100);
        assert_eq!(reg.list().len(), 1);
        let m = reg.get(MachineId(5)).unwrap();
        assert_eq!(m.last_seen, Some(100));
        assert_eq!(m.status, NodeStatus::Online);

        // Second heartbeat updates rather than duplicates.
        reg.heartbeat(
            MachineId(5),
            None,
            None,
            Some(NodeStatus::Training),
            Some(serde_json::json!({"cpu": 0.9})),
            160,
        );
        assert_eq!(reg.list().len(), 1);
        let m = reg.get(MachineId(5)).unwrap();
        assert_eq!(m.last_seen, Some(160));
        assert_eq!(m.status, NodeStatus::Training);
        assert_eq!(m.provider_address, "0xabc");
        assert_eq!(m.endpoint.as_deref(), Some("h:9000"));
    }

    #[test]
    fn register_updates_known_machine_in_place() {
        let reg = registry();
        reg.register(MachineId(1), "0xaaa".into(), "{}".into(), Some("a:1".into()), 10);
        reg.register(MachineId(1), "0xbbb".into(), "{\"gpu\":1}".into(), Some("b:2".into()), 20);
        assert_eq!(reg.list().len(), 1);
        let m = reg.get(MachineId(1)).unwrap();
        assert_eq!(m.provider_address, "0xbbb");
        assert_eq!(m.endpoint.as_deref(), Some("b:2"));
        assert_eq!(m.created_at, 10);
    }

    #[test]
    fn stale_node_reports_offline_in_views() {
        let reg = registry();
        reg.heartbeat(MachineId(2), Some("0xabc".into()), None, Some(NodeStatus::Online), None, 1_000);
        let views = reg.views(None, 1_000 + STALE_AFTER_SECS + 1);
        assert_eq!(views[0].status, NodeStatus::Offline);

        let views = reg.views(None, 1_030);
        assert_eq!(views[0].status, NodeStatus::Online);
    }

    #[test]
    fn heartbeat_publishes_a_delta() {
        let broadcaster = Arc::new(RealtimeBroadcaster::new());
        let reg = NodeRegistry::new(broadcaster.clone());
        let (_id, mut rx) = broadcaster.subscribe();

        reg.heartbeat(MachineId(3), Some("0xabc".into()), None, None, None, 42);
        let delta = rx.try_recv().unwrap();
        assert_eq!(delta.machine_id, MachineId(3));
        assert_eq!(delta.timestamp, 42);
    }

    #[test]
    fn heartbeat_log_is_retained_most_recent_first() {
        let reg = registry();
        for t in 0..5 {
            reg.heartbeat(MachineId(9), Some("0xabc".into()), None, None, None, t);
        }
        let log = reg.recent_heartbeats(MachineId(9), 3);
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].timestamp, 4);
        assert_eq!(log[2].timestamp, 2);
    }

    #[test]
    fn same_second_heartbeats_get_distinct_sequence_numbers() {
        let reg = registry();
        for _ in 0..3 {
            reg.heartbeat(MachineId(4), Some("0xabc".into()), None, None, None, 100);
        }
        let log = reg.recent_heartbeats(MachineId(4), 10);
        assert_eq!(log.len(), 3);
        // Newest first; sequence disambiguates the shared timestamp.
        assert_eq!(log[0].seq, 2);
        assert_eq!(log[1].seq, 1);
        assert_eq!(log[2].seq, 0);
        assert!(log.iter().all(|h| h.timestamp == 100));
    }

    #[test]
    fn sequence_numbers_survive_log_trimming() {
        let reg = registry();
        for t in 0..(HEARTBEAT_LOG_CAP as u64 + 5) {
            reg.heartbeat(MachineId(6), Some("0xabc".into()), None, None, None, t);
        }
        let log = reg.recent_heartbeats(MachineId(6), 1);
        assert_eq!(log[0].seq, HEARTBEAT_LOG_CAP as u64 + 4);
    }

    #[test]
    fn with_endpoints_skips_machines_without_one() {
        let reg = registry();
        reg.register(MachineId(1), "0xa".into(), "{}".into(), Some("a:1".into()), 0);
        reg.register(MachineId(2), "0xb".into(), "{}".into(), None, 0);
        reg.register(MachineId(3), "0xc".into(), "{}".into(), Some(String::new()), 0);
        let picked = reg.with_endpoints(10);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].machine_id, MachineId(1));
    }
}
