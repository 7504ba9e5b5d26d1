/// Shared handles and the per-tick snapshot published to subscribers.
///
/// Every node lives behind an `Arc<RwLock<…>>`: the simulator takes the
/// write lock once per tick for the node's update, protocol tasks take
/// short read/write locks per request, and nobody holds a lock across an
/// await. Snapshots fan out over a broadcast channel so a slow subscriber
/// can never stall the simulation loop.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::NodeClass;
use crate::nodes::{NodeStats, RtuNode};

pub type NodeHandle = Arc<RwLock<RtuNode>>;

pub fn node_handle(node: RtuNode) -> NodeHandle {
    Arc::new(RwLock::new(node))
}

/// Immutable per-tick view for the external dashboard collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct GridSnapshot {
    pub timestamp: DateTime<Utc>,
    pub tick: u64,
    pub frequency_hz: f64,
    pub rocof_hz_per_s: f64,
    pub frequency_status: String,
    pub total_generation_mw: f64,
    pub total_load_mw: f64,
    pub total_losses_mw: f64,
    pub nodes: HashMap<String, NodeSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub class: NodeClass,
    pub voltage_kv: f64,
    pub voltage_angle_deg: f64,
    pub current_a: f64,
    pub p_mw: f64,
    pub q_mvar: f64,
    pub frequency_hz: f64,
    pub breaker: String,
    pub active_alarms: Vec<String>,
    pub protection_trips: Vec<String>,
    pub stats: NodeStats,
    pub soe_events: u64,
}

impl NodeSnapshot {
    pub fn from_node(node: &RtuNode) -> Self {
        Self {
            class: node.class(),
            voltage_kv: node.state.voltage_kv,
            voltage_angle_deg: node.state.voltage_angle_deg,
            current_a: node.state.current_a,
            p_mw: node.state.p_mw,
            q_mvar: node.state.q_mvar,
            frequency_hz: node.state.frequency_hz,
            breaker: node.state.breaker.as_str().to_string(),
            active_alarms: node.active_alarms(),
            protection_trips: node.protection_trips(),
            stats: node.stats,
            soe_events: node.soe.total_recorded(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_snapshot_serializes_to_json() {
        let config = Config::default_grid();
        let node = RtuNode::new(config.node("SUB-001").unwrap(), &config.protection);
        let snapshot = GridSnapshot {
            timestamp: Utc::now(),
            tick: 7,
            frequency_hz: 49.98,
            rocof_hz_per_s: -0.01,
            frequency_status: "NORMAL".to_string(),
            total_generation_mw: 512.0,
            total_load_mw: 505.0,
            total_losses_mw: 7.0,
            nodes: HashMap::from([("SUB-001".to_string(), NodeSnapshot::from_node(&node))]),
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"frequency_hz\":49.98"));
        assert!(json.contains("SUB-001"));
        assert!(json.contains("\"breaker\":\"CLOSED\""));
    }
}
