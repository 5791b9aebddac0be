use serde::{Deserialize, Serialize};

use crate::mesh::MeshHandle;
use crate::peer::Peerstore;
use crate::registry::RoomRegistry;

/// Topic carrying room-ownership claims, published periodically and whenever
/// a room is created or destroyed.
pub const ROOM_STATE_TOPIC: &str = "room-state";

/// Topic carrying relay liveness data: addresses, neighbours, latencies.
pub const RELAY_METRICS_TOPIC: &str = "relay-metrics";

/// One room claim inside a `room-state` message. `claim_time` is unix
/// milliseconds and is the first tie-break key for duplicate names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStateEntry {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub claim_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomStateMessage {
    pub peer_id: String,
    pub rooms: Vec<RoomStateEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMetricsMessage {
    pub peer_id: String,
    pub addresses: Vec<String>,
    pub neighbours: Vec<String>,
    /// Round-trip times in milliseconds keyed by peer id.
    pub latencies: std::collections::HashMap<String, u64>,
}

/// Publishes the local room claim set; called on the metrics interval and
/// whenever a room is created or destroyed.
pub async fn publish_room_state(mesh: &MeshHandle, registry: &RoomRegistry) {
    let msg = RoomStateMessage {
        peer_id: mesh.peer_id().to_string(),
        rooms: registry.snapshot(),
    };

    let data = match serde_json::to_vec(&msg) {
        Ok(data) => data,
        Err(err) => {
            tracing::error!("failed to serialize room-state message: {}", err);
            return;
        }
    };

    if let Err(err) = mesh.publish(ROOM_STATE_TOPIC, data).await {
        tracing::warn!("failed to publish room-state: {}", err);
    }
}

/// Publishes this relay's liveness snapshot: addresses, known neighbours and
/// measured latencies.
pub async fn publish_relay_metrics(mesh: &MeshHandle, peerstore: &Peerstore) {
    let addresses = match mesh.listen_addrs().await {
        Ok(addrs) => addrs.iter().map(|a| a.to_string()).collect(),
        Err(_) => Vec::new(),
    };

    let msg = RelayMetricsMessage {
        peer_id: mesh.peer_id().to_string(),
        addresses,
        neighbours: peerstore
            .neighbour_ids()
            .iter()
            .map(|id| id.to_string())
            .collect(),
        latencies: peerstore.latency_snapshot(),
    };

    let data = match serde_json::to_vec(&msg) {
        Ok(data) => data,
        Err(err) => {
            tracing::error!("failed to serialize relay-metrics message: {}", err);
            return;
        }
    };

    if let Err(err) = mesh.publish(RELAY_METRICS_TOPIC, data).await {
        tracing::warn!("failed to publish relay-metrics: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_state_round_trips() {
        let msg = RoomStateMessage {
            peer_id: "12D3KooWExample".to_string(),
            rooms: vec![RoomStateEntry {
                id: "01J00000000000000000000000".to_string(),
                name: "alpha".to_string(),
                owner_id: "12D3KooWExample".to_string(),
                claim_time: 1_700_000_000_000,
            }],
        };

        let json = serde_json::to_vec(&msg).unwrap();
        let back: RoomStateMessage = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.peer_id, msg.peer_id);
        assert_eq!(back.rooms, msg.rooms);
    }

    #[test]
    fn relay_metrics_round_trips() {
        let mut latencies = std::collections::HashMap::new();
        latencies.insert("12D3KooWOther".to_string(), 23u64);

        let msg = RelayMetricsMessage {
            peer_id: "12D3KooWExample".to_string(),
            addresses: vec!["/ip4/10.0.0.1/tcp/4001".to_string()],
            neighbours: vec!["12D3KooWOther".to_string()],
            latencies,
        };

        let json = serde_json::to_vec(&msg).unwrap();
        let back: RelayMetricsMessage = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.addresses, msg.addresses);
        assert_eq!(back.latencies.get("12D3KooWOther"), Some(&23));
    }
}
