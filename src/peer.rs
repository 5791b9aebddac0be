use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use dashmap::DashMap;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};

use crate::error::{Error, PersistenceErrorKind};
use crate::gossip::{RelayMetricsMessage, RoomStateEntry};

const PEERSTORE_FILE: &str = "peerstore.json";

/// Everything this relay knows about one peer. Neighbour relationships are
/// stored as ids only; the [`Peerstore`] arena is the single owner of every
/// record, so a peer appearing in its own neighbour's neighbour set is just
/// another id lookup.
#[derive(Debug, Clone, Default)]
pub struct PeerRecord {
    pub addresses: Vec<Multiaddr>,
    pub neighbours: HashSet<PeerId>,
    pub latencies: HashMap<PeerId, Duration>,
    pub rooms: HashMap<String, RoomStateEntry>,
}

/// Canonical set of known peers, shared between the mesh layer and the
/// persistence path. Only the mesh layer mutates live records; snapshotting
/// never does.
#[derive(Debug, Default)]
pub struct Peerstore {
    records: DashMap<PeerId, PeerRecord>,
    // Round-trips measured by this relay, distinct from the latencies peers
    // advertise about each other inside their own records.
    rtt: DashMap<PeerId, Duration>,
}

impl Peerstore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records a sighting of `peer`, merging any newly observed addresses.
    pub fn observe(&self, peer: PeerId, addresses: Vec<Multiaddr>) {
        let mut record = self.records.entry(peer).or_default();
        for addr in addresses {
            if !record.addresses.contains(&addr) {
                record.addresses.push(addr);
            }
        }
    }

    /// Stores the measured round-trip time from this relay to `peer`.
    pub fn record_latency(&self, peer: PeerId, rtt: Duration) {
        self.rtt.insert(peer, rtt);
    }

    /// Merges a `relay-metrics` gossip payload into the sender's record.
    pub fn merge_metrics(&self, msg: &RelayMetricsMessage) {
        let Ok(peer) = PeerId::from_str(&msg.peer_id) else {
            tracing::warn!("relay-metrics message with invalid peer id: {}", msg.peer_id);
            return;
        };

        let mut record = self.records.entry(peer).or_default();
        record.addresses = msg
            .addresses
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect();
        record.neighbours = msg
            .neighbours
            .iter()
            .filter_map(|n| PeerId::from_str(n).ok())
            .collect();
        record.latencies = msg
            .latencies
            .iter()
            .filter_map(|(id, millis)| {
                PeerId::from_str(id)
                    .ok()
                    .map(|id| (id, Duration::from_millis(*millis)))
            })
            .collect();
    }

    /// Replaces the room list attributed to `peer` by the `room-state` topic.
    pub fn set_rooms(&self, peer: PeerId, rooms: Vec<RoomStateEntry>) {
        let mut record = self.records.entry(peer).or_default();
        record.rooms = rooms.into_iter().map(|r| (r.name.clone(), r)).collect();
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.records.get(peer).map(|r| r.clone())
    }

    pub fn remove(&self, peer: &PeerId) {
        self.records.remove(peer);
        self.rtt.remove(peer);
    }

    /// Snapshot of (peer, first-address) pairs used for reconnect at boot.
    pub fn dial_targets(&self) -> Vec<(PeerId, Multiaddr)> {
        self.records
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .addresses
                    .first()
                    .cloned()
                    .map(|addr| (*entry.key(), addr))
            })
            .collect()
    }

    pub fn neighbour_ids(&self) -> Vec<PeerId> {
        self.records.iter().map(|e| *e.key()).collect()
    }

    /// Latency snapshot in milliseconds, keyed by peer id string, for the
    /// metrics gossip payload.
    pub fn latency_snapshot(&self) -> HashMap<String, u64> {
        self.rtt
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().as_millis() as u64))
            .collect()
    }

    /// Writes the snapshot atomically (temp file + rename), mode 0644.
    pub fn save(&self, dir: &Path) -> Result<(), Error> {
        let path = peerstore_path(dir);
        let snapshot: Vec<PeerSnapshot> = self
            .records
            .iter()
            .map(|entry| PeerSnapshot::from_record(entry.key(), entry.value()))
            .collect();

        let data = serde_json::to_vec_pretty(&snapshot).map_err(|e| {
            Error::new_persistence(
                format!("failed to serialize peerstore: {}", e),
                PersistenceErrorKind::Peerstore,
            )
        })?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &data).and_then(|_| fs::rename(&tmp, &path)).map_err(|e| {
            Error::new_persistence(
                format!("failed to write peerstore {}: {}", path.display(), e),
                PersistenceErrorKind::Peerstore,
            )
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).map_err(|e| {
                Error::new_persistence(
                    format!("failed to set peerstore permissions: {}", e),
                    PersistenceErrorKind::Peerstore,
                )
            })?;
        }

        tracing::info!("Peerstore saved to {}", path.display());
        Ok(())
    }

    /// Best-effort load. A missing file starts an empty store; a corrupt file
    /// is reported as an error the caller downgrades to a warning.
    pub fn load(&self, dir: &Path) -> Result<(), Error> {
        let path = peerstore_path(dir);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No peerstore snapshot, starting empty");
                return Ok(());
            }
            Err(e) => {
                return Err(Error::new_persistence(
                    format!("failed to read peerstore {}: {}", path.display(), e),
                    PersistenceErrorKind::Peerstore,
                ))
            }
        };

        let snapshot: Vec<PeerSnapshot> = serde_json::from_slice(&data).map_err(|e| {
            Error::new_persistence(
                format!("peerstore {} is corrupt: {}", path.display(), e),
                PersistenceErrorKind::Peerstore,
            )
        })?;

        for peer in snapshot {
            let Ok(id) = PeerId::from_str(&peer.id) else {
                tracing::warn!("Skipping peerstore entry with invalid id: {}", peer.id);
                continue;
            };
            self.records.insert(id, peer.into_record());
        }

        tracing::info!("Peerstore loaded from {}", path.display());
        Ok(())
    }
}

pub fn peerstore_path(dir: &Path) -> PathBuf {
    dir.join(PEERSTORE_FILE)
}

/// Serialized form of a peer record. Ids and addresses are strings so the
/// snapshot stays readable and schema-stable.
#[derive(Debug, Serialize, Deserialize)]
struct PeerSnapshot {
    id: String,
    addresses: Vec<String>,
    neighbours: Vec<String>,
    latencies_ms: HashMap<String, u64>,
    rooms: Vec<RoomStateEntry>,
}

impl PeerSnapshot {
    fn from_record(id: &PeerId, record: &PeerRecord) -> Self {
        PeerSnapshot {
            id: id.to_string(),
            addresses: record.addresses.iter().map(|a| a.to_string()).collect(),
            neighbours: record.neighbours.iter().map(|n| n.to_string()).collect(),
            latencies_ms: record
                .latencies
                .iter()
                .map(|(id, rtt)| (id.to_string(), rtt.as_millis() as u64))
                .collect(),
            rooms: record.rooms.values().cloned().collect(),
        }
    }

    fn into_record(self) -> PeerRecord {
        PeerRecord {
            addresses: self
                .addresses
                .iter()
                .filter_map(|a| a.parse().ok())
                .collect(),
            neighbours: self
                .neighbours
                .iter()
                .filter_map(|n| PeerId::from_str(n).ok())
                .collect(),
            latencies: self
                .latencies_ms
                .iter()
                .filter_map(|(id, millis)| {
                    PeerId::from_str(id)
                        .ok()
                        .map(|id| (id, Duration::from_millis(*millis)))
                })
                .collect(),
            rooms: self.rooms.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn observe_merges_addresses() {
        let store = Peerstore::new();
        let peer = PeerId::random();

        store.observe(peer, vec![addr("/ip4/10.0.0.1/tcp/4001")]);
        store.observe(
            peer,
            vec![
                addr("/ip4/10.0.0.1/tcp/4001"),
                addr("/ip4/10.0.0.1/udp/4001/quic-v1"),
            ],
        );

        assert_eq!(store.get(&peer).unwrap().addresses.len(), 2);
    }

    #[test]
    fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Peerstore::new();
        let peer = PeerId::random();
        let neighbour = PeerId::random();

        store.observe(peer, vec![addr("/ip4/10.0.0.1/tcp/4001")]);
        store.record_latency(peer, Duration::from_millis(42));
        store.merge_metrics(&RelayMetricsMessage {
            peer_id: peer.to_string(),
            addresses: vec!["/ip4/10.0.0.1/tcp/4001".to_string()],
            neighbours: vec![neighbour.to_string()],
            latencies: HashMap::new(),
        });
        store.save(dir.path()).unwrap();

        let reloaded = Peerstore::new();
        reloaded.load(dir.path()).unwrap();

        let record = reloaded.get(&peer).unwrap();
        assert_eq!(record.addresses, vec![addr("/ip4/10.0.0.1/tcp/4001")]);
        assert!(record.neighbours.contains(&neighbour));
    }

    #[cfg(unix)]
    #[test]
    fn snapshot_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = Peerstore::new();
        store.observe(PeerId::random(), vec![addr("/ip4/10.0.0.1/tcp/4001")]);
        store.save(dir.path()).unwrap();

        let mode = fs::metadata(peerstore_path(dir.path()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn missing_snapshot_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Peerstore::new();
        store.load(dir.path()).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn corrupt_snapshot_is_an_error_and_leaves_store_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(peerstore_path(dir.path()), b"{not json").unwrap();

        let store = Peerstore::new();
        assert!(store.load(dir.path()).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn dial_targets_take_first_address() {
        let store = Peerstore::new();
        let peer = PeerId::random();
        store.observe(
            peer,
            vec![
                addr("/ip4/10.0.0.1/tcp/4001"),
                addr("/ip4/10.0.0.2/tcp/4001"),
            ],
        );

        let targets = store.dial_targets();
        assert_eq!(targets, vec![(peer, addr("/ip4/10.0.0.1/tcp/4001"))]);
    }
}
