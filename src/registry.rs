use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use libp2p::PeerId;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::error::{Error, StateErrorKind};
use crate::gossip::{RoomStateEntry, RoomStateMessage};
use crate::room::{PacketPool, Room};

/// A mesh-wide ownership claim for a room name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipClaim {
    pub owner: PeerId,
    pub claim_time: u64,
}

impl OwnershipClaim {
    /// True when this claim beats `other`: earlier claim first, then the
    /// numerically smaller peer id.
    fn wins_over(&self, other: &OwnershipClaim) -> bool {
        match self.claim_time.cmp(&other.claim_time) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => self.owner.to_bytes() < other.owner.to_bytes(),
        }
    }
}

/// Maps room names to rooms and tracks who owns which name across the mesh.
/// The ownership index converges through `room-state` gossip; conflicting
/// claims resolve deterministically on every relay.
pub struct RoomRegistry {
    local_peer: PeerId,
    rooms: DashMap<Ulid, Arc<Room>>,
    names: DashMap<String, Ulid>,
    index: DashMap<String, OwnershipClaim>,
    session_ids: StdMutex<ulid::Generator>,
    pool: Arc<PacketPool>,
    offline_tx: broadcast::Sender<String>,
}

impl std::fmt::Debug for RoomRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomRegistry")
            .field("local_peer", &self.local_peer)
            .field("rooms", &self.rooms.len())
            .field("index", &self.index.len())
            .finish()
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl RoomRegistry {
    pub fn new(local_peer: PeerId, pool: Arc<PacketPool>) -> Arc<Self> {
        let (offline_tx, _) = broadcast::channel(64);
        Arc::new(RoomRegistry {
            local_peer,
            rooms: DashMap::new(),
            names: DashMap::new(),
            index: DashMap::new(),
            session_ids: StdMutex::new(ulid::Generator::new()),
            pool,
            offline_tx,
        })
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// The process-wide packet pool shared by every room's fan-out.
    pub fn pool(&self) -> Arc<PacketPool> {
        self.pool.clone()
    }

    /// Creates a locally-owned room and claims its name. Fails with
    /// `NameTaken` when another relay holds the name with an online room.
    /// The index itself has no online bit, so a standing foreign claim
    /// counts as online unless this relay can see the room locally (as a
    /// mirror) and it is offline; such a dead mirror is reclaimed.
    pub fn create(&self, name: &str) -> Result<Arc<Room>, Error> {
        let foreign_claim = self
            .index
            .get(name)
            .map(|claim| claim.owner != self.local_peer)
            .unwrap_or(false);
        if foreign_claim {
            match self.get_by_name(name) {
                Some(room) if !room.is_online() => {
                    tracing::info!(
                        "reclaiming room name '{}': foreign claim has no online backing",
                        name
                    );
                    self.rooms.remove(&room.info.id);
                    self.names.remove(name);
                    self.index.remove(name);
                    let _ = self.offline_tx.send(name.to_string());
                }
                _ => {
                    return Err(Error::new_state(
                        format!("room name '{}' is held by another relay", name),
                        StateErrorKind::NameTaken,
                    ))
                }
            }
        }
        if let Some(existing) = self.get_by_name(name) {
            return Ok(existing);
        }

        let claim_time = now_millis();
        let room = Room::new(name.to_string(), self.local_peer, claim_time, self.pool.clone());
        self.names.insert(name.to_string(), room.info.id);
        self.rooms.insert(room.info.id, room.clone());
        self.index.insert(
            name.to_string(),
            OwnershipClaim {
                owner: self.local_peer,
                claim_time,
            },
        );

        tracing::info!("created room '{}'", name);
        Ok(room)
    }

    /// Registers a locally-served mirror of a remote room. The ownership
    /// index keeps pointing at the remote owner.
    pub fn insert_mirror(&self, name: &str, owner: PeerId, claim_time: u64) -> Arc<Room> {
        let room = Room::new_mirror(name.to_string(), owner, claim_time, self.pool.clone());
        self.names.insert(name.to_string(), room.info.id);
        self.rooms.insert(room.info.id, room.clone());
        tracing::info!("mirroring room '{}' owned by {}", name, owner);
        room
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Room>> {
        self.names
            .get(name)
            .and_then(|id| self.rooms.get(&id).map(|r| r.clone()))
    }

    pub fn get_by_id(&self, id: &Ulid) -> Option<Arc<Room>> {
        self.rooms.get(id).map(|r| r.clone())
    }

    pub fn list_local(&self) -> Vec<Arc<Room>> {
        self.rooms.iter().map(|r| r.clone()).collect()
    }

    /// Local rooms first, then the mesh-wide index.
    pub fn resolve_owner(&self, name: &str) -> Option<PeerId> {
        if let Some(room) = self.get_by_name(name) {
            return Some(room.info.owner_id);
        }
        self.index.get(name).map(|claim| claim.owner)
    }

    pub fn ownership_claim(&self, name: &str) -> Option<OwnershipClaim> {
        self.index.get(name).map(|c| c.clone())
    }

    /// Drops the room from the maps; the caller is responsible for closing
    /// it. The name's claim is released only when we held it.
    pub fn remove_room(&self, room: &Room) {
        self.rooms.remove(&room.info.id);
        self.names.remove(&room.info.name);
        if room.info.owner_id == self.local_peer {
            self.index.remove(&room.info.name);
        }
        let _ = self.offline_tx.send(room.info.name.clone());
    }

    /// Mid-handshake viewers subscribe here to learn that a room went
    /// offline before their session came up.
    pub fn subscribe_offline(&self) -> broadcast::Receiver<String> {
        self.offline_tx.subscribe()
    }

    /// Monotonic lexicographic session ids: a later id always sorts after an
    /// earlier one, even within the same millisecond.
    pub fn new_session_id(&self) -> String {
        let mut generator = self.session_ids.lock().unwrap();
        match generator.generate() {
            Ok(ulid) => ulid.to_string(),
            Err(_) => Ulid::new().to_string(),
        }
    }

    /// Consumes one `room-state` gossip message. Returns the local rooms that
    /// lost an ownership conflict; the caller must close them and republish.
    pub fn apply_room_state(&self, msg: &RoomStateMessage) -> Vec<Arc<Room>> {
        let Ok(sender) = PeerId::from_str(&msg.peer_id) else {
            tracing::warn!("room-state message with invalid peer id: {}", msg.peer_id);
            return Vec::new();
        };
        if sender == self.local_peer {
            return Vec::new();
        }

        let mut lost = Vec::new();

        for entry in &msg.rooms {
            let Ok(owner) = PeerId::from_str(&entry.owner_id) else {
                continue;
            };
            let incoming = OwnershipClaim {
                owner,
                claim_time: entry.claim_time,
            };

            match self.index.get(&entry.name).map(|c| c.clone()) {
                None => {
                    self.index.insert(entry.name.clone(), incoming);
                }
                Some(existing) if existing.owner == incoming.owner => {
                    if incoming.claim_time < existing.claim_time {
                        self.index.insert(entry.name.clone(), incoming);
                    }
                }
                Some(existing) => {
                    if incoming.wins_over(&existing) {
                        tracing::warn!(
                            "room '{}' ownership conflict: {} (claim {}) beats {} (claim {})",
                            entry.name,
                            incoming.owner,
                            incoming.claim_time,
                            existing.owner,
                            existing.claim_time
                        );
                        self.index.insert(entry.name.clone(), incoming);
                        if existing.owner == self.local_peer {
                            if let Some(room) = self.get_by_name(&entry.name) {
                                self.rooms.remove(&room.info.id);
                                self.names.remove(&entry.name);
                                let _ = self.offline_tx.send(entry.name.clone());
                                lost.push(room);
                            }
                        }
                    }
                }
            }
        }

        // Claims the sender no longer lists are withdrawn; any local mirror
        // of a withdrawn room comes down with it.
        let withdrawn: Vec<String> = self
            .index
            .iter()
            .filter(|entry| {
                entry.value().owner == sender
                    && !msg.rooms.iter().any(|r| r.name == *entry.key())
            })
            .map(|entry| entry.key().clone())
            .collect();
        for name in withdrawn {
            self.index.remove(&name);
            if let Some(room) = self.get_by_name(&name) {
                if room.info.owner_id == sender {
                    self.rooms.remove(&room.info.id);
                    self.names.remove(&name);
                    let _ = self.offline_tx.send(name.clone());
                    lost.push(room);
                }
            }
        }

        lost
    }

    /// Removes every trace of a disconnected peer: its index claims and any
    /// local mirror rooms it was feeding. Returned rooms need closing.
    pub fn on_peer_disconnected(&self, peer: &PeerId) -> Vec<Arc<Room>> {
        let names: Vec<String> = self
            .index
            .iter()
            .filter(|entry| entry.value().owner == *peer)
            .map(|entry| entry.key().clone())
            .collect();

        let mut torn_down = Vec::new();
        for name in names {
            self.index.remove(&name);
            if let Some(room) = self.get_by_name(&name) {
                if room.info.owner_id == *peer {
                    self.rooms.remove(&room.info.id);
                    self.names.remove(&name);
                    let _ = self.offline_tx.send(name.clone());
                    torn_down.push(room);
                }
            }
        }
        torn_down
    }

    /// The local claim set for `room-state` publication.
    pub fn snapshot(&self) -> Vec<RoomStateEntry> {
        self.rooms
            .iter()
            .map(|room| RoomStateEntry {
                id: room.info.id.to_string(),
                name: room.info.name.clone(),
                owner_id: room.info.owner_id.to_string(),
                claim_time: room.info.claim_time,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (Arc<RoomRegistry>, PeerId) {
        let local = PeerId::random();
        (RoomRegistry::new(local, PacketPool::new(8)), local)
    }

    fn state_msg(peer: PeerId, rooms: Vec<(&str, PeerId, u64)>) -> RoomStateMessage {
        RoomStateMessage {
            peer_id: peer.to_string(),
            rooms: rooms
                .into_iter()
                .map(|(name, owner, claim_time)| RoomStateEntry {
                    id: Ulid::new().to_string(),
                    name: name.to_string(),
                    owner_id: owner.to_string(),
                    claim_time,
                })
                .collect(),
        }
    }

    #[test]
    fn create_then_resolve_locally() {
        let (registry, local) = registry();
        let room = registry.create("alpha").unwrap();

        assert_eq!(registry.resolve_owner("alpha"), Some(local));
        assert!(Arc::ptr_eq(&registry.get_by_name("alpha").unwrap(), &room));
        assert!(Arc::ptr_eq(
            &registry.get_by_id(&room.info.id).unwrap(),
            &room
        ));
    }

    #[test]
    fn create_reclaims_name_from_offline_foreign_claim() {
        let (registry, local) = registry();
        let remote = PeerId::random();

        registry.apply_room_state(&state_msg(remote, vec![("alpha", remote, 5)]));
        // An offline mirror is local proof the claim has no online backing.
        let mirror = registry.insert_mirror("alpha", remote, 5);
        assert!(mirror.is_mirror());
        assert!(!mirror.is_online());

        let room = registry.create("alpha").unwrap();
        assert_eq!(room.info.owner_id, local);
        assert!(!room.is_mirror());
        assert_eq!(registry.resolve_owner("alpha"), Some(local));
    }

    #[test]
    fn foreign_claim_blocks_create() {
        let (registry, _) = registry();
        let remote = PeerId::random();
        registry.apply_room_state(&state_msg(remote, vec![("alpha", remote, 5)]));

        let err = registry.create("alpha").unwrap_err();
        assert!(matches!(
            err,
            Error::State {
                kind: StateErrorKind::NameTaken,
                ..
            }
        ));
        assert_eq!(registry.resolve_owner("alpha"), Some(remote));
    }

    #[test]
    fn earlier_claim_wins_conflict() {
        let (registry, local) = registry();
        let room = registry.create("charlie").unwrap();
        let earlier = room.info.claim_time - 10;

        let remote = PeerId::random();
        let lost = registry.apply_room_state(&state_msg(remote, vec![("charlie", remote, earlier)]));

        assert_eq!(lost.len(), 1);
        assert!(Arc::ptr_eq(&lost[0], &room));
        assert_eq!(registry.resolve_owner("charlie"), Some(remote));
        assert_ne!(registry.resolve_owner("charlie"), Some(local));
        assert!(registry.get_by_name("charlie").is_none());
    }

    #[test]
    fn later_claim_loses_conflict() {
        let (registry, local) = registry();
        let room = registry.create("charlie").unwrap();

        let remote = PeerId::random();
        let lost = registry.apply_room_state(&state_msg(
            remote,
            vec![("charlie", remote, room.info.claim_time + 1000)],
        ));

        assert!(lost.is_empty());
        assert_eq!(registry.resolve_owner("charlie"), Some(local));
    }

    #[test]
    fn equal_claims_fall_back_to_smaller_peer_id() {
        let (registry, local) = registry();
        let room = registry.create("charlie").unwrap();

        // Find a remote id on the winning side of the tie-break.
        let remote = loop {
            let candidate = PeerId::random();
            if candidate.to_bytes() < local.to_bytes() {
                break candidate;
            }
        };

        let lost = registry.apply_room_state(&state_msg(
            remote,
            vec![("charlie", remote, room.info.claim_time)],
        ));
        assert_eq!(lost.len(), 1);
        assert_eq!(registry.resolve_owner("charlie"), Some(remote));
    }

    #[test]
    fn withdrawn_claims_clear_the_index() {
        let (registry, _) = registry();
        let remote = PeerId::random();

        registry.apply_room_state(&state_msg(remote, vec![("alpha", remote, 5)]));
        assert_eq!(registry.resolve_owner("alpha"), Some(remote));

        registry.apply_room_state(&state_msg(remote, vec![]));
        assert_eq!(registry.resolve_owner("alpha"), None);
    }

    #[test]
    fn disconnect_tears_down_mirrors_and_claims() {
        let (registry, _) = registry();
        let remote = PeerId::random();

        registry.apply_room_state(&state_msg(remote, vec![("alpha", remote, 5)]));
        registry.insert_mirror("alpha", remote, 5);

        let torn_down = registry.on_peer_disconnected(&remote);
        assert_eq!(torn_down.len(), 1);
        assert!(registry.get_by_name("alpha").is_none());
        assert_eq!(registry.resolve_owner("alpha"), None);
    }

    #[test]
    fn offline_event_fires_on_room_removal() {
        let (registry, _) = registry();
        let mut rx = registry.subscribe_offline();
        let room = registry.create("alpha").unwrap();

        registry.remove_room(&room);
        assert_eq!(rx.try_recv().unwrap(), "alpha");
        assert_eq!(registry.resolve_owner("alpha"), None);
    }

    #[test]
    fn session_ids_are_monotonic() {
        let (registry, _) = registry();
        let ids: Vec<String> = (0..64).map(|_| registry.new_session_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
