use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use libp2p::PeerId;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::{RelayArgs, WebRtcApi};
use crate::error::Error;
use crate::gossip::{self, RelayMetricsMessage, RoomStateMessage, RELAY_METRICS_TOPIC, ROOM_STATE_TOPIC};
use crate::mesh::{self, MeshEvent, MeshHandle};
use crate::metrics::RelayGauges;
use crate::peer::Peerstore;
use crate::protocol::{self, ProtocolContext};
use crate::registry::RoomRegistry;
use crate::room::PacketPool;
use crate::{identity, metrics};

/// Gossip cadence for both topics.
const PUBLISH_INTERVAL: Duration = Duration::from_secs(15);

/// Shared freelist size for packet wrappers across all rooms.
const PACKET_POOL_CAPACITY: usize = 2048;

/// The relay process: identity, peerstore, mesh host, room registry and the
/// two stream protocols, all wired together here and torn down together.
pub struct Relay {
    pub id: PeerId,
    args: RelayArgs,
    pub peerstore: Arc<Peerstore>,
    pub registry: Arc<RoomRegistry>,
    pub mesh: MeshHandle,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay").field("id", &self.id).finish()
    }
}

impl Relay {
    pub async fn new(args: RelayArgs) -> Result<Self, Error> {
        let keypair = identity::load_or_generate(&args.persist_dir, args.regen_identity)?;
        let local_peer = keypair.public().to_peer_id();

        let peerstore = Arc::new(Peerstore::new());
        if let Err(err) = peerstore.load(&args.persist_dir) {
            tracing::warn!("failed to load previous peer store: {}", err);
        }

        let api = Arc::new(WebRtcApi::new(&args).await?);
        let registry = RoomRegistry::new(local_peer, PacketPool::new(PACKET_POOL_CAPACITY));
        let cancel = CancellationToken::new();

        // Metrics endpoint plus the libp2p recorder share one registry.
        let (libp2p_metrics, gauges) = if args.metrics {
            let mut prometheus = prometheus_client::registry::Registry::default();
            let libp2p_metrics = libp2p::metrics::Metrics::new(&mut prometheus);
            let gauges = RelayGauges::register(&mut prometheus);

            let shared = Arc::new(StdMutex::new(prometheus));
            let port = args.metrics_port;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = metrics::serve(port, shared, cancel).await {
                    tracing::error!("metrics server: {}", err);
                }
            });

            (Some(libp2p_metrics), Some(gauges))
        } else {
            (None, None)
        };

        let mesh = mesh::spawn(
            keypair,
            args.port,
            peerstore.clone(),
            libp2p_metrics,
            cancel.clone(),
        )
        .await?;

        let ctx = ProtocolContext::new(api, registry.clone(), mesh.clone(), cancel.clone());
        protocol::spawn_handlers(ctx)?;

        let relay = Relay {
            id: local_peer,
            args,
            peerstore,
            registry,
            mesh,
            cancel,
        };

        relay.spawn_gossip_consumer(gauges.clone());
        relay.spawn_periodic_publisher(gauges);
        relay.reconnect_known_peers().await;

        tracing::info!("relay initialized, id={}", relay.id);
        Ok(relay)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Blocks until shutdown is requested.
    pub async fn run(&self) {
        self.cancel.cancelled().await;
    }

    /// Cancels every task and snapshots the peerstore. Save errors at
    /// shutdown are warnings, not failures.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down relay {}", self.id);
        self.cancel.cancel();

        for room in self.registry.list_local() {
            room.close().await;
        }

        if let Err(err) = self.peerstore.save(&self.args.persist_dir) {
            tracing::warn!("failed to save peer store: {}", err);
        }
    }

    /// Consumes mesh events: gossip for the registry and peerstore, peer
    /// lifecycle for room teardown.
    fn spawn_gossip_consumer(&self, gauges: Option<RelayGauges>) {
        let mut events = self.mesh.events();
        let registry = self.registry.clone();
        let peerstore = self.peerstore.clone();
        let mesh = self.mesh.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };

                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("gossip consumer lagged by {} events", missed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match event {
                    MeshEvent::Gossip { topic, data, .. } if topic == ROOM_STATE_TOPIC => {
                        let msg: RoomStateMessage = match serde_json::from_slice(&data) {
                            Ok(msg) => msg,
                            Err(err) => {
                                tracing::warn!("undecodable room-state message: {}", err);
                                continue;
                            }
                        };
                        if let Ok(sender) = msg.peer_id.parse() {
                            peerstore.set_rooms(sender, msg.rooms.clone());
                        }

                        let lost = registry.apply_room_state(&msg);
                        for room in &lost {
                            tracing::warn!(
                                "closing room '{}' after losing ownership conflict",
                                room.info.name
                            );
                            room.close().await;
                        }
                        if !lost.is_empty() {
                            gossip::publish_room_state(&mesh, &registry).await;
                        }
                    }
                    MeshEvent::Gossip { topic, data, .. } if topic == RELAY_METRICS_TOPIC => {
                        match serde_json::from_slice::<RelayMetricsMessage>(&data) {
                            Ok(msg) => peerstore.merge_metrics(&msg),
                            Err(err) => {
                                tracing::warn!("undecodable relay-metrics message: {}", err)
                            }
                        }
                    }
                    MeshEvent::PeerConnected(_) => {
                        if let Some(gauges) = &gauges {
                            gauges.connected_peers.inc();
                        }
                    }
                    MeshEvent::PeerDisconnected(peer) => {
                        if let Some(gauges) = &gauges {
                            gauges.connected_peers.dec();
                        }
                        let torn_down = registry.on_peer_disconnected(&peer);
                        for room in &torn_down {
                            room.close().await;
                        }
                        if !torn_down.is_empty() {
                            gossip::publish_room_state(&mesh, &registry).await;
                        }
                    }
                    _ => {}
                }
            }
            tracing::debug!("gossip consumer finished");
        });
    }

    /// Publishes `room-state` and `relay-metrics` on a fixed interval and
    /// refreshes the room/participant gauges.
    fn spawn_periodic_publisher(&self, gauges: Option<RelayGauges>) {
        let mesh = self.mesh.clone();
        let registry = self.registry.clone();
        let peerstore = self.peerstore.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PUBLISH_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        gossip::publish_room_state(&mesh, &registry).await;
                        gossip::publish_relay_metrics(&mesh, &peerstore).await;

                        if let Some(gauges) = &gauges {
                            let rooms = registry.list_local();
                            gauges.local_rooms.set(rooms.len() as i64);
                            let participants: usize =
                                rooms.iter().map(|r| r.participant_count()).sum();
                            gauges.participants.set(participants as i64);
                        }
                    }
                }
            }
            tracing::debug!("metrics publisher finished");
        });
    }

    /// Best-effort redial of every peer in the loaded snapshot.
    async fn reconnect_known_peers(&self) {
        for (peer, addr) in self.peerstore.dial_targets() {
            tracing::debug!("reconnecting to known peer {} at {}", peer, addr);
            if let Err(err) = self.mesh.dial(addr).await {
                tracing::warn!("failed to reconnect to {}: {}", peer, err);
            }
        }
    }
}
