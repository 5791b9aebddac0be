use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::core::muxing::StreamMuxerBox;
use libp2p::core::transport::Transport;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{
    autonat, dcutr, gossipsub, identify, identity, mdns, noise, ping, relay, tcp, yamux,
    Multiaddr, PeerId, StreamProtocol, Swarm,
};
use libp2p_stream as stream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, TransportErrorKind};
use crate::gossip::{RELAY_METRICS_TOPIC, ROOM_STATE_TOPIC};
use crate::peer::Peerstore;

const IDENTIFY_PROTOCOL: &str = "/relaymesh/id/1.0.0";

#[derive(NetworkBehaviour)]
struct RelayBehaviour {
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    gossipsub: gossipsub::Behaviour,
    mdns: mdns::tokio::Behaviour,
    stream: stream::Behaviour,
    relay: relay::Behaviour,
    relay_client: relay::client::Behaviour,
    dcutr: dcutr::Behaviour,
    autonat: autonat::v2::client::Behaviour,
}

/// Connection and gossip happenings, fanned out to whoever subscribes.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    Gossip {
        topic: String,
        source: Option<PeerId>,
        data: Vec<u8>,
    },
    Latency {
        peer: PeerId,
        rtt: Duration,
    },
    NewListenAddr(Multiaddr),
}

enum MeshCommand {
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
}

/// Cheap clonable handle onto the running swarm task.
#[derive(Clone)]
pub struct MeshHandle {
    peer_id: PeerId,
    commands: mpsc::Sender<MeshCommand>,
    events: broadcast::Sender<MeshEvent>,
    control: stream::Control,
}

impl std::fmt::Debug for MeshHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshHandle")
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

impl MeshHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn events(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub async fn dial(&self, addr: Multiaddr) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(MeshCommand::Dial { addr, reply })
            .await
            .map_err(|_| mesh_gone())?;
        rx.await
            .map_err(|_| mesh_gone())?
            .map_err(|e| Error::new_transport(e, TransportErrorKind::NetworkUnreachable))
    }

    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(MeshCommand::Publish {
                topic: topic.to_string(),
                data,
                reply,
            })
            .await
            .map_err(|_| mesh_gone())?;
        rx.await
            .map_err(|_| mesh_gone())?
            .map_err(|e| Error::new_transport(e, TransportErrorKind::NetworkUnreachable))
    }

    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>, Error> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(MeshCommand::ListenAddrs { reply })
            .await
            .map_err(|_| mesh_gone())?;
        rx.await.map_err(|_| mesh_gone())
    }

    /// Opens an outbound framed-protocol stream to `peer`.
    pub async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<libp2p::Stream, Error> {
        let mut control = self.control.clone();
        control.open_stream(peer, protocol).await.map_err(|e| {
            Error::new_transport(
                format!("failed to open stream: {}", e),
                TransportErrorKind::NetworkUnreachable,
            )
        })
    }

    /// Registers this node as a handler for `protocol` and returns the
    /// stream of inbound conversations.
    pub fn accept(&self, protocol: StreamProtocol) -> Result<stream::IncomingStreams, Error> {
        let mut control = self.control.clone();
        control.accept(protocol).map_err(|e| {
            Error::new_transport(
                format!("protocol already registered: {}", e),
                TransportErrorKind::StreamClosed,
            )
        })
    }
}

fn mesh_gone() -> Error {
    Error::new_transport("mesh task is gone", TransportErrorKind::StreamClosed)
}

/// Builds the libp2p host (TCP, QUIC, WebSocket, WebRTC-direct, all under
/// noise+yamux where applicable), subscribes the gossip topics, starts
/// listening and spawns the swarm loop. Listen bind failures are fatal.
pub async fn spawn(
    keypair: identity::Keypair,
    port: u16,
    peerstore: Arc<Peerstore>,
    metrics: Option<libp2p::metrics::Metrics>,
    cancel: CancellationToken,
) -> Result<MeshHandle, Error> {
    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| fatal(format!("tcp transport: {}", e)))?
        .with_quic()
        .with_other_transport(|key| {
            let certificate = libp2p_webrtc::tokio::Certificate::generate(&mut rand::thread_rng())?;
            Ok(libp2p_webrtc::tokio::Transport::new(key.clone(), certificate)
                .map(|(peer_id, conn), _| (peer_id, StreamMuxerBox::new(conn))))
        })
        .map_err(|e| fatal(format!("webrtc transport: {}", e)))?
        .with_dns()
        .map_err(|e| fatal(format!("dns transport: {}", e)))?
        .with_websocket(noise::Config::new, yamux::Config::default)
        .await
        .map_err(|e| fatal(format!("websocket transport: {}", e)))?
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| fatal(format!("relay client: {}", e)))?
        .with_behaviour(|key, relay_client| {
            let local_peer_id = key.public().to_peer_id();

            let gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(key.clone()),
                gossipsub::ConfigBuilder::default()
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .build()?,
            )?;

            Ok(RelayBehaviour {
                identify: identify::Behaviour::new(identify::Config::new(
                    IDENTIFY_PROTOCOL.to_string(),
                    key.public(),
                )),
                ping: ping::Behaviour::new(ping::Config::new()),
                gossipsub,
                mdns: mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?,
                stream: stream::Behaviour::new(),
                relay: relay::Behaviour::new(local_peer_id, relay::Config::default()),
                relay_client,
                dcutr: dcutr::Behaviour::new(local_peer_id),
                autonat: autonat::v2::client::Behaviour::default(),
            })
        })
        .map_err(|e| fatal(format!("behaviour: {}", e)))?
        .with_swarm_config(|config| config.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    for topic in [ROOM_STATE_TOPIC, RELAY_METRICS_TOPIC] {
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&gossipsub::IdentTopic::new(topic))
            .map_err(|e| fatal(format!("failed to subscribe '{}': {:?}", topic, e)))?;
    }

    // TCP and QUIC share the base port; WebSocket and WebRTC-direct listen
    // one above since separate listeners cannot share it.
    let listen_addrs = [
        format!("/ip4/0.0.0.0/tcp/{}", port),
        format!("/ip6/::/tcp/{}", port),
        format!("/ip4/0.0.0.0/udp/{}/quic-v1", port),
        format!("/ip6/::/udp/{}/quic-v1", port),
        format!("/ip4/0.0.0.0/tcp/{}/ws", port + 1),
        format!("/ip6/::/tcp/{}/ws", port + 1),
        format!("/ip4/0.0.0.0/udp/{}/webrtc-direct", port + 1),
        format!("/ip6/::/udp/{}/webrtc-direct", port + 1),
    ];
    for addr in listen_addrs {
        let addr: Multiaddr = addr
            .parse()
            .map_err(|e| fatal(format!("invalid listen addr '{}': {}", addr, e)))?;
        swarm
            .listen_on(addr.clone())
            .map_err(|e| fatal(format!("failed to listen on {}: {}", addr, e)))?;
    }

    let peer_id = *swarm.local_peer_id();
    let control = swarm.behaviour().stream.new_control();
    let (command_tx, command_rx) = mpsc::channel(64);
    let (event_tx, _) = broadcast::channel(256);

    {
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            swarm_loop(swarm, command_rx, event_tx, peerstore, metrics, cancel).await;
        });
    }

    tracing::info!("mesh node {} started", peer_id);

    Ok(MeshHandle {
        peer_id,
        commands: command_tx,
        events: event_tx,
        control,
    })
}

fn fatal(message: String) -> Error {
    Error::new_transport(message, TransportErrorKind::NetworkUnreachable)
}

async fn swarm_loop(
    mut swarm: Swarm<RelayBehaviour>,
    mut commands: mpsc::Receiver<MeshCommand>,
    events: broadcast::Sender<MeshEvent>,
    peerstore: Arc<Peerstore>,
    metrics: Option<libp2p::metrics::Metrics>,
    cancel: CancellationToken,
) {
    let local_peer_id = *swarm.local_peer_id();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("mesh loop stopping");
                break;
            }
            command = commands.recv() => {
                let Some(command) = command else { break };
                handle_command(&mut swarm, command);
            }
            event = swarm.select_next_some() => {
                if let Some(metrics) = &metrics {
                    use libp2p::metrics::Recorder;
                    metrics.record(&event);
                }
                handle_swarm_event(&mut swarm, event, &events, &peerstore, &local_peer_id);
            }
        }
    }
}

fn handle_command(swarm: &mut Swarm<RelayBehaviour>, command: MeshCommand) {
    match command {
        MeshCommand::Dial { addr, reply } => {
            let result = swarm.dial(addr).map_err(|e| e.to_string());
            let _ = reply.send(result);
        }
        MeshCommand::Publish { topic, data, reply } => {
            let result = match swarm
                .behaviour_mut()
                .gossipsub
                .publish(gossipsub::IdentTopic::new(topic), data)
            {
                Ok(_) => Ok(()),
                Err(gossipsub::PublishError::InsufficientPeers) => {
                    // A lone relay has nobody to tell; not a failure.
                    Ok(())
                }
                Err(e) => Err(e.to_string()),
            };
            let _ = reply.send(result);
        }
        MeshCommand::ListenAddrs { reply } => {
            let addrs = swarm.listeners().cloned().collect();
            let _ = reply.send(addrs);
        }
    }
}

fn handle_swarm_event(
    swarm: &mut Swarm<RelayBehaviour>,
    event: SwarmEvent<RelayBehaviourEvent>,
    events: &broadcast::Sender<MeshEvent>,
    peerstore: &Peerstore,
    local_peer_id: &PeerId,
) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            tracing::info!(
                "Listening on '{}/p2p/{}'",
                address,
                local_peer_id
            );
            let _ = events.send(MeshEvent::NewListenAddr(address));
        }
        SwarmEvent::ConnectionEstablished {
            peer_id, endpoint, ..
        } => {
            tracing::info!("Connection established with peer {}", peer_id);
            peerstore.observe(peer_id, vec![endpoint.get_remote_address().clone()]);
            let _ = events.send(MeshEvent::PeerConnected(peer_id));
        }
        SwarmEvent::ConnectionClosed {
            peer_id,
            num_established,
            cause,
            ..
        } => {
            if let Some(cause) = cause {
                tracing::debug!("Connection with {} closed: {}", peer_id, cause);
            }
            if num_established == 0 {
                tracing::info!("Peer {} disconnected", peer_id);
                let _ = events.send(MeshEvent::PeerDisconnected(peer_id));
            }
        }
        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => match peer_id {
            Some(peer_id) => tracing::warn!("Failed to connect to {}: {}", peer_id, error),
            None => tracing::warn!("Failed to connect: {}", error),
        },
        SwarmEvent::ExternalAddrConfirmed { address } => {
            tracing::info!("Confirmed external address {}", address);
        }
        SwarmEvent::Behaviour(RelayBehaviourEvent::Gossipsub(gossipsub::Event::Message {
            message,
            ..
        })) => {
            let _ = events.send(MeshEvent::Gossip {
                topic: message.topic.as_str().to_string(),
                source: message.source,
                data: message.data,
            });
        }
        SwarmEvent::Behaviour(RelayBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
            for (peer_id, addr) in peers {
                tracing::debug!("mDNS discovered {} at {}", peer_id, addr);
                peerstore.observe(peer_id, vec![addr.clone()]);
                if let Err(err) = swarm.dial(addr) {
                    tracing::debug!("failed to dial mDNS peer {}: {}", peer_id, err);
                }
            }
        }
        SwarmEvent::Behaviour(RelayBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
            for (peer_id, _) in peers {
                tracing::trace!("mDNS record for {} expired", peer_id);
            }
        }
        SwarmEvent::Behaviour(RelayBehaviourEvent::Ping(ping::Event {
            peer, result, ..
        })) => {
            if let Ok(rtt) = result {
                peerstore.record_latency(peer, rtt);
                let _ = events.send(MeshEvent::Latency { peer, rtt });
            }
        }
        SwarmEvent::Behaviour(RelayBehaviourEvent::Identify(identify::Event::Received {
            peer_id,
            info,
            ..
        })) => {
            peerstore.observe(peer_id, info.listen_addrs);
            swarm.add_external_address(info.observed_addr);
        }
        SwarmEvent::Behaviour(RelayBehaviourEvent::Autonat(event)) => {
            match event.result {
                Ok(()) => tracing::debug!(
                    "autonat: server {} verified address {}",
                    event.server,
                    event.tested_addr
                ),
                Err(err) => tracing::debug!(
                    "autonat: server {} could not verify {}: {}",
                    event.server,
                    event.tested_addr,
                    err
                ),
            }
        }
        SwarmEvent::Behaviour(RelayBehaviourEvent::Dcutr(event)) => {
            tracing::debug!("dcutr: {:?}", event);
        }
        _ => {}
    }
}
