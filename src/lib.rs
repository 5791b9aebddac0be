#![deny(missing_debug_implementations)]
//! # relaymesh
//! A peer-to-peer media relay. Relays form a mesh and gossip which rooms
//! they own; a producer pushes one live audio/video stream plus a control
//! channel into the relay owning its room, and any number of viewers pull
//! that stream through the same relay or a neighbouring one. Media fans out
//! through per-viewer bounded queues that drop under backpressure rather
//! than stall the ingest path.

/// CLI flags and the process-wide WebRTC engine.
pub mod config;
/// Control channel wrapper and producer/viewer message splicing.
pub mod control;
pub mod error;
/// Gossip topic payloads and publishers.
pub mod gossip;
/// Identity key load and generation.
pub mod identity;
/// libp2p host: transports, behaviours, swarm loop, pubsub.
pub mod mesh;
/// Optional Prometheus endpoint.
pub mod metrics;
/// Per-viewer runtime record and its writer task.
pub mod participant;
/// Peer records and the peerstore snapshot.
pub mod peer;
/// The push and request stream protocols.
pub mod protocol;
/// Room registry and the mesh-wide ownership index.
pub mod registry;
/// Top-level wiring of the relay process.
pub mod relay;
/// Room record, fan-out engine and packet pool.
pub mod room;
/// Media session with held-candidate sequencing.
pub mod session;
/// Wire frame schema and length-prefixed framing.
pub mod wire;
