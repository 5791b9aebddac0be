use std::sync::{Arc, Mutex as StdMutex, RwLock};

use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use libp2p::PeerId;
use tokio::sync::mpsc;
use ulid::Ulid;
use webrtc::rtp;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};

use crate::control::ControlChannel;
use crate::error::Error;
use crate::participant::Participant;
use crate::session::MediaSession;

/// Per-participant queue depth: roughly one second of 60 fps video plus
/// audio.
pub const PARTICIPANT_QUEUE_DEPTH: usize = 1000;

/// A packet on its way from the ingest reader to one participant's writer.
#[derive(Debug, Default)]
pub struct PacketWrapper {
    pub kind: RTPCodecType,
    pub packet: rtp::packet::Packet,
}

/// Process-wide recycler for packet wrappers, so the hot broadcast path does
/// not allocate per packet per participant. Returns beyond the high-water
/// mark are dropped on the floor.
#[derive(Debug)]
pub struct PacketPool {
    free: StdMutex<Vec<Box<PacketWrapper>>>,
    capacity: usize,
}

impl PacketPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(PacketPool {
            free: StdMutex::new(Vec::new()),
            capacity,
        })
    }

    pub fn get(&self) -> Box<PacketWrapper> {
        self.free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Box::new(PacketWrapper::default()))
    }

    pub fn put(&self, mut wrapper: Box<PacketWrapper>) {
        wrapper.packet.payload = Bytes::new();
        let mut free = self.free.lock().unwrap();
        if free.len() < self.capacity {
            free.push(wrapper);
        }
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// One participant's entry in the fan-out slice.
#[derive(Debug, Clone)]
pub(crate) struct FanOutput {
    pub id: Ulid,
    pub queue: mpsc::Sender<Box<PacketWrapper>>,
}

/// The fan-out engine. Writers (add/remove) serialize on a short mutex and
/// swap in a rebuilt slice; `broadcast` reads the current slice without any
/// lock and never blocks, dropping packets for participants whose queues are
/// full.
pub struct FanOut {
    outputs: ArcSwap<Vec<FanOutput>>,
    edit: StdMutex<()>,
    pool: Arc<PacketPool>,
}

impl std::fmt::Debug for FanOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOut")
            .field("outputs", &self.outputs.load().len())
            .finish()
    }
}

impl FanOut {
    pub fn new(pool: Arc<PacketPool>) -> Self {
        FanOut {
            outputs: ArcSwap::from_pointee(Vec::new()),
            edit: StdMutex::new(()),
            pool,
        }
    }

    pub(crate) fn add(&self, output: FanOutput) {
        let _guard = self.edit.lock().unwrap();
        let mut next = Vec::clone(&self.outputs.load());
        next.push(output);
        self.outputs.store(Arc::new(next));
    }

    pub(crate) fn remove(&self, id: Ulid) {
        let _guard = self.edit.lock().unwrap();
        let mut next = Vec::clone(&self.outputs.load());
        next.retain(|o| o.id != id);
        self.outputs.store(Arc::new(next));
    }

    pub fn clear(&self) {
        let _guard = self.edit.lock().unwrap();
        self.outputs.store(Arc::new(Vec::new()));
    }

    pub fn len(&self) -> usize {
        self.outputs.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.load().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn output_ids(&self) -> Vec<Ulid> {
        self.outputs.load().iter().map(|o| o.id).collect()
    }

    /// One non-blocking send attempt per participant. A full queue costs that
    /// participant the packet and nobody else anything.
    pub fn broadcast(&self, kind: RTPCodecType, packet: &rtp::packet::Packet) {
        let outputs = self.outputs.load();
        for output in outputs.iter() {
            let mut wrapper = self.pool.get();
            wrapper.kind = kind;
            wrapper.packet = packet.clone();

            match output.queue.try_send(wrapper) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(wrapper)) => {
                    self.pool.put(wrapper);
                    tracing::warn!(
                        "participant {} queue full, dropping {} packet",
                        output.id,
                        kind
                    );
                }
                Err(mpsc::error::TrySendError::Closed(wrapper)) => {
                    // Writer already gone; removal follows from the session
                    // close callback.
                    self.pool.put(wrapper);
                }
            }
        }
    }
}

/// Identity of a room, stable for its whole lifetime.
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub id: Ulid,
    pub name: String,
    pub owner_id: PeerId,
    /// Unix milliseconds of the ownership claim; first tie-break key when two
    /// relays claim the same name.
    pub claim_time: u64,
}

/// A named live media session. Online means the inbound media session slot is
/// occupied; codecs are recorded as the producer's tracks arrive and every
/// participant's outbound tracks mirror them.
pub struct Room {
    pub info: RoomInfo,
    // True for rooms this relay pulls from a remote owner on behalf of its
    // local viewers; false for rooms it owns.
    mirror: bool,
    audio_codec: RwLock<Option<RTCRtpCodecCapability>>,
    video_codec: RwLock<Option<RTCRtpCodecCapability>>,
    session: RwLock<Option<Arc<MediaSession>>>,
    control: RwLock<Option<Arc<ControlChannel>>>,
    fanout: FanOut,
    participants: DashMap<Ulid, Arc<Participant>>,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("info", &self.info)
            .field("mirror", &self.mirror)
            .field("online", &self.is_online())
            .field("participants", &self.participants.len())
            .finish()
    }
}

impl Room {
    pub fn new(
        name: String,
        owner_id: PeerId,
        claim_time: u64,
        pool: Arc<PacketPool>,
    ) -> Arc<Self> {
        Self::build(name, owner_id, claim_time, pool, false)
    }

    /// A locally-served mirror of a room owned elsewhere.
    pub(crate) fn new_mirror(
        name: String,
        owner_id: PeerId,
        claim_time: u64,
        pool: Arc<PacketPool>,
    ) -> Arc<Self> {
        Self::build(name, owner_id, claim_time, pool, true)
    }

    fn build(
        name: String,
        owner_id: PeerId,
        claim_time: u64,
        pool: Arc<PacketPool>,
        mirror: bool,
    ) -> Arc<Self> {
        let info = RoomInfo {
            id: Ulid::new(),
            name,
            owner_id,
            claim_time,
        };
        tracing::debug!("room {} ({}) created", info.name, info.id);

        Arc::new(Room {
            info,
            mirror,
            audio_codec: RwLock::new(None),
            video_codec: RwLock::new(None),
            session: RwLock::new(None),
            control: RwLock::new(None),
            fanout: FanOut::new(pool),
            participants: DashMap::new(),
        })
    }

    pub fn is_online(&self) -> bool {
        self.session.read().unwrap().is_some()
    }

    pub fn is_mirror(&self) -> bool {
        self.mirror
    }

    pub fn set_session(&self, session: Arc<MediaSession>) {
        *self.session.write().unwrap() = Some(session);
    }

    pub fn session(&self) -> Option<Arc<MediaSession>> {
        self.session.read().unwrap().clone()
    }

    fn take_session(&self) -> Option<Arc<MediaSession>> {
        self.session.write().unwrap().take()
    }

    pub fn set_control(&self, control: Arc<ControlChannel>) {
        *self.control.write().unwrap() = Some(control);
    }

    pub fn control(&self) -> Option<Arc<ControlChannel>> {
        self.control.read().unwrap().clone()
    }

    pub fn set_codec(&self, kind: RTPCodecType, capability: RTCRtpCodecCapability) {
        match kind {
            RTPCodecType::Audio => *self.audio_codec.write().unwrap() = Some(capability),
            RTPCodecType::Video => *self.video_codec.write().unwrap() = Some(capability),
            _ => tracing::warn!("room {}: unknown track kind {}", self.info.name, kind),
        }
    }

    pub fn codec(&self, kind: RTPCodecType) -> Option<RTCRtpCodecCapability> {
        match kind {
            RTPCodecType::Audio => self.audio_codec.read().unwrap().clone(),
            RTPCodecType::Video => self.video_codec.read().unwrap().clone(),
            _ => None,
        }
    }

    pub fn broadcast(&self, kind: RTPCodecType, packet: &rtp::packet::Packet) {
        self.fanout.broadcast(kind, packet);
    }

    /// Inserts the participant into the fan-out. Called only once its media
    /// session has reached connected.
    pub fn add_participant(&self, participant: Arc<Participant>) {
        tracing::debug!(
            "adding participant {} to room {}",
            participant.id,
            self.info.name
        );
        if let Some(output) = participant.output() {
            self.fanout.add(output);
        }
        self.participants.insert(participant.id, participant);
    }

    pub fn remove_participant_by_id(&self, id: Ulid) {
        self.fanout.remove(id);
        if let Some((_, participant)) = self.participants.remove(&id) {
            tracing::info!(
                "participant {} removed from room {}",
                id,
                self.info.name
            );
            tokio::spawn(async move { participant.close().await });
        }
    }

    pub fn participant_by_session(&self, session_id: &str) -> Option<Arc<Participant>> {
        self.participants
            .iter()
            .find(|p| p.session_id == session_id)
            .map(|p| p.clone())
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Splices a viewer control frame upstream to the producer, verbatim.
    pub async fn forward_to_producer(&self, data: &Bytes) -> Result<(), Error> {
        if let Some(control) = self.control() {
            control.send_binary(data).await
        } else {
            Ok(())
        }
    }

    /// Tears the room down: producer session, control channel, every
    /// participant, and the fan-out slice.
    pub async fn close(&self) {
        tracing::info!("closing room {}", self.info.name);

        if let Some(session) = self.take_session() {
            session.close().await;
        }
        *self.control.write().unwrap() = None;

        let ids: Vec<Ulid> = self.participants.iter().map(|p| *p.key()).collect();
        for id in ids {
            self.fanout.remove(id);
            if let Some((_, participant)) = self.participants.remove(&id) {
                participant.close().await;
            }
        }
        self.fanout.clear();
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        tracing::debug!("room {} ({}) dropped", self.info.name, self.info.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(seq: u16) -> rtp::packet::Packet {
        rtp::packet::Packet {
            header: rtp::header::Header {
                sequence_number: seq,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0xau8; 16]),
        }
    }

    fn output(depth: usize) -> (FanOutput, mpsc::Receiver<Box<PacketWrapper>>) {
        let (tx, rx) = mpsc::channel(depth);
        (
            FanOutput {
                id: Ulid::new(),
                queue: tx,
            },
            rx,
        )
    }

    #[test]
    fn pool_recycles_wrappers() {
        let pool = PacketPool::new(4);
        let w = pool.get();
        pool.put(w);
        assert_eq!(pool.free_count(), 1);
        let _ = pool.get();
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn pool_respects_high_water_mark() {
        let pool = PacketPool::new(2);
        for _ in 0..5 {
            pool.put(Box::new(PacketWrapper::default()));
        }
        assert_eq!(pool.free_count(), 2);
    }

    #[tokio::test]
    async fn add_then_remove_restores_the_slice() {
        let fanout = FanOut::new(PacketPool::new(8));
        let (a, _rx_a) = output(4);
        let (b, _rx_b) = output(4);

        fanout.add(a.clone());
        let before = fanout.output_ids();

        fanout.add(b.clone());
        fanout.remove(b.id);

        assert_eq!(fanout.output_ids(), before);
    }

    #[tokio::test]
    async fn broadcast_preserves_per_output_order() {
        let fanout = FanOut::new(PacketPool::new(8));
        let (out, mut rx) = output(16);
        fanout.add(out);

        for seq in 0..10u16 {
            fanout.broadcast(RTPCodecType::Video, &packet(seq));
        }

        for seq in 0..10u16 {
            let wrapper = rx.recv().await.unwrap();
            assert_eq!(wrapper.packet.header.sequence_number, seq);
        }
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking_ingest() {
        let fanout = FanOut::new(PacketPool::new(8));
        let (slow, mut slow_rx) = output(4);
        let (fast, mut fast_rx) = output(64);
        fanout.add(slow);
        fanout.add(fast);

        // Nobody drains `slow`; ingest must still complete immediately.
        for seq in 0..32u16 {
            fanout.broadcast(RTPCodecType::Video, &packet(seq));
        }

        // The fast output saw every packet in order.
        for seq in 0..32u16 {
            let wrapper = fast_rx.recv().await.unwrap();
            assert_eq!(wrapper.packet.header.sequence_number, seq);
        }

        // The slow output kept only its queue depth, from the front.
        let mut kept = 0;
        while let Ok(wrapper) = slow_rx.try_recv() {
            assert_eq!(wrapper.packet.header.sequence_number, kept);
            kept += 1;
        }
        assert_eq!(kept, 4);
    }

    #[tokio::test]
    async fn sustained_overfeed_does_not_grow_memory() {
        let pool = PacketPool::new(16);
        let fanout = FanOut::new(pool.clone());
        let (out, _rx) = output(PARTICIPANT_QUEUE_DEPTH);
        fanout.add(out);

        // Ten times the queue depth with no consumer: every overflow wrapper
        // must come back to the pool.
        for seq in 0..(PARTICIPANT_QUEUE_DEPTH * 10) {
            fanout.broadcast(RTPCodecType::Video, &packet(seq as u16));
        }
        assert!(pool.free_count() <= 16);
    }

    #[tokio::test]
    async fn room_records_codecs_per_kind() {
        let room = Room::new(
            "alpha".to_string(),
            PeerId::random(),
            1,
            PacketPool::new(8),
        );

        assert!(room.codec(RTPCodecType::Audio).is_none());
        room.set_codec(
            RTPCodecType::Audio,
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
        );

        assert_eq!(
            room.codec(RTPCodecType::Audio).unwrap().mime_type,
            "audio/opus"
        );
        assert!(room.codec(RTPCodecType::Video).is_none());
        assert!(!room.is_online());
    }
}
