use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use libp2p::PeerId;
use tokio::sync::mpsc;
use ulid::Ulid;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use crate::control::ControlChannel;
use crate::room::{FanOutput, PacketPool, PacketWrapper, PARTICIPANT_QUEUE_DEPTH};
use crate::session::MediaSession;

/// One viewer's runtime record on the owning relay: an outbound media
/// session, two static tracks matching the room's codecs, a bounded packet
/// queue and the writer task that drains it. The session id survives
/// reconnect attempts; the participant id does not.
pub struct Participant {
    pub id: Ulid,
    pub session_id: String,
    pub peer_id: PeerId,
    session: Arc<MediaSession>,
    queue: StdMutex<Option<mpsc::Sender<Box<PacketWrapper>>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

impl Participant {
    pub fn new(
        session_id: String,
        peer_id: PeerId,
        session: Arc<MediaSession>,
        audio_track: Arc<TrackLocalStaticRTP>,
        video_track: Arc<TrackLocalStaticRTP>,
        pool: Arc<PacketPool>,
    ) -> Arc<Self> {
        let id = Ulid::new();
        let (tx, rx) = mpsc::channel(PARTICIPANT_QUEUE_DEPTH);

        tokio::spawn(async move {
            Self::writer_loop(id, rx, audio_track, video_track, pool).await;
        });

        tracing::debug!("participant {} created, session={}", id, session_id);

        Arc::new(Participant {
            id,
            session_id,
            peer_id,
            session,
            queue: StdMutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        })
    }

    /// The fan-out entry for this participant, or `None` once closed.
    pub(crate) fn output(&self) -> Option<FanOutput> {
        self.queue
            .lock()
            .unwrap()
            .as_ref()
            .map(|queue| FanOutput {
                id: self.id,
                queue: queue.clone(),
            })
    }

    pub fn control(&self) -> Option<Arc<ControlChannel>> {
        self.session.control()
    }

    pub fn session(&self) -> Arc<MediaSession> {
        self.session.clone()
    }

    /// Idempotent teardown: closes the queue (ending the writer once it has
    /// drained), then the media session with its tracks and channel.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.lock().unwrap().take();
        self.session.close().await;
        tracing::debug!("participant {} closed", self.id);
    }

    /// Drains the bounded queue onto the outbound tracks. Write failures
    /// other than a closed pipe are logged and the loop continues; connection
    /// loss surfaces through the media session's own state callback.
    async fn writer_loop(
        id: Ulid,
        mut rx: mpsc::Receiver<Box<PacketWrapper>>,
        audio_track: Arc<TrackLocalStaticRTP>,
        video_track: Arc<TrackLocalStaticRTP>,
        pool: Arc<PacketPool>,
    ) {
        tracing::debug!("participant {} writer started", id);

        while let Some(wrapper) = rx.recv().await {
            let track = match wrapper.kind {
                RTPCodecType::Audio => &audio_track,
                _ => &video_track,
            };

            match track.write_rtp(&wrapper.packet).await {
                Ok(_) => {}
                Err(webrtc::Error::ErrClosedPipe) => {}
                Err(err) => {
                    tracing::error!("participant {} failed to write rtp: {}", id, err);
                }
            }

            pool.put(wrapper);
        }

        tracing::debug!("participant {} writer finished", id);
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        tracing::debug!("participant {} dropped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use clap::Parser;
    use webrtc::rtp;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    use crate::config::{RelayArgs, WebRtcApi};
    use crate::session::MediaSession;

    fn track(mime: &str) -> Arc<TrackLocalStaticRTP> {
        Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            "test-track".to_string(),
            "test-stream".to_string(),
        ))
    }

    async fn participant() -> Arc<Participant> {
        let args = RelayArgs::parse_from(["relaymesh"]);
        let api = WebRtcApi::new(&args).await.unwrap();
        let session = MediaSession::new(&api, Box::new(|| {})).await.unwrap();
        Participant::new(
            "01J00000000000000000000000".to_string(),
            PeerId::random(),
            session,
            track("audio/opus"),
            track("video/H264"),
            PacketPool::new(8),
        )
    }

    #[tokio::test]
    async fn writer_drains_queue_and_stops_on_close() {
        let participant = participant().await;
        let output = participant.output().unwrap();

        for seq in 0..16u16 {
            let wrapper = Box::new(PacketWrapper {
                kind: RTPCodecType::Video,
                packet: rtp::packet::Packet {
                    header: rtp::header::Header {
                        sequence_number: seq,
                        ..Default::default()
                    },
                    payload: Bytes::from_static(&[0u8; 8]),
                },
            });
            output.queue.send(wrapper).await.unwrap();
        }

        participant.close().await;
        // Close is latched; a second call is a no-op.
        participant.close().await;

        assert!(participant.output().is_none());
        // The writer's end of the queue shuts down once the room's clone of
        // the sender goes away too.
        drop(output);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
