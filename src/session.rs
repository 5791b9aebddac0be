use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use ulid::Ulid;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::WebRtcApi;
use crate::control::ControlChannel;
use crate::error::{Error, ResourceErrorKind, TransportErrorKind};

pub type OnIceCandidateFn = Box<dyn Fn(RTCIceCandidate) + Send + Sync>;
pub type OnTrackFn =
    Box<dyn Fn(Arc<TrackRemote>, Arc<RTCRtpReceiver>, Arc<RTCRtpTransceiver>) + Send + Sync>;
pub type OnControlChannelFn = Box<dyn Fn(Arc<ControlChannel>) + Send + Sync>;
pub type OnCloseFn = Box<dyn Fn() + Send + Sync>;
pub type OnConnectedFn = Box<dyn Fn() + Send + Sync>;

/// Candidates received before the remote description is installed. `drain`
/// empties the buffer, so a flush happens exactly once; draining an empty
/// buffer yields nothing and is therefore a no-op.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    list: StdMutex<Vec<RTCIceCandidateInit>>,
}

impl PendingCandidates {
    pub fn push(&self, candidate: RTCIceCandidateInit) {
        self.list.lock().unwrap().push(candidate);
    }

    pub fn drain(&self) -> Vec<RTCIceCandidateInit> {
        std::mem::take(&mut *self.list.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.list.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().unwrap().is_empty()
    }
}

/// One media connection plus its optional control channel. The session owns
/// ICE candidate sequencing and reports terminal connection states through
/// the on-close callback exactly once.
pub struct MediaSession {
    pub id: Ulid,
    peer_connection: Arc<RTCPeerConnection>,
    pending_candidates: Arc<PendingCandidates>,
    control: RwLock<Option<Arc<ControlChannel>>>,
    on_connected: Arc<StdMutex<Option<OnConnectedFn>>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for MediaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSession")
            .field("id", &self.id)
            .field("state", &self.peer_connection.connection_state())
            .finish()
    }
}

impl MediaSession {
    /// Creates a session whose `on_close` runs once, on the first transition
    /// to failed, disconnected or closed. The callback is where the owner
    /// removes the session from its maps and tears down the participant or
    /// room built around it.
    pub async fn new(api: &WebRtcApi, on_close: OnCloseFn) -> Result<Arc<Self>, Error> {
        let peer_connection = Arc::new(api.new_peer_connection().await.map_err(|e| {
            Error::new_resource(
                format!("failed to create media connection: {}", e),
                ResourceErrorKind::SessionCreate,
            )
        })?);

        let id = Ulid::new();
        let closed = Arc::new(AtomicBool::new(false));
        let on_connected: Arc<StdMutex<Option<OnConnectedFn>>> = Arc::new(StdMutex::new(None));

        {
            let pc = peer_connection.clone();
            let closed = closed.clone();
            let on_connected = on_connected.clone();
            let on_close = Arc::new(on_close);
            peer_connection.on_peer_connection_state_change(Box::new(move |state| {
                tracing::debug!("media session {} connection state: {}", id, state);
                let pc = pc.clone();
                let closed = closed.clone();
                let on_connected = on_connected.clone();
                let on_close = on_close.clone();
                Box::pin(async move {
                    match state {
                        RTCPeerConnectionState::Connected => {
                            let callback = on_connected.lock().unwrap().take();
                            if let Some(callback) = callback {
                                callback();
                            }
                        }
                        RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Closed => {
                            if !closed.swap(true, Ordering::SeqCst) {
                                if let Err(err) = pc.close().await {
                                    tracing::error!(
                                        "failed to close media connection {}: {}",
                                        id,
                                        err
                                    );
                                }
                                (*on_close)();
                            }
                        }
                        _ => {}
                    }
                })
            }));
        }

        tracing::debug!("media session {} created", id);

        Ok(Arc::new(MediaSession {
            id,
            peer_connection,
            pending_candidates: Arc::new(PendingCandidates::default()),
            control: RwLock::new(None),
            on_connected,
            closed,
        }))
    }

    /// Runs `callback` once, the first time the connection reaches connected.
    pub fn set_on_connected(&self, callback: OnConnectedFn) {
        *self.on_connected.lock().unwrap() = Some(callback);
    }

    /// Applies the candidate now if the remote description is installed,
    /// otherwise buffers it for the flush that follows installation.
    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        if self.peer_connection.remote_description().await.is_some() {
            self.peer_connection.add_ice_candidate(candidate).await?;
            // Catch any stragglers buffered between the description install
            // and this call.
            self.flush_pending_candidates().await;
        } else {
            tracing::debug!("media session {} buffering ICE candidate", self.id);
            self.pending_candidates.push(candidate);
        }
        Ok(())
    }

    /// Installs the remote description and flushes held candidates.
    pub async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), Error> {
        self.peer_connection
            .set_remote_description(description)
            .await?;
        self.flush_pending_candidates().await;
        Ok(())
    }

    async fn flush_pending_candidates(&self) {
        for candidate in self.pending_candidates.drain() {
            tracing::debug!("media session {} applying held ICE candidate", self.id);
            if let Err(err) = self.peer_connection.add_ice_candidate(candidate).await {
                tracing::error!(
                    "media session {} failed to apply held ICE candidate: {}",
                    self.id,
                    err
                );
            }
        }
    }

    /// Creates the answer for an installed remote offer and returns the local
    /// description (candidates trickle separately).
    pub async fn answer(&self) -> Result<RTCSessionDescription, Error> {
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection.set_local_description(answer).await?;
        self.peer_connection
            .local_description()
            .await
            .ok_or_else(|| {
                Error::new_transport(
                    "local description missing after answer",
                    TransportErrorKind::StreamClosed,
                )
            })
    }

    /// Creates an offer and returns the local description.
    pub async fn offer(&self) -> Result<RTCSessionDescription, Error> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer).await?;
        self.peer_connection
            .local_description()
            .await
            .ok_or_else(|| {
                Error::new_transport(
                    "local description missing after offer",
                    TransportErrorKind::StreamClosed,
                )
            })
    }

    /// Adds an outbound RTP track.
    pub async fn add_track(
        &self,
        track: Arc<TrackLocalStaticRTP>,
    ) -> Result<(), Error> {
        self.peer_connection
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| {
                Error::new_resource(
                    format!("failed to add outbound track: {}", e),
                    ResourceErrorKind::TrackCreate,
                )
            })?;
        Ok(())
    }

    /// Creates the viewer-facing control channel: ordered, with bounded
    /// retransmits so stale input never queues behind fresh input.
    pub async fn create_control_channel(&self, label: &str) -> Result<Arc<ControlChannel>, Error> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            max_retransmits: Some(2),
            ..Default::default()
        };
        let dc = self
            .peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| {
                Error::new_resource(
                    format!("failed to create control channel: {}", e),
                    ResourceErrorKind::ChannelCreate,
                )
            })?;

        let control = ControlChannel::new(dc);
        self.set_control(control.clone());
        Ok(control)
    }

    pub fn set_control(&self, control: Arc<ControlChannel>) {
        *self.control.write().unwrap() = Some(control);
    }

    pub fn control(&self) -> Option<Arc<ControlChannel>> {
        self.control.read().unwrap().clone()
    }

    pub fn on_ice_candidate(&self, callback: OnIceCandidateFn) {
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = candidate {
                    callback(candidate);
                }
                Box::pin(async {})
            }));
    }

    pub fn on_track(&self, callback: OnTrackFn) {
        self.peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  receiver: Arc<RTCRtpReceiver>,
                  transceiver: Arc<RTCRtpTransceiver>| {
                callback(track, receiver, transceiver);
                Box::pin(async {})
            },
        ));
    }

    /// Fires when the remote side opens a data channel towards us (the
    /// producer does this on the push path).
    pub fn on_control_channel(&self, callback: OnControlChannelFn) {
        self.peer_connection.on_data_channel(Box::new(move |dc| {
            let control = ControlChannel::new(dc);
            callback(control);
            Box::pin(async {})
        }));
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.peer_connection.connection_state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(control) = self.control() {
            control.close().await;
        }
        if let Err(err) = self.peer_connection.close().await {
            tracing::debug!("media session {} close: {}", self.id, err);
        }
        tracing::debug!("media session {} closed", self.id);
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        tracing::debug!("media session {} dropped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: format!("candidate:{} 1 udp 2122260223 192.0.2.1 61764 typ host", n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn drain_empties_the_buffer_once() {
        let pending = PendingCandidates::default();
        pending.push(candidate(1));
        pending.push(candidate(2));

        let drained = pending.drain();
        assert_eq!(drained.len(), 2);
        assert!(pending.is_empty());

        // Second flush sees nothing.
        assert!(pending.drain().is_empty());
    }

    #[test]
    fn draining_empty_buffer_is_a_noop() {
        let pending = PendingCandidates::default();
        assert!(pending.drain().is_empty());
        assert!(pending.is_empty());
    }

    #[test]
    fn candidates_buffer_in_arrival_order() {
        let pending = PendingCandidates::default();
        for n in 0..5 {
            pending.push(candidate(n));
        }
        let drained = pending.drain();
        let order: Vec<String> = drained.into_iter().map(|c| c.candidate).collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));
    }
}
