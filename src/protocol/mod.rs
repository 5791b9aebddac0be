/// Push protocol: producer pushes a stream into the relay that will own it.
pub mod push;
/// Request protocol: a viewer or downstream relay pulls a room's stream.
pub mod request;

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use prost::Message;
use tokio_util::sync::CancellationToken;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::WebRtcApi;
use crate::error::{Error, ProtocolErrorKind, TransportErrorKind};
use crate::mesh::MeshHandle;
use crate::registry::RoomRegistry;
use crate::room::Room;
use crate::wire::{
    proto_message, PayloadKind, ProtoIce, ProtoMessage, ProtoSdp, RtcIceCandidateInit,
    RtcSessionDescriptionInit,
};

/// Everything a protocol handler needs, threaded through instead of living
/// in a process-wide singleton.
pub struct ProtocolContext {
    pub api: Arc<WebRtcApi>,
    pub registry: Arc<RoomRegistry>,
    pub mesh: MeshHandle,
    pub cancel: CancellationToken,
    /// Room names with an in-flight upstream fetch, so concurrent viewers
    /// trigger at most one mirror per room.
    pub(crate) fetching: DashMap<String, ()>,
}

impl std::fmt::Debug for ProtocolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolContext")
            .field("registry", &self.registry)
            .finish()
    }
}

impl ProtocolContext {
    pub fn new(
        api: Arc<WebRtcApi>,
        registry: Arc<RoomRegistry>,
        mesh: MeshHandle,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(ProtocolContext {
            api,
            registry,
            mesh,
            cancel,
            fetching: DashMap::new(),
        })
    }
}

/// Registers both stream protocols with the mesh and spawns their accept
/// loops.
pub fn spawn_handlers(ctx: Arc<ProtocolContext>) -> Result<(), Error> {
    let push_incoming = ctx.mesh.accept(push::PROTOCOL_PUSH)?;
    let request_incoming = ctx.mesh.accept(request::PROTOCOL_REQUEST)?;

    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            push::accept_loop(ctx, push_incoming).await;
        });
    }
    tokio::spawn(async move {
        request::accept_loop(ctx, request_incoming).await;
    });

    Ok(())
}

// --- wire <-> webrtc conversions ---

pub(crate) fn sdp_to_wire(description: &RTCSessionDescription) -> proto_message::Payload {
    proto_message::Payload::Sdp(ProtoSdp {
        sdp: Some(RtcSessionDescriptionInit {
            sdp: description.sdp.clone(),
            r#type: description.sdp_type.to_string(),
        }),
    })
}

pub(crate) fn wire_to_sdp(sdp: &ProtoSdp) -> Result<RTCSessionDescription, Error> {
    let init = sdp.sdp.as_ref().ok_or_else(|| {
        Error::new_protocol("sdp frame without description", ProtocolErrorKind::MalformedFrame)
    })?;

    let description = match init.r#type.as_str() {
        "offer" => RTCSessionDescription::offer(init.sdp.clone()),
        "answer" => RTCSessionDescription::answer(init.sdp.clone()),
        "pranswer" => RTCSessionDescription::pranswer(init.sdp.clone()),
        other => {
            return Err(Error::new_protocol(
                format!("unknown sdp type '{}'", other),
                ProtocolErrorKind::MalformedFrame,
            ))
        }
    };
    description.map_err(|e| {
        Error::new_protocol(
            format!("unparsable session description: {}", e),
            ProtocolErrorKind::MalformedFrame,
        )
    })
}

pub(crate) fn ice_to_wire(candidate: &RTCIceCandidateInit) -> proto_message::Payload {
    proto_message::Payload::Ice(ProtoIce {
        candidate: Some(RtcIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index.map(u32::from),
            username_fragment: candidate.username_fragment.clone(),
        }),
    })
}

pub(crate) fn wire_to_ice(ice: &ProtoIce) -> Result<RTCIceCandidateInit, Error> {
    let candidate = ice.candidate.as_ref().ok_or_else(|| {
        Error::new_protocol("ice frame without candidate", ProtocolErrorKind::MalformedFrame)
    })?;

    Ok(RTCIceCandidateInit {
        candidate: candidate.candidate.clone(),
        sdp_mid: candidate.sdp_mid.clone(),
        sdp_mline_index: candidate.sdp_mline_index.map(|idx| idx as u16),
        username_fragment: candidate.username_fragment.clone(),
    })
}

/// Routes one producer feedback frame to the participant its session id
/// names. A closed viewer channel means the viewer is gone; it is removed
/// from the room on the spot.
pub(crate) async fn route_feedback(room: &Arc<Room>, data: Bytes) {
    let frame = match ProtoMessage::decode(data.as_ref()) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::error!(
                "room {}: undecodable controller feedback: {}",
                room.info.name,
                err
            );
            return;
        }
    };

    let Some(proto_message::Payload::ControllerFeedback(feedback)) = &frame.payload else {
        tracing::error!(
            "room {}: controller feedback frame without feedback payload",
            room.info.name
        );
        return;
    };

    let Some(participant) = room.participant_by_session(&feedback.session_id) else {
        tracing::debug!(
            "room {}: feedback for unknown session {}",
            room.info.name,
            feedback.session_id
        );
        return;
    };

    let Some(control) = participant.control() else {
        return;
    };

    match control.send_binary(&data).await {
        Ok(()) => {}
        Err(Error::Transport {
            kind: TransportErrorKind::ChannelClosed,
            ..
        }) => {
            tracing::warn!(
                "room {}: participant {} control channel closed, removing",
                room.info.name,
                participant.id
            );
            room.remove_participant_by_id(participant.id);
        }
        Err(err) => {
            tracing::error!(
                "room {}: failed to forward feedback to {}: {}",
                room.info.name,
                participant.id,
                err
            );
        }
    }
}

/// Wires the room's inbound control channel: feedback frames fan out to the
/// addressed participant only.
pub(crate) fn attach_room_control(room: &Arc<Room>, control: Arc<crate::control::ControlChannel>) {
    room.set_control(control.clone());

    let room = room.clone();
    control.register(
        PayloadKind::ControllerInput,
        Arc::new(move |data: Bytes| {
            let room = room.clone();
            tokio::spawn(async move {
                route_feedback(&room, data).await;
            });
        }),
    );
}
