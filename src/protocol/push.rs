use std::sync::Arc;

use futures::StreamExt;
use libp2p::{PeerId, StreamProtocol};
use libp2p_stream::IncomingStreams;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::error::{Error, StateErrorKind};
use crate::gossip;
use crate::room::Room;
use crate::session::MediaSession;
use crate::wire::{
    create_message, frame_kind, proto_message, FramedStream, PayloadKind, ProtoRaw,
    ProtoServerPushStream, REJECT_ALREADY_ONLINE, REJECT_NOT_OWNER,
};

use super::{attach_room_control, ice_to_wire, sdp_to_wire, wire_to_ice, wire_to_sdp, ProtocolContext};

pub const PROTOCOL_PUSH: StreamProtocol = StreamProtocol::new("/relaymesh/stream-push/1.0.0");

/// Handshake progress on one inbound push stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushState {
    Init,
    RoomBound,
    Offered,
}

pub(crate) async fn accept_loop(ctx: Arc<ProtocolContext>, mut incoming: IncomingStreams) {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            next = incoming.next() => {
                let Some((peer, stream)) = next else { break };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    handle_push(ctx, peer, FramedStream::new(stream)).await;
                });
            }
        }
    }
    tracing::debug!("push accept loop finished");
}

/// Runs the push conversation: `Init -> RoomBound -> Offered`, with the
/// media engine driving the final hop to connected. Stream EOF at any point
/// destroys the room.
async fn handle_push(
    ctx: Arc<ProtocolContext>,
    peer: PeerId,
    framed: FramedStream<libp2p::Stream>,
) {
    let mut state = PushState::Init;
    let mut room: Option<Arc<Room>> = None;
    // Candidates that raced ahead of the offer; handed to the session as
    // soon as it exists.
    let mut early_candidates: Vec<RTCIceCandidateInit> = Vec::new();

    loop {
        let frame = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            frame = framed.recv() => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(Error::Io(_)) | Err(Error::Transport { .. }) => {
                tracing::debug!("push stream from {} closed", peer);
                break;
            }
            Err(err) => {
                tracing::error!("failed to receive push frame from {}: {}", peer, err);
                break;
            }
        };

        let kind = match frame_kind(&frame) {
            Ok(kind) => kind,
            Err(err) => {
                tracing::error!("push stream from {}: {}", peer, err);
                break;
            }
        };

        match (state, kind) {
            (PushState::Init, PayloadKind::PushStreamRoom) => {
                let Some(proto_message::Payload::PushStream(push)) = &frame.payload else {
                    tracing::error!("push-stream-room frame without payload from {}", peer);
                    break;
                };
                tracing::info!("received stream push request for room '{}'", push.room_name);

                match bind_room(&ctx, &push.room_name) {
                    Ok(bound) => {
                        room = Some(bound);
                        state = PushState::RoomBound;
                        let ok = create_message(
                            proto_message::Payload::PushStream(ProtoServerPushStream {
                                room_name: push.room_name.clone(),
                            }),
                            PayloadKind::PushStreamOk,
                            None,
                        );
                        if let Err(err) = framed.send(&ok).await {
                            tracing::error!("failed to send push-stream-ok: {}", err);
                            break;
                        }
                        gossip::publish_room_state(&ctx.mesh, &ctx.registry).await;
                    }
                    Err(err) => {
                        let reason = match &err {
                            Error::State {
                                kind: StateErrorKind::NotOwner,
                                ..
                            } => REJECT_NOT_OWNER,
                            Error::State {
                                kind: StateErrorKind::AlreadyOnline,
                                ..
                            } => REJECT_ALREADY_ONLINE,
                            _ => REJECT_NOT_OWNER,
                        };
                        tracing::warn!(
                            "rejecting push for room '{}': {}",
                            push.room_name,
                            err
                        );
                        let rejected = create_message(
                            proto_message::Payload::Raw(ProtoRaw {
                                data: reason.to_string(),
                            }),
                            PayloadKind::PushStreamRejected,
                            None,
                        );
                        if framed.send(&rejected).await.is_err() {
                            break;
                        }
                    }
                }
            }
            (PushState::RoomBound, PayloadKind::Offer) => {
                let Some(proto_message::Payload::Sdp(sdp)) = &frame.payload else {
                    tracing::error!("offer frame without sdp payload from {}", peer);
                    break;
                };
                let bound = room.clone().expect("room is bound in RoomBound state");

                match accept_offer(&ctx, &bound, sdp, &framed, std::mem::take(&mut early_candidates))
                    .await
                {
                    Ok(()) => state = PushState::Offered,
                    Err(err) => {
                        tracing::error!(
                            "failed to accept offer for room '{}': {}",
                            bound.info.name,
                            err
                        );
                        break;
                    }
                }
            }
            (_, PayloadKind::IceCandidate) => {
                let Some(proto_message::Payload::Ice(ice)) = &frame.payload else {
                    tracing::error!("ice-candidate frame without candidate from {}", peer);
                    break;
                };
                let candidate = match wire_to_ice(ice) {
                    Ok(candidate) => candidate,
                    Err(err) => {
                        tracing::error!("push stream from {}: {}", peer, err);
                        break;
                    }
                };

                let session = room.as_ref().and_then(|r| r.session());
                match session {
                    Some(session) => {
                        if let Err(err) = session.add_ice_candidate(candidate).await {
                            tracing::error!("failed to add ICE candidate: {}", err);
                        }
                    }
                    None => early_candidates.push(candidate),
                }
            }
            (state, kind) => {
                tracing::error!(
                    "push stream from {}: unexpected '{}' frame in {:?} state, resetting",
                    peer,
                    kind,
                    state
                );
                break;
            }
        }
    }

    // Any exit from the conversation takes the room down with it.
    if let Some(room) = room {
        teardown_room(&ctx, room).await;
    }
}

/// Resolves the named room for binding: create it if unknown, reuse it if
/// locally owned and offline, reject otherwise.
fn bind_room(ctx: &ProtocolContext, name: &str) -> Result<Arc<Room>, Error> {
    match ctx.registry.get_by_name(name) {
        Some(existing) => {
            if existing.info.owner_id != ctx.registry.local_peer() {
                Err(Error::new_state(
                    format!("room '{}' is owned by {}", name, existing.info.owner_id),
                    StateErrorKind::NotOwner,
                ))
            } else if existing.is_online() {
                Err(Error::new_state(
                    format!("room '{}' is already online", name),
                    StateErrorKind::AlreadyOnline,
                ))
            } else {
                Ok(existing)
            }
        }
        None => ctx.registry.create(name),
    }
}

/// Builds the inbound media session for a producer offer: track ingest into
/// the fan-out, control channel splicing, candidate flush, answer.
async fn accept_offer(
    ctx: &Arc<ProtocolContext>,
    room: &Arc<Room>,
    sdp: &crate::wire::ProtoSdp,
    framed: &FramedStream<libp2p::Stream>,
    early_candidates: Vec<RTCIceCandidateInit>,
) -> Result<(), Error> {
    let offer = wire_to_sdp(sdp)?;

    let on_close: crate::session::OnCloseFn = {
        let ctx = ctx.clone();
        let room = room.clone();
        Box::new(move || {
            tracing::info!(
                "producer media session closed for room '{}'",
                room.info.name
            );
            let ctx = ctx.clone();
            let room = room.clone();
            tokio::spawn(async move {
                teardown_room(&ctx, room).await;
            });
        })
    };
    let session = MediaSession::new(&ctx.api, on_close).await?;

    // Outbound trickle candidates ride the same framed stream.
    {
        let framed = framed.clone();
        let room_name = room.info.name.clone();
        session.on_ice_candidate(Box::new(move |candidate| {
            let framed = framed.clone();
            let room_name = room_name.clone();
            tokio::spawn(async move {
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(err) => {
                        tracing::error!("failed to serialize ICE candidate: {}", err);
                        return;
                    }
                };
                let msg = create_message(ice_to_wire(&init), PayloadKind::IceCandidate, None);
                if let Err(err) = framed.send(&msg).await {
                    tracing::error!(
                        "failed to send ICE candidate for room '{}': {}",
                        room_name,
                        err
                    );
                }
            });
        }));
    }

    // Each inbound track records its codec on the room and feeds the fan-out.
    {
        let room = room.clone();
        session.on_track(Box::new(move |track, _receiver, _transceiver| {
            let room = room.clone();
            tokio::spawn(async move {
                ingest_track(room, track).await;
            });
        }));
    }

    // The producer's data channel becomes the room control channel.
    {
        let room = room.clone();
        session.on_control_channel(Box::new(move |control| {
            tracing::debug!("control channel opened for room '{}'", room.info.name);
            attach_room_control(&room, control);
        }));
    }

    for candidate in early_candidates {
        // No remote description yet, so these land in the held buffer and
        // flush with the description below.
        session.add_ice_candidate(candidate).await?;
    }

    session.set_remote_description(offer).await?;
    let answer = session.answer().await?;
    framed
        .send(&create_message(
            sdp_to_wire(&answer),
            PayloadKind::Answer,
            None,
        ))
        .await?;

    room.set_session(session);
    gossip::publish_room_state(&ctx.mesh, &ctx.registry).await;
    tracing::debug!("sent answer for pushed stream, room '{}'", room.info.name);

    Ok(())
}

/// Copies one inbound track into the room's fan-out until it closes.
pub(crate) async fn ingest_track(
    room: Arc<Room>,
    track: Arc<webrtc::track::track_remote::TrackRemote>,
) {
    let kind = track.kind();
    room.set_codec(kind, track.codec().capability);
    tracing::info!(
        "track published to room '{}': kind={} ssrc={}",
        room.info.name,
        kind,
        track.ssrc()
    );

    loop {
        match track.read_rtp().await {
            Ok((packet, _attributes)) => room.broadcast(kind, &packet),
            Err(webrtc::Error::ErrClosedPipe) | Err(webrtc::Error::ErrDataChannelNotOpen) => {
                break;
            }
            Err(err) => {
                tracing::error!("room '{}': failed to read RTP: {}", room.info.name, err);
                break;
            }
        }
    }

    tracing::debug!("track closed for room '{}', kind {}", room.info.name, kind);
}

/// Removes the room from the registry, closes it and announces the new
/// room set.
pub(crate) async fn teardown_room(ctx: &Arc<ProtocolContext>, room: Arc<Room>) {
    ctx.registry.remove_room(&room);
    room.close().await;
    gossip::publish_room_state(&ctx.mesh, &ctx.registry).await;
}
