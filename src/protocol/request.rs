use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use libp2p::{PeerId, StreamProtocol};
use libp2p_stream::IncomingStreams;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::error::Error;
use crate::participant::Participant;
use crate::registry::now_millis;
use crate::room::Room;
use crate::session::MediaSession;
use crate::wire::{
    create_message, frame_kind, proto_message, FramedStream, PayloadKind,
    ProtoClientRequestRoomStream, ProtoRaw,
};

use super::{
    attach_room_control, ice_to_wire, sdp_to_wire, wire_to_ice, wire_to_sdp, ProtocolContext,
};

pub const PROTOCOL_REQUEST: StreamProtocol =
    StreamProtocol::new("/relaymesh/stream-request/1.0.0");

pub(crate) async fn accept_loop(ctx: Arc<ProtocolContext>, mut incoming: IncomingStreams) {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            next = incoming.next() => {
                let Some((peer, stream)) = next else { break };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    handle_request(ctx, peer, FramedStream::new(stream)).await;
                });
            }
        }
    }
    tracing::debug!("request accept loop finished");
}

/// One requester's conversation. The stream is pure signalling: if it breaks
/// after the media session is up, the session keeps being served and cleanup
/// waits for the media engine's own verdict.
async fn handle_request(
    ctx: Arc<ProtocolContext>,
    peer: PeerId,
    framed: FramedStream<libp2p::Stream>,
) {
    let mut current: Option<(Arc<Room>, Arc<MediaSession>)> = None;
    let mut current_room_name: Option<String> = None;
    let mut offline_rx = ctx.registry.subscribe_offline();

    loop {
        let frame = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            offline = offline_rx.recv() => {
                // A room we are mid-handshake on went offline under us.
                if let (Ok(name), None) = (&offline, &current) {
                    if current_room_name.as_deref() == Some(name.as_str()) {
                        let msg = create_message(
                            proto_message::Payload::Raw(ProtoRaw { data: name.clone() }),
                            PayloadKind::RequestStreamOffline,
                            None,
                        );
                        if framed.send(&msg).await.is_err() {
                            return;
                        }
                    }
                }
                continue;
            }
            frame = framed.recv() => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(Error::Io(_)) | Err(Error::Transport { .. }) => {
                tracing::debug!("request stream from {} closed", peer);
                return;
            }
            Err(err) => {
                tracing::error!("failed to receive request frame from {}: {}", peer, err);
                return;
            }
        };

        let kind = match frame_kind(&frame) {
            Ok(kind) => kind,
            Err(err) => {
                tracing::error!("request stream from {}: {}", peer, err);
                return;
            }
        };

        match kind {
            PayloadKind::RequestStreamRoom => {
                let Some(proto_message::Payload::RequestRoomStream(request)) = &frame.payload
                else {
                    tracing::error!("request-stream-room frame without payload from {}", peer);
                    return;
                };

                // Reuse the presented session id across reconnects, mint one
                // otherwise, and echo it either way.
                let session_id = if request.session_id.is_empty() {
                    ctx.registry.new_session_id()
                } else {
                    request.session_id.clone()
                };
                tracing::info!(
                    "client session {} requested room stream '{}'",
                    session_id,
                    request.room_name
                );

                let assigned = create_message(
                    proto_message::Payload::RequestRoomStream(ProtoClientRequestRoomStream {
                        session_id: session_id.clone(),
                        room_name: request.room_name.clone(),
                    }),
                    PayloadKind::SessionAssigned,
                    None,
                );
                if framed.send(&assigned).await.is_err() {
                    return;
                }
                current_room_name = Some(request.room_name.clone());

                // Serveable means found, online and locally owned; the one
                // extension is a room this relay deliberately mirrors, which
                // it serves in the owner's stead.
                let room = ctx.registry.get_by_name(&request.room_name);
                let local_peer = ctx.registry.local_peer();
                let serveable = room
                    .as_ref()
                    .map(|r| {
                        r.is_online() && (r.info.owner_id == local_peer || r.is_mirror())
                    })
                    .unwrap_or(false);
                if !serveable {
                    tracing::debug!(
                        "cannot serve room '{}': exists={} online={} owned={}",
                        request.room_name,
                        room.is_some(),
                        room.as_ref().map(|r| r.is_online()).unwrap_or(false),
                        room.as_ref()
                            .map(|r| r.info.owner_id == local_peer)
                            .unwrap_or(false)
                    );
                    // A known remote owner means we can fetch the room for
                    // this and future viewers; the requester retries.
                    maybe_fetch_remote(&ctx, &request.room_name);
                    let offline = create_message(
                        proto_message::Payload::Raw(ProtoRaw {
                            data: request.room_name.clone(),
                        }),
                        PayloadKind::RequestStreamOffline,
                        None,
                    );
                    if framed.send(&offline).await.is_err() {
                        return;
                    }
                    continue;
                }
                let room = room.expect("serveable room exists");

                match serve_viewer(&ctx, &room, peer, session_id, &framed).await {
                    Ok(session) => {
                        current = Some((room, session));
                    }
                    Err(err) => {
                        tracing::error!(
                            "failed to serve room '{}' to {}: {}",
                            request.room_name,
                            peer,
                            err
                        );
                        let offline = create_message(
                            proto_message::Payload::Raw(ProtoRaw {
                                data: request.room_name.clone(),
                            }),
                            PayloadKind::RequestStreamOffline,
                            None,
                        );
                        if framed.send(&offline).await.is_err() {
                            return;
                        }
                    }
                }
            }
            PayloadKind::Answer => {
                let Some(proto_message::Payload::Sdp(sdp)) = &frame.payload else {
                    tracing::error!("answer frame without sdp payload from {}", peer);
                    return;
                };
                let Some((_, session)) = &current else {
                    tracing::warn!("received answer without an active session from {}", peer);
                    continue;
                };
                let answer = match wire_to_sdp(sdp) {
                    Ok(answer) => answer,
                    Err(err) => {
                        tracing::error!("request stream from {}: {}", peer, err);
                        return;
                    }
                };
                if let Err(err) = session.set_remote_description(answer).await {
                    tracing::error!("failed to set remote description for answer: {}", err);
                    continue;
                }
                tracing::debug!("set remote description for answer from {}", peer);
            }
            PayloadKind::IceCandidate => {
                let Some(proto_message::Payload::Ice(ice)) = &frame.payload else {
                    tracing::error!("ice-candidate frame without candidate from {}", peer);
                    return;
                };
                let Some((_, session)) = &current else {
                    tracing::warn!("received ICE candidate without a session from {}", peer);
                    continue;
                };
                match wire_to_ice(ice) {
                    Ok(candidate) => {
                        if let Err(err) = session.add_ice_candidate(candidate).await {
                            tracing::error!("failed to add ICE candidate: {}", err);
                        }
                    }
                    Err(err) => {
                        tracing::error!("request stream from {}: {}", peer, err);
                        return;
                    }
                }
            }
            kind => {
                tracing::error!(
                    "request stream from {}: unexpected '{}' frame, resetting",
                    peer,
                    kind
                );
                return;
            }
        }
    }
}

/// Builds the outbound leg for one viewer: media session, control channel
/// splice, tracks mirroring the room codecs, and the offer. The participant
/// joins the room only when the connection reaches connected.
async fn serve_viewer(
    ctx: &Arc<ProtocolContext>,
    room: &Arc<Room>,
    peer: PeerId,
    session_id: String,
    framed: &FramedStream<libp2p::Stream>,
) -> Result<Arc<MediaSession>, Error> {
    let (Some(audio_codec), Some(video_codec)) = (
        room.codec(RTPCodecType::Audio),
        room.codec(RTPCodecType::Video),
    ) else {
        return Err(Error::new_state(
            format!("room '{}' has not negotiated codecs yet", room.info.name),
            crate::error::StateErrorKind::RoomOffline,
        ));
    };

    // Cleanup is driven by the media engine: the on-close callback fires on
    // failed/disconnected/closed and removes the participant exactly once.
    let participant_slot: Arc<std::sync::Mutex<Option<ulid::Ulid>>> =
        Arc::new(std::sync::Mutex::new(None));
    let session = {
        let room = room.clone();
        let participant_slot = participant_slot.clone();
        MediaSession::new(
            &ctx.api,
            Box::new(move || {
                if let Some(id) = *participant_slot.lock().unwrap() {
                    tracing::info!(
                        "participant {} disconnected from room '{}'",
                        id,
                        room.info.name
                    );
                    room.remove_participant_by_id(id);
                }
            }),
        )
        .await?
    };

    let control = session.create_control_channel("relay-data").await?;
    {
        let name = room.info.name.clone();
        control.on_open(move || {
            tracing::debug!("relay control channel opened for requested stream '{}'", name);
        });
        let name = room.info.name.clone();
        control.on_close(move || {
            tracing::debug!("relay control channel closed for requested stream '{}'", name);
        });
    }
    // Viewer input, plain or controller, goes upstream verbatim.
    for kind in [PayloadKind::Input, PayloadKind::ControllerInput] {
        let room = room.clone();
        control.register(
            kind,
            Arc::new(move |data: Bytes| {
                let room = room.clone();
                tokio::spawn(async move {
                    if let Err(err) = room.forward_to_producer(&data).await {
                        tracing::error!(
                            "failed to forward input to room '{}': {}",
                            room.info.name,
                            err
                        );
                    }
                });
            }),
        );
    }

    let participant = {
        let pool = ctx.registry.pool();
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            audio_codec,
            format!("participant-{}-audio", session_id),
            format!("participant-{}", session_id),
        ));
        let video_track = Arc::new(TrackLocalStaticRTP::new(
            video_codec,
            format!("participant-{}-video", session_id),
            format!("participant-{}", session_id),
        ));
        session.add_track(audio_track.clone()).await?;
        session.add_track(video_track.clone()).await?;

        Participant::new(
            session_id,
            peer,
            session.clone(),
            audio_track,
            video_track,
            pool,
        )
    };
    *participant_slot.lock().unwrap() = Some(participant.id);

    {
        let room = room.clone();
        let participant = participant.clone();
        session.set_on_connected(Box::new(move || {
            room.add_participant(participant.clone());
        }));
    }

    {
        let framed = framed.clone();
        session.on_ice_candidate(Box::new(move |candidate| {
            let framed = framed.clone();
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
                    tracing::error!("failed to send ICE candidate: {}", err);
                }
            });
        }));
    }

    let offer = session.offer().await?;
    framed
        .send(&create_message(sdp_to_wire(&offer), PayloadKind::Offer, None))
        .await?;
    tracing::debug!("sent offer for requested stream '{}'", room.info.name);

    Ok(session)
}

/// Kicks off an upstream fetch when the room lives on another relay and no
/// fetch is already running.
fn maybe_fetch_remote(ctx: &Arc<ProtocolContext>, name: &str) {
    let Some(owner) = ctx.registry.resolve_owner(name) else {
        return;
    };
    if owner == ctx.registry.local_peer() {
        return;
    }
    if ctx.fetching.insert(name.to_string(), ()).is_some() {
        return;
    }

    let ctx = ctx.clone();
    let name = name.to_string();
    tokio::spawn(async move {
        if let Err(err) = run_remote_fetch(&ctx, &name, owner).await {
            tracing::warn!("fetch of room '{}' from {} failed: {}", name, owner, err);
        }
        ctx.fetching.remove(&name);
    });
}

/// Opens a request stream without sending anything; the caller owns the
/// conversation and sends `request-stream-room` itself.
pub async fn open(
    mesh: &crate::mesh::MeshHandle,
    peer: PeerId,
) -> Result<FramedStream<libp2p::Stream>, Error> {
    let stream = mesh.open_stream(peer, PROTOCOL_REQUEST).await?;
    Ok(FramedStream::new(stream))
}

/// The requester side of the protocol, relay-to-relay: pull the room from
/// its owner and serve it locally as a mirror.
async fn run_remote_fetch(
    ctx: &Arc<ProtocolContext>,
    name: &str,
    owner: PeerId,
) -> Result<(), Error> {
    tracing::info!("requesting room '{}' from owner {}", name, owner);
    let framed = open(&ctx.mesh, owner).await?;

    framed
        .send(&create_message(
            proto_message::Payload::RequestRoomStream(ProtoClientRequestRoomStream {
                session_id: String::new(),
                room_name: name.to_string(),
            }),
            PayloadKind::RequestStreamRoom,
            None,
        ))
        .await?;

    let mut mirror: Option<(Arc<Room>, Arc<MediaSession>)> = None;

    loop {
        let frame = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(()),
            frame = framed.recv() => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(Error::Io(_)) | Err(Error::Transport { .. }) => {
                tracing::debug!("request stream to {} closed", owner);
                // The mirror session, if up, outlives its signalling stream.
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match frame_kind(&frame)? {
            PayloadKind::SessionAssigned => {
                if let Some(proto_message::Payload::RequestRoomStream(assigned)) = &frame.payload
                {
                    tracing::debug!(
                        "assigned session {} for room '{}'",
                        assigned.session_id,
                        assigned.room_name
                    );
                }
            }
            PayloadKind::RequestStreamOffline => {
                tracing::info!("room '{}' is offline at {}", name, owner);
                return Ok(());
            }
            PayloadKind::Offer => {
                let Some(proto_message::Payload::Sdp(sdp)) = &frame.payload else {
                    return Err(Error::new_protocol(
                        "offer frame without sdp payload",
                        crate::error::ProtocolErrorKind::MalformedFrame,
                    ));
                };
                let offer = wire_to_sdp(sdp)?;

                let claim_time = ctx
                    .registry
                    .ownership_claim(name)
                    .map(|c| c.claim_time)
                    .unwrap_or_else(now_millis);
                let room = ctx.registry.insert_mirror(name, owner, claim_time);

                let session = {
                    let ctx = ctx.clone();
                    let room = room.clone();
                    MediaSession::new(
                        &ctx.api.clone(),
                        Box::new(move || {
                            tracing::info!(
                                "mirror session closed for room '{}'",
                                room.info.name
                            );
                            let ctx = ctx.clone();
                            let room = room.clone();
                            tokio::spawn(async move {
                                super::push::teardown_room(&ctx, room).await;
                            });
                        }),
                    )
                    .await?
                };

                // The owner's tracks feed our local fan-out exactly like a
                // directly-pushed stream.
                {
                    let room = room.clone();
                    session.on_track(Box::new(move |track, _receiver, _transceiver| {
                        let room = room.clone();
                        tokio::spawn(async move {
                            super::push::ingest_track(room, track).await;
                        });
                    }));
                }

                // The owner opened the control channel towards us; it plays
                // the producer-channel role for local participants.
                {
                    let room = room.clone();
                    session.on_control_channel(Box::new(move |control| {
                        tracing::debug!(
                            "upstream control channel opened for mirror '{}'",
                            room.info.name
                        );
                        attach_room_control(&room, control);
                    }));
                }

                {
                    let framed = framed.clone();
                    session.on_ice_candidate(Box::new(move |candidate| {
                        let framed = framed.clone();
                        tokio::spawn(async move {
                            let init = match candidate.to_json() {
                                Ok(init) => init,
                                Err(err) => {
                                    tracing::error!(
                                        "failed to serialize ICE candidate: {}",
                                        err
                                    );
                                    return;
                                }
                            };
                            let msg = create_message(
                                ice_to_wire(&init),
                                PayloadKind::IceCandidate,
                                None,
                            );
                            if let Err(err) = framed.send(&msg).await {
                                tracing::error!("failed to send ICE candidate: {}", err);
                            }
                        });
                    }));
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

                room.set_session(session.clone());
                mirror = Some((room, session));
            }
            PayloadKind::IceCandidate => {
                let Some(proto_message::Payload::Ice(ice)) = &frame.payload else {
                    continue;
                };
                let Some((_, session)) = &mirror else {
                    tracing::warn!("ICE candidate from {} before offer", owner);
                    continue;
                };
                if let Err(err) = session.add_ice_candidate(wire_to_ice(ice)?).await {
                    tracing::error!("failed to add ICE candidate: {}", err);
                }
            }
            kind => {
                return Err(Error::new_protocol(
                    format!("unexpected '{}' frame from room owner", kind),
                    crate::error::ProtocolErrorKind::UnexpectedFrame,
                ));
            }
        }
    }
}
