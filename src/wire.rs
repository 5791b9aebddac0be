use std::sync::Arc;

use futures::io::{ReadHalf, WriteHalf};
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use prost::Message;
use tokio::sync::Mutex;
use unsigned_varint::{decode, encode};

use crate::error::{Error, ProtocolErrorKind};

/// Every frame on a protocol stream or control channel is a `ProtoMessage`:
/// a header naming the payload kind plus a oneof payload. The field numbers
/// below are the published schema; changing them breaks every peer.
#[derive(Clone, PartialEq, Message)]
pub struct ProtoMessage {
    #[prost(message, optional, tag = "1")]
    pub base: Option<ProtoMessageBase>,
    #[prost(oneof = "proto_message::Payload", tags = "10, 11, 12, 13, 14, 15")]
    pub payload: Option<proto_message::Payload>,
}

pub mod proto_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "10")]
        Sdp(super::ProtoSdp),
        #[prost(message, tag = "11")]
        Ice(super::ProtoIce),
        #[prost(message, tag = "12")]
        RequestRoomStream(super::ProtoClientRequestRoomStream),
        #[prost(message, tag = "13")]
        PushStream(super::ProtoServerPushStream),
        #[prost(message, tag = "14")]
        Raw(super::ProtoRaw),
        #[prost(message, tag = "15")]
        ControllerFeedback(super::ProtoControllerFeedback),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoMessageBase {
    #[prost(string, tag = "1")]
    pub payload_type: String,
    #[prost(message, optional, tag = "2")]
    pub latency: Option<ProtoLatencyTracker>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoLatencyTracker {
    #[prost(string, tag = "1")]
    pub sequence_id: String,
    #[prost(message, repeated, tag = "2")]
    pub timestamps: Vec<ProtoTimestampEntry>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoTimestampEntry {
    #[prost(string, tag = "1")]
    pub stage: String,
    #[prost(message, optional, tag = "2")]
    pub time: Option<prost_types::Timestamp>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoSdp {
    #[prost(message, optional, tag = "1")]
    pub sdp: Option<RtcSessionDescriptionInit>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RtcSessionDescriptionInit {
    #[prost(string, tag = "1")]
    pub sdp: String,
    #[prost(string, tag = "2")]
    pub r#type: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoIce {
    #[prost(message, optional, tag = "1")]
    pub candidate: Option<RtcIceCandidateInit>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RtcIceCandidateInit {
    #[prost(string, tag = "1")]
    pub candidate: String,
    #[prost(string, optional, tag = "2")]
    pub sdp_mid: Option<String>,
    #[prost(uint32, optional, tag = "3")]
    pub sdp_mline_index: Option<u32>,
    #[prost(string, optional, tag = "4")]
    pub username_fragment: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoClientRequestRoomStream {
    #[prost(string, tag = "1")]
    pub session_id: String,
    #[prost(string, tag = "2")]
    pub room_name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoServerPushStream {
    #[prost(string, tag = "1")]
    pub room_name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoRaw {
    #[prost(string, tag = "1")]
    pub data: String,
}

/// Producer-to-viewer feedback (rumble and the like). The session id selects
/// which participant's control channel receives the frame; the data stays
/// opaque to the relay.
#[derive(Clone, PartialEq, Message)]
pub struct ProtoControllerFeedback {
    #[prost(string, tag = "1")]
    pub session_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

/// Closed set of payload kinds. The wire carries the string form for
/// interoperability; everything past the decode boundary matches on this
/// enum, and an unknown string is a protocol error rather than a silent skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    PushStreamRoom,
    PushStreamOk,
    PushStreamRejected,
    RequestStreamRoom,
    SessionAssigned,
    RequestStreamOffline,
    Offer,
    Answer,
    IceCandidate,
    Input,
    ControllerInput,
}

impl PayloadKind {
    pub const ALL: [PayloadKind; 11] = [
        PayloadKind::PushStreamRoom,
        PayloadKind::PushStreamOk,
        PayloadKind::PushStreamRejected,
        PayloadKind::RequestStreamRoom,
        PayloadKind::SessionAssigned,
        PayloadKind::RequestStreamOffline,
        PayloadKind::Offer,
        PayloadKind::Answer,
        PayloadKind::IceCandidate,
        PayloadKind::Input,
        PayloadKind::ControllerInput,
    ];

    pub fn as_wire(&self) -> &'static str {
        match self {
            PayloadKind::PushStreamRoom => "push-stream-room",
            PayloadKind::PushStreamOk => "push-stream-ok",
            PayloadKind::PushStreamRejected => "push-stream-rejected",
            PayloadKind::RequestStreamRoom => "request-stream-room",
            PayloadKind::SessionAssigned => "session-assigned",
            PayloadKind::RequestStreamOffline => "request-stream-offline",
            PayloadKind::Offer => "offer",
            PayloadKind::Answer => "answer",
            PayloadKind::IceCandidate => "ice-candidate",
            PayloadKind::Input => "input",
            PayloadKind::ControllerInput => "controllerInput",
        }
    }

    pub fn from_wire(s: &str) -> Result<Self, Error> {
        match s {
            "push-stream-room" => Ok(PayloadKind::PushStreamRoom),
            "push-stream-ok" => Ok(PayloadKind::PushStreamOk),
            "push-stream-rejected" => Ok(PayloadKind::PushStreamRejected),
            "request-stream-room" => Ok(PayloadKind::RequestStreamRoom),
            "session-assigned" => Ok(PayloadKind::SessionAssigned),
            "request-stream-offline" => Ok(PayloadKind::RequestStreamOffline),
            "offer" => Ok(PayloadKind::Offer),
            "answer" => Ok(PayloadKind::Answer),
            "ice-candidate" => Ok(PayloadKind::IceCandidate),
            "input" => Ok(PayloadKind::Input),
            "controllerInput" => Ok(PayloadKind::ControllerInput),
            other => Err(Error::new_protocol(
                format!("unknown payload kind '{}'", other),
                ProtocolErrorKind::UnknownPayloadKind,
            )),
        }
    }
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Rejection reasons carried in `push-stream-rejected` frames.
pub const REJECT_NOT_OWNER: &str = "not-owner";
pub const REJECT_ALREADY_ONLINE: &str = "already-online";

/// Builds a frame for the given payload, stamping the `created` latency
/// stage when a sequence id is supplied.
pub fn create_message(
    payload: proto_message::Payload,
    kind: PayloadKind,
    sequence_id: Option<String>,
) -> ProtoMessage {
    let latency = sequence_id.map(|sequence_id| ProtoLatencyTracker {
        sequence_id,
        timestamps: vec![ProtoTimestampEntry {
            stage: "created".to_string(),
            time: Some(prost_types::Timestamp::from(std::time::SystemTime::now())),
        }],
    });

    ProtoMessage {
        base: Some(ProtoMessageBase {
            payload_type: kind.as_wire().to_string(),
            latency,
        }),
        payload: Some(payload),
    }
}

/// Appends a latency stage to a frame's tracker, if it carries one.
pub fn track_stage(msg: &mut ProtoMessage, stage: &str) {
    if let Some(latency) = msg.base.as_mut().and_then(|b| b.latency.as_mut()) {
        latency.timestamps.push(ProtoTimestampEntry {
            stage: stage.to_string(),
            time: Some(prost_types::Timestamp::from(std::time::SystemTime::now())),
        });
    }
}

/// Returns the decoded payload kind of a frame, or a protocol error when the
/// header is missing or the kind string is unknown.
pub fn frame_kind(msg: &ProtoMessage) -> Result<PayloadKind, Error> {
    let base = msg.base.as_ref().ok_or_else(|| {
        Error::new_protocol("frame has no message base", ProtocolErrorKind::MissingHeader)
    })?;
    PayloadKind::from_wire(&base.payload_type)
}

const MAX_VARINT_LEN: usize = 10;

/// Writes one length-prefixed frame: unsigned varint length, then the encoded
/// message.
pub async fn write_frame<W>(writer: &mut W, msg: &ProtoMessage) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let buf = msg.encode_to_vec();

    let mut length_buf = encode::usize_buffer();
    let length_bytes = encode::usize(buf.len(), &mut length_buf);

    writer.write_all(length_bytes).await?;
    writer.write_all(&buf).await?;
    writer.flush().await?;

    Ok(())
}

/// Reads one length-prefixed frame. An overlong varint prefix is a protocol
/// error, not an allocation request.
pub async fn read_frame<R>(reader: &mut R) -> Result<ProtoMessage, Error>
where
    R: AsyncRead + Unpin,
{
    let mut length_buf = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        reader.read_exact(&mut byte).await?;
        length_buf.push(byte[0]);

        if byte[0] & 0x80 == 0 {
            break;
        }
        if length_buf.len() > MAX_VARINT_LEN {
            return Err(Error::new_protocol(
                "varint length prefix exceeds 10 bytes",
                ProtocolErrorKind::MalformedFrame,
            ));
        }
    }

    let (length, _) = decode::usize(&length_buf).map_err(|e| {
        Error::new_protocol(
            format!("invalid varint length prefix: {}", e),
            ProtocolErrorKind::MalformedFrame,
        )
    })?;

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(ProtoMessage::decode(payload.as_slice())?)
}

/// A mesh stream carrying framed messages. Read and write halves are locked
/// independently so a blocked reader never starves outbound signalling.
pub struct FramedStream<S> {
    read: Arc<Mutex<ReadHalf<S>>>,
    write: Arc<Mutex<WriteHalf<S>>>,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(stream: S) -> Self {
        let (read, write) = stream.split();
        FramedStream {
            read: Arc::new(Mutex::new(read)),
            write: Arc::new(Mutex::new(write)),
        }
    }

    pub async fn send(&self, msg: &ProtoMessage) -> Result<(), Error> {
        let mut write = self.write.lock().await;
        write_frame(&mut *write, msg).await
    }

    pub async fn recv(&self) -> Result<ProtoMessage, Error> {
        let mut read = self.read.lock().await;
        read_frame(&mut *read).await
    }
}

impl<S> Clone for FramedStream<S> {
    fn clone(&self) -> Self {
        FramedStream {
            read: Arc::clone(&self.read),
            write: Arc::clone(&self.write),
        }
    }
}

impl<S> std::fmt::Debug for FramedStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedStream").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;

    fn sample_payloads() -> Vec<(PayloadKind, proto_message::Payload)> {
        vec![
            (
                PayloadKind::Offer,
                proto_message::Payload::Sdp(ProtoSdp {
                    sdp: Some(RtcSessionDescriptionInit {
                        sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n".to_string(),
                        r#type: "offer".to_string(),
                    }),
                }),
            ),
            (
                PayloadKind::IceCandidate,
                proto_message::Payload::Ice(ProtoIce {
                    candidate: Some(RtcIceCandidateInit {
                        candidate: "candidate:1 1 udp 2122260223 192.0.2.1 61764 typ host"
                            .to_string(),
                        sdp_mid: Some("0".to_string()),
                        sdp_mline_index: Some(0),
                        username_fragment: None,
                    }),
                }),
            ),
            (
                PayloadKind::RequestStreamRoom,
                proto_message::Payload::RequestRoomStream(ProtoClientRequestRoomStream {
                    session_id: "01J0000000000000000000000".to_string(),
                    room_name: "alpha".to_string(),
                }),
            ),
            (
                PayloadKind::PushStreamRoom,
                proto_message::Payload::PushStream(ProtoServerPushStream {
                    room_name: "alpha".to_string(),
                }),
            ),
            (
                PayloadKind::RequestStreamOffline,
                proto_message::Payload::Raw(ProtoRaw {
                    data: "bravo".to_string(),
                }),
            ),
            (
                PayloadKind::ControllerInput,
                proto_message::Payload::ControllerFeedback(ProtoControllerFeedback {
                    session_id: "01J0000000000000000000001".to_string(),
                    data: vec![0x01, 0x02, 0x03],
                }),
            ),
        ]
    }

    #[test]
    fn payload_kind_round_trips() {
        for kind in PayloadKind::ALL {
            assert_eq!(PayloadKind::from_wire(kind.as_wire()).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_payload_kind_is_an_error() {
        assert!(PayloadKind::from_wire("definitely-not-a-kind").is_err());
        assert!(PayloadKind::from_wire("").is_err());
    }

    #[test]
    fn frame_kind_rejects_missing_header() {
        let msg = ProtoMessage {
            base: None,
            payload: None,
        };
        assert!(frame_kind(&msg).is_err());
    }

    #[test]
    fn encode_decode_round_trips_every_variant() {
        for (kind, payload) in sample_payloads() {
            let msg = create_message(payload, kind, None);
            let mut buf = Vec::new();
            msg.encode(&mut buf).unwrap();
            let decoded = ProtoMessage::decode(buf.as_slice()).unwrap();
            assert_eq!(decoded, msg);
            assert_eq!(frame_kind(&decoded).unwrap(), kind);
        }
    }

    #[test]
    fn latency_tracker_stamps_stages() {
        let mut msg = create_message(
            proto_message::Payload::Raw(ProtoRaw {
                data: "x".to_string(),
            }),
            PayloadKind::Input,
            Some("seq-1".to_string()),
        );
        track_stage(&mut msg, "relayed");

        let latency = msg.base.unwrap().latency.unwrap();
        assert_eq!(latency.sequence_id, "seq-1");
        let stages: Vec<_> = latency.timestamps.iter().map(|t| t.stage.as_str()).collect();
        assert_eq!(stages, ["created", "relayed"]);
    }

    #[tokio::test]
    async fn framing_round_trips() {
        let mut cursor = Cursor::new(Vec::new());
        let mut sent = Vec::new();
        for (kind, payload) in sample_payloads() {
            let msg = create_message(payload, kind, None);
            write_frame(&mut cursor, &msg).await.unwrap();
            sent.push(msg);
        }

        cursor.set_position(0);
        for expected in sent {
            let got = read_frame(&mut cursor).await.unwrap();
            assert_eq!(got, expected);
        }
    }

    #[tokio::test]
    async fn overlong_varint_prefix_errors() {
        // Eleven continuation bytes never terminate a valid length.
        let bogus = vec![0x80u8; 11];
        let mut cursor = Cursor::new(bogus);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn truncated_frame_errors() {
        let msg = create_message(
            proto_message::Payload::Raw(ProtoRaw {
                data: "truncate me".to_string(),
            }),
            PayloadKind::Input,
            None,
        );
        let mut cursor = Cursor::new(Vec::new());
        write_frame(&mut cursor, &msg).await.unwrap();
        let mut data = cursor.into_inner();
        data.truncate(data.len() - 3);

        let mut cursor = Cursor::new(data);
        assert!(read_frame(&mut cursor).await.is_err());
    }
}
