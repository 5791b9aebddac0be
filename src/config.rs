use std::path::PathBuf;

use clap::Parser;
use webrtc::api::interceptor_registry::{configure_nack, configure_rtcp_reports};
use webrtc::api::media_engine::{
    MediaEngine, MIME_TYPE_AV1, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP9,
};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;

use crate::error::{Error, ResourceErrorKind};

/// Command-line surface of the relay process.
#[derive(Debug, Clone, Parser)]
#[command(name = "relaymesh", about = "Peer-to-peer media relay")]
pub struct RelayArgs {
    /// Mesh listen port. TCP and QUIC bind here; WebSocket and WebRTC-direct
    /// listeners bind one port above.
    #[arg(long, default_value_t = 4001)]
    pub port: u16,

    /// Enable the Prometheus metrics endpoint.
    #[arg(long, default_value_t = false)]
    pub metrics: bool,

    /// Port for the metrics endpoint.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Directory for the identity key and peerstore snapshot.
    #[arg(long, default_value = "./relay-data")]
    pub persist_dir: PathBuf,

    /// Discard any persisted identity and generate a fresh one.
    #[arg(long, default_value_t = false)]
    pub regen_identity: bool,

    /// Log at debug level.
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,

    /// Start of the WebRTC ephemeral UDP port range (0 disables).
    #[arg(long, default_value_t = 0)]
    pub webrtc_udp_start: u16,

    /// End of the WebRTC ephemeral UDP port range (0 disables).
    #[arg(long, default_value_t = 0)]
    pub webrtc_udp_end: u16,

    /// Multiplex all WebRTC traffic over one UDP port (0 disables).
    #[arg(long, default_value_t = 0)]
    pub udp_mux_port: u16,

    /// Advertise this address for NAT 1:1 deployments.
    #[arg(long)]
    pub nat_1to1_ip: Option<String>,
}

/// The process-wide WebRTC engine: media engine with the fixed codec
/// catalogue, NACK and RTCP-report interceptors, and a setting engine shaped
/// by the CLI flags. Built once at startup, then only read.
pub struct WebRtcApi {
    api: API,
}

impl std::fmt::Debug for WebRtcApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcApi").finish()
    }
}

impl WebRtcApi {
    pub async fn new(args: &RelayArgs) -> Result<Self, Error> {
        let mut media_engine = MediaEngine::default();

        for codec in audio_codecs() {
            media_engine.register_codec(codec, RTPCodecType::Audio)?;
        }
        for codec in video_codecs() {
            media_engine.register_codec(codec, RTPCodecType::Video)?;
        }

        let mut registry = Registry::new();
        registry = configure_nack(registry, &mut media_engine);
        registry = configure_rtcp_reports(registry);

        let mut setting_engine = SettingEngine::default();

        if let Some(nat_ip) = &args.nat_1to1_ip {
            setting_engine
                .set_nat_1to1_ips(vec![nat_ip.clone()], RTCIceCandidateType::Host);
            tracing::info!("Using NAT 1:1 IP for WebRTC: {}", nat_ip);
        }

        if args.udp_mux_port > 0 {
            let socket = tokio::net::UdpSocket::bind(("0.0.0.0", args.udp_mux_port))
                .await
                .map_err(|e| {
                    Error::new_resource(
                        format!("failed to bind WebRTC UDP mux port: {}", e),
                        ResourceErrorKind::SessionCreate,
                    )
                })?;
            setting_engine
                .set_udp_network(UDPNetwork::Muxed(UDPMuxDefault::new(UDPMuxParams::new(
                    socket,
                ))));
            tracing::info!("Using UDP mux for WebRTC on port {}", args.udp_mux_port);
        } else if args.webrtc_udp_start > 0 && args.webrtc_udp_start < args.webrtc_udp_end {
            let ephemeral =
                EphemeralUDP::new(args.webrtc_udp_start, args.webrtc_udp_end).map_err(|e| {
                    Error::new_resource(
                        format!("invalid WebRTC UDP port range: {}", e),
                        ResourceErrorKind::SessionCreate,
                    )
                })?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
            tracing::info!(
                "Using WebRTC UDP port range {}-{}",
                args.webrtc_udp_start,
                args.webrtc_udp_end
            );
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        Ok(WebRtcApi { api })
    }

    pub async fn new_peer_connection(&self) -> Result<RTCPeerConnection, Error> {
        let pc = self
            .api
            .new_peer_connection(RTCConfiguration::default())
            .await?;
        Ok(pc)
    }
}

fn audio_codecs() -> Vec<RTCRtpCodecParameters> {
    vec![RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        payload_type: 111,
        ..Default::default()
    }]
}

fn video_codecs() -> Vec<RTCRtpCodecParameters> {
    let feedback = vec![
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "pli".to_owned(),
        },
    ];

    let h264 = |fmtp: &str, payload_type: u8| RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: fmtp.to_owned(),
            rtcp_feedback: feedback.clone(),
        },
        payload_type,
        ..Default::default()
    };

    let mut codecs = vec![
        h264(
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f",
            102,
        ),
        h264(
            "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42001f",
            104,
        ),
        h264(
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
            106,
        ),
        h264(
            "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42e01f",
            108,
        ),
        h264(
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=4d001f",
            127,
        ),
        h264(
            "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=4d001f",
            39,
        ),
        h264(
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=64001f",
            112,
        ),
    ];

    codecs.push(RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: "video/H265".to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "".to_owned(),
            rtcp_feedback: feedback.clone(),
        },
        payload_type: 116,
        ..Default::default()
    });
    codecs.push(RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_AV1.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "".to_owned(),
            rtcp_feedback: feedback.clone(),
        },
        payload_type: 45,
        ..Default::default()
    });
    codecs.push(RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP9.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "profile-id=0".to_owned(),
            rtcp_feedback: feedback.clone(),
        },
        payload_type: 98,
        ..Default::default()
    });
    codecs.push(RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP9.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "profile-id=2".to_owned(),
            rtcp_feedback: feedback,
        },
        payload_type: 100,
        ..Default::default()
    });

    codecs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_catalogue_has_stable_payload_types() {
        let audio = audio_codecs();
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].payload_type, 111);

        let video = video_codecs();
        let payload_types: Vec<u8> = video.iter().map(|c| c.payload_type).collect();
        assert_eq!(payload_types, [102, 104, 106, 108, 127, 39, 112, 116, 45, 98, 100]);
        assert!(video
            .iter()
            .all(|c| c.capability.rtcp_feedback.iter().any(|f| f.typ == "nack")));
    }

    #[test]
    fn args_parse_all_flags() {
        let args = RelayArgs::parse_from([
            "relaymesh",
            "--port",
            "4002",
            "--metrics",
            "--metrics-port",
            "9100",
            "--persist-dir",
            "/tmp/relay",
            "--regen-identity",
            "--verbose",
            "--webrtc-udp-start",
            "50000",
            "--webrtc-udp-end",
            "50100",
            "--udp-mux-port",
            "8443",
            "--nat-1to1-ip",
            "203.0.113.7",
        ]);

        assert_eq!(args.port, 4002);
        assert!(args.metrics);
        assert_eq!(args.metrics_port, 9100);
        assert!(args.regen_identity);
        assert!(args.verbose);
        assert_eq!(args.webrtc_udp_start, 50000);
        assert_eq!(args.webrtc_udp_end, 50100);
        assert_eq!(args.udp_mux_port, 8443);
        assert_eq!(args.nat_1to1_ip.as_deref(), Some("203.0.113.7"));
    }
}
