use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use prost::Message;
use webrtc::data_channel::RTCDataChannel;

use crate::error::{Error, TransportErrorKind};
use crate::wire::{PayloadKind, ProtoMessage};

pub type MessageHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// A control channel: an [`RTCDataChannel`] whose binary messages are framed
/// [`ProtoMessage`]s dispatched by payload kind. Payload bytes are handed to
/// handlers verbatim so forwarding never re-encodes.
pub struct ControlChannel {
    data_channel: Arc<RTCDataChannel>,
    handlers: Arc<DashMap<PayloadKind, MessageHandler>>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("label", &self.data_channel.label())
            .finish()
    }
}

impl ControlChannel {
    pub fn new(data_channel: Arc<RTCDataChannel>) -> Arc<Self> {
        let handlers: Arc<DashMap<PayloadKind, MessageHandler>> = Arc::new(DashMap::new());

        {
            let handlers = handlers.clone();
            let label = data_channel.label().to_string();
            data_channel.on_message(Box::new(move |msg| {
                let handlers = handlers.clone();
                let label = label.clone();
                Box::pin(async move {
                    if msg.is_string {
                        return;
                    }

                    let frame = match ProtoMessage::decode(msg.data.as_ref()) {
                        Ok(frame) => frame,
                        Err(err) => {
                            tracing::error!(
                                "failed to decode control message on '{}': {}",
                                label,
                                err
                            );
                            return;
                        }
                    };

                    let kind = match crate::wire::frame_kind(&frame) {
                        Ok(kind) => kind,
                        Err(err) => {
                            tracing::error!("control message on '{}' rejected: {}", label, err);
                            return;
                        }
                    };

                    let handler = handlers.get(&kind).map(|h| h.value().clone());
                    if let Some(handler) = handler {
                        (*handler)(msg.data);
                    }
                })
            }));
        }

        data_channel.on_error(Box::new(move |err| {
            Box::pin(async move {
                tracing::debug!("control channel error: {}", err);
            })
        }));

        Arc::new(ControlChannel {
            data_channel,
            handlers,
        })
    }

    pub fn label(&self) -> String {
        self.data_channel.label().to_string()
    }

    /// Sends a pre-encoded frame. Closed-channel failures come back as
    /// `TransportErrorKind::ChannelClosed` so callers can tear down the peer.
    pub async fn send_binary(&self, data: &Bytes) -> Result<(), Error> {
        match self.data_channel.send(data).await {
            Ok(_) => Ok(()),
            Err(webrtc::Error::ErrClosedPipe) | Err(webrtc::Error::ErrDataChannelNotOpen) => {
                Err(Error::new_transport(
                    "control channel is closed",
                    TransportErrorKind::ChannelClosed,
                ))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Registers the handler for one payload kind, replacing any previous one.
    pub fn register(&self, kind: PayloadKind, handler: MessageHandler) {
        self.handlers.insert(kind, handler);
    }

    pub fn on_open(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.data_channel.on_open(Box::new(move || {
            callback();
            Box::pin(async {})
        }));
    }

    pub fn on_close(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.data_channel.on_close(Box::new(move || {
            callback();
            Box::pin(async {})
        }));
    }

    pub async fn close(&self) {
        if let Err(err) = self.data_channel.close().await {
            tracing::debug!("failed to close control channel: {}", err);
        }
    }
}
