use thiserror::Error;

/// Crate-wide error type. Each variant carries a kind enum so callers can
/// branch on the failure class without string matching.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error ({kind:?}): {message}")]
    Transport {
        message: String,
        kind: TransportErrorKind,
    },
    #[error("protocol error ({kind:?}): {message}")]
    Protocol {
        message: String,
        kind: ProtocolErrorKind,
    },
    #[error("state error ({kind:?}): {message}")]
    State {
        message: String,
        kind: StateErrorKind,
    },
    #[error("resource error ({kind:?}): {message}")]
    Resource {
        message: String,
        kind: ResourceErrorKind,
    },
    #[error("persistence error ({kind:?}): {message}")]
    Persistence {
        message: String,
        kind: PersistenceErrorKind,
    },
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Decode(#[from] prost::DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    NetworkUnreachable,
    StreamClosed,
    ChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    MalformedFrame,
    MissingHeader,
    UnknownPayloadKind,
    UnexpectedFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateErrorKind {
    NotOwner,
    AlreadyOnline,
    RoomOffline,
    NameTaken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceErrorKind {
    SessionCreate,
    TrackCreate,
    ChannelCreate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceErrorKind {
    Identity,
    Peerstore,
}

impl Error {
    pub fn new_transport(message: impl Into<String>, kind: TransportErrorKind) -> Self {
        Error::Transport {
            message: message.into(),
            kind,
        }
    }

    pub fn new_protocol(message: impl Into<String>, kind: ProtocolErrorKind) -> Self {
        Error::Protocol {
            message: message.into(),
            kind,
        }
    }

    pub fn new_state(message: impl Into<String>, kind: StateErrorKind) -> Self {
        Error::State {
            message: message.into(),
            kind,
        }
    }

    pub fn new_resource(message: impl Into<String>, kind: ResourceErrorKind) -> Self {
        Error::Resource {
            message: message.into(),
            kind,
        }
    }

    pub fn new_persistence(message: impl Into<String>, kind: PersistenceErrorKind) -> Self {
        Error::Persistence {
            message: message.into(),
            kind,
        }
    }
}
