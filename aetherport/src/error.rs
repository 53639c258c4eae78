use thiserror::Error;

/// Errors surfaced by the tunnel machinery.
///
/// Cryptographic and handshake failures are fatal for their session. TCP
/// accept and dial failures are logged and retried by the proxy loops, relay
/// errors terminate only the affected pair, and cancellation or EOF are not
/// errors at the session boundary.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("invalid cryptographic material: {0}")]
    CryptoMaterialInvalid(String),

    #[error(transparent)]
    Certificate(#[from] aetherport_identity::Error),

    #[error("handshake failed: no pre-shared key authenticated the peer")]
    HandshakePskMismatch,

    #[error("handshake failed: peer payload rejected: {0}")]
    HandshakePayloadInvalid(aetherport_identity::Error),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("signalling timed out")]
    SignalTimeout,

    #[error("signalling failed: {0}")]
    Signal(String),

    #[error("peer unreachable")]
    PeerUnreachable,

    #[error("transport failed: {0}")]
    TransportFailed(String),

    #[error("stream closed")]
    StreamClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<aetherport_mux::Error> for Error {
    fn from(value: aetherport_mux::Error) -> Self {
        match value {
            aetherport_mux::Error::SessionClosed => Error::StreamClosed,
            aetherport_mux::Error::Io(error) => Error::Io(error),
        }
    }
}

impl From<webrtc::Error> for Error {
    fn from(value: webrtc::Error) -> Self {
        Error::TransportFailed(value.to_string())
    }
}
