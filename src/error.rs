use thiserror::Error;

/// Errors produced by the streaming pipeline.
///
/// `Throttled` and `NotOpen` are deliberately absent here: they are
/// routine, per-frame outcomes of [`crate::dtls::StreamingController::send_update`]
/// and are represented by [`crate::dtls::SendOutcome`] instead of an error.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("hub {hub} channel set mismatch: missing {missing:?}, extra {extra:?}")]
    ConfigMismatch {
        hub: String,
        missing: Vec<u8>,
        extra: Vec<u8>,
    },

    #[error("{method} {path} failed with status {status}: {body}")]
    HttpFailure {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    #[error("TLS failure talking to hub: {0}")]
    TlsFailure(String),

    #[error("DTLS handshake failed: {0}")]
    DtlsHandshakeFailure(String),

    #[error("transport lost: {0}")]
    TransportLoss(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
