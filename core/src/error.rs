use thiserror::Error;

/// Core cryptographic subsystem errors.
///
/// String payloads carry diagnostics that are safe to log locally but must
/// never be forwarded to a relay or rendered verbatim in a UI: handshake
/// failures present to users as "secure session could not be established",
/// decryption failures as a redacted placeholder.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("wrong password or corrupted data")]
    WrongPasswordOrCorrupt,
    #[error("not found")]
    NotFound,
    #[error("stored key uses a legacy, unsupported signing purpose")]
    LegacyFormat,
    #[error("signature verification failed")]
    BadSignature,
    #[error("no identity public key on file for peer")]
    NoPeerIdentity,
    #[error("ephemeral exchange key pair is no longer available")]
    ExchangeLost,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("replay-protection fields missing from record")]
    MissingReplayFields,
    #[error("nonce is not valid base64 or too short")]
    BadNonce,
    #[error("record could not be decrypted")]
    Undecipherable,
    #[error("nonce has already been accepted")]
    DuplicateNonce,
    #[error("message timestamp is too old")]
    MessageTooOld,
    #[error("message timestamp is from the future")]
    MessageFromFuture,
    #[error("sequence number is not greater than the last accepted value")]
    InvalidSequence,
    #[error("storage uniqueness constraint violated")]
    StorageUniquenessViolation,
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Maps a raw storage-layer uniqueness violation onto the public
    /// `DuplicateNonce` kind used by the durable insert-time backstop.
    pub fn from_storage_conflict() -> Self {
        CoreError::DuplicateNonce
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
