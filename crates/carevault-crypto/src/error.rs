use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// No usable randomness or cipher provider. Fatal, never retried.
    #[error("cryptographic provider unavailable: {0}")]
    EnvironmentUnsupported(String),

    /// Rejected before any cryptographic work was done.
    #[error("invalid passphrase: {0}")]
    InvalidPassphrase(String),

    #[error("invalid KDF parameters: {0}")]
    InvalidKdfParams(String),

    #[error("incorrect workspace passphrase")]
    KeyCheckFailed,

    #[error("unsupported encrypted envelope: {0}")]
    UnsupportedEnvelope(String),

    #[error("encrypted payload context mismatch: expected {expected:?}, found {found:?}")]
    ContextMismatch { expected: String, found: String },

    /// Wrong key or tampered ciphertext; the cipher cannot tell which.
    #[error("authenticated decryption failed")]
    AuthenticationFailed,

    #[error("malformed encrypted envelope: {0}")]
    MalformedEnvelope(String),

    #[error("payload serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}
