use carevault_crypto::CryptoError;
use thiserror::Error;

pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("sign in is required")]
    SignInRequired,

    #[error("workspace context not found")]
    NoWorkspace,

    #[error("only workspace owners can {0}")]
    RoleNotPermitted(&'static str),

    #[error("workspace encryption is already initialized")]
    AlreadyInitialized,

    #[error("workspace encryption has not been initialized yet")]
    NotInitialized,

    /// A protected record was read or written without a usable key.
    #[error("workspace is locked")]
    Locked,

    #[error("workspace encryption is disabled")]
    EncryptionDisabled,

    #[error("malformed workspace crypto metadata: {0}")]
    MalformedMeta(String),

    #[error("migration interrupted after {done}/{total} records")]
    MigrationInterrupted { done: usize, total: usize },

    #[error("migration failed after {done}/{total} records: {source}")]
    MigrationFailed {
        done: usize,
        total: usize,
        source: Box<WorkspaceError>,
    },

    #[error("{kind} not found: {id}")]
    RecordNotFound { kind: &'static str, id: String },

    /// Settings or row store failure
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl WorkspaceError {
    /// Message suitable for showing to the person at the keyboard. Passphrase
    /// failures never reveal which part of the check failed.
    pub fn user_message(&self) -> String {
        match self {
            Self::Crypto(CryptoError::KeyCheckFailed) => "Incorrect workspace passphrase.".into(),
            Self::Crypto(CryptoError::InvalidPassphrase(reason)) => reason.clone(),
            Self::MigrationFailed {
                done,
                total,
                source,
            } => format!(
                "Migration stopped after {done}/{total} records: {}",
                source.user_message()
            ),
            other => other.to_string(),
        }
    }
}
