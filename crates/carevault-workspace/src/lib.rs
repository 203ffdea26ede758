//! carevault-workspace: workspace encryption state machine, record codec, and
//! the record repository it protects.
//!
//! One [`CryptoLock`] per session holds the only copy of the workspace key.
//! The [`WorkspaceCrypto`] orchestrator is the only writer of that lock; the
//! [`WorkspaceRepository`] reads the key from it on every call.

pub mod backend;
pub mod codec;
pub mod error;
pub mod lock;
pub mod meta;
pub mod orchestrator;
pub mod repository;
pub mod session;
pub mod store;

use std::sync::Arc;

use carevault_core::config::CryptoConfig;
use carevault_core::types::Session;

pub use backend::LocalBackend;
pub use error::{WorkspaceError, WorkspaceResult};
pub use lock::{CryptoContext, CryptoLock, CryptoSnapshot, LockState};
pub use meta::{MigrationMarker, WorkspaceCryptoMeta};
pub use orchestrator::{LockStatus, WorkspaceCrypto};
pub use repository::WorkspaceRepository;
pub use session::SessionCell;
pub use store::{ProgressFn, RecordStore, RowStore, SettingsStore};

/// An orchestrator and a repository sharing one session and one lock.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub crypto: Arc<WorkspaceCrypto>,
    pub records: Arc<WorkspaceRepository>,
}

/// Wire up a session against a backend that stores both settings and rows.
pub fn open_workspace<B>(config: &CryptoConfig, session: Session, backend: Arc<B>) -> Workspace
where
    B: SettingsStore + RowStore + 'static,
{
    let lock = Arc::new(CryptoLock::new(config.enabled));
    let session = Arc::new(SessionCell::new(session));
    let records = Arc::new(WorkspaceRepository::new(
        backend.clone(),
        lock.clone(),
        session.clone(),
    ));
    let crypto = Arc::new(WorkspaceCrypto::new(
        config.clone(),
        lock,
        session,
        backend,
        records.clone(),
    ));
    Workspace { crypto, records }
}
