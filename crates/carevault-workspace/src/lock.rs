//! Crypto lock state: the single place the workspace key lives.
//!
//! Transitions are `pub(crate)` and driven only by the orchestrator; everyone
//! else gets read-only snapshots, a key-bearing [`CryptoContext`] scoped to the
//! current workspace, or a `watch` subscription.
//!
//! ```text
//!   (none)    ── refresh, no meta ──► setup_required ── initialize ──► unlocked
//!   (none)    ── refresh, meta ─────► locked ── unlock ──► unlocking ──► unlocked | error
//!   unlocked  ── migrate ───────────► migrating ──► unlocked
//!   unlocked  ── reset (owner) ─────► setup_required
//!   any       ── lock / sign-out / switch ──► locked
//! ```

use carevault_core::types::MigrationProgress;
use carevault_crypto::WorkspaceKey;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use crate::meta::WorkspaceCryptoMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Locked,
    SetupRequired,
    Unlocking,
    Unlocked,
    Migrating,
    Error,
}

impl LockState {
    /// States in which the key is present and usable for record I/O.
    pub fn has_usable_key(&self) -> bool {
        matches!(self, Self::Unlocked | Self::Migrating)
    }
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Locked => "locked",
            Self::SetupRequired => "setup_required",
            Self::Unlocking => "unlocking",
            Self::Unlocked => "unlocked",
            Self::Migrating => "migrating",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Read-only projection of the lock state. Never contains key material.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CryptoSnapshot {
    pub state: LockState,
    pub workspace_id: Option<String>,
    pub has_key: bool,
    pub has_meta: bool,
    pub last_error: Option<String>,
    pub migration: Option<MigrationProgress>,
}

/// What the record codec needs for one read or write.
#[derive(Debug, Clone)]
pub struct CryptoContext {
    pub enabled: bool,
    pub workspace_id: Option<String>,
    pub key: Option<WorkspaceKey>,
}

impl CryptoContext {
    pub fn disabled(workspace_id: Option<String>) -> Self {
        Self {
            enabled: false,
            workspace_id,
            key: None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: LockState,
    workspace_id: Option<String>,
    key: Option<WorkspaceKey>,
    meta: Option<WorkspaceCryptoMeta>,
    last_error: Option<String>,
    migration: Option<MigrationProgress>,
}

impl Inner {
    fn snapshot(&self) -> CryptoSnapshot {
        CryptoSnapshot {
            state: self.state,
            workspace_id: self.workspace_id.clone(),
            has_key: self.key.is_some(),
            has_meta: self.meta.is_some(),
            last_error: self.last_error.clone(),
            migration: self.migration,
        }
    }
}

pub struct CryptoLock {
    enabled: bool,
    inner: RwLock<Inner>,
    tx: watch::Sender<CryptoSnapshot>,
}

impl CryptoLock {
    /// A fresh container. Starts `locked`, or `unlocked` with no key when
    /// encryption is disabled.
    pub fn new(enabled: bool) -> Self {
        let inner = Inner {
            state: if enabled {
                LockState::Locked
            } else {
                LockState::Unlocked
            },
            workspace_id: None,
            key: None,
            meta: None,
            last_error: None,
            migration: None,
        };
        let (tx, _rx) = watch::channel(inner.snapshot());
        Self {
            enabled,
            inner: RwLock::new(inner),
            tx,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> LockState {
        self.inner.read().state
    }

    pub fn snapshot(&self) -> CryptoSnapshot {
        self.inner.read().snapshot()
    }

    pub fn meta(&self) -> Option<WorkspaceCryptoMeta> {
        self.inner.read().meta.clone()
    }

    /// Observe every transition.
    pub fn subscribe(&self) -> watch::Receiver<CryptoSnapshot> {
        self.tx.subscribe()
    }

    /// Key context for `workspace_id`. The key is handed out only while the
    /// lock is unlocked (or migrating) for that same workspace, so a key left
    /// over from another workspace is never used.
    pub fn context(&self, workspace_id: &str) -> CryptoContext {
        if !self.enabled {
            return CryptoContext::disabled(Some(workspace_id.to_string()));
        }
        let inner = self.inner.read();
        let key = if inner.state.has_usable_key()
            && inner.workspace_id.as_deref() == Some(workspace_id)
        {
            inner.key.clone()
        } else {
            None
        };
        CryptoContext {
            enabled: true,
            workspace_id: Some(workspace_id.to_string()),
            key,
        }
    }

    pub(crate) fn is_migrating_for(&self, workspace_id: &str) -> bool {
        let inner = self.inner.read();
        inner.state == LockState::Migrating
            && inner.workspace_id.as_deref() == Some(workspace_id)
            && inner.key.is_some()
    }

    // ── Transitions ──────────────────────────────────────────────────────────

    fn transition<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = self.inner.write();
        let from = inner.state;
        let out = f(&mut *inner);
        tracing::debug!(
            from = %from,
            to = %inner.state,
            workspace_id = inner.workspace_id.as_deref().unwrap_or("-"),
            "crypto lock transition"
        );
        self.tx.send_replace(inner.snapshot());
        out
    }

    pub(crate) fn set_locked(
        &self,
        workspace_id: Option<String>,
        meta: Option<WorkspaceCryptoMeta>,
    ) {
        self.transition(|inner| {
            inner.state = LockState::Locked;
            inner.workspace_id = workspace_id;
            inner.key = None;
            inner.meta = meta;
            inner.last_error = None;
            inner.migration = None;
        });
    }

    pub(crate) fn set_setup_required(&self, workspace_id: Option<String>) {
        self.transition(|inner| {
            inner.state = LockState::SetupRequired;
            inner.workspace_id = workspace_id;
            inner.key = None;
            inner.meta = None;
            inner.last_error = None;
            inner.migration = None;
        });
    }

    pub(crate) fn set_unlocking(
        &self,
        workspace_id: Option<String>,
        meta: Option<WorkspaceCryptoMeta>,
    ) {
        self.transition(|inner| {
            inner.state = LockState::Unlocking;
            inner.workspace_id = workspace_id;
            inner.key = None;
            inner.meta = meta;
            inner.last_error = None;
        });
    }

    pub(crate) fn set_unlocked(
        &self,
        workspace_id: Option<String>,
        key: Option<WorkspaceKey>,
        meta: Option<WorkspaceCryptoMeta>,
    ) {
        self.transition(|inner| {
            inner.state = LockState::Unlocked;
            inner.workspace_id = workspace_id;
            inner.key = key;
            inner.meta = meta;
            inner.last_error = None;
            inner.migration = None;
        });
    }

    /// Complete an unlock started with [`Self::set_unlocking`]. Refused
    /// (returns `false`, key dropped) if the lock left `unlocking` for
    /// `workspace_id` while the key was being derived.
    pub(crate) fn finish_unlock(
        &self,
        workspace_id: &str,
        key: WorkspaceKey,
        meta: WorkspaceCryptoMeta,
    ) -> bool {
        self.transition(|inner| {
            let pending = inner.state == LockState::Unlocking
                && inner.workspace_id.as_deref() == Some(workspace_id);
            if pending {
                inner.state = LockState::Unlocked;
                inner.key = Some(key);
                inner.meta = Some(meta);
                inner.last_error = None;
                inner.migration = None;
            }
            pending
        })
    }

    /// Enter or advance `migrating`. Refused (returns `false`) unless the
    /// lock still holds a key for `workspace_id`.
    pub(crate) fn set_migrating(&self, workspace_id: &str, progress: MigrationProgress) -> bool {
        self.transition(|inner| {
            let usable = inner.state.has_usable_key()
                && inner.key.is_some()
                && inner.workspace_id.as_deref() == Some(workspace_id);
            if usable {
                inner.state = LockState::Migrating;
                inner.migration = Some(progress);
            }
            usable
        })
    }

    /// Back to `unlocked` after a migration run, keeping the key. A no-op if
    /// something else (a lock, a sign-out) already moved the state on.
    pub(crate) fn finish_migration(&self) {
        self.transition(|inner| {
            if inner.state == LockState::Migrating {
                inner.state = LockState::Unlocked;
                inner.migration = None;
            }
        });
    }

    pub(crate) fn set_error(&self, message: impl Into<String>) {
        self.transition(|inner| {
            inner.state = LockState::Error;
            inner.key = None;
            inner.last_error = Some(message.into());
            inner.migration = None;
        });
    }
}

impl std::fmt::Debug for CryptoLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoLock")
            .field("enabled", &self.enabled)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carevault_core::types::MigrationPhase;

    fn key() -> WorkspaceKey {
        WorkspaceKey::from_bytes([3u8; 32])
    }

    #[test]
    fn test_initial_state() {
        assert_eq!(CryptoLock::new(true).state(), LockState::Locked);
        assert_eq!(CryptoLock::new(false).state(), LockState::Unlocked);
    }

    #[test]
    fn test_context_requires_matching_workspace() {
        let lock = CryptoLock::new(true);
        lock.set_unlocked(Some("w1".into()), Some(key()), None);

        assert!(lock.context("w1").key.is_some());
        assert!(lock.context("w2").key.is_none(), "stale workspace key");
    }

    #[test]
    fn test_lock_discards_key() {
        let lock = CryptoLock::new(true);
        lock.set_unlocked(Some("w1".into()), Some(key()), None);
        lock.set_locked(Some("w1".into()), None);

        let snap = lock.snapshot();
        assert_eq!(snap.state, LockState::Locked);
        assert!(!snap.has_key);
        assert!(lock.context("w1").key.is_none());
    }

    #[test]
    fn test_error_discards_key_and_records_message() {
        let lock = CryptoLock::new(true);
        lock.set_unlocked(Some("w1".into()), Some(key()), None);
        lock.set_error("Incorrect workspace passphrase.");

        let snap = lock.snapshot();
        assert_eq!(snap.state, LockState::Error);
        assert!(!snap.has_key);
        assert_eq!(
            snap.last_error.as_deref(),
            Some("Incorrect workspace passphrase.")
        );
    }

    #[test]
    fn test_key_usable_while_migrating() {
        let lock = CryptoLock::new(true);
        lock.set_unlocked(Some("w1".into()), Some(key()), None);
        assert!(lock.set_migrating(
            "w1",
            MigrationProgress {
                done: 0,
                total: 2,
                phase: MigrationPhase::Patients,
            }
        ));

        assert!(lock.is_migrating_for("w1"));
        assert!(lock.context("w1").key.is_some());

        lock.finish_migration();
        let snap = lock.snapshot();
        assert_eq!(snap.state, LockState::Unlocked);
        assert!(snap.has_key);
        assert_eq!(snap.migration, None);
    }

    #[test]
    fn test_finish_migration_does_not_undo_lock() {
        let lock = CryptoLock::new(true);
        lock.set_unlocked(Some("w1".into()), Some(key()), None);
        let progress = MigrationProgress {
            done: 1,
            total: 2,
            phase: MigrationPhase::Patients,
        };
        assert!(lock.set_migrating("w1", progress));
        lock.set_locked(Some("w1".into()), None);
        lock.finish_migration();

        assert_eq!(lock.state(), LockState::Locked);
        assert!(!lock.is_migrating_for("w1"));
        assert!(!lock.set_migrating("w1", progress), "no migrating without a key");
        assert_eq!(lock.state(), LockState::Locked);
    }

    #[test]
    fn test_migrating_refused_for_other_workspace() {
        let lock = CryptoLock::new(true);
        lock.set_unlocked(Some("w1".into()), Some(key()), None);
        let progress = MigrationProgress {
            done: 0,
            total: 1,
            phase: MigrationPhase::Assessments,
        };
        assert!(!lock.set_migrating("w2", progress));
        assert_eq!(lock.state(), LockState::Unlocked);
    }

    fn meta() -> WorkspaceCryptoMeta {
        WorkspaceCryptoMeta {
            enc_version: carevault_crypto::ENC_VERSION,
            kdf: carevault_crypto::KdfParams::default(),
            key_check: carevault_crypto::create_key_check_envelope(&key(), "w1").unwrap(),
            initialized_at: chrono::Utc::now(),
            initialized_by: None,
        }
    }

    #[test]
    fn test_finish_unlock_from_unlocking() {
        let lock = CryptoLock::new(true);
        lock.set_unlocking(Some("w1".into()), Some(meta()));
        assert!(lock.finish_unlock("w1", key(), meta()));

        let snap = lock.snapshot();
        assert_eq!(snap.state, LockState::Unlocked);
        assert!(snap.has_key);
        assert!(lock.context("w1").key.is_some());
    }

    #[test]
    fn test_finish_unlock_does_not_undo_lock() {
        let lock = CryptoLock::new(true);
        lock.set_unlocking(Some("w1".into()), Some(meta()));
        lock.set_locked(Some("w1".into()), Some(meta()));

        assert!(!lock.finish_unlock("w1", key(), meta()));
        let snap = lock.snapshot();
        assert_eq!(snap.state, LockState::Locked);
        assert!(!snap.has_key);
        assert!(lock.context("w1").key.is_none());
    }

    #[test]
    fn test_finish_unlock_refused_for_other_workspace() {
        let lock = CryptoLock::new(true);
        lock.set_unlocking(Some("w2".into()), Some(meta()));
        assert!(!lock.finish_unlock("w1", key(), meta()));
        assert_eq!(lock.state(), LockState::Unlocking);
    }

    #[test]
    fn test_disabled_context_has_no_key() {
        let lock = CryptoLock::new(false);
        let ctx = lock.context("w1");
        assert!(!ctx.enabled);
        assert!(ctx.key.is_none());
    }

    #[test]
    fn test_subscribers_see_post_transition_state() {
        let lock = CryptoLock::new(true);
        let mut rx = lock.subscribe();
        lock.set_setup_required(Some("w1".into()));

        assert!(rx.has_changed().unwrap());
        let snap = rx.borrow_and_update().clone();
        assert_eq!(snap.state, LockState::SetupRequired);
        assert_eq!(snap.workspace_id.as_deref(), Some("w1"));
    }

    #[test]
    fn test_debug_never_prints_key() {
        let lock = CryptoLock::new(true);
        lock.set_unlocked(Some("w1".into()), Some(key()), None);
        let rendered = format!("{lock:?}");
        assert!(rendered.contains("has_key: true"));
        assert!(!rendered.contains("bytes"));
    }
}
