//! Workspace crypto orchestrator: setup, unlock, lock, migration, and reset
//! for the active workspace.
//!
//! Cryptographic operations are serialised per orchestrator by `op_guard`.
//! `lock_workspace`, `sign_out` and `switch_workspace` never wait on it, so a
//! lock always takes effect immediately; an in-flight migration notices at the
//! next record and stops.

use std::sync::Arc;

use carevault_core::config::CryptoConfig;
use carevault_core::types::{
    AssessmentDraft, MigrationPhase, MigrationProgress, MigrationReport, PatientInput, Role,
    Session, UnprotectedCounts,
};
use carevault_crypto::{
    create_key_check_envelope, verify_key_check_envelope, CryptoError, KdfParams, WorkspaceKey,
    ENC_VERSION,
};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::error::{WorkspaceError, WorkspaceResult};
use crate::lock::{CryptoContext, CryptoLock, CryptoSnapshot, LockState};
use crate::meta::{MigrationMarker, WorkspaceCryptoMeta, CRYPTO_META_KEY, CRYPTO_MIGRATED_KEY};
use crate::session::{SessionCell, WorkspaceIdentity};
use crate::store::{ProgressFn, RecordStore, SettingsStore};

const INCORRECT_PASSPHRASE: &str = "Incorrect workspace passphrase.";

/// Result of [`WorkspaceCrypto::refresh_lock_state`]
#[derive(Debug, Clone, PartialEq)]
pub struct LockStatus {
    pub requires_setup: bool,
    pub meta: Option<WorkspaceCryptoMeta>,
}

pub struct WorkspaceCrypto {
    config: CryptoConfig,
    lock: Arc<CryptoLock>,
    session: Arc<SessionCell>,
    settings: Arc<dyn SettingsStore>,
    records: Arc<dyn RecordStore>,
    op_guard: Mutex<()>,
}

impl WorkspaceCrypto {
    /// `lock` must be the same container the record repository reads keys
    /// from. Whether encryption is on is taken from the lock.
    pub fn new(
        config: CryptoConfig,
        lock: Arc<CryptoLock>,
        session: Arc<SessionCell>,
        settings: Arc<dyn SettingsStore>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            config,
            lock,
            session,
            settings,
            records,
            op_guard: Mutex::new(()),
        }
    }

    /// Encryption applies only to signed-in sessions with the feature on.
    pub fn is_enabled(&self) -> bool {
        self.lock.is_enabled() && self.session.is_authenticated()
    }

    pub fn snapshot(&self) -> CryptoSnapshot {
        self.lock.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<CryptoSnapshot> {
        self.lock.subscribe()
    }

    pub fn session(&self) -> Session {
        self.session.get()
    }

    /// Key context for the current session's workspace.
    pub fn crypto_context(&self) -> CryptoContext {
        let workspace_id = self.session.workspace_id();
        if !self.is_enabled() {
            return CryptoContext::disabled(workspace_id);
        }
        match workspace_id {
            Some(ws) => self.lock.context(&ws),
            None => CryptoContext {
                enabled: true,
                workspace_id: None,
                key: None,
            },
        }
    }

    async fn load_meta(&self, workspace_id: &str) -> WorkspaceResult<Option<WorkspaceCryptoMeta>> {
        self.settings
            .get_setting(workspace_id, CRYPTO_META_KEY)
            .await?
            .map(WorkspaceCryptoMeta::from_setting)
            .transpose()
    }

    // ── Lock state ───────────────────────────────────────────────────────────

    /// Re-read the workspace's metadata and settle the lock state: no
    /// metadata means `setup_required`, otherwise `locked`. A session already
    /// unlocked for this workspace stays unlocked.
    pub async fn refresh_lock_state(&self) -> WorkspaceResult<LockStatus> {
        if !self.is_enabled() {
            self.lock
                .set_unlocked(self.session.workspace_id(), None, None);
            return Ok(LockStatus {
                requires_setup: false,
                meta: None,
            });
        }
        let identity = self.session.require_workspace()?;
        let _guard = self.op_guard.lock().await;
        let ws = identity.workspace_id;

        let Some(meta) = self.load_meta(&ws).await? else {
            self.lock.set_setup_required(Some(ws));
            return Ok(LockStatus {
                requires_setup: true,
                meta: None,
            });
        };

        let snap = self.lock.snapshot();
        let keep_key = snap.state.has_usable_key() && snap.workspace_id.as_deref() == Some(&ws);
        if !keep_key {
            self.lock.set_locked(Some(ws), Some(meta.clone()));
        }
        Ok(LockStatus {
            requires_setup: false,
            meta: Some(meta),
        })
    }

    /// Set the workspace passphrase for the first time (owner only).
    ///
    /// Fails with `AlreadyInitialized`, leaving the lock state untouched, when
    /// the workspace already has metadata.
    pub async fn initialize_workspace_passphrase(
        &self,
        passphrase: &SecretString,
    ) -> WorkspaceResult<()> {
        if !self.lock.is_enabled() {
            return Err(WorkspaceError::EncryptionDisabled);
        }
        let passphrase = self.checked_passphrase(passphrase)?;
        let identity = self.session.require_workspace()?;
        if !identity.is_owner {
            return Err(WorkspaceError::RoleNotPermitted(
                "initialize workspace encryption",
            ));
        }

        let _guard = self.op_guard.lock().await;
        let ws = identity.workspace_id.clone();
        if self.load_meta(&ws).await?.is_some() {
            return Err(WorkspaceError::AlreadyInitialized);
        }

        if self.config.is_weak_kdf() {
            warn!(
                iterations = self.config.kdf_iterations,
                "initializing workspace with a weak KDF iteration count"
            );
        }

        self.lock.set_unlocking(Some(ws.clone()), None);
        match self.create_meta(&identity, passphrase).await {
            Ok((key, meta)) => {
                self.lock.set_unlocked(Some(ws.clone()), Some(key), Some(meta));
                info!(workspace_id = %ws, "workspace encryption initialized");
                Ok(())
            }
            Err(e) => {
                warn!(workspace_id = %ws, error = %e, "workspace encryption setup failed");
                match self.load_meta(&ws).await {
                    Ok(Some(meta)) => self.lock.set_locked(Some(ws), Some(meta)),
                    _ => self.lock.set_setup_required(Some(ws)),
                }
                Err(e)
            }
        }
    }

    async fn create_meta(
        &self,
        identity: &WorkspaceIdentity,
        passphrase: SecretString,
    ) -> WorkspaceResult<(WorkspaceKey, WorkspaceCryptoMeta)> {
        let ws = &identity.workspace_id;
        let kdf = KdfParams::generate(self.config.kdf_iterations)?;
        let key = derive_off_thread(kdf.clone(), passphrase).await?;
        let meta = WorkspaceCryptoMeta {
            enc_version: ENC_VERSION,
            kdf,
            key_check: create_key_check_envelope(&key, ws)?,
            initialized_at: Utc::now(),
            initialized_by: identity.user_id.clone(),
        };

        // Another device may have finished setup while we were deriving.
        if self.load_meta(ws).await?.is_some() {
            return Err(WorkspaceError::AlreadyInitialized);
        }
        self.settings
            .upsert_setting(ws, CRYPTO_META_KEY, meta.to_setting()?)
            .await?;
        Ok((key, meta))
    }

    /// Derive the key from the stored KDF parameters and verify it against
    /// the key-check envelope.
    pub async fn unlock_workspace(&self, passphrase: &SecretString) -> WorkspaceResult<()> {
        if !self.is_enabled() {
            self.lock
                .set_unlocked(self.session.workspace_id(), None, None);
            return Ok(());
        }
        let passphrase = trimmed(passphrase);
        if passphrase.expose_secret().is_empty() {
            return Err(CryptoError::InvalidPassphrase("passphrase is required".into()).into());
        }
        let identity = self.session.require_workspace()?;

        let _guard = self.op_guard.lock().await;
        let ws = identity.workspace_id;
        let Some(meta) = self.load_meta(&ws).await? else {
            self.lock.set_setup_required(Some(ws));
            return Err(WorkspaceError::NotInitialized);
        };

        self.lock.set_unlocking(Some(ws.clone()), Some(meta.clone()));
        let key = match derive_off_thread(meta.kdf.clone(), passphrase).await {
            Ok(key) => key,
            // Bad stored KDF parameters look exactly like a wrong passphrase.
            Err(WorkspaceError::Crypto(CryptoError::InvalidKdfParams(detail))) => {
                tracing::debug!(workspace_id = %ws, %detail, "stored KDF parameters rejected");
                warn!(workspace_id = %ws, "workspace unlock rejected");
                self.lock.set_error(INCORRECT_PASSPHRASE);
                return Err(CryptoError::KeyCheckFailed.into());
            }
            Err(e) => {
                self.lock.set_error(e.user_message());
                return Err(e);
            }
        };

        if !verify_key_check_envelope(&key, &meta.key_check, &ws) {
            warn!(workspace_id = %ws, "workspace unlock rejected");
            self.lock.set_error(INCORRECT_PASSPHRASE);
            return Err(CryptoError::KeyCheckFailed.into());
        }

        // A sign-out, switch or lock during derivation already moved the lock on.
        if self.session.workspace_id().as_deref() != Some(ws.as_str())
            || !self.lock.finish_unlock(&ws, key, meta)
        {
            return Err(WorkspaceError::Locked);
        }

        info!(workspace_id = %ws, "workspace unlocked");
        Ok(())
    }

    /// Discard the in-memory key. Metadata is kept.
    pub fn lock_workspace(&self) {
        let ws = self.session.workspace_id();
        if !self.lock.is_enabled() {
            self.lock.set_unlocked(ws, None, None);
            return;
        }
        self.lock.set_locked(ws.clone(), self.lock.meta());
        info!(workspace_id = ws.as_deref().unwrap_or("-"), "workspace locked");
    }

    /// Drop to a guest session and discard the key.
    pub fn sign_out(&self) {
        self.session.set(Session::guest());
        if self.lock.is_enabled() {
            self.lock.set_locked(None, None);
        } else {
            self.lock.set_unlocked(None, None, None);
        }
        info!("signed out; workspace key discarded");
    }

    /// Make `workspace_id` the active workspace. The key for the previous one
    /// is discarded; call [`Self::refresh_lock_state`] next.
    pub fn switch_workspace(
        &self,
        workspace_id: impl Into<String>,
        role: Role,
    ) -> WorkspaceResult<()> {
        let mut session = self.session.get();
        if !session.is_authenticated() {
            return Err(WorkspaceError::SignInRequired);
        }
        let workspace_id = workspace_id.into();
        session.workspace_id = Some(workspace_id.clone());
        session.role = Some(role);
        self.session.set(session);

        if self.lock.is_enabled() {
            self.lock.set_locked(Some(workspace_id.clone()), None);
        } else {
            self.lock.set_unlocked(Some(workspace_id.clone()), None, None);
        }
        info!(workspace_id = %workspace_id, "switched workspace");
        Ok(())
    }

    // ── Migration ────────────────────────────────────────────────────────────

    /// Records still stored in plaintext. Zero for guests or when disabled.
    pub async fn count_unencrypted_records(&self) -> WorkspaceResult<UnprotectedCounts> {
        if !self.is_enabled() {
            return Ok(UnprotectedCounts::default());
        }
        self.records.count_unprotected_records().await
    }

    pub async fn has_migration_marker(&self) -> WorkspaceResult<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let identity = self.session.require_workspace()?;
        Ok(self
            .settings
            .get_setting(&identity.workspace_id, CRYPTO_MIGRATED_KEY)
            .await?
            .is_some())
    }

    /// Re-write every legacy plaintext record through the codec, one at a
    /// time, patients first.
    ///
    /// Stops with `MigrationInterrupted` if the workspace is locked in between
    /// records. A failing record stops the run with `MigrationFailed`. Either
    /// way the records already done stay encrypted and a later run resumes
    /// with the rest.
    pub async fn migrate_plaintext_records(
        &self,
        on_progress: Option<&ProgressFn>,
    ) -> WorkspaceResult<MigrationReport> {
        let identity = self.session.require_workspace()?;
        if !self.lock.is_enabled() {
            return Err(WorkspaceError::EncryptionDisabled);
        }

        let _guard = self.op_guard.lock().await;
        let ws = identity.workspace_id;
        if self.lock.state() != LockState::Unlocked || self.lock.context(&ws).key.is_none() {
            return Err(WorkspaceError::Locked);
        }

        let patients = self.records.list_legacy_plaintext_patients().await?;
        let assessments = self.records.list_legacy_plaintext_assessments().await?;
        let total = patients.len() + assessments.len();
        let mut done = 0;
        info!(
            workspace_id = %ws,
            patients = patients.len(),
            assessments = assessments.len(),
            "starting plaintext migration"
        );

        let start = MigrationProgress {
            done,
            total,
            phase: MigrationPhase::Patients,
        };
        if !self.lock.set_migrating(&ws, start) {
            return Err(WorkspaceError::MigrationInterrupted { done, total });
        }

        for patient in &patients {
            self.ensure_still_migrating(&ws, done, total)?;
            let input = PatientInput::from(&patient.profile);
            if let Err(e) = self.records.update_patient(&patient.id, &input).await {
                return Err(self.migration_failed(&ws, done, total, e));
            }
            done += 1;
            self.report(&ws, done, total, MigrationPhase::Patients, on_progress);
        }

        for assessment in assessments {
            self.ensure_still_migrating(&ws, done, total)?;
            let draft = AssessmentDraft::from(assessment);
            if let Err(e) = self.records.upsert_assessment(draft).await {
                return Err(self.migration_failed(&ws, done, total, e));
            }
            done += 1;
            self.report(&ws, done, total, MigrationPhase::Assessments, on_progress);
        }

        let marker = MigrationMarker {
            completed_at: Utc::now(),
        };
        let marker = serde_json::to_value(&marker).map_err(CryptoError::from)?;
        if let Err(e) = self
            .settings
            .upsert_setting(&ws, CRYPTO_MIGRATED_KEY, marker)
            .await
        {
            self.lock.finish_migration();
            return Err(e.into());
        }

        self.lock.finish_migration();
        info!(workspace_id = %ws, done, total, "plaintext migration complete");
        Ok(MigrationReport {
            migrated_patients: patients.len(),
            migrated_assessments: done - patients.len(),
        })
    }

    fn ensure_still_migrating(&self, ws: &str, done: usize, total: usize) -> WorkspaceResult<()> {
        if self.lock.is_migrating_for(ws) {
            return Ok(());
        }
        warn!(workspace_id = %ws, done, total, "migration interrupted by lock");
        Err(WorkspaceError::MigrationInterrupted { done, total })
    }

    fn migration_failed(
        &self,
        ws: &str,
        done: usize,
        total: usize,
        source: WorkspaceError,
    ) -> WorkspaceError {
        warn!(workspace_id = %ws, done, total, error = %source, "migration failed");
        self.lock.finish_migration();
        WorkspaceError::MigrationFailed {
            done,
            total,
            source: Box::new(source),
        }
    }

    fn report(
        &self,
        ws: &str,
        done: usize,
        total: usize,
        phase: MigrationPhase,
        on_progress: Option<&ProgressFn>,
    ) {
        let progress = MigrationProgress { done, total, phase };
        tracing::debug!(workspace_id = %ws, done, total, ?phase, "migrated record");
        // Refused once the lock has moved on; the next record check stops.
        self.lock.set_migrating(ws, progress);
        if let Some(cb) = on_progress {
            cb(progress);
        }
    }

    // ── Reset ────────────────────────────────────────────────────────────────

    /// Delete every record and the crypto metadata of the workspace (owner
    /// only). Irreversible. Does not require the workspace to be unlocked.
    pub async fn reset_workspace_encrypted_data(&self) -> WorkspaceResult<()> {
        let identity = self.session.require_workspace()?;
        if !identity.is_owner {
            return Err(WorkspaceError::RoleNotPermitted(
                "reset workspace encrypted data",
            ));
        }

        let _guard = self.op_guard.lock().await;
        let ws = identity.workspace_id;
        warn!(workspace_id = %ws, "resetting workspace encrypted data");

        self.records.reset_workspace_data().await?;
        self.settings.delete_setting(&ws, CRYPTO_META_KEY).await?;
        self.settings.delete_setting(&ws, CRYPTO_MIGRATED_KEY).await?;

        if self.lock.is_enabled() {
            self.lock.set_setup_required(Some(ws.clone()));
        } else {
            self.lock.set_unlocked(Some(ws.clone()), None, None);
        }
        info!(workspace_id = %ws, "workspace reset");
        Ok(())
    }

    fn checked_passphrase(&self, passphrase: &SecretString) -> WorkspaceResult<SecretString> {
        let passphrase = trimmed(passphrase);
        let min = self.config.min_passphrase_len;
        if passphrase.expose_secret().chars().count() < min {
            return Err(CryptoError::InvalidPassphrase(format!(
                "passphrase must be at least {min} characters"
            ))
            .into());
        }
        Ok(passphrase)
    }
}

fn trimmed(passphrase: &SecretString) -> SecretString {
    SecretString::from(passphrase.expose_secret().trim().to_string())
}

/// PBKDF2 is deliberately slow; keep it off the async executor.
async fn derive_off_thread(
    kdf: KdfParams,
    passphrase: SecretString,
) -> WorkspaceResult<WorkspaceKey> {
    let key = tokio::task::spawn_blocking(move || kdf.derive(&passphrase))
        .await
        .map_err(|e| CryptoError::EnvironmentUnsupported(format!("key derivation task: {e}")))??;
    Ok(key)
}

impl std::fmt::Debug for WorkspaceCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceCrypto")
            .field("config", &self.config)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}
