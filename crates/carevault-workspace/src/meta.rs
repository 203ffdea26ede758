//! Persisted workspace crypto metadata and the migration marker.
//!
//! Both live in the settings store as JSON blobs keyed per workspace. They are
//! parsed into fixed, versioned types on read; an unknown `encVersion` fails
//! immediately.

use carevault_crypto::{CryptoError, EncryptedEnvelope, KdfParams, ENC_VERSION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{WorkspaceError, WorkspaceResult};

/// Settings key holding [`WorkspaceCryptoMeta`]
pub const CRYPTO_META_KEY: &str = "workspace_crypto_meta";

/// Settings key holding [`MigrationMarker`]
pub const CRYPTO_MIGRATED_KEY: &str = "workspace_crypto_migrated_at";

/// One per initialized workspace. Absent means setup is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceCryptoMeta {
    pub enc_version: u32,
    pub kdf: KdfParams,
    pub key_check: EncryptedEnvelope,
    pub initialized_at: DateTime<Utc>,
    pub initialized_by: Option<String>,
}

impl WorkspaceCryptoMeta {
    pub fn from_setting(value: Value) -> WorkspaceResult<Self> {
        let meta: Self = serde_json::from_value(value)
            .map_err(|e| WorkspaceError::MalformedMeta(e.to_string()))?;
        if meta.enc_version != ENC_VERSION {
            return Err(CryptoError::UnsupportedEnvelope(format!(
                "workspace metadata version {} (expected {ENC_VERSION})",
                meta.enc_version
            ))
            .into());
        }
        Ok(meta)
    }

    pub fn to_setting(&self) -> WorkspaceResult<Value> {
        serde_json::to_value(self).map_err(|e| CryptoError::Serialization(e).into())
    }
}

/// One-way marker written after a migration completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationMarker {
    pub completed_at: DateTime<Utc>,
}
