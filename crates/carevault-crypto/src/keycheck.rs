//! Key-check envelope: proves a candidate key is the workspace key without
//! decrypting any real record.

use serde::{Deserialize, Serialize};

use crate::envelope::{decrypt_json, encrypt_json, EncryptedEnvelope};
use crate::error::CryptoResult;
use crate::kdf::WorkspaceKey;

const SENTINEL: &str = "ok";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyCheck {
    check: String,
    workspace_id: String,
}

/// AAD binding a key-check envelope to its workspace
pub fn key_check_aad(workspace_id: &str) -> String {
    format!("workspace-key-check:{workspace_id}")
}

pub fn create_key_check_envelope(
    key: &WorkspaceKey,
    workspace_id: &str,
) -> CryptoResult<EncryptedEnvelope> {
    let sentinel = KeyCheck {
        check: SENTINEL.into(),
        workspace_id: workspace_id.into(),
    };
    encrypt_json(&sentinel, key, &key_check_aad(workspace_id))
}

/// Returns `true` only if `envelope` opens under `key` and holds this
/// workspace's sentinel. Every failure, including a malformed envelope, is
/// reported as `false`.
pub fn verify_key_check_envelope(
    key: &WorkspaceKey,
    envelope: &EncryptedEnvelope,
    workspace_id: &str,
) -> bool {
    match decrypt_json::<KeyCheck>(envelope, key, Some(&key_check_aad(workspace_id))) {
        Ok(out) => out.check == SENTINEL && out.workspace_id == workspace_id,
        Err(e) => {
            tracing::debug!(error = %e, "key check rejected");
            false
        }
    }
}
