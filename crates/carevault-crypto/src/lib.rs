//! carevault-crypto: zero-knowledge envelope encryption for workspace records
//!
//! Key hierarchy:
//! ```text
//! Workspace passphrase (known only to members)
//!   └── Workspace Key (256-bit, PBKDF2-HMAC-SHA256, per-workspace random salt)
//!         ├── Key-check envelope: AES-256-GCM over a fixed sentinel,
//!         │     AAD = "workspace-key-check:<workspace_id>"
//!         └── Record envelopes: AES-256-GCM over the record's JSON,
//!               AAD = "<table>:<workspace_id>:<record_id>"
//! ```
//!
//! Every envelope carries its own random 96-bit IV, so sealing the same
//! payload twice never yields the same ciphertext.

pub mod envelope;
pub mod error;
pub mod kdf;
pub mod keycheck;

pub use envelope::{decrypt_json, encrypt_json, EncryptedEnvelope};
pub use error::{CryptoError, CryptoResult};
pub use kdf::{derive_workspace_key, generate_salt_b64, KdfParams, WorkspaceKey};
pub use keycheck::{create_key_check_envelope, key_check_aad, verify_key_check_envelope};

/// Envelope schema version understood by this build
pub const ENC_VERSION: u32 = 1;

/// Algorithm tag written into every envelope
pub const ALGORITHM: &str = "AES-GCM-256";

/// Size of a workspace key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const IV_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of a freshly generated KDF salt
pub const SALT_SIZE: usize = 16;

/// Default PBKDF2 iteration count for new workspaces
pub const DEFAULT_KDF_ITERATIONS: u32 = 310_000;

/// Fill a fixed-size buffer from the OS CSPRNG.
///
/// A failing OS RNG means the environment cannot do cryptography at all.
pub(crate) fn random_bytes<const N: usize>() -> CryptoResult<[u8; N]> {
    use rand::RngCore;

    let mut out = [0u8; N];
    rand::rngs::OsRng
        .try_fill_bytes(&mut out)
        .map_err(|e| CryptoError::EnvironmentUnsupported(format!("OS randomness: {e}")))?;
    Ok(out)
}
