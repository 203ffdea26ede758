//! Key derivation: PBKDF2-HMAC-SHA256 passphrase → workspace key

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use pbkdf2::pbkdf2_hmac;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::{random_bytes, DEFAULT_KDF_ITERATIONS, KEY_SIZE, SALT_SIZE};

pub const KDF_ALGORITHM: &str = "PBKDF2";
pub const KDF_HASH: &str = "SHA-256";

/// A 256-bit workspace key derived from the workspace passphrase.
///
/// Lives only in memory for the duration of an unlocked session.
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct WorkspaceKey {
    bytes: [u8; KEY_SIZE],
}

impl WorkspaceKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for WorkspaceKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for WorkspaceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Persisted KDF parameters, stored alongside the workspace's crypto metadata.
/// The salt is not secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub algorithm: String,
    pub hash: String,
    pub iterations: u32,
    pub salt_base64: String,
}

impl KdfParams {
    /// Fresh parameters with a random salt, generated once per workspace.
    pub fn generate(iterations: u32) -> CryptoResult<Self> {
        Ok(Self {
            algorithm: KDF_ALGORITHM.into(),
            hash: KDF_HASH.into(),
            iterations,
            salt_base64: generate_salt_b64()?,
        })
    }

    /// Derive the workspace key these parameters describe.
    pub fn derive(&self, passphrase: &SecretString) -> CryptoResult<WorkspaceKey> {
        if self.algorithm != KDF_ALGORITHM || self.hash != KDF_HASH {
            return Err(CryptoError::InvalidKdfParams(format!(
                "unsupported KDF {}/{}",
                self.algorithm, self.hash
            )));
        }
        let salt = B64
            .decode(&self.salt_base64)
            .map_err(|e| CryptoError::InvalidKdfParams(format!("salt base64: {e}")))?;
        derive_workspace_key(passphrase, &salt, self.iterations)
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            algorithm: KDF_ALGORITHM.into(),
            hash: KDF_HASH.into(),
            iterations: DEFAULT_KDF_ITERATIONS,
            salt_base64: String::new(),
        }
    }
}

/// Generate a random 16-byte salt, base64 encoded.
pub fn generate_salt_b64() -> CryptoResult<String> {
    let salt: [u8; SALT_SIZE] = random_bytes()?;
    Ok(B64.encode(salt))
}

/// Derive a 256-bit workspace key from a passphrase and salt using
/// PBKDF2-HMAC-SHA256.
///
/// Deterministic for the same inputs. The iteration count is the work factor;
/// this is CPU-bound and should be run off the async executor.
pub fn derive_workspace_key(
    passphrase: &SecretString,
    salt: &[u8],
    iterations: u32,
) -> CryptoResult<WorkspaceKey> {
    if iterations == 0 {
        return Err(CryptoError::InvalidKdfParams(
            "iteration count must be positive".into(),
        ));
    }
    if salt.is_empty() {
        return Err(CryptoError::InvalidKdfParams("salt is empty".into()));
    }

    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(
        passphrase.expose_secret().as_bytes(),
        salt,
        iterations,
        &mut key,
    );
    tracing::debug!(iterations, "derived workspace key");

    Ok(WorkspaceKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST_ITERATIONS: u32 = 1_000;

    #[test]
    fn test_kdf_deterministic() {
        let passphrase = SecretString::from("correct-horse-battery");
        let salt = [1u8; 16];

        let key1 = derive_workspace_key(&passphrase, &salt, FAST_ITERATIONS).unwrap();
        let key2 = derive_workspace_key(&passphrase, &salt, FAST_ITERATIONS).unwrap();

        assert_eq!(
            key1.as_bytes(),
            key2.as_bytes(),
            "KDF must be deterministic"
        );
    }

    #[test]
    fn test_kdf_different_passphrases() {
        let salt = [1u8; 16];

        let key1 =
            derive_workspace_key(&SecretString::from("passphrase-a"), &salt, FAST_ITERATIONS)
                .unwrap();
        let key2 =
            derive_workspace_key(&SecretString::from("passphrase-b"), &salt, FAST_ITERATIONS)
                .unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_different_salts() {
        let passphrase = SecretString::from("same-passphrase");

        let key1 = derive_workspace_key(&passphrase, &[1u8; 16], FAST_ITERATIONS).unwrap();
        let key2 = derive_workspace_key(&passphrase, &[2u8; 16], FAST_ITERATIONS).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_iterations_change_key() {
        let passphrase = SecretString::from("same-passphrase");
        let salt = [3u8; 16];

        let key1 = derive_workspace_key(&passphrase, &salt, 1_000).unwrap();
        let key2 = derive_workspace_key(&passphrase, &salt, 1_001).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_known_vector() {
        // RFC 7914 §11 PBKDF2-HMAC-SHA256 test vector, first 32 bytes
        let key = derive_workspace_key(&SecretString::from("passwd"), b"salt", 1).unwrap();
        assert_eq!(
            key.as_bytes()[..8],
            [0x55, 0xac, 0x04, 0x6e, 0x56, 0xe3, 0x08, 0x9f]
        );
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let result = derive_workspace_key(&SecretString::from("x"), &[1u8; 16], 0);
        assert!(matches!(result, Err(CryptoError::InvalidKdfParams(_))));
    }

    #[test]
    fn test_generated_params_derive() {
        let params = KdfParams::generate(FAST_ITERATIONS).unwrap();
        assert_eq!(params.algorithm, "PBKDF2");
        assert_eq!(params.hash, "SHA-256");
        assert_eq!(B64.decode(&params.salt_base64).unwrap().len(), SALT_SIZE);

        let passphrase = SecretString::from("correct-horse-battery");
        let key1 = params.derive(&passphrase).unwrap();
        let key2 = params.derive(&passphrase).unwrap();
        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_salts_are_random() {
        assert_ne!(generate_salt_b64().unwrap(), generate_salt_b64().unwrap());
    }

    #[test]
    fn test_unknown_kdf_rejected() {
        let params = KdfParams {
            algorithm: "scrypt".into(),
            ..KdfParams::generate(FAST_ITERATIONS).unwrap()
        };
        let result = params.derive(&SecretString::from("whatever"));
        assert!(matches!(result, Err(CryptoError::InvalidKdfParams(_))));
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = WorkspaceKey::from_bytes([7u8; KEY_SIZE]);
        let rendered = format!("{key:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains('7'));
    }
}
