//! Self-describing AES-256-GCM JSON envelopes
//!
//! Wire format (JSON):
//! ```text
//! { "encVersion": 1, "algorithm": "AES-GCM-256",
//!   "ivBase64": "<12 random bytes>", "ciphertextBase64": "<ciphertext || 16-byte tag>",
//!   "aad": "<table>:<workspace_id>:<record_id>" }
//! ```
//!
//! The AAD is authenticated, not encrypted. It binds a ciphertext to one
//! record's logical identity, so an envelope moved onto another record or into
//! another workspace fails to open.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::WorkspaceKey;
use crate::{random_bytes, ALGORITHM, ENC_VERSION, IV_SIZE, TAG_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub enc_version: u32,
    pub algorithm: String,
    pub iv_base64: String,
    pub ciphertext_base64: String,
    pub aad: String,
}

impl EncryptedEnvelope {
    /// Fail fast on envelopes written by a different schema or cipher.
    pub fn check_header(&self) -> CryptoResult<()> {
        if self.enc_version != ENC_VERSION {
            return Err(CryptoError::UnsupportedEnvelope(format!(
                "version {} (expected {ENC_VERSION})",
                self.enc_version
            )));
        }
        if self.algorithm != ALGORITHM {
            return Err(CryptoError::UnsupportedEnvelope(format!(
                "algorithm {:?} (expected {ALGORITHM:?})",
                self.algorithm
            )));
        }
        Ok(())
    }
}

/// Serialize `payload` to JSON and seal it under `key`, binding `aad`.
///
/// A fresh random IV is drawn for every call.
pub fn encrypt_json<T: Serialize + ?Sized>(
    payload: &T,
    key: &WorkspaceKey,
    aad: &str,
) -> CryptoResult<EncryptedEnvelope> {
    let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);
    let iv: [u8; IV_SIZE] = random_bytes()?;

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext.as_slice(),
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| CryptoError::EnvironmentUnsupported(format!("AES-256-GCM encrypt: {e}")))?;

    Ok(EncryptedEnvelope {
        enc_version: ENC_VERSION,
        algorithm: ALGORITHM.into(),
        iv_base64: B64.encode(iv),
        ciphertext_base64: B64.encode(ciphertext),
        aad: aad.into(),
    })
}

/// Open an envelope and deserialize its JSON payload.
///
/// Checks, in order: envelope version and algorithm, `expected_aad` (when
/// given) against the envelope's AAD, then the GCM tag. A wrong key and a
/// tampered ciphertext both surface as `AuthenticationFailed`.
pub fn decrypt_json<T: DeserializeOwned>(
    envelope: &EncryptedEnvelope,
    key: &WorkspaceKey,
    expected_aad: Option<&str>,
) -> CryptoResult<T> {
    envelope.check_header()?;

    if let Some(expected) = expected_aad {
        if expected != envelope.aad {
            return Err(CryptoError::ContextMismatch {
                expected: expected.into(),
                found: envelope.aad.clone(),
            });
        }
    }

    let iv = B64
        .decode(&envelope.iv_base64)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("iv base64: {e}")))?;
    if iv.len() != IV_SIZE {
        return Err(CryptoError::MalformedEnvelope(format!(
            "IV must be {IV_SIZE} bytes, got {}",
            iv.len()
        )));
    }
    let ciphertext = B64
        .decode(&envelope.ciphertext_base64)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("ciphertext base64: {e}")))?;
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::MalformedEnvelope(format!(
            "ciphertext too short: {} bytes (minimum {TAG_SIZE})",
            ciphertext.len()
        )));
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: &ciphertext,
                    aad: envelope.aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?,
    );

    Ok(serde_json::from_slice(plaintext.as_slice())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KEY_SIZE;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn key(byte: u8) -> WorkspaceKey {
        WorkspaceKey::from_bytes([byte; KEY_SIZE])
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let payload = json!({"alias": "Baby A", "ageMonths": 14, "tags": ["x", null]});
        let env = encrypt_json(&payload, &key(1), "patients:w1:p1").unwrap();
        let out: Value = decrypt_json(&env, &key(1), Some("patients:w1:p1")).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_envelope_header() {
        let env = encrypt_json(&json!({}), &key(1), "a").unwrap();
        assert_eq!(env.enc_version, 1);
        assert_eq!(env.algorithm, "AES-GCM-256");
        assert_eq!(env.aad, "a");
        assert_eq!(B64.decode(&env.iv_base64).unwrap().len(), IV_SIZE);
    }

    #[test]
    fn test_wire_field_names() {
        let env = encrypt_json(&json!(1), &key(1), "a").unwrap();
        let wire = serde_json::to_value(&env).unwrap();
        for field in ["encVersion", "algorithm", "ivBase64", "ciphertextBase64", "aad"] {
            assert!(wire.get(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn test_encryption_is_nondeterministic() {
        let payload = json!({"alias": "same"});
        let a = encrypt_json(&payload, &key(1), "patients:w1:p1").unwrap();
        let b = encrypt_json(&payload, &key(1), "patients:w1:p1").unwrap();
        assert_ne!(a.iv_base64, b.iv_base64);
        assert_ne!(a.ciphertext_base64, b.ciphertext_base64);
    }

    #[test]
    fn test_context_mismatch() {
        let env = encrypt_json(&json!({"alias": "x"}), &key(1), "patients:w1:p1").unwrap();
        let result = decrypt_json::<Value>(&env, &key(1), Some("patients:w1:p2"));
        assert!(matches!(result, Err(CryptoError::ContextMismatch { .. })));
    }

    #[test]
    fn test_relabelled_aad_fails_authentication() {
        // Rewriting the stored aad to match the caller still fails: the tag
        // covers the original context.
        let mut env = encrypt_json(&json!({"alias": "x"}), &key(1), "patients:w1:p1").unwrap();
        env.aad = "patients:w1:p2".into();
        let result = decrypt_json::<Value>(&env, &key(1), Some("patients:w1:p2"));
        assert!(matches!(result, Err(CryptoError::AuthenticationFailed)));
    }

    #[test]
    fn test_no_expected_aad_uses_stored_aad() {
        let env = encrypt_json(&json!("v"), &key(1), "ctx").unwrap();
        let out: String = decrypt_json(&env, &key(1), None).unwrap();
        assert_eq!(out, "v");
    }

    #[test]
    fn test_wrong_key() {
        let env = encrypt_json(&json!({"a": 1}), &key(1), "ctx").unwrap();
        let result = decrypt_json::<Value>(&env, &key(2), Some("ctx"));
        assert!(matches!(result, Err(CryptoError::AuthenticationFailed)));
    }

    #[test]
    fn test_tampered_ciphertext() {
        let mut env = encrypt_json(&json!({"a": 1}), &key(1), "ctx").unwrap();
        let mut ct = B64.decode(&env.ciphertext_base64).unwrap();
        ct[0] ^= 0xFF;
        env.ciphertext_base64 = B64.encode(ct);

        let result = decrypt_json::<Value>(&env, &key(1), Some("ctx"));
        assert!(matches!(result, Err(CryptoError::AuthenticationFailed)));
    }

    #[test]
    fn test_unsupported_version() {
        let mut env = encrypt_json(&json!(null), &key(1), "ctx").unwrap();
        env.enc_version = 2;
        let result = decrypt_json::<Value>(&env, &key(1), Some("ctx"));
        assert!(matches!(result, Err(CryptoError::UnsupportedEnvelope(_))));
    }

    #[test]
    fn test_unsupported_algorithm() {
        let mut env = encrypt_json(&json!(null), &key(1), "ctx").unwrap();
        env.algorithm = "XCHACHA20-POLY1305".into();
        let result = decrypt_json::<Value>(&env, &key(1), Some("ctx"));
        assert!(matches!(result, Err(CryptoError::UnsupportedEnvelope(_))));
    }

    #[test]
    fn test_version_checked_before_context() {
        let mut env = encrypt_json(&json!(null), &key(1), "ctx").unwrap();
        env.enc_version = 0;
        let result = decrypt_json::<Value>(&env, &key(1), Some("other"));
        assert!(matches!(result, Err(CryptoError::UnsupportedEnvelope(_))));
    }

    #[test]
    fn test_malformed_iv() {
        let mut env = encrypt_json(&json!(null), &key(1), "ctx").unwrap();
        env.iv_base64 = B64.encode([0u8; 8]);
        let result = decrypt_json::<Value>(&env, &key(1), Some("ctx"));
        assert!(matches!(result, Err(CryptoError::MalformedEnvelope(_))));

        env.iv_base64 = "not base64!".into();
        let result = decrypt_json::<Value>(&env, &key(1), Some("ctx"));
        assert!(matches!(result, Err(CryptoError::MalformedEnvelope(_))));
    }

    #[test]
    fn test_truncated_ciphertext() {
        let mut env = encrypt_json(&json!(null), &key(1), "ctx").unwrap();
        env.ciphertext_base64 = B64.encode([0u8; 4]);
        let result = decrypt_json::<Value>(&env, &key(1), Some("ctx"));
        assert!(matches!(result, Err(CryptoError::MalformedEnvelope(_))));
    }

    #[test]
    fn test_ciphertext_size() {
        let payload = "x".repeat(100);
        let env = encrypt_json(&payload, &key(1), "ctx").unwrap();
        // JSON string (100 + 2 quotes) + tag
        assert_eq!(
            B64.decode(&env.ciphertext_base64).unwrap().len(),
            102 + TAG_SIZE
        );
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            ".*".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::from),
                prop::collection::btree_map("[a-zA-Z0-9_]{1,8}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_roundtrip(
            payload in arb_json(),
            aad in "[a-z]{1,10}:[a-z0-9-]{1,12}:[a-z0-9-]{1,12}",
            byte in any::<u8>(),
        ) {
            let k = key(byte);
            let env = encrypt_json(&payload, &k, &aad).unwrap();
            let out: Value = decrypt_json(&env, &k, Some(&aad)).unwrap();
            prop_assert_eq!(out, payload);
        }
    }
}
