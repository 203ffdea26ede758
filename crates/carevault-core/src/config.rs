use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CarevaultError, CarevaultResult};
use crate::types::{Role, Session};

/// Iteration counts below this are accepted but flagged as weak.
pub const RECOMMENDED_MIN_KDF_ITERATIONS: u32 = 300_000;

/// Top-level configuration (loaded from carevault.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CarevaultConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub session: SessionConfig,
}

impl CarevaultConfig {
    pub fn from_toml_str(content: &str) -> CarevaultResult<Self> {
        toml::from_str(content).map_err(|e| CarevaultError::Config(e.to_string()))
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> CarevaultResult<Self> {
        if !path.exists() {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| CarevaultError::Config(format!("parsing {}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file backing the local workspace store
    pub data_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_file: PathBuf::from("~/.local/share/carevault/workspace.json"),
        }
    }
}

/// Workspace encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Enable workspace client-side encryption. When off, records are stored
    /// in plaintext columns and no confidentiality is provided.
    pub enabled: bool,
    /// PBKDF2-HMAC-SHA256 iterations for newly initialized workspaces
    pub kdf_iterations: u32,
    /// Minimum passphrase length (after trimming)
    pub min_passphrase_len: usize,
}

impl CryptoConfig {
    pub fn is_weak_kdf(&self) -> bool {
        self.kdf_iterations < RECOMMENDED_MIN_KDF_ITERATIONS
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kdf_iterations: 310_000,
            min_passphrase_len: 8,
        }
    }
}

/// Who is signed in, and to which workspace. No user means a guest session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
    pub role: Option<Role>,
}

impl SessionConfig {
    pub fn to_session(&self) -> Session {
        match &self.user_id {
            Some(user_id) => Session::authenticated(
                user_id.clone(),
                self.workspace_id.clone(),
                self.role.unwrap_or(Role::Member),
            ),
            None => Session::guest(),
        }
    }
}
