//! Secrets at rest.
//!
//! A secret field in the configuration is stored as `{data, algorithm}`:
//! base64 plaintext when the file is unencrypted, or base64 of the vault's
//! `nonce || ct || tag` sealed form. Decryption is always an explicit vault
//! call at the boundary, never implicit in (de)serialization.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::crypto::Vault;
use crate::error::{AgentError, AgentResult};

/// How a secret's `data` field is encoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecretAlgorithm {
    /// `data` is base64 of the UTF-8 plaintext.
    #[default]
    #[serde(rename = "PLAIN")]
    Plain,
    /// `data` is base64 of `nonce(12) || ciphertext || tag(16)`.
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
}

/// A secret configuration field.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedValue {
    /// Base64 payload, interpretation per `algorithm`.
    pub data: String,
    /// Encoding of `data`.
    #[serde(default)]
    pub algorithm: SecretAlgorithm,
}

impl EncryptedValue {
    /// Wrap a plaintext secret (base64, unencrypted).
    pub fn plain(value: &str) -> Self {
        Self {
            data: BASE64.encode(value.as_bytes()),
            algorithm: SecretAlgorithm::Plain,
        }
    }

    /// Seal a plaintext secret with the unlocked vault.
    pub fn seal_with(vault: &Vault, value: &str) -> AgentResult<Self> {
        let sealed = vault.seal(value.as_bytes())?;
        Ok(Self {
            data: BASE64.encode(sealed),
            algorithm: SecretAlgorithm::Aes256Gcm,
        })
    }

    /// Recover the plaintext. Encrypted values require an unlocked vault.
    pub fn reveal(&self, vault: &Vault) -> AgentResult<String> {
        let raw = BASE64
            .decode(&self.data)
            .map_err(|e| AgentError::Config(format!("secret is not valid base64: {}", e)))?;

        let plaintext = match self.algorithm {
            SecretAlgorithm::Plain => raw,
            SecretAlgorithm::Aes256Gcm => vault.open(&raw)?,
        };

        String::from_utf8(plaintext)
            .map_err(|_| AgentError::Config("secret is not valid UTF-8".to_string()))
    }

    /// Whether this value still needs the vault to be read.
    pub fn is_encrypted(&self) -> bool {
        self.algorithm == SecretAlgorithm::Aes256Gcm
    }

    /// Re-encode this value for an encrypted or plaintext config file.
    ///
    /// Used by the `encrypt`/`decrypt` CLI commands to migrate a whole file.
    pub fn convert(&self, vault: &Vault, encrypt: bool) -> AgentResult<Self> {
        let plaintext = self.reveal(vault)?;
        if encrypt {
            Self::seal_with(vault, &plaintext)
        } else {
            Ok(Self::plain(&plaintext))
        }
    }
}

// Secrets never appear in logs or debug dumps; only shape information does.
impl fmt::Debug for EncryptedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedValue")
            .field("algorithm", &self.algorithm)
            .field("data_len", &self.data.len())
            .finish()
    }
}
