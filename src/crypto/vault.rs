//! The secrets vault: AES-256-GCM under a PBKDF2-derived master key.
//!
//! The vault is a process singleton with two states. *Sealed*: no key
//! material in memory, every seal/open fails with `Locked`. *Unsealed*: the
//! derived key is held (zeroized on lock and drop) and secrets can be
//! sealed and opened. Unlocking verifies the master password against a
//! stored verification token before any user data is touched.

use std::num::NonZeroU32;

use parking_lot::Mutex;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::{AgentError, AgentResult};

/// PBKDF2-HMAC-SHA256 iteration count.
pub const PBKDF2_ITERATIONS: u32 = 150_000;
/// Master key salt length in bytes.
pub const SALT_LEN: usize = 32;
/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Plaintext of the verification token written when encryption is enabled.
const VERIFICATION_PLAINTEXT: &[u8] = b"MUNIN_AGENT_VERIFIED";

type Key = Zeroizing<[u8; 32]>;

/// Process-wide secrets vault.
pub struct Vault {
    key: Mutex<Option<Key>>,
    rng: SystemRandom,
}

impl Default for Vault {
    fn default() -> Self {
        Self::new()
    }
}

impl Vault {
    /// Create a sealed vault.
    pub fn new() -> Self {
        Self {
            key: Mutex::new(None),
            rng: SystemRandom::new(),
        }
    }

    /// Whether the vault currently holds a derived key.
    pub fn is_unlocked(&self) -> bool {
        self.key.lock().is_some()
    }

    /// Drop the derived key. The backing memory is zeroized.
    pub fn lock(&self) {
        *self.key.lock() = None;
    }

    /// Enable encryption: derive a key from `password` under a fresh salt
    /// and produce the verification token.
    ///
    /// Returns `(salt, verification_token)` for the configuration file.
    /// The vault is left unlocked.
    pub async fn enable(&self, password: &str) -> AgentResult<(Vec<u8>, Vec<u8>)> {
        let mut salt = vec![0u8; SALT_LEN];
        self.rng
            .fill(&mut salt)
            .map_err(|_| AgentError::Auth("random generator failure".to_string()))?;

        let key = derive_key_blocking(password.to_string(), salt.clone()).await?;
        *self.key.lock() = Some(key);

        let token = self.seal(VERIFICATION_PLAINTEXT)?;
        Ok((salt, token))
    }

    /// Unlock with the master password.
    ///
    /// The candidate key must open `verification_token` to the expected
    /// plaintext before it is installed; a wrong password leaves the vault
    /// sealed and state untouched.
    pub async fn unlock(
        &self,
        password: &str,
        salt: &[u8],
        verification_token: &[u8],
    ) -> AgentResult<()> {
        let key = derive_key_blocking(password.to_string(), salt.to_vec()).await?;

        let plaintext = open_with(&key, verification_token)?;
        if plaintext != VERIFICATION_PLAINTEXT {
            return Err(AgentError::Auth("verification token mismatch".to_string()));
        }

        *self.key.lock() = Some(key);
        Ok(())
    }

    /// Encrypt `plaintext`; output layout is `nonce || ciphertext || tag`.
    ///
    /// A fresh random nonce is drawn per call.
    pub fn seal(&self, plaintext: &[u8]) -> AgentResult<Vec<u8>> {
        let guard = self.key.lock();
        let key = guard.as_ref().ok_or(AgentError::Locked)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| AgentError::Auth("random generator failure".to_string()))?;

        let sealing_key = aes_key(key)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.to_vec();
        sealing_key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| AgentError::Auth("encryption failure".to_string()))?;

        let mut output = Vec::with_capacity(NONCE_LEN + in_out.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&in_out);
        Ok(output)
    }

    /// Decrypt `nonce || ciphertext || tag`, verifying the tag.
    ///
    /// Tag failure returns `Auth` and leaves the vault usable.
    pub fn open(&self, data: &[u8]) -> AgentResult<Vec<u8>> {
        let guard = self.key.lock();
        let key = guard.as_ref().ok_or(AgentError::Locked)?;
        open_with(key, data)
    }
}

fn aes_key(key: &Key) -> AgentResult<LessSafeKey> {
    let unbound = UnboundKey::new(&AES_256_GCM, key.as_ref())
        .map_err(|_| AgentError::Auth("key setup failure".to_string()))?;
    Ok(LessSafeKey::new(unbound))
}

fn open_with(key: &Key, data: &[u8]) -> AgentResult<Vec<u8>> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(AgentError::Auth("ciphertext too short".to_string()));
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|_| AgentError::Auth("bad nonce".to_string()))?;

    let opening_key = aes_key(key)?;
    let mut in_out = ciphertext.to_vec();
    let plaintext = opening_key
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| AgentError::Auth("decryption failed".to_string()))?;

    Ok(plaintext.to_vec())
}

/// PBKDF2 is CPU-bound; run it off the I/O pool.
async fn derive_key_blocking(password: String, salt: Vec<u8>) -> AgentResult<Key> {
    tokio::task::spawn_blocking(move || {
        let mut key = Zeroizing::new([0u8; 32]);
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            NonZeroU32::new(PBKDF2_ITERATIONS).expect("iterations is non-zero"),
            &salt,
            password.as_bytes(),
            key.as_mut(),
        );
        key
    })
    .await
    .map_err(|e| AgentError::Auth(format!("key derivation task failed: {}", e)))
}
