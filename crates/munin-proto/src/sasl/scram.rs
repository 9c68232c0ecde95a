//! SCRAM-SHA-256 client (RFC 5802, RFC 7677).
//!
//! Challenge-response authentication: the password never crosses the wire,
//! and the server proves knowledge of the stored key back to us.
//!
//! # Protocol flow
//!
//! 1. Client sends `client-first-message`: `n,,n=user,r=nonce`
//! 2. Server sends `server-first-message`: `r=nonce+server,s=salt,i=iterations`
//! 3. Client sends `client-final-message`: `c=biws,r=nonce+server,p=proof`
//! 4. Server sends `server-final-message`: `v=verifier`

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use super::decode_base64;

/// Progression of one SCRAM exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScramState {
    /// Nothing sent yet.
    Initial,
    /// Sent client-first, awaiting server-first.
    AwaitServerFirst,
    /// Sent client-final, awaiting server-final.
    AwaitServerFinal,
    /// Server verifier checked out.
    Complete,
    /// Exchange failed; the contained reason is safe to log.
    Failed(String),
}

/// SCRAM-SHA-256 client state machine.
#[derive(Clone, Debug)]
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    /// Stored for AuthMessage computation.
    client_first_bare: String,
    /// Stored server-first-message for AuthMessage.
    server_first: String,
    state: ScramState,
    /// Expected server signature, captured when computing the proof.
    server_signature: Option<[u8; 32]>,
}

/// Errors from the SCRAM exchange.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ScramError {
    /// Base64 decoding failed.
    #[error("invalid base64 encoding")]
    InvalidEncoding,
    /// Server nonce is not prefixed by our client nonce.
    #[error("server nonce does not extend client nonce")]
    NonceMismatch,
    /// Server-first is missing its `r=` token.
    #[error("missing nonce in server message")]
    MissingNonce,
    /// Server-first is missing its `s=` token.
    #[error("missing salt in server message")]
    MissingSalt,
    /// Server-first is missing its `i=` token.
    #[error("missing iteration count in server message")]
    MissingIterations,
    /// Iteration count did not parse.
    #[error("invalid iteration count")]
    InvalidIterations,
    /// Server verifier did not match.
    #[error("server verification failed")]
    ServerVerificationFailed,
    /// Message arrived in the wrong state.
    #[error("unexpected message for state {0}")]
    BadState(&'static str),
    /// Random generator failure.
    #[error("nonce generation failed: {0}")]
    Rng(String),
}

impl ScramClient {
    /// Create a client with fresh random nonce for the given credentials.
    pub fn new(username: &str, password: &str) -> Result<Self, ScramError> {
        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: generate_nonce()?,
            client_first_bare: String::new(),
            server_first: String::new(),
            state: ScramState::Initial,
            server_signature: None,
        })
    }

    /// Current exchange state.
    pub fn state(&self) -> &ScramState {
        &self.state
    }

    /// Produce the base64 client-first-message and advance the state.
    pub fn client_first(&mut self) -> String {
        // gs2-header `n,,`: no channel binding, no authzid.
        let bare = format!("n={},r={}", escape_username(&self.username), self.client_nonce);
        self.client_first_bare = bare.clone();
        self.state = ScramState::AwaitServerFirst;
        BASE64.encode(format!("n,,{bare}").as_bytes())
    }

    /// Consume the base64 server-first-message; returns the base64
    /// client-final-message.
    pub fn handle_server_first(&mut self, server_first: &str) -> Result<String, ScramError> {
        if self.state != ScramState::AwaitServerFirst {
            return Err(ScramError::BadState("await-server-first"));
        }

        let decoded = decode_base64(server_first).map_err(|_| ScramError::InvalidEncoding)?;
        let message = String::from_utf8(decoded).map_err(|_| ScramError::InvalidEncoding)?;
        self.server_first = message.clone();

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in message.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(decode_base64(value).map_err(|_| ScramError::InvalidEncoding)?);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(value.parse::<u32>().map_err(|_| ScramError::InvalidIterations)?);
            }
        }

        let nonce = nonce.ok_or(ScramError::MissingNonce)?;
        let salt = salt.ok_or(ScramError::MissingSalt)?;
        let iterations = iterations.ok_or(ScramError::MissingIterations)?;

        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            self.state = ScramState::Failed("nonce mismatch".to_string());
            return Err(ScramError::NonceMismatch);
        }

        // SaltedPassword = Hi(password, salt, i)
        let salted_password = hi(&self.password, &salt, iterations);
        // ClientKey = HMAC(SaltedPassword, "Client Key"); StoredKey = H(ClientKey)
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);

        // biws = base64("n,,")
        let client_final_without_proof = format!("c=biws,r={nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, self.server_first, client_final_without_proof
        );

        // ClientProof = ClientKey XOR HMAC(StoredKey, AuthMessage)
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        // ServerSignature = HMAC(HMAC(SaltedPassword, "Server Key"), AuthMessage)
        let server_key = hmac_sha256(&salted_password, b"Server Key");
        self.server_signature = Some(hmac_sha256(&server_key, auth_message.as_bytes()));

        self.state = ScramState::AwaitServerFinal;
        let client_final = format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(&client_proof)
        );
        Ok(BASE64.encode(client_final.as_bytes()))
    }

    /// Verify the base64 server-final-message in constant time.
    pub fn handle_server_final(&mut self, server_final: &str) -> Result<(), ScramError> {
        if self.state != ScramState::AwaitServerFinal {
            return Err(ScramError::BadState("await-server-final"));
        }

        let decoded = decode_base64(server_final).map_err(|_| ScramError::InvalidEncoding)?;
        let message = String::from_utf8(decoded).map_err(|_| ScramError::InvalidEncoding)?;

        let verifier = message
            .strip_prefix("v=")
            .ok_or(ScramError::ServerVerificationFailed)?;
        let server_sig = decode_base64(verifier).map_err(|_| ScramError::InvalidEncoding)?;

        let expected = self
            .server_signature
            .as_ref()
            .ok_or(ScramError::ServerVerificationFailed)?;

        if server_sig.ct_eq(expected.as_slice()).into() {
            self.state = ScramState::Complete;
            Ok(())
        } else {
            self.state = ScramState::Failed("server verification failed".to_string());
            Err(ScramError::ServerVerificationFailed)
        }
    }
}

/// Escape `=` and `,` in the username per RFC 5802 (`=` first, so the
/// escape marker itself is never double-processed).
fn escape_username(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

/// 24 random bytes, base64url without padding: never contains `,` or `=`.
fn generate_nonce() -> Result<String, ScramError> {
    let mut bytes = [0u8; 24];
    getrandom::getrandom(&mut bytes).map_err(|e| ScramError::Rng(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Hi() from RFC 5802: PBKDF2-HMAC-SHA256.
fn hi(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    // Only fails on zero-length output, which [u8; 32] rules out.
    let _ = pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, iterations, &mut output);
    output
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
