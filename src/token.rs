//! Credential token codec and issuer.
//!
//! A credential is the authenticated encryption of the payload string
//! `"<participantId>|<nonce>"` under a shared 32-byte ChaCha20-Poly1305
//! key, carried as URL-safe base64 of `cipher-nonce(12) || ciphertext+tag`.
//! The text form is what gets rendered into a scannable symbol and what the
//! checkpoint hands back to [`TokenCodec::decode`].

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore as _;
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize as _;

use crate::error::{GatepassError, Result, ResultExt as _};
use crate::util;

/// Separator between participant identifier and nonce in the plaintext
/// payload.  Identifier validation guarantees it cannot occur in an id.
pub const PAYLOAD_SEPARATOR: char = '|';

const KEY_LEN: usize = 32;
const CIPHER_NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Random bytes behind the payload nonce; 48 bits keeps payloads
/// unguessable and repeated issuance distinct.
const PAYLOAD_NONCE_LEN: usize = 6;

// ---------------------------------------------------------------------------
// Decode errors
// ---------------------------------------------------------------------------

/// Why a scanned string failed to decode into a credential payload.
///
/// These are expected outcomes of an untrusted input channel, kept separate
/// from [`GatepassError`] so the verification engine can classify scans
/// without treating them as failures.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Input is not valid URL-safe base64.
    #[error("malformed encoding: {0}")]
    MalformedEncoding(String),

    /// Ciphertext does not decrypt/verify.  Covers tampering, truncation,
    /// and a wrong key.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Decrypted payload is not `"<participantId>|<nonce>"`.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl From<DecodeError> for GatepassError {
    fn from(e: DecodeError) -> Self {
        GatepassError::Token(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// An issued credential: the token text bound to one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub participant_id: String,
    /// URL-safe text form, as rendered and scanned.
    pub token: String,
    pub issued_at_utc: String,
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Encrypts and decrypts credential payloads under a fixed key.
///
/// Pure over its inputs plus the key; all persistence lives in
/// [`crate::store::AttendanceStore`].
#[derive(Clone)]
pub struct TokenCodec {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// Build a codec from a URL-safe base64 encoded 32-byte key.
    pub fn from_base64_key(key_b64: &SecretString) -> Result<Self> {
        let mut key_bytes =
            util::b64url_decode(key_b64.expose_secret()).ctx_token("encryption key")?;
        if key_bytes.len() != KEY_LEN {
            let got = key_bytes.len();
            key_bytes.zeroize();
            return Err(GatepassError::Token(format!(
                "encryption key must decode to {KEY_LEN} bytes, got {got}"
            )));
        }
        let cipher =
            ChaCha20Poly1305::new_from_slice(&key_bytes).ctx_token("encryption key")?;
        key_bytes.zeroize();
        Ok(Self { cipher })
    }

    /// Generate a fresh random key in the accepted text form.
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        util::b64url_encode(&key)
    }

    /// Encrypt `"<participantId>|<nonce>"` into scannable token text.
    pub fn encode(&self, participant_id: &str, nonce: &str) -> Result<String> {
        if participant_id.contains(PAYLOAD_SEPARATOR) {
            return Err(GatepassError::Token(format!(
                "participant identifier must not contain '{PAYLOAD_SEPARATOR}'"
            )));
        }
        if nonce.contains(PAYLOAD_SEPARATOR) {
            return Err(GatepassError::Token(format!(
                "nonce must not contain '{PAYLOAD_SEPARATOR}'"
            )));
        }
        let payload = format!("{participant_id}{PAYLOAD_SEPARATOR}{nonce}");

        let mut nonce_bytes = [0u8; CIPHER_NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(&Nonce::from(nonce_bytes), payload.as_bytes())
            .map_err(|_| GatepassError::Token("token encryption failed".into()))?;

        let mut token = Vec::with_capacity(CIPHER_NONCE_LEN + ciphertext.len());
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&ciphertext);
        Ok(util::b64url_encode(&token))
    }

    /// Decode scanned token text back into `(participantId, nonce)`.
    pub fn decode(&self, text: &str) -> std::result::Result<(String, String), DecodeError> {
        let bytes = util::b64url_decode(text)
            .map_err(|e| DecodeError::MalformedEncoding(e.to_string()))?;
        if bytes.len() < CIPHER_NONCE_LEN + TAG_LEN {
            return Err(DecodeError::AuthenticationFailed);
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(CIPHER_NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| DecodeError::AuthenticationFailed)?;
        let payload = String::from_utf8(plaintext)
            .map_err(|_| DecodeError::MalformedPayload("payload is not valid UTF-8".into()))?;

        let mut parts = payload.split(PAYLOAD_SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(nonce), None) => Ok((id.trim().to_string(), nonce.to_string())),
            _ => Err(DecodeError::MalformedPayload(format!(
                "expected '<id>{PAYLOAD_SEPARATOR}<nonce>'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Issuer
// ---------------------------------------------------------------------------

/// Produces fresh credentials.  Construction requires a working codec, so a
/// missing or malformed key fails before any issuance runs.  Persisting the
/// credential is the caller's responsibility.
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    codec: TokenCodec,
}

impl TokenIssuer {
    pub fn new(codec: TokenCodec) -> Self {
        Self { codec }
    }

    /// Issue a credential with a fresh payload nonce and the current time.
    pub fn issue(&self, participant_id: &str) -> Result<Credential> {
        util::validate_participant_id(participant_id)?;
        let nonce = fresh_payload_nonce();
        let token = self.codec.encode(participant_id, &nonce)?;
        Ok(Credential {
            participant_id: participant_id.to_string(),
            token,
            issued_at_utc: util::now_utc_rfc3339(),
        })
    }
}

/// Random payload nonce in URL-safe text form (never contains `|`).
fn fresh_payload_nonce() -> String {
    let mut raw = [0u8; PAYLOAD_NONCE_LEN];
    rand::rng().fill_bytes(&mut raw);
    util::b64url_encode(&raw)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
