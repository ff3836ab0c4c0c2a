//! Opaque session token issuance and validation.
//!
//! Tokens are HMAC-SHA256 over the session id with a server-held secret;
//! they carry no claims and are validated in constant time.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Mints and validates session tokens.
pub struct SessionTokens {
    secret: Vec<u8>,
}

impl SessionTokens {
    /// Use an explicit secret (from configuration).
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Generate a random secret; tokens do not survive a restart.
    #[must_use]
    pub fn ephemeral() -> Self {
        let mut secret = vec![0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self { secret }
    }

    /// Issue the token for a session id.
    #[must_use]
    pub fn issue(&self, session_id: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(session_id.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Validate a token against a session id.
    #[must_use]
    pub fn validate(&self, session_id: &str, token: &str) -> bool {
        let Ok(expected) = hex::decode(token) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(session_id.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}
