//! Access tokens for non-local clients.
//!
//! Local (loopback) connections are trusted; anything else must present
//! a token from this process-wide set during the handshake. Tokens are
//! opaque byte strings; comparison is constant-time so a remote peer
//! cannot learn a token byte by byte from timing.

use std::sync::Mutex;

use tracing::warn;
use uuid::Uuid;

/// Process-wide registry of accepted tokens.
///
/// The `Mutex` here guards only set mutation and is the single lock in
/// the broker core; everything else runs on the actor executor.
pub struct TokenManager {
    tokens: Mutex<Vec<Vec<u8>>>,
}

impl TokenManager {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(Vec::new()),
        }
    }

    /// Adds a token to the accepted set.
    pub fn insert(&self, token: Vec<u8>) {
        if token.is_empty() {
            warn!("refusing to register an empty access token");
            return;
        }
        match self.tokens.lock() {
            Ok(mut tokens) => tokens.push(token),
            Err(poisoned) => poisoned.into_inner().push(token),
        }
    }

    /// Generates, registers and returns a fresh random token.
    pub fn generate(&self) -> Vec<u8> {
        let token = Uuid::new_v4().simple().to_string().into_bytes();
        self.insert(token.clone());
        token
    }

    /// Checks a presented token against the accepted set.
    ///
    /// Every registered token is compared in full regardless of earlier
    /// matches, so the check takes the same time for any input of a
    /// given length.
    pub fn check_token(&self, presented: &[u8]) -> bool {
        let tokens = match self.tokens.lock() {
            Ok(tokens) => tokens,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut found = false;
        for token in tokens.iter() {
            found |= constant_time_eq(token, presented);
        }
        found
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte-string equality without data-dependent early exit.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
