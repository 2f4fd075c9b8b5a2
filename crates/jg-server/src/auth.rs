//! Client authentication
//!
//! Exactly one identity is accepted: the fixed SSH user `jump` presenting
//! the public key configured at startup. Keys are compared by SHA-256
//! fingerprint in constant time.

use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};

use jg_core::{Diagnostic, Diagnostics};

/// The only SSH user the server accepts.
pub const AUTHORIZED_USER: &str = "jump";

/// The single authorized client key.
#[derive(Debug)]
pub struct AuthPolicy {
    fingerprint: [u8; 32],
}

impl AuthPolicy {
    /// Parse the configured `authorized_key` value: either an OpenSSH
    /// `type base64 [comment]` line or the bare base64 key blob.
    pub fn from_openssh(line: &str) -> Result<Self, Diagnostics> {
        let line = line.trim();
        let key = match russh_keys::parse_public_key_base64(line) {
            Ok(key) => key,
            Err(_) => {
                let parts: Vec<&str> = line.split_whitespace().collect();
                let blob = parts.get(1).copied().unwrap_or("");
                russh_keys::parse_public_key_base64(blob).map_err(|e| {
                    Diagnostics::from(
                        Diagnostic::error("invalid authorized_key")
                            .with_detail(e.to_string()),
                    )
                })?
            }
        };
        Ok(Self::from_key(&key))
    }

    /// Authorize exactly this key.
    pub fn from_key(key: &PublicKey) -> Self {
        Self {
            fingerprint: sha256_fingerprint(key),
        }
    }

    /// Whether `user` presenting `key` may log in.
    pub fn allows(&self, user: &str, key: &PublicKey) -> bool {
        let offered = sha256_fingerprint(key);
        // The user name is public; only the key comparison must not leak
        // where the fingerprints diverge.
        user == AUTHORIZED_USER && constant_time_eq(&self.fingerprint, &offered)
    }
}

fn sha256_fingerprint(key: &PublicKey) -> [u8; 32] {
    Sha256::digest(key.public_key_bytes()).into()
}

/// Compare two digests without an early exit on the first differing byte.
fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
