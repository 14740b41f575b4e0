/// Token Revocation Registry
///
/// Process-wide set of revoked bearer values, consulted before any signature
/// work. Shared through an `Arc` and safe for concurrent readers and writers.
///
/// ## Lifetime
///
/// Entries live until the process exits. Nothing is persisted and nothing is
/// swept, so a restart forgets every revocation.
///
/// ## Storage
///
/// Values are stored as SHA-256 hex digests, never in clear.
use dashmap::DashSet;

#[derive(Debug, Default)]
pub struct RevocationRegistry {
    revoked: DashSet<String>,
}

impl RevocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject `token` from now on. Returns `false` if it was already revoked.
    pub fn revoke(&self, token: &str) -> bool {
        let inserted = self.revoked.insert(hash_token(token));
        if inserted {
            tracing::info!(revoked = self.revoked.len(), "Token revoked");
        }
        inserted
    }

    pub fn is_revoked(&self, token: &str) -> bool {
        self.revoked.contains(&hash_token(token))
    }

    pub fn len(&self) -> usize {
        self.revoked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revoked.is_empty()
    }
}

fn hash_token(token: &str) -> String {
    crypto_core::hash::sha256_hex(token.as_bytes())
}
