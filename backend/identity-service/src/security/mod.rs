/// Security module for authentication
///
/// Provides core security primitives for identity-service:
/// - Salted password digests
/// - Per-kind token signing and validation (HS256 via crypto-core)
/// - Token revocation (in-process blacklist)
///
/// ## Architecture
///
/// - **crypto-core::jwt**: Shared JWT implementation
/// - **signer**: Token-kind rules on top of crypto-core
/// - **password**: SHA-256 salted digests
/// - **token_revocation**: Concurrent revocation set
pub use crypto_core::jwt::Claims;

pub mod password;
pub mod signer;
pub mod token_revocation;

pub use password::{hash_password, new_salt, verify_password};
pub use signer::{IssuedToken, Signer};
pub use token_revocation::RevocationRegistry;
