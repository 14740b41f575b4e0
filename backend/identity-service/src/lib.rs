/// Identity Service Library
///
/// Authentication core for the storefront backend: accounts, login with
/// lockout, password reset codes, and per-kind tokens with a single live
/// token per user and kind.
///
/// ## Modules
///
/// - `config`: Environment configuration and policy constants
/// - `error`: Caller-facing error outcome
/// - `models`: Users, roles, carts and token rows
/// - `security`: Password digests, token signing, revocation registry
/// - `services`: Authentication and token lifecycle
/// - `store`: Credential store traits, unit of work, memory and Postgres backends
/// - `validators`: Input validation
pub mod config;
pub mod error;
pub mod models;
pub mod security;
pub mod services;
pub mod store;
pub mod validators;

// Re-export commonly used types
pub use error::{IdentityError, Result};
pub use services::{AuthManager, TokenManager};
