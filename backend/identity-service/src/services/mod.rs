/// Service layer for identity-service
///
/// - `auth`: sign-up, login and lockout, password reset, token checks
/// - `tokens`: token issuance with supersession, validation, reference data
/// - `reset_delivery`: seam for getting reset codes to users
pub mod auth;
pub mod reset_delivery;
pub mod tokens;

pub use auth::{bearer_token, AuthManager};
pub use reset_delivery::{LogOnlyNotifier, ResetCodeNotifier};
pub use tokens::TokenManager;
