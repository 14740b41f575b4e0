/// Password reset code delivery
///
/// The auth flow only produces the code. Getting it to the user (email, SMS,
/// ...) belongs to whoever implements `ResetCodeNotifier`.
use async_trait::async_trait;

use crate::models::User;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResetCodeNotifier: Send + Sync {
    async fn send_reset_code(&self, user: &User, code: &str) -> anyhow::Result<()>;
}

/// Notifier used when no delivery channel is configured. Logs the issuance,
/// never the code.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyNotifier;

#[async_trait]
impl ResetCodeNotifier for LogOnlyNotifier {
    async fn send_reset_code(&self, user: &User, _code: &str) -> anyhow::Result<()> {
        tracing::info!(
            user_id = user.id,
            "Password reset code issued; no delivery channel configured"
        );
        Ok(())
    }
}
