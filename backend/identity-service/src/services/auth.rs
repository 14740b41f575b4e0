/// Authentication manager
///
/// Sign-up, login with lockout, password reset by code, and token checks
/// against the revocation registry. Every operation opens its own unit of
/// work; nothing is shared between calls except the store, the signer and the
/// registry.
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::MAX_ACCESS_ATTEMPTS;
use crate::error::{IdentityError, Result, DEFAULT_INTERNAL};
use crate::models::{
    kinds, Cart, Role, RoleFilter, Token, TokenFilter, TokenStatus, TokenType, TokenTypeFilter,
    User, UserFilter, UserSession,
};
use crate::security::password::encode_salt;
use crate::security::{hash_password, new_salt, verify_password, Claims, RevocationRegistry, Signer};
use crate::services::reset_delivery::{LogOnlyNotifier, ResetCodeNotifier};
use crate::services::tokens::{TokenManager, INVALID_TOKEN};
use crate::store::{
    CredentialStore, StoreError, StoreResult, StoreSession, UnitOfWork, DEFAULT_ROLE,
};
use crate::validators::{validate_email, validate_password, validate_username};

pub const LOGIN_FAILED: &str = "username or password is incorrect.";
pub const ACCOUNT_DISABLED: &str = "Account is disabled. Please contact support.";
pub const ACCOUNT_LOCKED: &str = "Too many attempts, account locked.";
pub const EMAIL_TAKEN: &str =
    "The provided email address is already in use. Please use a different email.";
pub const USERNAME_TAKEN: &str =
    "The username you entered is already taken. Please choose a different username.";
pub const PASSWORD_INVALID: &str = "Password must be at least 8 characters.";
pub const USER_NOT_FOUND: &str = "User not found.";
pub const RESET_FAILED: &str = "Error occurred while resetting password";

/// Strip an optional `Bearer` scheme from an authorization value.
/// A scheme with no credential yields an empty string.
pub fn bearer_token(value: &str) -> &str {
    let value = value.trim();
    if value.eq_ignore_ascii_case("bearer") {
        return "";
    }
    match value.split_once(char::is_whitespace) {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ => value,
    }
}

pub struct AuthManager<C: CredentialStore> {
    store: C,
    tokens: TokenManager,
    revocations: Arc<RevocationRegistry>,
    notifier: Arc<dyn ResetCodeNotifier>,
}

impl<C: CredentialStore> AuthManager<C> {
    pub fn new(store: C, signer: Arc<Signer>, revocations: Arc<RevocationRegistry>) -> Self {
        Self {
            store,
            tokens: TokenManager::new(signer),
            revocations,
            notifier: Arc::new(LogOnlyNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ResetCodeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    async fn unit(&self) -> Result<UnitOfWork<C::Session>> {
        Ok(self.store.unit_of_work().await?)
    }

    // ========================================================================
    // Sign-up
    // ========================================================================

    /// Register a user with the default role and an empty cart
    ///
    /// ## Errors
    ///
    /// - `BadRequest` for a malformed email, short password or bad username
    /// - `Conflict` if the email (checked first) or the username is taken
    /// - `Internal` if persisting fails; nothing is left behind
    pub async fn sign_up(&self, username: &str, email: &str, password: &str) -> Result<User> {
        if !validate_email(email) {
            return Err(IdentityError::bad_request(format!(
                "{email} is not a valid email."
            )));
        }
        if !validate_password(password) {
            return Err(IdentityError::bad_request(PASSWORD_INVALID));
        }
        if !validate_username(username) {
            return Err(IdentityError::bad_request(format!(
                "{username} is not a valid username."
            )));
        }

        let mut unit = self.unit().await?;

        let role = unit
            .repository::<Role>()
            .find_one(&RoleFilter::Name(DEFAULT_ROLE.to_string()))
            .await?
            .ok_or_else(|| {
                error!(role = DEFAULT_ROLE, "Default role missing");
                IdentityError::internal(DEFAULT_INTERNAL)
            })?;

        let salt = new_salt();
        let now = Utc::now();
        let user = User {
            id: 0,
            email: email.to_string(),
            username: username.to_string(),
            password_hash: hash_password(password, &salt),
            salt: encode_salt(&salt),
            role_id: role.id,
            is_locked: false,
            is_disabled: false,
            is_email_confirmed: false,
            access_attempts: 0,
            first_name: None,
            last_name: None,
            cart_id: None,
            created_at: now,
            last_access_at: now,
        };

        match create_account(&mut unit, user).await {
            Ok(user) => {
                info!(user_id = user.id, "User signed up");
                Ok(user)
            }
            Err(e) => {
                if let Err(rollback_err) = unit.rollback().await {
                    warn!(error = %rollback_err, "Rollback after sign-up failure also failed");
                }
                match e {
                    IdentityError::Conflict(_) => {
                        info!(username = %username, reason = %e, "Sign-up rejected");
                        Err(e)
                    }
                    _ => {
                        error!(username = %username, error = %e, "Sign-up failed");
                        Err(IdentityError::internal(DEFAULT_INTERNAL))
                    }
                }
            }
        }
    }

    // ========================================================================
    // Login
    // ========================================================================

    /// Log in by email or username
    ///
    /// A wrong password counts toward the lockout; the attempt that reaches
    /// `MAX_ACCESS_ATTEMPTS` locks the account. The counter update is a plain
    /// read-modify-write, so concurrent failures may under-count.
    pub async fn log_in(
        &self,
        credential: &str,
        password: &str,
        remember: bool,
    ) -> Result<UserSession> {
        let mut unit = self.unit().await?;

        let mut user = unit
            .repository::<User>()
            .find_one(&UserFilter::Credential(credential.to_string()))
            .await?
            .ok_or_else(|| IdentityError::not_found(LOGIN_FAILED))?;

        if !user.can_log_in() {
            return Err(IdentityError::bad_request(ACCOUNT_DISABLED));
        }

        if !verify_password(password, &user.salt, &user.password_hash)? {
            user.access_attempts += 1;
            let message = if user.access_attempts >= MAX_ACCESS_ATTEMPTS {
                user.is_locked = true;
                warn!(user_id = user.id, attempts = user.access_attempts, "Account locked");
                ACCOUNT_LOCKED
            } else {
                LOGIN_FAILED
            };
            unit.repository::<User>().update(user).await?;
            return Err(IdentityError::bad_request(message));
        }

        let access_token = self
            .tokens
            .create_token(&mut unit, &user, kinds::ACCESS, 0)
            .await
            .map_err(|e| IdentityError::bad_request(e.message()))?;

        let refresh_token = if remember {
            match self
                .tokens
                .create_token(&mut unit, &user, kinds::REFRESH, 0)
                .await
            {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!(user_id = user.id, error = %e, "Refresh token not issued");
                    None
                }
            }
        } else {
            None
        };

        user.access_attempts = 0;
        user.last_access_at = Utc::now();
        unit.repository::<User>().update(user.clone()).await?;

        let role = unit
            .repository::<Role>()
            .find_by_id(user.role_id)
            .await?
            .ok_or_else(|| {
                error!(user_id = user.id, role_id = user.role_id, "Role missing for user");
                IdentityError::internal(DEFAULT_INTERNAL)
            })?;

        info!(user_id = user.id, remember, "User logged in");
        Ok(UserSession::new(&user, &role, access_token, refresh_token))
    }

    /// Clear the lock and the failed attempt counter
    pub async fn unlock_account(&self, user_id: i32) -> Result<User> {
        let mut unit = self.unit().await?;
        let mut user = unit
            .repository::<User>()
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| IdentityError::not_found(USER_NOT_FOUND))?;

        user.is_locked = false;
        user.access_attempts = 0;
        unit.repository::<User>().update(user.clone()).await?;

        info!(user_id, "Account unlocked");
        Ok(user)
    }

    // ========================================================================
    // Password reset
    // ========================================================================

    /// Issue a reset code for the account behind `email`
    ///
    /// The code is handed to the notifier and also returned. Delivery
    /// failures are logged and do not fail the request.
    pub async fn request_password_reset(&self, email: &str) -> Result<String> {
        let mut unit = self.unit().await?;
        let user = unit
            .repository::<User>()
            .find_one(&UserFilter::Email(email.to_string()))
            .await?
            .ok_or_else(|| IdentityError::not_found(USER_NOT_FOUND))?;

        let code = self
            .tokens
            .create_token(&mut unit, &user, kinds::RESTORE, 0)
            .await
            .map_err(|e| IdentityError::bad_request(e.message()))?;

        if let Err(e) = self.notifier.send_reset_code(&user, &code).await {
            warn!(user_id = user.id, error = %e, "Reset code delivery failed");
        }

        info!(user_id = user.id, "Password reset requested");
        Ok(code)
    }

    /// Redeem a reset code
    ///
    /// Unknown, superseded and expired codes all fail the same way.
    pub async fn reset_password(&self, code: &str, new_password: &str) -> Result<()> {
        if !validate_password(new_password) {
            return Err(IdentityError::bad_request(PASSWORD_INVALID));
        }
        if code.trim().is_empty() {
            return Err(IdentityError::bad_request(INVALID_TOKEN));
        }

        let mut unit = self.unit().await?;
        let outcome = redeem_reset_code(&mut unit, code.trim(), new_password).await;

        match outcome {
            Ok(Some(user_id)) => {
                info!(user_id, "Password reset");
                Ok(())
            }
            Ok(None) => {
                if let Err(e) = unit.rollback().await {
                    warn!(error = %e, "Rollback after rejected reset code failed");
                }
                Err(IdentityError::bad_request(INVALID_TOKEN))
            }
            Err(e) => {
                error!(error = %e, "Password reset failed");
                if let Err(rollback_err) = unit.rollback().await {
                    warn!(error = %rollback_err, "Rollback after reset failure also failed");
                }
                Err(IdentityError::internal(RESET_FAILED))
            }
        }
    }

    // ========================================================================
    // Token checks
    // ========================================================================

    /// User id behind an access token
    ///
    /// Blank, revoked, invalid and superseded tokens all yield
    /// `BadRequest("Invalid Token")`.
    pub async fn get_user_id_from_jwt(&self, token: &str) -> Result<i32> {
        let token = self.admissible(token)?;
        let mut unit = self.unit().await?;
        self.tokens
            .get_user_id_from_signed_token(&mut unit, token)
            .await
            .map_err(invalid_unless_internal)
    }

    /// Claims of an access token that is not revoked, verifies, and is still
    /// the live token for its user
    pub async fn validate_access_token(&self, token: &str) -> Result<Claims> {
        let token = self.admissible(token)?;
        let mut unit = self.unit().await?;
        self.tokens
            .validate_token(&mut unit, token, kinds::ACCESS)
            .await
            .map_err(invalid_unless_internal)
    }

    /// Returns whether the token was newly revoked
    pub fn revoke_token(&self, token: &str) -> Result<bool> {
        let token = bearer_token(token);
        if token.is_empty() {
            return Err(IdentityError::bad_request("Token is required"));
        }
        Ok(self.revocations.revoke(token))
    }

    pub fn is_revoked(&self, token: &str) -> bool {
        self.revocations.is_revoked(bearer_token(token))
    }

    fn admissible<'t>(&self, token: &'t str) -> Result<&'t str> {
        let token = bearer_token(token);
        if token.is_empty() || self.revocations.is_revoked(token) {
            return Err(IdentityError::bad_request(INVALID_TOKEN));
        }
        Ok(token)
    }
}

fn invalid_unless_internal(err: IdentityError) -> IdentityError {
    match err {
        IdentityError::Internal(_) => err,
        _ => IdentityError::bad_request(INVALID_TOKEN),
    }
}

/// Check the email and username are free, insert the user and its cart, then
/// link them, all in one transaction. On error the transaction is left open
/// for the caller to roll back.
async fn create_account<S: StoreSession>(
    unit: &mut UnitOfWork<S>,
    user: User,
) -> Result<User> {
    unit.begin().await?;

    let email_taken = unit
        .repository::<User>()
        .exists(&UserFilter::Email(user.email.clone()))
        .await?;
    if email_taken {
        return Err(IdentityError::conflict(EMAIL_TAKEN));
    }
    let username_taken = unit
        .repository::<User>()
        .exists(&UserFilter::Username(user.username.clone()))
        .await?;
    if username_taken {
        return Err(IdentityError::conflict(USERNAME_TAKEN));
    }

    let mut user = unit
        .repository::<User>()
        .create(user)
        .await
        .map_err(duplicate_conflict)?;
    let cart = unit
        .repository::<Cart>()
        .create(Cart {
            id: 0,
            user_id: user.id,
        })
        .await?;
    user.cart_id = Some(cart.id);
    unit.repository::<User>().update(user.clone()).await?;

    unit.commit().await?;
    Ok(user)
}

/// A unique violation raced past the existence checks
fn duplicate_conflict(err: StoreError) -> IdentityError {
    match err {
        StoreError::Duplicate(constraint) if constraint.contains("email") => {
            IdentityError::conflict(EMAIL_TAKEN)
        }
        StoreError::Duplicate(constraint) if constraint.contains("username") => {
            IdentityError::conflict(USERNAME_TAKEN)
        }
        other => other.into(),
    }
}

/// `Ok(None)` when the code does not redeem; the transaction is left open
/// for the caller to roll back
async fn redeem_reset_code<S: StoreSession>(
    unit: &mut UnitOfWork<S>,
    code: &str,
    new_password: &str,
) -> StoreResult<Option<i32>> {
    unit.begin().await?;

    let Some(kind) = unit
        .repository::<TokenType>()
        .find_one(&TokenTypeFilter::Name(kinds::RESTORE.to_string()))
        .await?
    else {
        return Ok(None);
    };

    let Some(mut row) = unit
        .repository::<Token>()
        .find_one(&TokenFilter::Redeemable {
            value: code.to_string(),
            token_type_id: kind.id,
            status_id: TokenStatus::ACTIVE,
            now: Utc::now(),
        })
        .await?
    else {
        return Ok(None);
    };

    let Some(mut user) = unit.repository::<User>().find_by_id(row.user_id).await? else {
        return Ok(None);
    };

    let salt = new_salt();
    user.password_hash = hash_password(new_password, &salt);
    user.salt = encode_salt(&salt);
    user.is_locked = false;
    user.access_attempts = 0;
    row.status_id = TokenStatus::SUPERSEDED;

    let user_id = user.id;
    unit.repository::<User>().update(user).await?;
    unit.repository::<Token>().update(row).await?;

    unit.commit().await?;
    Ok(Some(user_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JwtSettings;
    use crate::services::reset_delivery::MockResetCodeNotifier;
    use crate::store::MemoryCredentialStore;
    use mockall::predicate::*;

    fn signer() -> Arc<Signer> {
        let settings = JwtSettings {
            secret_key: "auth-unit-default-secret".to_string(),
            issuer: "auth-unit".to_string(),
            audience: "auth-unit-web".to_string(),
            refresh_secret_key: "auth-unit-refresh-secret".to_string(),
            refresh_audience: "auth-unit-refresh".to_string(),
        };
        Arc::new(Signer::from_settings(&settings).unwrap())
    }

    fn manager(store: MemoryCredentialStore) -> AuthManager<MemoryCredentialStore> {
        AuthManager::new(store, signer(), Arc::new(RevocationRegistry::new()))
    }

    #[test]
    fn test_bearer_token_strips_scheme() {
        assert_eq!(bearer_token("Bearer abc.def"), "abc.def");
        assert_eq!(bearer_token("bearer   abc"), "abc");
        assert_eq!(bearer_token("  abc "), "abc");
        assert_eq!(bearer_token("Bearer\tabc"), "abc");
        assert_eq!(bearer_token("Bearer "), "");
        assert_eq!(bearer_token(" bearer"), "");
        assert_eq!(bearer_token(""), "");
        assert_eq!(bearer_token("Bearerabc"), "Bearerabc");
    }

    #[tokio::test]
    async fn test_sign_up_validation_messages() {
        let auth = manager(MemoryCredentialStore::seeded());

        let err = auth.sign_up("alice", "not-an-email", "Passw0rd!").await.unwrap_err();
        assert_eq!(err.message(), "not-an-email is not a valid email.");

        let err = auth.sign_up("alice", "alice@x.com", "short").await.unwrap_err();
        assert_eq!(err, IdentityError::bad_request(PASSWORD_INVALID));

        let err = auth.sign_up("al", "alice@x.com", "Passw0rd!").await.unwrap_err();
        assert_eq!(err.message(), "al is not a valid username.");
    }

    #[tokio::test]
    async fn test_email_conflict_takes_priority() {
        let auth = manager(MemoryCredentialStore::seeded());
        auth.sign_up("alice", "alice@x.com", "Passw0rd!").await.unwrap();

        let both = auth.sign_up("alice", "alice@x.com", "Passw0rd!").await.unwrap_err();
        assert_eq!(both, IdentityError::conflict(EMAIL_TAKEN));

        let name_only = auth.sign_up("alice", "other@x.com", "Passw0rd!").await.unwrap_err();
        assert_eq!(name_only, IdentityError::conflict(USERNAME_TAKEN));
    }

    #[test]
    fn test_unique_violations_map_to_conflicts() {
        let email = duplicate_conflict(StoreError::Duplicate("users_email_key".to_string()));
        assert_eq!(email, IdentityError::conflict(EMAIL_TAKEN));

        let username = duplicate_conflict(StoreError::Duplicate("users_username_key".to_string()));
        assert_eq!(username, IdentityError::conflict(USERNAME_TAKEN));

        let other = duplicate_conflict(StoreError::Duplicate("carts_user_id_key".to_string()));
        assert_eq!(other, IdentityError::internal(DEFAULT_INTERNAL));

        let backend = duplicate_conflict(StoreError::Backend("connection reset".to_string()));
        assert_eq!(backend.status_code(), 500);
    }

    #[tokio::test]
    async fn test_sign_up_without_default_role_is_internal() {
        let auth = manager(MemoryCredentialStore::new());
        let err = auth.sign_up("alice", "alice@x.com", "Passw0rd!").await.unwrap_err();
        assert_eq!(err.status_code(), 500);
    }

    #[tokio::test]
    async fn test_reset_code_handed_to_notifier() {
        let store = MemoryCredentialStore::seeded();
        let mut notifier = MockResetCodeNotifier::new();
        notifier
            .expect_send_reset_code()
            .withf(|user, code| user.username == "alice" && code.len() == 6)
            .times(1)
            .returning(|_, _| Ok(()));

        let auth = manager(store).with_notifier(Arc::new(notifier));
        auth.sign_up("alice", "alice@x.com", "Passw0rd!").await.unwrap();

        let code = auth.request_password_reset("alice@x.com").await.unwrap();
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_notifier_failure_does_not_fail_request() {
        let mut notifier = MockResetCodeNotifier::new();
        notifier
            .expect_send_reset_code()
            .with(always(), always())
            .returning(|_, _| Err(anyhow::anyhow!("smtp unavailable")));

        let auth = manager(MemoryCredentialStore::seeded()).with_notifier(Arc::new(notifier));
        auth.sign_up("alice", "alice@x.com", "Passw0rd!").await.unwrap();

        let code = auth.request_password_reset("alice@x.com").await.unwrap();
        auth.reset_password(&code, "N3wPassword!").await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_for_unknown_email() {
        let auth = manager(MemoryCredentialStore::seeded());
        let err = auth.request_password_reset("ghost@x.com").await.unwrap_err();
        assert_eq!(err, IdentityError::not_found(USER_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_reset_rejects_short_password_before_lookup() {
        let auth = manager(MemoryCredentialStore::seeded());
        let err = auth.reset_password("123456", "short").await.unwrap_err();
        assert_eq!(err, IdentityError::bad_request(PASSWORD_INVALID));
    }

    #[tokio::test]
    async fn test_unlock_account() {
        let auth = manager(MemoryCredentialStore::seeded());
        let user = auth.sign_up("alice", "alice@x.com", "Passw0rd!").await.unwrap();
        for _ in 0..MAX_ACCESS_ATTEMPTS {
            let _ = auth.log_in("alice", "wrong-password", false).await;
        }
        assert_eq!(
            auth.log_in("alice", "Passw0rd!", false).await.unwrap_err(),
            IdentityError::bad_request(ACCOUNT_DISABLED)
        );

        let unlocked = auth.unlock_account(user.id).await.unwrap();
        assert!(!unlocked.is_locked);
        assert_eq!(unlocked.access_attempts, 0);
        assert!(auth.log_in("alice", "Passw0rd!", false).await.is_ok());

        assert_eq!(auth.unlock_account(999).await.unwrap_err().status_code(), 404);
    }

    #[tokio::test]
    async fn test_revoke_requires_value() {
        let auth = manager(MemoryCredentialStore::seeded());
        assert_eq!(auth.revoke_token("  ").unwrap_err().status_code(), 400);
        assert_eq!(auth.revoke_token("Bearer ").unwrap_err().status_code(), 400);
        assert!(!auth.is_revoked("Bearer"));
        assert!(auth.revoke_token("Bearer abc").unwrap());
        assert!(!auth.revoke_token("abc").unwrap());
        assert!(auth.is_revoked("abc"));
    }
}
