/// Token signer for identity-service
///
/// Wraps `crypto_core::jwt::JwtSigner` with the token-kind rules of this
/// service:
///
/// - `restore` tokens are six digit numeric codes, not JWTs. The code is both
///   the token and its persisted identifier.
/// - every other kind is a JWT whose `jti` is the persisted identifier and
///   whose key, audience and lifetime come from the kind.
use anyhow::{anyhow, Context, Result};
use crypto_core::jwt::{Claims, JwtSigner, SigningKey};

use crate::config::{JwtSettings, RESET_CODE_DIGITS};
use crate::models::{kinds, TokenType, User};

/// What the signer hands back for one issuance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// Value given to the client
    pub token: String,
    /// Value persisted in the token row
    pub identifier: String,
}

#[derive(Debug, Clone)]
pub struct Signer {
    jwt: JwtSigner,
}

impl Signer {
    pub fn new(jwt: JwtSigner) -> Self {
        Self { jwt }
    }

    pub fn from_settings(settings: &JwtSettings) -> Result<Self> {
        let default_key =
            SigningKey::from_secret(settings.secret_key.as_bytes(), settings.audience.clone())
                .context("Invalid JWT_SECRET_KEY / JWT_AUDIENCE")?;
        let refresh_key = SigningKey::from_secret(
            settings.refresh_secret_key.as_bytes(),
            settings.refresh_audience.clone(),
        )
        .context("Invalid JWT_REFRESH_SECRET_KEY / JWT_REFRESH_AUDIENCE")?;

        Ok(Self::new(JwtSigner::new(
            settings.issuer.clone(),
            default_key,
            refresh_key,
        )))
    }

    /// Default claim set for `user` and `kind`
    ///
    /// ## Errors
    ///
    /// Returns error if the kind's lifetime is unusable or overflows the
    /// expiry timestamp
    pub fn claims_for(&self, user: &User, kind: &TokenType) -> Result<Claims> {
        let lifetime = kind
            .lifetime()
            .ok_or_else(|| anyhow!("Token type '{}' has an out-of-range lifetime", kind.name))?;
        let subject = user.id.to_string();
        self.jwt
            .claims_for(&kind.name, &subject, Some(&user.email), lifetime)
    }

    /// Issue a token of `kind` for `user`
    ///
    /// `claims` replaces the kind's default claim set when given; it is
    /// ignored for the restore kind.
    ///
    /// ## Errors
    ///
    /// Returns error if the claim set cannot be built or JWT encoding fails
    pub fn issue_token(
        &self,
        user: &User,
        kind: &TokenType,
        claims: Option<Claims>,
    ) -> Result<IssuedToken> {
        if kind.is(kinds::RESTORE) {
            let code = crypto_core::numeric_code(RESET_CODE_DIGITS);
            return Ok(IssuedToken {
                token: code.clone(),
                identifier: code,
            });
        }

        let claims = match claims {
            Some(claims) => claims,
            None => self.claims_for(user, kind)?,
        };
        let token = self.jwt.sign(&kind.name, &claims)?;

        Ok(IssuedToken {
            token,
            identifier: claims.jti,
        })
    }

    /// Verify a signed token for `kind`
    ///
    /// Every failure (malformed, bad signature, wrong issuer or audience,
    /// expired) collapses to `None`. The reason is only logged at debug level.
    pub fn validate_token(&self, token: &str, kind: &str) -> Option<Claims> {
        match self.jwt.validate(token, kind) {
            Ok(data) => Some(data.claims),
            Err(e) => {
                tracing::debug!(token_type = kind, error = %e, "Token rejected");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn settings() -> JwtSettings {
        JwtSettings {
            secret_key: "unit-test-default-secret".to_string(),
            issuer: "unit-test".to_string(),
            audience: "unit-web".to_string(),
            refresh_secret_key: "unit-test-refresh-secret".to_string(),
            refresh_audience: "unit-refresh".to_string(),
        }
    }

    fn user() -> User {
        let now = Utc::now();
        User {
            id: 42,
            email: "bob@example.com".to_string(),
            username: "bob".to_string(),
            password_hash: String::new(),
            salt: String::new(),
            role_id: 1,
            is_locked: false,
            is_disabled: false,
            is_email_confirmed: false,
            access_attempts: 0,
            first_name: None,
            last_name: None,
            cart_id: None,
            created_at: now,
            last_access_at: now,
        }
    }

    fn kind(id: i32, name: &str, lifetime_days: f64) -> TokenType {
        TokenType {
            id,
            name: name.to_string(),
            default_status: 1,
            lifetime_days,
        }
    }

    #[test]
    fn test_restore_kind_yields_numeric_code() {
        let signer = Signer::from_settings(&settings()).unwrap();
        let issued = signer
            .issue_token(&user(), &kind(3, "Restore", 0.25), None)
            .unwrap();

        assert_eq!(issued.token, issued.identifier);
        assert_eq!(issued.token.len(), 6);
        assert!(issued.token.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_access_round_trip() {
        let signer = Signer::from_settings(&settings()).unwrap();
        let issued = signer
            .issue_token(&user(), &kind(1, "access", 1.0), None)
            .unwrap();

        let claims = signer.validate_token(&issued.token, "access").unwrap();
        assert_eq!(claims.jti, issued.identifier);
        assert_eq!(claims.sub, "42");
        assert_eq!(claims.name, "access");
        assert!(claims.email.is_none());
    }

    #[test]
    fn test_refresh_carries_email_and_own_audience() {
        let signer = Signer::from_settings(&settings()).unwrap();
        let issued = signer
            .issue_token(&user(), &kind(2, "refresh", 7.0), None)
            .unwrap();

        let claims = signer.validate_token(&issued.token, "refresh").unwrap();
        assert_eq!(claims.email.as_deref(), Some("bob@example.com"));
        assert_eq!(claims.aud, "unit-refresh");
        assert!(signer.validate_token(&issued.token, "access").is_none());
    }

    #[test]
    fn test_explicit_claims_are_used() {
        let signer = Signer::from_settings(&settings()).unwrap();
        let access = kind(1, "access", 1.0);
        let mut claims = signer.claims_for(&user(), &access).unwrap();
        claims.sub = "99".to_string();

        let issued = signer.issue_token(&user(), &access, Some(claims)).unwrap();
        assert_eq!(signer.validate_token(&issued.token, "access").unwrap().sub, "99");
    }

    #[test]
    fn test_expired_kind_fails_validation() {
        let signer = Signer::from_settings(&settings()).unwrap();
        let issued = signer
            .issue_token(&user(), &kind(1, "access", -1.0), None)
            .unwrap();
        assert!(signer.validate_token(&issued.token, "access").is_none());
    }

    #[test]
    fn test_out_of_range_lifetime_fails_to_issue() {
        let signer = Signer::from_settings(&settings()).unwrap();
        assert!(signer
            .issue_token(&user(), &kind(4, "longlived", 1.0e9), None)
            .is_err());
        assert!(signer
            .issue_token(&user(), &kind(4, "longlived", f64::INFINITY), None)
            .is_err());
    }

    #[test]
    fn test_garbage_is_invalid_not_error() {
        let signer = Signer::from_settings(&settings()).unwrap();
        assert!(signer.validate_token("not-a-token", "access").is_none());
        assert!(signer.validate_token("", "refresh").is_none());
    }
}
