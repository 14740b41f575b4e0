/// Shared JWT signing and validation
///
/// Tokens are HS256-signed. Key material is chosen per token kind: the
/// `refresh` kind has its own secret and audience, every other kind shares
/// the default pair. A refresh token therefore never validates as an access
/// token and vice versa.
///
/// ## Usage
///
/// ```rust
/// use chrono::Duration;
/// use crypto_core::jwt::{JwtSigner, SigningKey};
///
/// let signer = JwtSigner::new(
///     "storefront",
///     SigningKey::from_secret(b"access-secret", "storefront-web").unwrap(),
///     SigningKey::from_secret(b"refresh-secret", "storefront-refresh").unwrap(),
/// );
///
/// let claims = signer.claims_for("access", "42", None, Duration::days(1)).unwrap();
/// let token = signer.sign("access", &claims).unwrap();
/// assert_eq!(signer.validate(&token, "access").unwrap().claims.sub, "42");
/// ```
use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// Kind name routed to the refresh key material (matched case-insensitively)
pub const REFRESH_KIND: &str = "refresh";

const ACCESS_NAME: &str = "access";

const JWT_ALGORITHM: Algorithm = Algorithm::HS256;

// ============================================================================
// Data Structures
// ============================================================================

/// JWT Claims structure
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Unique token identifier, persisted alongside the issued token
    pub jti: String,
    /// Subject (numeric user id as string)
    pub sub: String,
    /// "access" or "refresh"
    pub name: String,
    /// Only carried by refresh tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub iss: String,
    pub aud: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

/// Secret and intended audience for one family of token kinds
#[derive(Clone)]
pub struct SigningKey {
    encoding: EncodingKey,
    decoding: DecodingKey,
    audience: String,
}

impl SigningKey {
    /// Build key material from a shared secret
    ///
    /// ## Errors
    ///
    /// Returns error if the secret or the audience is empty.
    pub fn from_secret(secret: &[u8], audience: impl Into<String>) -> Result<Self> {
        if secret.is_empty() {
            return Err(anyhow!("JWT secret must not be empty"));
        }
        let audience = audience.into();
        if audience.trim().is_empty() {
            return Err(anyhow!("JWT audience must not be empty"));
        }

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            audience,
        })
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("secret", &"[REDACTED]")
            .field("audience", &self.audience)
            .finish()
    }
}

/// Issuer plus the two key families
#[derive(Debug, Clone)]
pub struct JwtSigner {
    issuer: String,
    default_key: SigningKey,
    refresh_key: SigningKey,
}

impl JwtSigner {
    pub fn new(issuer: impl Into<String>, default_key: SigningKey, refresh_key: SigningKey) -> Self {
        Self {
            issuer: issuer.into(),
            default_key,
            refresh_key,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Key material for a token kind. Pure function of the kind name.
    pub fn key_for(&self, kind: &str) -> &SigningKey {
        if is_refresh_kind(kind) {
            &self.refresh_key
        } else {
            &self.default_key
        }
    }

    // ========================================================================
    // Token Generation
    // ========================================================================

    /// Build the default claim set for a kind
    ///
    /// `email` is only embedded for the refresh kind. `lifetime` may be
    /// negative, which yields an already-expired claim set.
    ///
    /// ## Errors
    ///
    /// Returns error if `now + lifetime` falls outside the representable
    /// date range
    pub fn claims_for(
        &self,
        kind: &str,
        subject: &str,
        email: Option<&str>,
        lifetime: Duration,
    ) -> Result<Claims> {
        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(lifetime)
            .ok_or_else(|| anyhow!("Lifetime of {kind} token is out of range"))?;
        let refresh = is_refresh_kind(kind);

        Ok(Claims {
            jti: Uuid::new_v4().to_string(),
            sub: subject.to_string(),
            name: if refresh { REFRESH_KIND } else { ACCESS_NAME }.to_string(),
            email: if refresh { email.map(str::to_string) } else { None },
            iss: self.issuer.clone(),
            aud: self.key_for(kind).audience.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        })
    }

    /// Sign a claim set with the key of the given kind
    pub fn sign(&self, kind: &str, claims: &Claims) -> Result<String> {
        encode(
            &Header::new(JWT_ALGORITHM),
            claims,
            &self.key_for(kind).encoding,
        )
        .map_err(|e| anyhow!("Failed to sign {kind} token: {e}"))
    }

    // ========================================================================
    // Token Validation
    // ========================================================================

    /// Validate and decode a JWT token for a kind
    ///
    /// Checks signature, issuer, audience and expiry with zero leeway.
    ///
    /// ## Errors
    ///
    /// Returns error if:
    /// - Token signature is invalid for the kind's key
    /// - Issuer or audience differ from the configured values
    /// - Token is expired
    /// - Token format is malformed
    pub fn validate(&self, token: &str, kind: &str) -> Result<TokenData<Claims>> {
        let key = self.key_for(kind);

        let mut validation = Validation::new(JWT_ALGORITHM);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[key.audience.as_str()]);

        decode::<Claims>(token, &key.decoding, &validation)
            .map_err(|e| anyhow!("Token validation failed: {e}"))
    }
}

fn is_refresh_kind(kind: &str) -> bool {
    kind.eq_ignore_ascii_case(REFRESH_KIND)
}

// ============================================================================
// Tests
// ============================================================================
