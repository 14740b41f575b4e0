/// Token lifecycle
///
/// Binds signer output to persisted token rows. For every (user, kind) pair
/// at most one row is live: issuing a new token flips the previous live rows
/// to superseded inside the same transaction that inserts the new row. Rows
/// are never deleted.
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, warn};

use crate::error::{IdentityError, Result};
use crate::models::{
    kinds, Token, TokenFilter, TokenStatus, TokenStatusFilter, TokenType, TokenTypeFilter, User,
};
use crate::security::{Claims, Signer};
use crate::store::{StoreResult, StoreSession, UnitOfWork};

pub const TOKEN_GENERATION_ERROR: &str = "Error generating token";
pub const INVALID_TOKEN: &str = "Invalid Token";

#[derive(Debug, Clone)]
pub struct TokenManager {
    signer: Arc<Signer>,
}

impl TokenManager {
    pub fn new(signer: Arc<Signer>) -> Self {
        Self { signer }
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Resolve a kind by case-insensitive name
    pub async fn find_kind<S: StoreSession>(
        &self,
        unit: &mut UnitOfWork<S>,
        kind: &str,
    ) -> Result<TokenType> {
        unit.repository::<TokenType>()
            .find_one(&TokenTypeFilter::Name(kind.to_string()))
            .await?
            .ok_or_else(|| IdentityError::not_found(format!("Token type '{kind}' not found.")))
    }

    // ========================================================================
    // Issuance
    // ========================================================================

    /// Issue a token of `kind` for `user` and return the signed string (or code)
    ///
    /// `status_override` > 0 replaces the kind's default status.
    ///
    /// ## Errors
    ///
    /// - `NotFound` if the kind does not exist
    /// - `BadRequest` if the signer produced an empty token
    /// - `Internal` ("Error generating token") if the kind's lifetime is out of
    ///   range, or on signing or persistence failure; persistence failures roll
    ///   the unit of work back first
    pub async fn create_token<S: StoreSession>(
        &self,
        unit: &mut UnitOfWork<S>,
        user: &User,
        kind: &str,
        status_override: i32,
    ) -> Result<String> {
        let token_type = match self.find_kind(unit, kind).await {
            Ok(token_type) => token_type,
            Err(IdentityError::NotFound(message)) => return Err(IdentityError::NotFound(message)),
            Err(_) => return Err(IdentityError::internal(TOKEN_GENERATION_ERROR)),
        };

        let expires_at = token_type.expires_at(Utc::now()).ok_or_else(|| {
            error!(
                user_id = user.id,
                token_type = kind,
                lifetime_days = token_type.lifetime_days,
                "Token lifetime out of range"
            );
            IdentityError::internal(TOKEN_GENERATION_ERROR)
        })?;

        let issued = self
            .signer
            .issue_token(user, &token_type, None)
            .map_err(|e| {
                error!(user_id = user.id, token_type = kind, error = %e, "Token signing failed");
                IdentityError::internal(TOKEN_GENERATION_ERROR)
            })?;

        if issued.token.trim().is_empty() {
            return Err(IdentityError::bad_request(TOKEN_GENERATION_ERROR));
        }

        let row = Token {
            id: 0,
            value: issued.identifier,
            token_type_id: token_type.id,
            user_id: user.id,
            status_id: if status_override > 0 {
                status_override
            } else {
                token_type.default_status
            },
            expires_at,
        };

        if let Err(e) = persist_superseding(unit, row).await {
            error!(
                user_id = user.id,
                token_type = kind,
                status = status_override,
                error = %e,
                "Error generating token"
            );
            if let Err(rollback_err) = unit.rollback().await {
                warn!(error = %rollback_err, "Rollback after token failure also failed");
            }
            return Err(IdentityError::internal(TOKEN_GENERATION_ERROR));
        }

        Ok(issued.token)
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Validate a signed token of `kind` against the signer and its persisted row
    ///
    /// ## Errors
    ///
    /// - `NotFound` if the kind does not exist
    /// - `NotFound` ("Invalid Token") for a bad signature, a missing `jti`, or
    ///   a row that is absent or superseded
    pub async fn validate_token<S: StoreSession>(
        &self,
        unit: &mut UnitOfWork<S>,
        signed: &str,
        kind: &str,
    ) -> Result<Claims> {
        let token_type = self.find_kind(unit, kind).await?;

        let claims = self
            .signer
            .validate_token(signed, &token_type.name)
            .filter(|claims| !claims.jti.is_empty())
            .ok_or_else(|| IdentityError::not_found(INVALID_TOKEN))?;

        let live = unit
            .repository::<Token>()
            .exists(&TokenFilter::LiveValue(claims.jti.clone()))
            .await?;

        if live {
            Ok(claims)
        } else {
            Err(IdentityError::not_found(INVALID_TOKEN))
        }
    }

    /// User id carried by a valid access token
    pub async fn get_user_id_from_signed_token<S: StoreSession>(
        &self,
        unit: &mut UnitOfWork<S>,
        signed: &str,
    ) -> Result<i32> {
        let claims = self.validate_token(unit, signed, kinds::ACCESS).await?;
        claims
            .sub
            .parse()
            .map_err(|_| IdentityError::not_found(INVALID_TOKEN))
    }

    // ========================================================================
    // Reference data
    // ========================================================================

    pub async fn token_type_names<S: StoreSession>(
        &self,
        unit: &mut UnitOfWork<S>,
    ) -> Result<Vec<String>> {
        let types = unit
            .repository::<TokenType>()
            .find_all(&TokenTypeFilter::All)
            .await?;
        Ok(types.into_iter().map(|t| t.name).collect())
    }

    pub async fn create_token_type<S: StoreSession>(
        &self,
        unit: &mut UnitOfWork<S>,
        name: &str,
        default_status: i32,
        lifetime_days: f64,
    ) -> Result<TokenType> {
        let name = name.trim();
        if name.is_empty() {
            return Err(IdentityError::bad_request("Name is required"));
        }
        if default_status <= 0 {
            return Err(IdentityError::bad_request("Status is required"));
        }
        if !lifetime_days.is_finite() || lifetime_days <= 0.0 {
            return Err(IdentityError::bad_request("Expiry span is required"));
        }
        if lifetime_days > TokenType::MAX_LIFETIME_DAYS {
            return Err(IdentityError::bad_request(format!(
                "Expiry span must not exceed {} days",
                TokenType::MAX_LIFETIME_DAYS
            )));
        }

        let status_known = unit
            .repository::<TokenStatus>()
            .exists(&TokenStatusFilter::Id(default_status))
            .await?;
        if !status_known {
            return Err(IdentityError::not_found(format!(
                "Token status {default_status} not found."
            )));
        }

        let duplicate = unit
            .repository::<TokenType>()
            .exists(&TokenTypeFilter::Name(name.to_string()))
            .await?;
        if duplicate {
            return Err(IdentityError::conflict(format!(
                "Token type '{name}' already exists."
            )));
        }

        let created = unit
            .repository::<TokenType>()
            .create(TokenType {
                id: 0,
                name: name.to_string(),
                default_status,
                lifetime_days,
            })
            .await?;
        Ok(created)
    }

    pub async fn create_token_status<S: StoreSession>(
        &self,
        unit: &mut UnitOfWork<S>,
        name: &str,
    ) -> Result<TokenStatus> {
        let name = name.trim();
        if name.is_empty() {
            return Err(IdentityError::bad_request("Name is required"));
        }

        let duplicate = unit
            .repository::<TokenStatus>()
            .exists(&TokenStatusFilter::Name(name.to_string()))
            .await?;
        if duplicate {
            return Err(IdentityError::conflict(format!(
                "Token status '{name}' already exists."
            )));
        }

        let created = unit
            .repository::<TokenStatus>()
            .create(TokenStatus {
                id: 0,
                name: name.to_string(),
            })
            .await?;
        Ok(created)
    }
}

/// Supersede the live rows of the same (user, kind) and insert `row`, atomically
async fn persist_superseding<S: StoreSession>(
    unit: &mut UnitOfWork<S>,
    row: Token,
) -> StoreResult<()> {
    unit.begin().await?;

    let previous = unit
        .repository::<Token>()
        .find_all(&TokenFilter::LiveForUser {
            user_id: row.user_id,
            token_type_id: row.token_type_id,
        })
        .await?;

    if !previous.is_empty() {
        let superseded = previous
            .into_iter()
            .map(|mut token| {
                token.status_id = TokenStatus::SUPERSEDED;
                token
            })
            .collect();
        unit.repository::<Token>().bulk_update(superseded).await?;
    }

    unit.repository::<Token>().create(row).await?;
    unit.commit().await
}
