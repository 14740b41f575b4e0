use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::store::Entity;

/// Well-known token kind names
pub mod kinds {
    pub const ACCESS: &str = "access";
    pub const REFRESH: &str = "refresh";
    /// Password reset; issued as a bare numeric code rather than a JWT
    pub const RESTORE: &str = "restore";
}

/// Reference data describing one token kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TokenType {
    pub id: i32,
    pub name: String,
    /// Status assigned to new tokens of this kind unless overridden
    pub default_status: i32,
    /// Lifetime in days, fractional values allowed
    pub lifetime_days: f64,
}

impl TokenType {
    /// Longest lifetime a kind may be configured with (about a century)
    pub const MAX_LIFETIME_DAYS: f64 = 36_500.0;

    /// `None` when `lifetime_days` is not finite or its magnitude exceeds
    /// `MAX_LIFETIME_DAYS`
    pub fn lifetime(&self) -> Option<Duration> {
        if !self.lifetime_days.is_finite() || self.lifetime_days.abs() > Self::MAX_LIFETIME_DAYS {
            return None;
        }
        Duration::try_milliseconds((self.lifetime_days * 86_400_000.0).round() as i64)
    }

    /// Expiry of a token of this kind issued at `issued_at`
    pub fn expires_at(&self, issued_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.lifetime()
            .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
    }

    pub fn is(&self, kind: &str) -> bool {
        self.name.eq_ignore_ascii_case(kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenTypeFilter {
    All,
    Id(i32),
    /// Case-insensitive
    Name(String),
}

impl Entity for TokenType {
    type Filter = TokenTypeFilter;
    const NAME: &'static str = "token_types";

    fn id(&self) -> i32 {
        self.id
    }

    fn set_id(&mut self, id: i32) {
        self.id = id;
    }

    fn by_id(id: i32) -> TokenTypeFilter {
        TokenTypeFilter::Id(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct TokenStatus {
    pub id: i32,
    pub name: String,
}

impl TokenStatus {
    pub const ACTIVE: i32 = 1;
    pub const SUPERSEDED: i32 = 2;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatusFilter {
    All,
    Id(i32),
    /// Case-insensitive
    Name(String),
}

impl Entity for TokenStatus {
    type Filter = TokenStatusFilter;
    const NAME: &'static str = "token_statuses";

    fn id(&self) -> i32 {
        self.id
    }

    fn set_id(&mut self, id: i32) {
        self.id = id;
    }

    fn by_id(id: i32) -> TokenStatusFilter {
        TokenStatusFilter::Id(id)
    }
}

/// One issued credential. `value` is the `jti` for signed kinds and the code
/// itself for the restore kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Token {
    pub id: i32,
    pub value: String,
    pub token_type_id: i32,
    pub user_id: i32,
    pub status_id: i32,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    pub fn is_live(&self) -> bool {
        self.status_id != TokenStatus::SUPERSEDED
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenFilter {
    All,
    Id(i32),
    /// Rows of one kind for one user whose status is not superseded
    LiveForUser { user_id: i32, token_type_id: i32 },
    /// Row carrying `value` whose status is not superseded
    LiveValue(String),
    /// Row of a kind carrying `value`, in `status_id`, not yet expired at `now`
    Redeemable {
        value: String,
        token_type_id: i32,
        status_id: i32,
        now: DateTime<Utc>,
    },
}

impl Entity for Token {
    type Filter = TokenFilter;
    const NAME: &'static str = "tokens";

    fn id(&self) -> i32 {
        self.id
    }

    fn set_id(&mut self, id: i32) {
        self.id = id;
    }

    fn by_id(id: i32) -> TokenFilter {
        TokenFilter::Id(id)
    }
}
