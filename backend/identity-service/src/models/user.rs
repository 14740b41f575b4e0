use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::store::Entity;

/// User model - core identity entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i32,
    pub email: String,
    pub username: String,
    /// base64 SHA-256 of password bytes followed by salt bytes
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// base64 of the raw salt
    #[serde(skip_serializing)]
    pub salt: String,
    pub role_id: i32,
    pub is_locked: bool,
    pub is_disabled: bool,
    pub is_email_confirmed: bool,
    pub access_attempts: i32,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub cart_id: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
}

impl User {
    /// "first last" when a first name is present, otherwise the username
    pub fn display_name(&self) -> String {
        match &self.first_name {
            Some(first) => match &self.last_name {
                Some(last) => format!("{first} {last}"),
                None => first.clone(),
            },
            None => self.username.clone(),
        }
    }

    pub fn can_log_in(&self) -> bool {
        !self.is_locked && !self.is_disabled
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserFilter {
    All,
    Id(i32),
    Email(String),
    Username(String),
    /// Exact match against either email or username
    Credential(String),
}

impl Entity for User {
    type Filter = UserFilter;
    const NAME: &'static str = "users";

    fn id(&self) -> i32 {
        self.id
    }

    fn set_id(&mut self, id: i32) {
        self.id = id;
    }

    fn by_id(id: i32) -> UserFilter {
        UserFilter::Id(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleFilter {
    All,
    Id(i32),
    /// Case-insensitive
    Name(String),
}

impl Entity for Role {
    type Filter = RoleFilter;
    const NAME: &'static str = "roles";

    fn id(&self) -> i32 {
        self.id
    }

    fn set_id(&mut self, id: i32) {
        self.id = id;
    }

    fn by_id(id: i32) -> RoleFilter {
        RoleFilter::Id(id)
    }
}

/// Shopping cart owned by exactly one user, created at sign-up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Cart {
    pub id: i32,
    pub user_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartFilter {
    All,
    Id(i32),
    UserId(i32),
}

impl Entity for Cart {
    type Filter = CartFilter;
    const NAME: &'static str = "carts";

    fn id(&self) -> i32 {
        self.id
    }

    fn set_id(&mut self, id: i32) {
        self.id = id;
    }

    fn by_id(id: i32) -> CartFilter {
        CartFilter::Id(id)
    }
}

/// What a successful login hands back to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSession {
    pub user_id: i32,
    pub display_name: String,
    pub role: String,
    pub currency: String,
    pub cart: Vec<i32>,
    pub wishlist: Vec<i32>,
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl UserSession {
    pub fn new(user: &User, role: &Role, access_token: String, refresh_token: Option<String>) -> Self {
        Self {
            user_id: user.id,
            display_name: user.display_name(),
            role: role.name.clone(),
            currency: String::new(),
            cart: Vec::new(),
            wishlist: Vec::new(),
            access_token,
            refresh_token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(first: Option<&str>, last: Option<&str>) -> User {
        let now = Utc::now();
        User {
            id: 1,
            email: "alice@x.com".to_string(),
            username: "alice".to_string(),
            password_hash: "hash".to_string(),
            salt: "salt".to_string(),
            role_id: 1,
            is_locked: false,
            is_disabled: false,
            is_email_confirmed: false,
            access_attempts: 0,
            first_name: first.map(str::to_string),
            last_name: last.map(str::to_string),
            cart_id: None,
            created_at: now,
            last_access_at: now,
        }
    }

    #[test]
    fn test_display_name_prefers_full_name() {
        assert_eq!(user(Some("Alice"), Some("Liddell")).display_name(), "Alice Liddell");
        assert_eq!(user(None, Some("Liddell")).display_name(), "alice");
    }

    #[test]
    fn test_session_serialization_hides_secrets() {
        let role = Role { id: 1, name: "user".to_string() };
        let session = UserSession::new(&user(None, None), &role, "tok".to_string(), None);
        let json = serde_json::to_value(&session).unwrap();

        assert_eq!(json["display_name"], "alice");
        assert_eq!(json["role"], "user");
        assert!(json.get("refresh_token").is_none());

        let raw = serde_json::to_value(user(None, None)).unwrap();
        assert!(raw.get("password_hash").is_none());
        assert!(raw.get("salt").is_none());
    }

    #[test]
    fn test_locked_or_disabled_cannot_log_in() {
        let mut u = user(None, None);
        assert!(u.can_log_in());
        u.is_locked = true;
        assert!(!u.can_log_in());
        u.is_locked = false;
        u.is_disabled = true;
        assert!(!u.can_log_in());
    }
}
