/// Credential store abstraction
///
/// The identity core never talks to a database directly. It sees:
///
/// - `EntityStore<E>`: find/exists/count/create/update/bulk-update/delete for one entity
/// - `StoreSession`: a connection-scoped handle implementing `EntityStore` for every
///   entity the core needs, plus physical `begin`/`commit`/`rollback`
/// - `CredentialStore`: a cloneable factory of sessions
///
/// Business code goes through `UnitOfWork`, which layers reference-counted
/// nesting and staged writes on top of a session.
///
/// ## Backends
///
/// - `memory`: in-process tables, used by tests and the database-less preflight
/// - `postgres`: sqlx pool, SQL generated per entity with `QueryBuilder`
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::models::{
    Cart, Role, TokenStatus, TokenStatusFilter, TokenType, TokenTypeFilter, Token, User,
};

pub mod memory;
pub mod postgres;
pub mod unit_of_work;

pub use memory::MemoryCredentialStore;
pub use postgres::PgCredentialStore;
pub use unit_of_work::{Repository, UnitOfWork};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("No active transaction")]
    NoActiveTransaction,

    #[error("Transaction already open")]
    TransactionAlreadyOpen,

    #[error("Duplicate value violates {0}")]
    Duplicate(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// A persisted record with an integer primary key
pub trait Entity: Clone + fmt::Debug + Send + Sync + 'static {
    /// Predicate type understood by every backend
    type Filter: Clone + fmt::Debug + Send + Sync + 'static;

    /// Table name, also used in logs and fault injection
    const NAME: &'static str;

    fn id(&self) -> i32;

    fn set_id(&mut self, id: i32);

    fn by_id(id: i32) -> Self::Filter;
}

/// Narrow per-entity capability set
#[async_trait]
pub trait EntityStore<E: Entity>: Send {
    async fn find_one(&mut self, filter: &E::Filter) -> StoreResult<Option<E>>;

    async fn find_all(&mut self, filter: &E::Filter) -> StoreResult<Vec<E>>;

    async fn exists(&mut self, filter: &E::Filter) -> StoreResult<bool>;

    async fn count(&mut self, filter: &E::Filter) -> StoreResult<u64>;

    /// Insert and return the entity with its assigned id
    async fn create(&mut self, entity: E) -> StoreResult<E>;

    async fn update(&mut self, entity: &E) -> StoreResult<()>;

    async fn bulk_update(&mut self, entities: &[E]) -> StoreResult<()>;

    /// Returns whether a row was removed
    async fn delete(&mut self, id: i32) -> StoreResult<bool>;
}

/// One connection-scoped view of the store
#[async_trait]
pub trait StoreSession:
    EntityStore<User>
    + EntityStore<Role>
    + EntityStore<Cart>
    + EntityStore<Token>
    + EntityStore<TokenType>
    + EntityStore<TokenStatus>
    + Send
    + 'static
{
    async fn begin(&mut self) -> StoreResult<()>;

    async fn commit(&mut self) -> StoreResult<()>;

    async fn rollback(&mut self) -> StoreResult<()>;

    fn in_transaction(&self) -> bool;
}

#[async_trait]
pub trait CredentialStore: Clone + Send + Sync + 'static {
    type Session: StoreSession;

    async fn open_session(&self) -> StoreResult<Self::Session>;

    /// Fresh unit of work over a new session. One per logical operation.
    async fn unit_of_work(&self) -> StoreResult<UnitOfWork<Self::Session>> {
        Ok(UnitOfWork::new(self.open_session().await?))
    }
}

/// Reference rows every deployment must carry before serving traffic
pub const REQUIRED_TOKEN_KINDS: [&str; 3] = [
    crate::models::kinds::ACCESS,
    crate::models::kinds::REFRESH,
    crate::models::kinds::RESTORE,
];

pub const DEFAULT_ROLE: &str = "user";

/// List the reference rows that are missing, empty when the store is ready
pub async fn missing_reference_data<S: StoreSession>(
    unit: &mut UnitOfWork<S>,
) -> StoreResult<Vec<String>> {
    let mut missing = Vec::new();

    for kind in REQUIRED_TOKEN_KINDS {
        let present = unit
            .repository::<TokenType>()
            .exists(&TokenTypeFilter::Name(kind.to_string()))
            .await?;
        if !present {
            missing.push(format!("token type '{kind}'"));
        }
    }

    for status in [TokenStatus::ACTIVE, TokenStatus::SUPERSEDED] {
        let present = unit
            .repository::<TokenStatus>()
            .exists(&TokenStatusFilter::Id(status))
            .await?;
        if !present {
            missing.push(format!("token status {status}"));
        }
    }

    let role_present = unit
        .repository::<Role>()
        .exists(&crate::models::RoleFilter::Name(DEFAULT_ROLE.to_string()))
        .await?;
    if !role_present {
        missing.push(format!("role '{DEFAULT_ROLE}'"));
    }

    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seeded_store_has_reference_data() {
        let store = MemoryCredentialStore::seeded();
        let mut unit = store.unit_of_work().await.unwrap();
        assert!(missing_reference_data(&mut unit).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_store_reports_everything_missing() {
        let store = MemoryCredentialStore::new();
        let mut unit = store.unit_of_work().await.unwrap();
        let missing = missing_reference_data(&mut unit).await.unwrap();

        assert_eq!(missing.len(), 6);
        assert!(missing.contains(&"token type 'restore'".to_string()));
        assert!(missing.contains(&"role 'user'".to_string()));
    }
}
