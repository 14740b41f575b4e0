/// PostgreSQL credential store
///
/// Each entity describes its table through `PgEntity`; the generic
/// `EntityStore` impl turns filters and rows into SQL with `QueryBuilder`.
/// Statements run on the session's open transaction when there is one and on
/// the pool otherwise. Tables are provisioned out-of-band (see
/// `schema/identity.sql`).
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Transaction};
use std::time::Duration;
use tracing::debug;

use super::{CredentialStore, Entity, EntityStore, StoreError, StoreResult, StoreSession};
use crate::config::DatabaseSettings;
use crate::models::{
    Cart, CartFilter, Role, RoleFilter, Token, TokenFilter, TokenStatus, TokenStatusFilter,
    TokenType, TokenTypeFilter, User, UserFilter,
};

type Query = QueryBuilder<'static, Postgres>;

/// Table layout and filter translation for the Postgres backend
pub trait PgEntity: Entity + for<'r> FromRow<'r, PgRow> + Unpin {
    /// Every column except `id`, in bind order
    const COLUMNS: &'static str;

    /// Push a boolean SQL expression for the filter
    fn push_filter(query: &mut Query, filter: &Self::Filter);

    /// Push one bind per entry of `COLUMNS`, comma separated
    fn push_values(&self, query: &mut Query);
}

fn push_name_match(query: &mut Query, name: &str) {
    query
        .push("LOWER(name) = LOWER(")
        .push_bind(name.to_string())
        .push(")");
}

impl PgEntity for User {
    const COLUMNS: &'static str = "email, username, password_hash, salt, role_id, is_locked, \
        is_disabled, is_email_confirmed, access_attempts, first_name, last_name, cart_id, \
        created_at, last_access_at";

    fn push_filter(query: &mut Query, filter: &UserFilter) {
        match filter {
            UserFilter::All => {
                query.push("TRUE");
            }
            UserFilter::Id(id) => {
                query.push("id = ").push_bind(*id);
            }
            UserFilter::Email(email) => {
                query.push("email = ").push_bind(email.clone());
            }
            UserFilter::Username(username) => {
                query.push("username = ").push_bind(username.clone());
            }
            UserFilter::Credential(credential) => {
                query
                    .push("(email = ")
                    .push_bind(credential.clone())
                    .push(" OR username = ")
                    .push_bind(credential.clone())
                    .push(")");
            }
        }
    }

    fn push_values(&self, query: &mut Query) {
        let mut values = query.separated(", ");
        values
            .push_bind(self.email.clone())
            .push_bind(self.username.clone())
            .push_bind(self.password_hash.clone())
            .push_bind(self.salt.clone())
            .push_bind(self.role_id)
            .push_bind(self.is_locked)
            .push_bind(self.is_disabled)
            .push_bind(self.is_email_confirmed)
            .push_bind(self.access_attempts)
            .push_bind(self.first_name.clone())
            .push_bind(self.last_name.clone())
            .push_bind(self.cart_id)
            .push_bind(self.created_at)
            .push_bind(self.last_access_at);
    }
}

impl PgEntity for Role {
    const COLUMNS: &'static str = "name";

    fn push_filter(query: &mut Query, filter: &RoleFilter) {
        match filter {
            RoleFilter::All => {
                query.push("TRUE");
            }
            RoleFilter::Id(id) => {
                query.push("id = ").push_bind(*id);
            }
            RoleFilter::Name(name) => push_name_match(query, name),
        }
    }

    fn push_values(&self, query: &mut Query) {
        query.push_bind(self.name.clone());
    }
}

impl PgEntity for Cart {
    const COLUMNS: &'static str = "user_id";

    fn push_filter(query: &mut Query, filter: &CartFilter) {
        match filter {
            CartFilter::All => {
                query.push("TRUE");
            }
            CartFilter::Id(id) => {
                query.push("id = ").push_bind(*id);
            }
            CartFilter::UserId(user_id) => {
                query.push("user_id = ").push_bind(*user_id);
            }
        }
    }

    fn push_values(&self, query: &mut Query) {
        query.push_bind(self.user_id);
    }
}

impl PgEntity for Token {
    const COLUMNS: &'static str = "value, token_type_id, user_id, status_id, expires_at";

    fn push_filter(query: &mut Query, filter: &TokenFilter) {
        match filter {
            TokenFilter::All => {
                query.push("TRUE");
            }
            TokenFilter::Id(id) => {
                query.push("id = ").push_bind(*id);
            }
            TokenFilter::LiveForUser {
                user_id,
                token_type_id,
            } => {
                query
                    .push("user_id = ")
                    .push_bind(*user_id)
                    .push(" AND token_type_id = ")
                    .push_bind(*token_type_id)
                    .push(" AND status_id <> ")
                    .push_bind(TokenStatus::SUPERSEDED);
            }
            TokenFilter::LiveValue(value) => {
                query
                    .push("value = ")
                    .push_bind(value.clone())
                    .push(" AND status_id <> ")
                    .push_bind(TokenStatus::SUPERSEDED);
            }
            TokenFilter::Redeemable {
                value,
                token_type_id,
                status_id,
                now,
            } => {
                query
                    .push("value = ")
                    .push_bind(value.clone())
                    .push(" AND token_type_id = ")
                    .push_bind(*token_type_id)
                    .push(" AND status_id = ")
                    .push_bind(*status_id)
                    .push(" AND expires_at > ")
                    .push_bind(*now);
            }
        }
    }

    fn push_values(&self, query: &mut Query) {
        let mut values = query.separated(", ");
        values
            .push_bind(self.value.clone())
            .push_bind(self.token_type_id)
            .push_bind(self.user_id)
            .push_bind(self.status_id)
            .push_bind(self.expires_at);
    }
}

impl PgEntity for TokenType {
    const COLUMNS: &'static str = "name, default_status, lifetime_days";

    fn push_filter(query: &mut Query, filter: &TokenTypeFilter) {
        match filter {
            TokenTypeFilter::All => {
                query.push("TRUE");
            }
            TokenTypeFilter::Id(id) => {
                query.push("id = ").push_bind(*id);
            }
            TokenTypeFilter::Name(name) => push_name_match(query, name),
        }
    }

    fn push_values(&self, query: &mut Query) {
        let mut values = query.separated(", ");
        values
            .push_bind(self.name.clone())
            .push_bind(self.default_status)
            .push_bind(self.lifetime_days);
    }
}

impl PgEntity for TokenStatus {
    const COLUMNS: &'static str = "name";

    fn push_filter(query: &mut Query, filter: &TokenStatusFilter) {
        match filter {
            TokenStatusFilter::All => {
                query.push("TRUE");
            }
            TokenStatusFilter::Id(id) => {
                query.push("id = ").push_bind(*id);
            }
            TokenStatusFilter::Name(name) => push_name_match(query, name),
        }
    }

    fn push_values(&self, query: &mut Query) {
        query.push_bind(self.name.clone());
    }
}

// ============================================================================
// SQL generation
// ============================================================================

fn select_query<E: PgEntity>(filter: &E::Filter, limit_one: bool) -> Query {
    let mut query = QueryBuilder::new(format!(
        "SELECT id, {} FROM {} WHERE ",
        E::COLUMNS,
        E::NAME
    ));
    E::push_filter(&mut query, filter);
    query.push(" ORDER BY id");
    if limit_one {
        query.push(" LIMIT 1");
    }
    query
}

fn count_query<E: PgEntity>(filter: &E::Filter) -> Query {
    let mut query = QueryBuilder::new(format!("SELECT COUNT(*) FROM {} WHERE ", E::NAME));
    E::push_filter(&mut query, filter);
    query
}

fn exists_query<E: PgEntity>(filter: &E::Filter) -> Query {
    let mut query = QueryBuilder::new(format!("SELECT EXISTS(SELECT 1 FROM {} WHERE ", E::NAME));
    E::push_filter(&mut query, filter);
    query.push(")");
    query
}

fn insert_query<E: PgEntity>(entity: &E) -> Query {
    let mut query = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) VALUES (",
        E::NAME,
        E::COLUMNS
    ));
    entity.push_values(&mut query);
    query.push(") RETURNING id");
    query
}

fn update_query<E: PgEntity>(entity: &E) -> Query {
    let mut query = QueryBuilder::new(format!(
        "UPDATE {} SET ({}) = ROW(",
        E::NAME,
        E::COLUMNS
    ));
    entity.push_values(&mut query);
    query.push(") WHERE id = ").push_bind(entity.id());
    query
}

fn delete_query<E: PgEntity>(id: i32) -> Query {
    let mut query = QueryBuilder::new(format!("DELETE FROM {} WHERE id = ", E::NAME));
    query.push_bind(id);
    query
}

// ============================================================================
// Store and session
// ============================================================================

#[derive(Debug, Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from settings. Does not create or migrate tables.
    pub async fn connect(settings: &DatabaseSettings) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout))
            .connect(&settings.url)
            .await?;

        debug!(
            max_connections = settings.max_connections,
            "PostgreSQL pool initialized"
        );
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    type Session = PgSession;

    async fn open_session(&self) -> StoreResult<PgSession> {
        Ok(PgSession {
            pool: self.pool.clone(),
            tx: None,
        })
    }
}

pub struct PgSession {
    pool: PgPool,
    /// Dropped (and therefore rolled back by sqlx) if never committed
    tx: Option<Transaction<'static, Postgres>>,
}

/// Run `$body` with `$conn` bound to the open transaction or the pool
/// Unique-constraint violations become `Duplicate` carrying the constraint name
fn unique_violation(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Duplicate(
                db.constraint().unwrap_or("unique constraint").to_string(),
            );
        }
    }
    StoreError::Database(err)
}

macro_rules! on_executor {
    ($session:expr, $conn:ident => $body:expr) => {
        match $session.tx.as_mut() {
            Some(tx) => {
                let $conn = &mut **tx;
                $body
            }
            None => {
                let $conn = &$session.pool;
                $body
            }
        }
    };
}

#[async_trait]
impl<E: PgEntity> EntityStore<E> for PgSession {
    async fn find_one(&mut self, filter: &E::Filter) -> StoreResult<Option<E>> {
        let mut query = select_query::<E>(filter, true);
        let row = on_executor!(self, conn => query.build_query_as::<E>().fetch_optional(conn).await?);
        Ok(row)
    }

    async fn find_all(&mut self, filter: &E::Filter) -> StoreResult<Vec<E>> {
        let mut query = select_query::<E>(filter, false);
        let rows = on_executor!(self, conn => query.build_query_as::<E>().fetch_all(conn).await?);
        Ok(rows)
    }

    async fn exists(&mut self, filter: &E::Filter) -> StoreResult<bool> {
        let mut query = exists_query::<E>(filter);
        let exists = on_executor!(self, conn => query.build_query_scalar::<bool>().fetch_one(conn).await?);
        Ok(exists)
    }

    async fn count(&mut self, filter: &E::Filter) -> StoreResult<u64> {
        let mut query = count_query::<E>(filter);
        let count = on_executor!(self, conn => query.build_query_scalar::<i64>().fetch_one(conn).await?);
        Ok(count.max(0) as u64)
    }

    async fn create(&mut self, mut entity: E) -> StoreResult<E> {
        let mut query = insert_query(&entity);
        let id = on_executor!(self, conn => query.build_query_scalar::<i32>().fetch_one(conn).await)
            .map_err(unique_violation)?;
        entity.set_id(id);
        Ok(entity)
    }

    async fn update(&mut self, entity: &E) -> StoreResult<()> {
        let mut query = update_query(entity);
        let result = on_executor!(self, conn => query.build().execute(conn).await?);
        if result.rows_affected() == 0 {
            return Err(StoreError::Backend(format!(
                "{} row {} not found",
                E::NAME,
                entity.id()
            )));
        }
        Ok(())
    }

    async fn bulk_update(&mut self, entities: &[E]) -> StoreResult<()> {
        if entities.is_empty() {
            return Ok(());
        }

        // All rows or none, even when called outside a transaction
        let local = self.tx.is_none();
        if local {
            self.tx = Some(self.pool.begin().await?);
        }

        let mut outcome = Ok(());
        for entity in entities {
            outcome = <Self as EntityStore<E>>::update(self, entity).await;
            if outcome.is_err() {
                break;
            }
        }

        if local {
            if let Some(tx) = self.tx.take() {
                match outcome {
                    Ok(()) => tx.commit().await?,
                    Err(_) => tx.rollback().await?,
                }
            }
        }
        outcome
    }

    async fn delete(&mut self, id: i32) -> StoreResult<bool> {
        let mut query = delete_query::<E>(id);
        let result = on_executor!(self, conn => query.build().execute(conn).await?);
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl StoreSession for PgSession {
    async fn begin(&mut self) -> StoreResult<()> {
        if self.tx.is_some() {
            return Err(StoreError::TransactionAlreadyOpen);
        }
        self.tx = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let tx = self.tx.take().ok_or(StoreError::NoActiveTransaction)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        let tx = self.tx.take().ok_or(StoreError::NoActiveTransaction)?;
        tx.rollback().await?;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }
}
