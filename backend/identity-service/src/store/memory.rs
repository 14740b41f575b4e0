/// In-process credential store
///
/// Tables live behind one `tokio::sync::Mutex`. Outside a transaction each
/// call locks briefly. A transaction takes the lock for its whole duration and
/// keeps a snapshot, so uncommitted writes are invisible to other sessions and
/// a rollback (or dropping the session mid-transaction) restores the snapshot.
use async_trait::async_trait;
use dashmap::DashSet;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{CredentialStore, Entity, EntityStore, StoreError, StoreResult, StoreSession};
use crate::models::{
    kinds, Cart, CartFilter, Role, RoleFilter, Token, TokenFilter, TokenStatus,
    TokenStatusFilter, TokenType, TokenTypeFilter, User, UserFilter,
};

#[derive(Debug, Clone)]
pub struct Table<E> {
    rows: BTreeMap<i32, E>,
    next_id: i32,
}

impl<E> Default for Table<E> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl<E: Entity> Table<E> {
    fn insert(&mut self, mut entity: E) -> E {
        let id = self.next_id;
        self.next_id += 1;
        entity.set_id(id);
        self.rows.insert(id, entity.clone());
        entity
    }

    /// Insert keeping the caller's id
    fn seed(&mut self, entity: E) {
        self.next_id = self.next_id.max(entity.id() + 1);
        self.rows.insert(entity.id(), entity);
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    users: Table<User>,
    roles: Table<Role>,
    carts: Table<Cart>,
    tokens: Table<Token>,
    token_types: Table<TokenType>,
    token_statuses: Table<TokenStatus>,
}

/// Table access and filter evaluation for the memory backend
pub trait MemoryEntity: Entity {
    fn table(state: &MemoryState) -> &Table<Self>;

    fn table_mut(state: &mut MemoryState) -> &mut Table<Self>;

    fn matches(&self, filter: &Self::Filter) -> bool;
}

fn same_name(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

impl MemoryEntity for User {
    fn table(state: &MemoryState) -> &Table<Self> {
        &state.users
    }

    fn table_mut(state: &mut MemoryState) -> &mut Table<Self> {
        &mut state.users
    }

    fn matches(&self, filter: &UserFilter) -> bool {
        match filter {
            UserFilter::All => true,
            UserFilter::Id(id) => self.id == *id,
            UserFilter::Email(email) => self.email == *email,
            UserFilter::Username(username) => self.username == *username,
            UserFilter::Credential(credential) => {
                self.email == *credential || self.username == *credential
            }
        }
    }
}

impl MemoryEntity for Role {
    fn table(state: &MemoryState) -> &Table<Self> {
        &state.roles
    }

    fn table_mut(state: &mut MemoryState) -> &mut Table<Self> {
        &mut state.roles
    }

    fn matches(&self, filter: &RoleFilter) -> bool {
        match filter {
            RoleFilter::All => true,
            RoleFilter::Id(id) => self.id == *id,
            RoleFilter::Name(name) => same_name(&self.name, name),
        }
    }
}

impl MemoryEntity for Cart {
    fn table(state: &MemoryState) -> &Table<Self> {
        &state.carts
    }

    fn table_mut(state: &mut MemoryState) -> &mut Table<Self> {
        &mut state.carts
    }

    fn matches(&self, filter: &CartFilter) -> bool {
        match filter {
            CartFilter::All => true,
            CartFilter::Id(id) => self.id == *id,
            CartFilter::UserId(user_id) => self.user_id == *user_id,
        }
    }
}

impl MemoryEntity for Token {
    fn table(state: &MemoryState) -> &Table<Self> {
        &state.tokens
    }

    fn table_mut(state: &mut MemoryState) -> &mut Table<Self> {
        &mut state.tokens
    }

    fn matches(&self, filter: &TokenFilter) -> bool {
        match filter {
            TokenFilter::All => true,
            TokenFilter::Id(id) => self.id == *id,
            TokenFilter::LiveForUser {
                user_id,
                token_type_id,
            } => self.user_id == *user_id && self.token_type_id == *token_type_id && self.is_live(),
            TokenFilter::LiveValue(value) => self.value == *value && self.is_live(),
            TokenFilter::Redeemable {
                value,
                token_type_id,
                status_id,
                now,
            } => {
                self.value == *value
                    && self.token_type_id == *token_type_id
                    && self.status_id == *status_id
                    && self.expires_at > *now
            }
        }
    }
}

impl MemoryEntity for TokenType {
    fn table(state: &MemoryState) -> &Table<Self> {
        &state.token_types
    }

    fn table_mut(state: &mut MemoryState) -> &mut Table<Self> {
        &mut state.token_types
    }

    fn matches(&self, filter: &TokenTypeFilter) -> bool {
        match filter {
            TokenTypeFilter::All => true,
            TokenTypeFilter::Id(id) => self.id == *id,
            TokenTypeFilter::Name(name) => same_name(&self.name, name),
        }
    }
}

impl MemoryEntity for TokenStatus {
    fn table(state: &MemoryState) -> &Table<Self> {
        &state.token_statuses
    }

    fn table_mut(state: &mut MemoryState) -> &mut Table<Self> {
        &mut state.token_statuses
    }

    fn matches(&self, filter: &TokenStatusFilter) -> bool {
        match filter {
            TokenStatusFilter::All => true,
            TokenStatusFilter::Id(id) => self.id == *id,
            TokenStatusFilter::Name(name) => same_name(&self.name, name),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<DashSet<&'static str>>,
}

impl MemoryCredentialStore {
    /// Empty store without reference data
    pub fn new() -> Self {
        Self::default()
    }

    /// Store carrying the reference rows a deployment seeds out-of-band
    pub fn seeded() -> Self {
        let mut state = MemoryState::default();

        state.token_statuses.seed(TokenStatus {
            id: TokenStatus::ACTIVE,
            name: "active".to_string(),
        });
        state.token_statuses.seed(TokenStatus {
            id: TokenStatus::SUPERSEDED,
            name: "superseded".to_string(),
        });

        state.roles.seed(Role {
            id: 1,
            name: super::DEFAULT_ROLE.to_string(),
        });

        for (id, name, lifetime_days) in [
            (1, kinds::ACCESS, 1.0),
            (2, kinds::REFRESH, 7.0),
            (3, kinds::RESTORE, 0.25),
        ] {
            state.token_types.seed(TokenType {
                id,
                name: name.to_string(),
                default_status: TokenStatus::ACTIVE,
                lifetime_days,
            });
        }

        Self {
            state: Arc::new(Mutex::new(state)),
            faults: Arc::default(),
        }
    }

    /// Make every write to `table` fail until `clear_faults` is called
    pub fn fail_writes_to(&self, table: &'static str) {
        self.faults.insert(table);
    }

    pub fn clear_faults(&self) {
        self.faults.clear();
    }

    /// Committed rows of one entity. Waits while another session holds a transaction.
    pub async fn rows<E: MemoryEntity>(&self) -> Vec<E> {
        let state = self.state.lock().await;
        E::table(&state).rows.values().cloned().collect()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    type Session = MemorySession;

    async fn open_session(&self) -> StoreResult<MemorySession> {
        Ok(MemorySession {
            state: Arc::clone(&self.state),
            faults: Arc::clone(&self.faults),
            tx: None,
        })
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    /// Restored on drop unless cleared by commit
    snapshot: Option<MemoryState>,
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

pub struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<DashSet<&'static str>>,
    tx: Option<MemoryTransaction>,
}

impl MemorySession {
    async fn with_state<R>(&mut self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        if let Some(tx) = self.tx.as_mut() {
            return f(&mut tx.guard);
        }
        let mut guard = self.state.lock().await;
        f(&mut guard)
    }

    fn check_fault(&self, table: &'static str) -> StoreResult<()> {
        if self.faults.contains(table) {
            return Err(StoreError::Backend(format!("injected failure writing to {table}")));
        }
        Ok(())
    }
}

#[async_trait]
impl<E: MemoryEntity> EntityStore<E> for MemorySession {
    async fn find_one(&mut self, filter: &E::Filter) -> StoreResult<Option<E>> {
        Ok(self
            .with_state(|state| {
                E::table(state)
                    .rows
                    .values()
                    .find(|row| row.matches(filter))
                    .cloned()
            })
            .await)
    }

    async fn find_all(&mut self, filter: &E::Filter) -> StoreResult<Vec<E>> {
        Ok(self
            .with_state(|state| {
                E::table(state)
                    .rows
                    .values()
                    .filter(|row| row.matches(filter))
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn exists(&mut self, filter: &E::Filter) -> StoreResult<bool> {
        Ok(self
            .with_state(|state| E::table(state).rows.values().any(|row| row.matches(filter)))
            .await)
    }

    async fn count(&mut self, filter: &E::Filter) -> StoreResult<u64> {
        Ok(self
            .with_state(|state| {
                E::table(state)
                    .rows
                    .values()
                    .filter(|row| row.matches(filter))
                    .count() as u64
            })
            .await)
    }

    async fn create(&mut self, entity: E) -> StoreResult<E> {
        self.check_fault(E::NAME)?;
        Ok(self.with_state(|state| E::table_mut(state).insert(entity)).await)
    }

    async fn update(&mut self, entity: &E) -> StoreResult<()> {
        self.check_fault(E::NAME)?;
        self.with_state(|state| match E::table_mut(state).rows.get_mut(&entity.id()) {
            Some(row) => {
                *row = entity.clone();
                Ok(())
            }
            None => Err(StoreError::Backend(format!(
                "{} row {} not found",
                E::NAME,
                entity.id()
            ))),
        })
        .await
    }

    async fn bulk_update(&mut self, entities: &[E]) -> StoreResult<()> {
        self.check_fault(E::NAME)?;
        self.with_state(|state| {
            let table = E::table_mut(state);
            if let Some(missing) = entities.iter().find(|e| !table.rows.contains_key(&e.id())) {
                return Err(StoreError::Backend(format!(
                    "{} row {} not found",
                    E::NAME,
                    missing.id()
                )));
            }
            for entity in entities {
                table.rows.insert(entity.id(), entity.clone());
            }
            Ok(())
        })
        .await
    }

    async fn delete(&mut self, id: i32) -> StoreResult<bool> {
        self.check_fault(E::NAME)?;
        Ok(self
            .with_state(|state| E::table_mut(state).rows.remove(&id).is_some())
            .await)
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn begin(&mut self) -> StoreResult<()> {
        if self.tx.is_some() {
            return Err(StoreError::TransactionAlreadyOpen);
        }
        let guard = Arc::clone(&self.state).lock_owned().await;
        let snapshot = guard.clone();
        self.tx = Some(MemoryTransaction {
            guard,
            snapshot: Some(snapshot),
        });
        tracing::trace!("Memory transaction opened");
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let mut tx = self.tx.take().ok_or(StoreError::NoActiveTransaction)?;
        tx.snapshot = None;
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        // Dropping the transaction restores the snapshot
        self.tx.take().ok_or(StoreError::NoActiveTransaction)?;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }
}
