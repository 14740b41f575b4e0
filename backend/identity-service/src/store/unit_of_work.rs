/// Unit of work over a store session
///
/// ## Nesting
///
/// `begin` at depth 0 opens the physical transaction; deeper calls only bump
/// the depth. `commit` at depth 1 flushes staged writes and commits, deeper
/// commits only decrement, and a commit at depth 0 does nothing. `rollback`
/// always aborts everything and resets the depth to 0, so an inner failure
/// cannot be half-committed by an outer caller.
///
/// ## Repositories
///
/// `repository::<E>()` hands out a typed view. Its state (staged updates) is
/// created on first use and cached for the lifetime of the unit. Updates made
/// inside a transaction are staged and written on the outermost commit, on
/// `save_changes`, or before any read so reads observe them. Creates and
/// deletes go straight to the session.
use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;

use super::{Entity, EntityStore, StoreResult, StoreSession};

#[async_trait]
trait StagedWrites<S>: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn has_pending(&self) -> bool;

    async fn flush(&mut self, session: &mut S) -> StoreResult<()>;

    fn discard(&mut self);
}

struct RepositoryState<E> {
    pending: Vec<E>,
}

impl<E> Default for RepositoryState<E> {
    fn default() -> Self {
        Self { pending: Vec::new() }
    }
}

impl<E: Entity> RepositoryState<E> {
    /// Later writes to the same row replace earlier ones
    fn stage(&mut self, entity: E) {
        match self.pending.iter_mut().find(|p| p.id() == entity.id()) {
            Some(slot) => *slot = entity,
            None => self.pending.push(entity),
        }
    }
}

#[async_trait]
impl<S, E> StagedWrites<S> for RepositoryState<E>
where
    S: EntityStore<E>,
    E: Entity,
{
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    async fn flush(&mut self, session: &mut S) -> StoreResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        tracing::trace!(entity = E::NAME, rows = pending.len(), "Flushing staged updates");
        <S as EntityStore<E>>::bulk_update(session, &pending).await
    }

    fn discard(&mut self) {
        self.pending.clear();
    }
}

pub struct UnitOfWork<S: StoreSession> {
    session: S,
    depth: usize,
    repositories: HashMap<TypeId, Box<dyn StagedWrites<S>>>,
    order: Vec<TypeId>,
}

impl<S: StoreSession> UnitOfWork<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            depth: 0,
            repositories: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Current nesting depth, 0 when no transaction is open
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    /// Number of repositories created so far
    pub fn cached_repositories(&self) -> usize {
        self.repositories.len()
    }

    pub async fn begin(&mut self) -> StoreResult<()> {
        if self.depth == 0 {
            self.session.begin().await?;
        }
        self.depth += 1;
        Ok(())
    }

    /// On error the depth is left untouched; callers follow up with `rollback`
    pub async fn commit(&mut self) -> StoreResult<()> {
        match self.depth {
            0 => Ok(()),
            1 => {
                self.save_changes().await?;
                self.session.commit().await?;
                self.depth = 0;
                Ok(())
            }
            _ => {
                self.depth -= 1;
                Ok(())
            }
        }
    }

    pub async fn rollback(&mut self) -> StoreResult<()> {
        for state in self.repositories.values_mut() {
            state.discard();
        }
        if self.depth == 0 {
            return Ok(());
        }
        self.depth = 0;
        self.session.rollback().await
    }

    /// Write every staged update to the session, in repository creation order
    pub async fn save_changes(&mut self) -> StoreResult<()> {
        for key in &self.order {
            if let Some(state) = self.repositories.get_mut(key) {
                if state.has_pending() {
                    state.flush(&mut self.session).await?;
                }
            }
        }
        Ok(())
    }

    pub fn repository<E>(&mut self) -> Repository<'_, S, E>
    where
        E: Entity,
        S: EntityStore<E>,
    {
        self.state_mut::<E>();
        Repository {
            unit: self,
            _entity: PhantomData,
        }
    }

    fn state_mut<E>(&mut self) -> &mut RepositoryState<E>
    where
        E: Entity,
        S: EntityStore<E>,
    {
        let key = TypeId::of::<E>();
        if !self.repositories.contains_key(&key) {
            self.repositories
                .insert(key, Box::new(RepositoryState::<E>::default()));
            self.order.push(key);
        }

        match self
            .repositories
            .get_mut(&key)
            .and_then(|state| state.as_any_mut().downcast_mut::<RepositoryState<E>>())
        {
            Some(state) => state,
            None => unreachable!("repository state registered under a foreign type id"),
        }
    }
}

/// Typed view of one entity inside a unit of work
pub struct Repository<'u, S: StoreSession, E> {
    unit: &'u mut UnitOfWork<S>,
    _entity: PhantomData<E>,
}

impl<'u, S, E> Repository<'u, S, E>
where
    S: StoreSession + EntityStore<E>,
    E: Entity,
{
    pub async fn find_one(&mut self, filter: &E::Filter) -> StoreResult<Option<E>> {
        self.unit.save_changes().await?;
        <S as EntityStore<E>>::find_one(&mut self.unit.session, filter).await
    }

    pub async fn find_by_id(&mut self, id: i32) -> StoreResult<Option<E>> {
        self.find_one(&E::by_id(id)).await
    }

    pub async fn find_all(&mut self, filter: &E::Filter) -> StoreResult<Vec<E>> {
        self.unit.save_changes().await?;
        <S as EntityStore<E>>::find_all(&mut self.unit.session, filter).await
    }

    pub async fn exists(&mut self, filter: &E::Filter) -> StoreResult<bool> {
        self.unit.save_changes().await?;
        <S as EntityStore<E>>::exists(&mut self.unit.session, filter).await
    }

    pub async fn count(&mut self, filter: &E::Filter) -> StoreResult<u64> {
        self.unit.save_changes().await?;
        <S as EntityStore<E>>::count(&mut self.unit.session, filter).await
    }

    pub async fn create(&mut self, entity: E) -> StoreResult<E> {
        self.unit.save_changes().await?;
        <S as EntityStore<E>>::create(&mut self.unit.session, entity).await
    }

    pub async fn update(&mut self, entity: E) -> StoreResult<()> {
        if !self.unit.in_transaction() {
            return <S as EntityStore<E>>::update(&mut self.unit.session, &entity).await;
        }
        self.unit.state_mut::<E>().stage(entity);
        Ok(())
    }

    pub async fn bulk_update(&mut self, entities: Vec<E>) -> StoreResult<()> {
        if !self.unit.in_transaction() {
            return <S as EntityStore<E>>::bulk_update(&mut self.unit.session, &entities).await;
        }
        let state = self.unit.state_mut::<E>();
        for entity in entities {
            state.stage(entity);
        }
        Ok(())
    }

    pub async fn delete(&mut self, id: i32) -> StoreResult<bool> {
        self.unit.save_changes().await?;
        <S as EntityStore<E>>::delete(&mut self.unit.session, id).await
    }

    /// Updates staged for this entity and not yet written
    pub fn pending(&mut self) -> usize {
        self.unit.state_mut::<E>().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::models::{Role, RoleFilter, TokenStatus};
    use crate::store::{CredentialStore, MemoryCredentialStore};

    #[tokio::test]
    async fn test_nested_begin_only_commits_at_outermost() {
        let store = MemoryCredentialStore::seeded();
        let mut unit = store.unit_of_work().await.unwrap();

        unit.begin().await.unwrap();
        unit.begin().await.unwrap();
        assert_eq!(unit.depth(), 2);

        unit.repository::<Role>()
            .create(Role { id: 0, name: "admin".to_string() })
            .await
            .unwrap();

        unit.commit().await.unwrap();
        assert_eq!(unit.depth(), 1);
        assert!(unit.in_transaction());

        unit.commit().await.unwrap();
        assert_eq!(unit.depth(), 0);

        let mut other = store.unit_of_work().await.unwrap();
        assert!(other
            .repository::<Role>()
            .exists(&RoleFilter::Name("ADMIN".to_string()))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_commit_at_depth_zero_is_noop() {
        let store = MemoryCredentialStore::seeded();
        let mut unit = store.unit_of_work().await.unwrap();
        unit.commit().await.unwrap();
        assert_eq!(unit.depth(), 0);
    }

    #[tokio::test]
    async fn test_rollback_from_nested_depth_discards_everything() {
        let store = MemoryCredentialStore::seeded();
        let mut unit = store.unit_of_work().await.unwrap();

        unit.begin().await.unwrap();
        unit.repository::<Role>()
            .create(Role { id: 0, name: "admin".to_string() })
            .await
            .unwrap();
        unit.begin().await.unwrap();

        unit.rollback().await.unwrap();
        assert_eq!(unit.depth(), 0);

        // A later commit must not resurrect anything
        unit.commit().await.unwrap();
        assert!(!unit
            .repository::<Role>()
            .exists(&RoleFilter::Name("admin".to_string()))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_updates_staged_until_commit() {
        let store = MemoryCredentialStore::seeded();
        let mut unit = store.unit_of_work().await.unwrap();

        let mut role = unit
            .repository::<Role>()
            .find_one(&RoleFilter::Name("user".to_string()))
            .await
            .unwrap()
            .unwrap();

        unit.begin().await.unwrap();
        role.name = "customer".to_string();
        unit.repository::<Role>().update(role.clone()).await.unwrap();
        assert_eq!(unit.repository::<Role>().pending(), 1);

        // Reads flush staged writes first
        let seen = unit.repository::<Role>().find_by_id(role.id).await.unwrap().unwrap();
        assert_eq!(seen.name, "customer");
        assert_eq!(unit.repository::<Role>().pending(), 0);

        unit.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_staged_update_dropped_on_rollback() {
        let store = MemoryCredentialStore::seeded();
        let mut unit = store.unit_of_work().await.unwrap();
        let mut status = unit.repository::<TokenStatus>().find_by_id(1).await.unwrap().unwrap();

        unit.begin().await.unwrap();
        status.name = "renamed".to_string();
        unit.repository::<TokenStatus>().update(status).await.unwrap();
        unit.rollback().await.unwrap();

        let status = unit.repository::<TokenStatus>().find_by_id(1).await.unwrap().unwrap();
        assert_eq!(status.name, "active");
    }

    #[tokio::test]
    async fn test_repositories_are_cached() {
        let store = MemoryCredentialStore::seeded();
        let mut unit = store.unit_of_work().await.unwrap();
        assert_eq!(unit.cached_repositories(), 0);

        unit.repository::<Role>();
        unit.repository::<Role>();
        unit.repository::<TokenStatus>();
        assert_eq!(unit.cached_repositories(), 2);
    }
}
