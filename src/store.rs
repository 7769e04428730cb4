//! Persistence and audit collaborators.
//!
//! The core only talks to storage through these traits. Read failures surface as
//! `StorageUnavailable` and abort the operation; audit writes complete before the
//! caller sees the result.

use crate::error::{CoreError, CoreResult};
use crate::patterns;
use crate::types::{
    ClassificationTask, EntityId, EntityRecord, SessionId, StageSnapshot, TaskId, Taxonomy,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Read access to catalog entities
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_entity(&self, id: EntityId) -> CoreResult<Option<EntityRecord>>;

    /// Entities currently assigned `code` in `taxonomy`
    async fn entities_by_code(
        &self,
        taxonomy: Taxonomy,
        code: &str,
        limit: usize,
    ) -> CoreResult<Vec<EntityRecord>>;

    /// Entities whose cleaned name starts with `prefix`
    async fn entities_by_name_prefix(
        &self,
        prefix: &str,
        limit: usize,
    ) -> CoreResult<Vec<EntityRecord>>;
}

/// Append-only audit trail of snapshots and task transitions
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_snapshot(&self, session_id: SessionId, snapshot: &StageSnapshot)
        -> CoreResult<()>;

    async fn append_task(&self, task: &ClassificationTask) -> CoreResult<()>;
}

fn unavailable(what: &str) -> CoreError {
    CoreError::StorageUnavailable(format!("{} store is offline", what))
}

fn poisoned<T>(_: T) -> CoreError {
    CoreError::StorageUnavailable("store lock poisoned".into())
}

/// In-process entity store. `set_failing(true)` makes every read fail.
#[derive(Default)]
pub struct InMemoryEntityStore {
    entities: RwLock<BTreeMap<EntityId, EntityRecord>>,
    failing: AtomicBool,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: impl IntoIterator<Item = EntityRecord>) -> Self {
        let store = Self::new();
        for entity in entities {
            store.insert(entity);
        }
        store
    }

    pub fn insert(&self, entity: EntityRecord) {
        if let Ok(mut map) = self.entities.write() {
            map.insert(entity.id, entity);
        }
    }

    /// Record an accepted taxonomy code on an entity
    pub fn assign(&self, id: EntityId, taxonomy: Taxonomy, code: &str) -> CoreResult<()> {
        let mut map = self.entities.write().map_err(poisoned)?;
        let entity = map
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("entity {}", id)))?;
        entity.assignments.insert(taxonomy, code.to_string());
        Ok(())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> CoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(unavailable("entity"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get_entity(&self, id: EntityId) -> CoreResult<Option<EntityRecord>> {
        self.check()?;
        let map = self.entities.read().map_err(poisoned)?;
        Ok(map.get(&id).cloned())
    }

    async fn entities_by_code(
        &self,
        taxonomy: Taxonomy,
        code: &str,
        limit: usize,
    ) -> CoreResult<Vec<EntityRecord>> {
        self.check()?;
        let map = self.entities.read().map_err(poisoned)?;
        Ok(map
            .values()
            .filter(|e| e.assignments.get(&taxonomy).map(String::as_str) == Some(code))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn entities_by_name_prefix(
        &self,
        prefix: &str,
        limit: usize,
    ) -> CoreResult<Vec<EntityRecord>> {
        self.check()?;
        let prefix = patterns::clean(prefix);
        let map = self.entities.read().map_err(poisoned)?;
        Ok(map
            .values()
            .filter(|e| patterns::clean(&e.name).starts_with(&prefix))
            .take(limit)
            .cloned()
            .collect())
    }
}

/// In-process audit log
#[derive(Default)]
pub struct InMemoryAuditStore {
    snapshots: RwLock<HashMap<SessionId, Vec<StageSnapshot>>>,
    tasks: RwLock<Vec<ClassificationTask>>,
    failing: AtomicBool,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn snapshots(&self, session_id: SessionId) -> Vec<StageSnapshot> {
        self.snapshots
            .read()
            .ok()
            .and_then(|m| m.get(&session_id).cloned())
            .unwrap_or_default()
    }

    /// Every recorded transition of one task, oldest first
    pub fn task_transitions(&self, task_id: TaskId) -> Vec<ClassificationTask> {
        self.tasks
            .read()
            .map(|t| t.iter().filter(|t| t.id == task_id).cloned().collect())
            .unwrap_or_default()
    }

    fn check(&self) -> CoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(unavailable("audit"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append_snapshot(
        &self,
        session_id: SessionId,
        snapshot: &StageSnapshot,
    ) -> CoreResult<()> {
        self.check()?;
        self.snapshots
            .write()
            .map_err(poisoned)?
            .entry(session_id)
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn append_task(&self, task: &ClassificationTask) -> CoreResult<()> {
        self.check()?;
        self.tasks.write().map_err(poisoned)?.push(task.clone());
        Ok(())
    }
}
