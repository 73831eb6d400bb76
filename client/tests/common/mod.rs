//! Shared test fixtures: an in-memory remote service and device wiring.

#![allow(dead_code)]

use async_trait::async_trait;
use mushaf_engine::{EntityType, Fields, Mutation, RemoteChange, RemoteId, RemoteRecord, Timestamp};
use mushaf_sync::{
    AccessToken, Delta, LocalStore, MemoryStore, RemoteApi, RemoteError, StaticTokenProvider,
    Synchronizer, TokenProvider,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Remote calls made so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Calls {
    pub fetches: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl Calls {
    pub fn pushes(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

#[derive(Default)]
struct ServerState {
    log: Vec<(EntityType, RemoteChange)>,
    live: BTreeMap<(EntityType, RemoteId), Fields>,
    next_id: u32,
    now: Timestamp,
    calls: Calls,
    failing_pushes: bool,
    failing_fetch: Option<EntityType>,
}

impl ServerState {
    fn record(
        &mut self,
        entity: EntityType,
        remote_id: RemoteId,
        kind: Mutation,
        fields: Fields,
    ) -> Timestamp {
        let now = self.now;
        if kind == Mutation::Deleted {
            self.live.remove(&(entity, remote_id.clone()));
        } else {
            self.live.insert((entity, remote_id.clone()), fields.clone());
        }
        self.log.push((
            entity,
            RemoteChange {
                remote_id,
                kind,
                fields,
                modified_at: now,
            },
        ));
        now
    }
}

/// A change log standing in for the server. Cursors are log positions.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<ServerState>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        let remote = Self::default();
        remote.set_now(1_000_000);
        Arc::new(remote)
    }

    /// Server time stamped on every following write.
    pub fn set_now(&self, now: Timestamp) {
        self.state.lock().unwrap().now = now;
    }

    pub fn calls(&self) -> Calls {
        self.state.lock().unwrap().calls
    }

    pub fn live(&self, entity: EntityType) -> Vec<Fields> {
        self.state
            .lock()
            .unwrap()
            .live
            .iter()
            .filter(|((e, _), _)| *e == entity)
            .map(|(_, fields)| fields.clone())
            .collect()
    }

    pub fn fail_pushes(&self, failing: bool) {
        self.state.lock().unwrap().failing_pushes = failing;
    }

    pub fn fail_fetch(&self, entity: Option<EntityType>) {
        self.state.lock().unwrap().failing_fetch = entity;
    }

    /// Append a change as if another client had made it.
    pub fn inject(&self, entity: EntityType, change: RemoteChange) {
        let mut state = self.state.lock().unwrap();
        if change.kind == Mutation::Deleted {
            state.live.remove(&(entity, change.remote_id.clone()));
        } else {
            state
                .live
                .insert((entity, change.remote_id.clone()), change.fields.clone());
        }
        state.log.push((entity, change));
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn fetch_delta(
        &self,
        _token: &AccessToken,
        entity: EntityType,
        since: Option<&str>,
    ) -> Result<Delta, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.fetches += 1;
        if state.failing_fetch == Some(entity) {
            return Err(RemoteError::Network("connection reset".into()));
        }
        let start = since.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let changes = state.log[start.min(state.log.len())..]
            .iter()
            .filter(|(e, _)| *e == entity)
            .map(|(_, c)| c.clone())
            .collect();
        Ok(Delta {
            changes,
            cursor: state.log.len().to_string(),
        })
    }

    async fn push_create(
        &self,
        _token: &AccessToken,
        entity: EntityType,
        fields: &Fields,
    ) -> Result<RemoteRecord, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.creates += 1;
        if state.failing_pushes {
            return Err(RemoteError::Network("timeout".into()));
        }
        state.next_id += 1;
        let remote_id = format!("{}-{}", entity.table(), state.next_id);
        let modified_at =
            state.record(entity, remote_id.clone(), Mutation::Created, fields.clone());
        Ok(RemoteRecord {
            remote_id,
            fields: fields.clone(),
            modified_at,
        })
    }

    async fn push_update(
        &self,
        _token: &AccessToken,
        entity: EntityType,
        remote_id: &str,
        fields: &Fields,
    ) -> Result<RemoteRecord, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.updates += 1;
        if state.failing_pushes {
            return Err(RemoteError::Network("timeout".into()));
        }
        let modified_at = state.record(
            entity,
            remote_id.to_string(),
            Mutation::Modified,
            fields.clone(),
        );
        Ok(RemoteRecord {
            remote_id: remote_id.to_string(),
            fields: fields.clone(),
            modified_at,
        })
    }

    async fn push_delete(
        &self,
        _token: &AccessToken,
        entity: EntityType,
        remote_id: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.deletes += 1;
        if state.failing_pushes {
            return Err(RemoteError::Network("timeout".into()));
        }
        if !state.live.contains_key(&(entity, remote_id.to_string())) {
            return Err(RemoteError::NotFound(remote_id.to_string()));
        }
        state.record(entity, remote_id.to_string(), Mutation::Deleted, Fields::new());
        Ok(())
    }
}

/// A device: a local store and a synchronizer talking to `remote`.
pub struct Device<S> {
    pub store: Arc<S>,
    pub sync: Synchronizer,
}

pub fn device(remote: &Arc<FakeRemote>) -> Device<MemoryStore> {
    device_with(remote, Arc::new(MemoryStore::new()), Arc::new(StaticTokenProvider::new("token")))
}

pub fn device_with<S: LocalStore + 'static>(
    remote: &Arc<FakeRemote>,
    store: Arc<S>,
    tokens: Arc<dyn TokenProvider>,
) -> Device<S> {
    let sync = Synchronizer::new(store.clone(), remote.clone(), tokens);
    Device { store, sync }
}
