//! In-memory table of connected editor instances plus the selection.
//!
//! Liveness is never taken on trust: every read path first reaps instances
//! whose connection has already left `Open`, whether or not the reader loop
//! has processed the close yet.

use crate::{
    connection::EditorConnection,
    error::BrokerError,
    selection::Selection,
    store::{BrokerStore, InstanceRecord, RegistrySnapshot},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};
use vimlink_core::{EditorState, InstanceInfo};

pub struct Instance {
    pub id: String,
    pub info: InstanceInfo,
    pub started: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub open_buffers: Vec<Value>,
    pub cached_state: Option<EditorState>,
    pub pending_exit: bool,
    pub connection: Arc<EditorConnection>,
}

impl Instance {
    fn new(id: String, info: InstanceInfo, connection: Arc<EditorConnection>) -> Self {
        let now = Utc::now();
        Self {
            id,
            open_buffers: info.buffers.clone(),
            info,
            started: now,
            last_seen: now,
            cached_state: None,
            pending_exit: false,
            connection,
        }
    }

    fn record(&self) -> InstanceRecord {
        InstanceRecord {
            pid: self.info.pid,
            cwd: self.info.cwd.clone(),
            main_file: self.info.main_file.clone(),
            buffers: self.open_buffers.clone(),
            started: self.started.to_rfc3339(),
            last_seen: self.last_seen.to_rfc3339(),
        }
    }

    fn summary(&self, selected: bool) -> InstanceSummary {
        InstanceSummary {
            id: self.id.clone(),
            pid: self.info.pid,
            cwd: self.info.cwd.clone(),
            main_file: match self.info.main_file.as_deref() {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => "unnamed".to_string(),
            },
            buffers: self.open_buffers.clone(),
            started: self.started.to_rfc3339(),
            selected,
            pending_exit: self.pending_exit,
        }
    }
}

/// Point-in-time view of one live instance.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InstanceSummary {
    pub id: String,
    pub pid: Option<u32>,
    pub cwd: Option<String>,
    pub main_file: String,
    pub buffers: Vec<Value>,
    pub started: String,
    pub selected: bool,
    pub pending_exit: bool,
}

#[derive(Default)]
struct RegistryState {
    instances: HashMap<String, Instance>,
    selection: Selection,
}

impl RegistryState {
    /// Removes instances whose link is no longer open.
    fn reap_closed(&mut self) -> Vec<String> {
        let closed = self
            .instances
            .iter()
            .filter(|(_, instance)| instance.connection.is_closed())
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        for id in &closed {
            self.instances.remove(id);
            if self.selection.clear_if(id) {
                info!(event = "broker_selection_cleared", instance_id = %id);
            }
            debug!(event = "broker_instance_reaped", instance_id = %id);
        }
        closed
    }

    fn snapshot(&self) -> RegistrySnapshot {
        self.instances
            .iter()
            .map(|(id, instance)| (id.clone(), instance.record()))
            .collect()
    }

    fn sorted_ids(&self) -> Vec<String> {
        let mut ids = self.instances.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }
}

pub struct InstanceRegistry {
    state: RwLock<RegistryState>,
    store: Arc<dyn BrokerStore>,
    // taken before the state lock is released; orders file writes
    persist_order: Mutex<()>,
}

impl InstanceRegistry {
    pub fn new(store: Arc<dyn BrokerStore>) -> Self {
        let remembered = match store.load_preference() {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "broker_preference_load_error", error = %err);
                None
            }
        };
        if let Some(id) = remembered.as_deref() {
            info!(event = "broker_preference_loaded", instance_id = %id);
        }
        Self {
            state: RwLock::new(RegistryState {
                instances: HashMap::new(),
                selection: Selection::with_preference(remembered),
            }),
            store,
            persist_order: Mutex::new(()),
        }
    }

    /// Inserts or replaces `id`. The latest registration wins.
    pub async fn register(
        &self,
        id: &str,
        info: InstanceInfo,
        connection: Arc<EditorConnection>,
    ) -> bool {
        let conn_id = connection.conn_id();
        let (auto, snapshot, order) = {
            let mut state = self.state.write().await;
            state.reap_closed();
            let instance = Instance::new(id.to_string(), info, connection);
            if let Some(previous) = state.instances.insert(id.to_string(), instance) {
                if previous.connection.conn_id() != conn_id {
                    warn!(
                        event = "broker_instance_superseded",
                        instance_id = %id,
                        old_conn_id = previous.connection.conn_id(),
                        conn_id
                    );
                }
            }
            let live = state.instances.len();
            let auto = state.selection.on_register(id, live);
            (auto, state.snapshot(), self.persist_order.lock().await)
        };

        info!(event = "broker_instance_registered", instance_id = %id, conn_id);
        if auto {
            info!(event = "broker_auto_selected", instance_id = %id);
        }
        let preference = auto.then(|| id.to_string());
        self.persist(order, preference, Some(snapshot)).await;
        auto
    }

    /// Caches a state document for `id` if it still belongs to `conn_id`.
    pub async fn record_state(&self, id: &str, conn_id: u64, state: EditorState) -> bool {
        let mut guard = self.state.write().await;
        let Some(instance) = guard.instances.get_mut(id) else {
            return false;
        };
        if instance.connection.conn_id() != conn_id {
            return false;
        }
        if !state.buffers.is_empty() {
            instance.open_buffers = state
                .buffers
                .iter()
                .map(|buffer| Value::String(buffer.display_name().to_string()))
                .collect();
        }
        instance.last_seen = Utc::now();
        instance.cached_state = Some(state);
        true
    }

    /// Removes `id` if it is still bound to `conn_id`; a superseded
    /// connection closing must not take the replacement with it. The removed
    /// entry still carries its `pending_exit` flag so the caller can tell an
    /// expected exit from a lost editor.
    pub async fn drop_instance(&self, id: &str, conn_id: u64) -> Option<Instance> {
        let (removed, snapshot, order) = {
            let mut state = self.state.write().await;
            match state.instances.get(id) {
                Some(instance) if instance.connection.conn_id() == conn_id => {}
                _ => return None,
            }
            let removed = state.instances.remove(id)?;
            if state.selection.clear_if(id) {
                info!(event = "broker_selection_cleared", instance_id = %id);
            }
            (removed, state.snapshot(), self.persist_order.lock().await)
        };
        self.persist(order, None, Some(snapshot)).await;
        Some(removed)
    }

    /// Live instances sorted by id.
    pub async fn list(&self) -> Vec<InstanceSummary> {
        self.validate().await;
        let state = self.state.read().await;
        let mut summaries = state
            .instances
            .values()
            .map(|instance| instance.summary(state.selection.is_selected(&instance.id)))
            .collect::<Vec<_>>();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Reaps closed connections; returns the ids that were dropped.
    pub async fn validate(&self) -> Vec<String> {
        let (reaped, pending_write) = {
            let mut state = self.state.write().await;
            let reaped = state.reap_closed();
            let pending_write = if reaped.is_empty() {
                None
            } else {
                Some((state.snapshot(), self.persist_order.lock().await))
            };
            (reaped, pending_write)
        };
        if let Some((snapshot, order)) = pending_write {
            self.persist(order, None, Some(snapshot)).await;
        }
        reaped
    }

    pub async fn connection(&self, id: &str) -> Result<Arc<EditorConnection>, BrokerError> {
        let state = self.state.read().await;
        match state.instances.get(id) {
            Some(instance) if !instance.connection.is_closed() => {
                Ok(instance.connection.clone())
            }
            _ => Err(BrokerError::NotConnected(id.to_string())),
        }
    }

    pub async fn select(&self, id: &str) -> Result<(), BrokerError> {
        self.validate().await;
        let order = {
            let mut state = self.state.write().await;
            if !state.instances.contains_key(id) {
                return Err(BrokerError::InstanceNotFound {
                    requested: id.to_string(),
                    available: state.sorted_ids(),
                });
            }
            state.selection.select(id);
            self.persist_order.lock().await
        };
        info!(event = "broker_instance_selected", instance_id = %id);
        self.persist(order, Some(id.to_string()), None).await;
        Ok(())
    }

    pub async fn selected(&self) -> Option<String> {
        self.state.read().await.selection.current().map(str::to_string)
    }

    /// Last explicit or automatic choice, possibly from a previous process.
    pub async fn remembered(&self) -> Option<String> {
        self.state.read().await.selection.remembered().map(str::to_string)
    }

    /// Target of state and command operations.
    pub async fn require_selected(&self) -> Result<(String, Arc<EditorConnection>), BrokerError> {
        self.validate().await;
        let id = self
            .selected()
            .await
            .ok_or(BrokerError::NoInstanceSelected)?;
        let connection = self.connection(&id).await?;
        Ok((id, connection))
    }

    /// More than one live instance and nothing selected.
    pub async fn selection_required(&self) -> bool {
        let state = self.state.read().await;
        state.selection.current().is_none() && state.instances.len() > 1
    }

    pub async fn set_pending_exit(&self, id: &str, conn_id: u64, pending: bool) -> bool {
        let mut state = self.state.write().await;
        match state.instances.get_mut(id) {
            Some(instance) if instance.connection.conn_id() == conn_id => {
                instance.pending_exit = pending;
                true
            }
            _ => false,
        }
    }

    pub async fn pending_exit(&self, id: &str) -> Option<bool> {
        let state = self.state.read().await;
        state.instances.get(id).map(|instance| instance.pending_exit)
    }

    pub async fn cached_state(&self, id: &str) -> Option<EditorState> {
        let state = self.state.read().await;
        state
            .instances
            .get(id)
            .and_then(|instance| instance.cached_state.clone())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.state.read().await.instances.contains_key(id)
    }

    /// Closes every connection, forgets all instances and removes the
    /// registry snapshot. The preference is kept.
    pub async fn close_all(&self) -> usize {
        let (count, _order) = {
            let mut state = self.state.write().await;
            let count = state.instances.len();
            for instance in state.instances.values() {
                instance.connection.close();
            }
            state.instances.clear();
            state.selection.clear();
            (count, self.persist_order.lock().await)
        };

        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.clear_registry()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(event = "broker_registry_clear_error", error = %err),
            Err(err) => warn!(event = "broker_persist_task_failed", error = %err),
        }
        count
    }

    /// Writes on the blocking pool. `_order` was taken under the state lock,
    /// so concurrent mutations reach disk in the order they happened.
    async fn persist(
        &self,
        _order: MutexGuard<'_, ()>,
        preference: Option<String>,
        snapshot: Option<RegistrySnapshot>,
    ) {
        let store = self.store.clone();
        let written = tokio::task::spawn_blocking(move || {
            let preference = preference.map(|id| {
                let result = store.save_preference(&id);
                (id, result)
            });
            let snapshot = snapshot.map(|snapshot| store.save_registry(&snapshot));
            (preference, snapshot)
        })
        .await;

        match written {
            Ok((preference, snapshot)) => {
                if let Some((id, Err(err))) = preference {
                    warn!(event = "broker_preference_save_error", instance_id = %id, error = %err);
                }
                if let Some(Err(err)) = snapshot {
                    warn!(event = "broker_registry_save_error", error = %err);
                }
            }
            Err(err) => warn!(event = "broker_persist_task_failed", error = %err),
        }
    }
}
