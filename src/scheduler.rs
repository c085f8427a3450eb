//! Worker scheduling
//!
//! The coordinator consumes the [`Scheduler`] interface to pick a
//! compatible cached worker for a component, or to wait for the next
//! ready worker. [`CachingScheduler`] is the default implementation: a
//! bounded pool where idle workers are cached for reuse and the least
//! recently cached worker is evicted when the pool overflows.
//!
//! All scheduler callbacks fire synchronously inside the coordinator's
//! lifecycle step, so scheduler state is observed single-threaded.

use crate::error::{Error, Result};
use crate::message::Message;
use crate::pipeline::Component;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Invoked with the chosen worker id when a cached worker is reused.
pub type FoundFn = Box<dyn FnOnce(&str) + Send>;

/// Invoked with the waiting component when a new worker becomes ready.
pub type AssignFn = Box<dyn FnOnce(&Component) + Send>;

/// Invoked with the worker id the coordinator should ask to exit.
pub type EvictFn = Box<dyn Fn(&str) + Send + Sync>;

/// Scheduler-side view of one worker connection.
///
/// Tracks the worker's manifest across `response_manifest` messages and
/// the name of the component it last executed.
#[derive(Debug)]
pub struct WorkerHandle {
    id: String,
    state: Mutex<WorkerManifestState>,
}

#[derive(Debug, Default)]
struct WorkerManifestState {
    manifest: Option<serde_json::Value>,
    last_component: Option<String>,
}

impl WorkerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(WorkerManifestState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Records a message from this worker.
    ///
    /// For `response_manifest` the manifest is replaced and the return
    /// value says whether this was the worker's first manifest: the "new
    /// worker" signal that triggers assignment of a waiting component.
    pub fn on_msg(&self, msg: &Message) -> Result<bool> {
        match msg.cmd() {
            "response_manifest" => {
                let manifest_json = msg
                    .args()
                    .first()
                    .ok_or_else(|| Error::Protocol("response_manifest without body".into()))?;
                let manifest: serde_json::Value = serde_json::from_str(manifest_json)?;

                let mut state = self.state.lock().expect("worker state lock");
                let is_new = state.manifest.is_none();
                state.manifest = Some(manifest);
                if is_new {
                    debug!(worker_id = %self.id, "New worker ready");
                }
                Ok(is_new)
            }
            "done" => {
                let component_id = msg.args().first().map(String::as_str).unwrap_or("?");
                debug!(worker_id = %self.id, component_id, "Component done");
                Ok(false)
            }
            other => {
                warn!(worker_id = %self.id, cmd = %other, "Unexpected message for worker handle");
                Ok(false)
            }
        }
    }

    pub fn manifest(&self) -> Option<serde_json::Value> {
        self.state.lock().expect("worker state lock").manifest.clone()
    }

    fn record_last_component(&self, name: &str) {
        let mut state = self.state.lock().expect("worker state lock");
        state.last_component = Some(name.to_string());
        debug!(worker_id = %self.id, component = %name, "Last executed component recorded");
    }

    fn last_component(&self) -> Option<String> {
        self.state.lock().expect("worker state lock").last_component.clone()
    }
}

/// Interface the coordinator consumes.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// A worker identified itself; register it as new (not yet ready).
    async fn add_new_worker(&self, id: &str);

    /// Looks a worker up by id across all pool states.
    async fn get_worker(&self, id: &str) -> Option<Arc<WorkerHandle>>;

    /// A new worker delivered its first manifest. If a component is
    /// waiting, `assign` fires synchronously with it.
    async fn on_worker_ready(&self, worker: Arc<WorkerHandle>, assign: AssignFn);

    /// A worker finished its component and returns to the cache.
    async fn cache_worker(&self, worker: Arc<WorkerHandle>);

    /// Picks a compatible cached worker for `component`. On a hit,
    /// `found` fires synchronously with the worker id; on a miss the
    /// component waits for the next ready worker.
    async fn get_compatible_worker_sync(&self, component: &Component, found: FoundFn);
}

struct PoolState {
    new_workers: Vec<Arc<WorkerHandle>>,
    active: Vec<Arc<WorkerHandle>>,
    cached: VecDeque<Arc<WorkerHandle>>,
    waiting: VecDeque<Component>,
}

/// Default scheduler: bounded worker pool with LRU cache reuse.
pub struct CachingScheduler {
    state: Mutex<PoolState>,
    num_slot: usize,
    compat_check: bool,
    evict: EvictFn,
}

impl CachingScheduler {
    pub fn new(num_slot: usize, compat_check: bool, evict: EvictFn) -> Self {
        Self {
            state: Mutex::new(PoolState {
                new_workers: Vec::new(),
                active: Vec::new(),
                cached: VecDeque::new(),
                waiting: VecDeque::new(),
            }),
            num_slot,
            compat_check,
            evict,
        }
    }

    /// A cached worker is compatible when its environment is still clean
    /// (it has not executed anything yet) or it last executed a component
    /// of the same name.
    fn is_compatible(&self, worker: &WorkerHandle, component: &Component) -> bool {
        if !self.compat_check {
            return true;
        }
        match worker.last_component() {
            None => true,
            Some(last) => last == component.name,
        }
    }
}

#[async_trait]
impl Scheduler for CachingScheduler {
    async fn add_new_worker(&self, id: &str) {
        let mut state = self.state.lock().expect("pool lock");
        debug!(worker_id = %id, "Worker registered");
        state.new_workers.push(Arc::new(WorkerHandle::new(id)));
    }

    async fn get_worker(&self, id: &str) -> Option<Arc<WorkerHandle>> {
        let state = self.state.lock().expect("pool lock");
        state
            .new_workers
            .iter()
            .chain(state.active.iter())
            .chain(state.cached.iter())
            .find(|w| w.id() == id)
            .cloned()
    }

    async fn on_worker_ready(&self, worker: Arc<WorkerHandle>, assign: AssignFn) {
        let assigned = {
            let mut state = self.state.lock().expect("pool lock");
            state.new_workers.retain(|w| w.id() != worker.id());
            state.cached.push_back(worker.clone());

            // A fresh worker has a clean environment; hand it the first
            // waiting component.
            match state.waiting.pop_front() {
                Some(component) => {
                    state.cached.retain(|w| w.id() != worker.id());
                    state.active.push(worker.clone());
                    worker.record_last_component(&component.name);
                    info!(
                        worker_id = %worker.id(),
                        component_id = %component.id,
                        "Worker found for waiting component"
                    );
                    Some(component)
                }
                None => None,
            }
        };

        if let Some(component) = assigned {
            assign(&component);
        }
    }

    async fn cache_worker(&self, worker: Arc<WorkerHandle>) {
        let evicted = {
            let mut state = self.state.lock().expect("pool lock");
            state.active.retain(|w| w.id() != worker.id());
            state.cached.retain(|w| w.id() != worker.id());
            state.cached.push_back(worker.clone());
            debug!(worker_id = %worker.id(), "Worker cached");

            if state.active.len() + state.cached.len() > self.num_slot && state.cached.len() > 1 {
                state.cached.pop_front()
            } else {
                None
            }
        };

        if let Some(victim) = evicted {
            info!(worker_id = %victim.id(), "Worker pool full, evicting");
            (self.evict)(victim.id());
        }
    }

    async fn get_compatible_worker_sync(&self, component: &Component, found: FoundFn) {
        let reused = {
            let mut state = self.state.lock().expect("pool lock");

            let position = state
                .cached
                .iter()
                .position(|w| self.is_compatible(w, component));
            let hit = match position {
                Some(index) => state.cached.remove(index),
                None => None,
            };

            match hit {
                Some(worker) => {
                    state.active.push(worker.clone());
                    worker.record_last_component(&component.name);
                    info!(
                        worker_id = %worker.id(),
                        component_id = %component.id,
                        "Reusing cached worker"
                    );
                    Some(worker)
                }
                None => {
                    debug!(
                        component_id = %component.id,
                        "No compatible cached worker, waiting for a new one"
                    );
                    state.waiting.push_back(component.clone());
                    None
                }
            }
        };

        if let Some(worker) = reused {
            found(worker.id());
        }
    }
}
