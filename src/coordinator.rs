//! Coordinator core
//!
//! Accepts worker connections, tracks their lifecycle, and serializes
//! pipeline execution: the trial driver submits a pipeline, then drives
//! its components in order, and each `on_new_component` call blocks until
//! the dispatched component reports `done`.
//!
//! All lifecycle steps (pipeline registration, component dispatch, the
//! scheduler callbacks, and completion handling) run under one lifecycle
//! lock, so pipeline state is observed single-threaded. The block-until-
//! done gate is a per-component oneshot completed by the `done` handler.

use crate::enckey::NO_KEY;
use crate::error::{Error, Result};
use crate::handler::{ignore_unknown, HandlerEvents, MessageHandler};
use crate::message::Message;
use crate::pipeline::{Component, TaskMonitor};
use crate::scheduler::Scheduler;
use crate::transport::Acceptor;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

/// Sender id the coordinator stamps on every outgoing message.
const SENDER_ID: &str = "Coordinator";

struct ComponentGate {
    component_id: String,
    done_tx: oneshot::Sender<f64>,
}

#[derive(Default)]
struct LifecycleState {
    /// Connected but not yet identified by a `ready`.
    unidentified: Vec<Arc<MessageHandler>>,
    /// Identified workers, indexed by worker id.
    workers: HashMap<String, Arc<MessageHandler>>,
    monitor: TaskMonitor,
    gate: Option<ComponentGate>,
}

pub struct Coordinator {
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<LifecycleState>,
    component_key: Option<String>,
}

impl Coordinator {
    pub fn new(scheduler: Arc<dyn Scheduler>, component_key: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            state: Mutex::new(LifecycleState::default()),
            component_key,
        })
    }

    /// The key inserted into every `execute` dispatch, `NULL` when no key
    /// is configured.
    fn dispatch_key(&self) -> String {
        self.component_key
            .clone()
            .unwrap_or_else(|| NO_KEY.to_string())
    }

    /// Accept loop. Each accepted socket is handshaked off the loop and
    /// becomes an unidentified handler with this coordinator as its
    /// receive callback.
    pub async fn run(self: &Arc<Self>, listener: TcpListener, acceptor: Acceptor) -> Result<()> {
        let local = listener
            .local_addr()
            .map_err(|e| Error::Init(format!("listener address: {}", e)))?;
        warn!(address = %local, mode = %acceptor.mode(), "Coordinator listening");

        let acceptor = Arc::new(acceptor);
        loop {
            let (socket, peer) = listener
                .accept()
                .await
                .map_err(|e| Error::Transport(format!("accept: {}", e)))?;
            debug!(peer = %peer, "Connection accepted");

            let coordinator = self.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let transport = match acceptor.accept(socket).await {
                    Ok(transport) => transport,
                    Err(e) => {
                        error!(peer = %peer, error = %e, "Handshake failed");
                        return;
                    }
                };

                let handler = MessageHandler::spawn(
                    transport,
                    acceptor.mode(),
                    peer.to_string(),
                    coordinator.clone(),
                );
                coordinator.state.lock().await.unidentified.push(handler);
            });
        }
    }

    /// Registers a new pipeline: each `(name, id)` pair becomes a pending
    /// component.
    pub async fn on_new_pipeline(&self, names: Vec<String>, ids: Vec<String>) -> Result<()> {
        if names.is_empty() || names.len() != ids.len() {
            return Err(Error::Scheduler(format!(
                "pipeline must have matching names and ids, got {} and {}",
                names.len(),
                ids.len()
            )));
        }
        debug!(components = %names.join(", "), "New pipeline execution task");

        let mut state = self.state.lock().await;
        state.monitor.add_pending_components(
            names
                .into_iter()
                .zip(ids)
                .map(|(name, id)| Component::new(name, id)),
        )
    }

    /// Drives one component: `info[0]` is the component id, `info[1]` the
    /// working directory, the rest is the command. Blocks until the
    /// component reports `done` and returns its I/O time in seconds.
    pub async fn on_new_component(&self, info: Vec<String>) -> Result<f64> {
        if info.len() < 2 {
            return Err(Error::Scheduler(
                "component info needs at least an id and a working directory".to_string(),
            ));
        }
        let component_id = info[0].clone();
        let working_directory = info[1].clone();

        let done_rx = {
            let mut state = self.state.lock().await;

            if let Some(gate) = &state.gate {
                return Err(Error::Scheduler(format!(
                    "component {} is still running",
                    gate.component_id
                )));
            }

            let mut dispatch = vec![
                component_id.clone(),
                working_directory.clone(),
                self.dispatch_key(),
            ];
            dispatch.extend_from_slice(&info[2..]);

            let component = {
                let record = state.monitor.pending_component_mut(&component_id)?;
                record.path = Some(working_directory.clone().into());
                record.command = dispatch;
                record.clone()
            };

            let (done_tx, done_rx) = oneshot::channel();
            state.gate = Some(ComponentGate {
                component_id: component_id.clone(),
                done_tx,
            });

            let dispatched: Arc<std::sync::Mutex<Option<String>>> = Arc::default();
            let sink = dispatched.clone();
            let workers = state.workers.clone();
            let execute = Message::new(SENDER_ID, "execute", component.command.clone());
            self.scheduler
                .get_compatible_worker_sync(
                    &component,
                    Box::new(move |worker_id| {
                        debug!(worker_id, "Sending component execution task");
                        match workers.get(worker_id) {
                            Some(handler) => {
                                if let Err(e) = handler.send(execute) {
                                    error!(worker_id, error = %e, "Dispatch failed");
                                } else {
                                    *sink.lock().expect("dispatch slot") =
                                        Some(worker_id.to_string());
                                }
                            }
                            None => error!(worker_id, "No worker with that id"),
                        }
                    }),
                )
                .await;

            let hit = dispatched.lock().expect("dispatch slot").take();
            if hit.is_some() {
                state.monitor.record_component_started(&component_id)?;
            }

            done_rx
        };

        // Self-block until the `done` handler releases the gate. The
        // lifecycle lock is not held across this await.
        let io_time = done_rx
            .await
            .map_err(|_| Error::Scheduler("coordinator shut down mid-component".to_string()))?;

        debug!(component_id = %component_id, io_time, "Component gate released");
        Ok(io_time)
    }

    /// The scheduler's cache overflowed: ask the worker to exit. Its
    /// registry entry is dropped when its `bye` arrives.
    pub async fn on_cache_full(&self, worker_id: &str) {
        debug!(worker_id, "Worker to reclaim");
        let state = self.state.lock().await;
        match state.workers.get(worker_id) {
            Some(handler) => {
                if let Err(e) = handler.send(Message::without_args(SENDER_ID, "exit")) {
                    warn!(worker_id, error = %e, "Exit request failed");
                }
            }
            None => warn!(worker_id, "No worker with that id"),
        }
    }

    async fn handle_ready(&self, handler: Arc<MessageHandler>, id: &str) {
        self.scheduler.add_new_worker(id).await;

        let mut state = self.state.lock().await;
        state
            .unidentified
            .retain(|h| !Arc::ptr_eq(h, &handler));
        if let Some(previous) = state.workers.insert(id.to_string(), handler.clone()) {
            // An id reconnecting before its old entry saw `bye`.
            warn!(worker_id = %id, peer = %previous.peer(), "Replacing stale worker entry");
        }
        info!(worker_id = %id, peer = %handler.peer(), "Worker identified");

        if let Err(e) = handler.send(Message::without_args(SENDER_ID, "request_manifest")) {
            error!(worker_id = %id, error = %e, "Manifest request failed");
        }
    }

    async fn handle_response_manifest(&self, msg: &Message) {
        let id = msg.sender_id();
        let Some(worker) = self.scheduler.get_worker(id).await else {
            error!(worker_id = %id, "No worker with that id");
            return;
        };

        let is_new = match worker.on_msg(msg) {
            Ok(is_new) => is_new,
            Err(e) => {
                error!(worker_id = %id, error = %e, "Bad manifest");
                return;
            }
        };
        if !is_new {
            return;
        }

        let mut state = self.state.lock().await;
        let Some(handler) = state.workers.get(id).cloned() else {
            error!(worker_id = %id, "Worker has no connection");
            return;
        };

        let dispatched: Arc<std::sync::Mutex<Option<String>>> = Arc::default();
        let sink = dispatched.clone();
        let worker_id = id.to_string();
        self.scheduler
            .on_worker_ready(
                worker,
                Box::new(move |component| {
                    debug!(
                        worker_id = %worker_id,
                        component_id = %component.id,
                        command = %component.command.join(" "),
                        "Sending component execution task"
                    );
                    let execute =
                        Message::new(SENDER_ID, "execute", component.command.clone());
                    if let Err(e) = handler.send(execute) {
                        error!(worker_id = %worker_id, error = %e, "Dispatch failed");
                    } else {
                        *sink.lock().expect("dispatch slot") = Some(component.id.clone());
                    }
                }),
            )
            .await;

        let dispatched_id = dispatched.lock().expect("dispatch slot").take();
        if let Some(component_id) = dispatched_id {
            if let Err(e) = state.monitor.record_component_started(&component_id) {
                error!(component_id = %component_id, error = %e, "Cannot mark running");
            }
        }
    }

    async fn handle_done(&self, msg: &Message) {
        let id = msg.sender_id();
        let (Some(component_id), Some(io_time_str)) = (msg.args().first(), msg.args().last())
        else {
            error!(worker_id = %id, "Malformed done message");
            return;
        };
        info!(
            component_id = %component_id,
            io_time = %io_time_str,
            "Component done"
        );

        let io_time: f64 = match io_time_str.parse() {
            Ok(v) => v,
            Err(e) => {
                warn!(worker_id = %id, error = %e, "Unparsable I/O time, recording 0");
                0.0
            }
        };

        match self.scheduler.get_worker(id).await {
            Some(worker) => self.scheduler.cache_worker(worker).await,
            None => {
                error!(worker_id = %id, "No worker with that id");
                return;
            }
        }

        let mut state = self.state.lock().await;
        if let Err(e) = state.monitor.record_component_done(component_id) {
            warn!(component_id = %component_id, error = %e, "Completion for unknown component");
        }

        match state.gate.take() {
            Some(gate) => {
                if gate.component_id != *component_id {
                    warn!(
                        expected = %gate.component_id,
                        finished = %component_id,
                        "Done for unexpected component, releasing gate anyway"
                    );
                }
                debug!(worker_id = %id, "Worker cached, releasing lifecycle gate");
                let _ = gate.done_tx.send(io_time);
            }
            None => warn!(component_id = %component_id, "Done with no component in flight"),
        }
    }

    async fn handle_bye(&self, handler: &Arc<MessageHandler>, id: &str) {
        info!(worker_id = %id, "Worker disconnected, removing from registry");
        let mut state = self.state.lock().await;
        state
            .unidentified
            .retain(|h| !Arc::ptr_eq(h, handler));
        if let Some(entry) = state.workers.get(id) {
            if Arc::ptr_eq(entry, handler) {
                state.workers.remove(id);
            }
        }
    }
}

#[async_trait]
impl HandlerEvents for Coordinator {
    async fn on_receive(&self, handler: Arc<MessageHandler>, msg: Message) {
        debug!(peer = %handler.peer(), "Dispatching {}", msg);

        match msg.cmd() {
            "ping" => {
                if let Err(e) = handler.send(Message::without_args(SENDER_ID, "pong")) {
                    warn!(peer = %handler.peer(), error = %e, "Pong failed");
                }
            }
            "ready" => self.handle_ready(handler, msg.sender_id()).await,
            "response_manifest" => self.handle_response_manifest(&msg).await,
            "done" => self.handle_done(&msg).await,
            "bye" => self.handle_bye(&handler, msg.sender_id()).await,
            _ => ignore_unknown(handler.peer(), &msg),
        }
    }
}
