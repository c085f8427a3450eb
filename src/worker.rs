//! Worker core
//!
//! A worker dials the coordinator, announces itself with `ready`, and
//! then serves commands. Component execution and manifest capture run on
//! a serialized executor (one queue, one draining task), so at most one
//! component executes at any instant and its `response_manifest` is
//! always sent before its `done`.

use crate::enckey::{ContentKey, NO_KEY};
use crate::error::{Error, Result};
use crate::handler::{ignore_unknown, HandlerEvents, MessageHandler};
use crate::message::Message;
use crate::runtime::ComponentRuntime;
use crate::transport::Connector;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

enum Job {
    CaptureManifest {
        handler: Arc<MessageHandler>,
    },
    Execute {
        handler: Arc<MessageHandler>,
        component_id: String,
        working_directory: PathBuf,
        argv: Vec<String>,
        key: Option<ContentKey>,
    },
}

pub struct Worker {
    id: String,
    jobs: mpsc::UnboundedSender<Job>,
}

impl Worker {
    /// Creates the worker and starts its serialized component executor.
    pub fn new(id: impl Into<String>, runtime: Arc<dyn ComponentRuntime>) -> Arc<Self> {
        let id = id.into();
        let (jobs, jobs_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_jobs(id.clone(), runtime, jobs_rx));

        Arc::new(Self { id, jobs })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Connects to the coordinator. The `ready` announcement is sent from
    /// the connected callback, before any command can arrive.
    pub async fn connect(
        self: &Arc<Self>,
        connector: &Connector,
        host: &str,
        port: u16,
    ) -> Result<Arc<MessageHandler>> {
        let transport = connector.connect(host, port).await?;
        info!(worker_id = %self.id, host, port, mode = %connector.mode(), "Connected to coordinator");

        Ok(MessageHandler::spawn(
            transport,
            connector.mode(),
            format!("{}:{}", host, port),
            self.clone(),
        ))
    }

    fn queue(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            error!(worker_id = %self.id, "Component executor is gone");
        }
    }

    fn handle_execute(&self, handler: Arc<MessageHandler>, msg: &Message) -> Result<()> {
        let args = msg.args();
        if args.len() < 3 {
            return Err(Error::Protocol(format!(
                "execute needs [component_id, working_directory, key, argv...], got {} args",
                args.len()
            )));
        }

        let component_id = args[0].clone();
        let working_directory = PathBuf::from(&args[1]);
        let component_key = &args[2];
        let argv = args[3..].to_vec();

        let key = if component_key == NO_KEY {
            warn!(
                worker_id = %self.id,
                "Component key is empty, skipping component encryption"
            );
            None
        } else {
            Some(ContentKey::derive(component_key))
        };

        debug!(
            worker_id = %self.id,
            component_id = %component_id,
            working_directory = %working_directory.display(),
            command = %argv.join(" "),
            "Execute component"
        );

        self.queue(Job::Execute {
            handler,
            component_id,
            working_directory,
            argv,
            key,
        });
        Ok(())
    }
}

#[async_trait]
impl HandlerEvents for Worker {
    async fn on_connected(&self, handler: Arc<MessageHandler>) {
        if let Err(e) = handler.send(Message::new(
            &self.id,
            "ready",
            vec![self.id.clone()],
        )) {
            error!(worker_id = %self.id, error = %e, "Cannot announce ready");
        }
    }

    async fn on_receive(&self, handler: Arc<MessageHandler>, msg: Message) {
        debug!(worker_id = %self.id, "Dispatching {}", msg);

        match msg.cmd() {
            "ping" => {
                if let Err(e) = handler.send(Message::without_args(&self.id, "pong")) {
                    warn!(worker_id = %self.id, error = %e, "Pong failed");
                }
            }
            "exit" => {
                // The handler closes the socket after the bye is flushed.
                if let Err(e) = handler.send(Message::without_args(&self.id, "bye")) {
                    warn!(worker_id = %self.id, error = %e, "Bye failed");
                }
            }
            "request_manifest" => self.queue(Job::CaptureManifest { handler }),
            "execute" => {
                if let Err(e) = self.handle_execute(handler, &msg) {
                    error!(worker_id = %self.id, error = %e, "Bad execute request");
                }
            }
            _ => ignore_unknown(&self.id, &msg),
        }
    }
}

/// Drains the job queue one job at a time.
async fn run_jobs(
    worker_id: String,
    runtime: Arc<dyn ComponentRuntime>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            Job::CaptureManifest { handler } => {
                match runtime.capture_manifest(&worker_id).await {
                    Ok(manifest) => {
                        debug!(worker_id = %worker_id, "Manifest for current env: {}", manifest);
                        if let Err(e) =
                            handler.send(Message::new(&worker_id, "response_manifest", vec![manifest]))
                        {
                            error!(worker_id = %worker_id, error = %e, "Manifest reply failed");
                        }
                    }
                    Err(e) => error!(worker_id = %worker_id, error = %e, "Manifest capture failed"),
                }
            }
            Job::Execute {
                handler,
                component_id,
                working_directory,
                argv,
                key,
            } => {
                let outcome = match runtime
                    .execute_component(&component_id, &working_directory, &argv, key.as_ref())
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(
                            worker_id = %worker_id,
                            component_id = %component_id,
                            error = %e,
                            "Component execution failed"
                        );
                        continue;
                    }
                };

                let manifest = match runtime.capture_manifest(&worker_id).await {
                    Ok(manifest) => manifest,
                    Err(e) => {
                        error!(worker_id = %worker_id, error = %e, "Manifest capture failed");
                        continue;
                    }
                };
                debug!(
                    worker_id = %worker_id,
                    component_id = %outcome.finished_id,
                    "Component finished with manifest: {}",
                    manifest
                );

                // Same handler, queue order: the manifest always arrives
                // before the completion report.
                let sent = handler
                    .send(Message::new(&worker_id, "response_manifest", vec![manifest]))
                    .and_then(|_| {
                        handler.send(Message::new(
                            &worker_id,
                            "done",
                            vec![outcome.finished_id.clone(), outcome.io_time.to_string()],
                        ))
                    });
                if let Err(e) = sent {
                    error!(worker_id = %worker_id, error = %e, "Completion report failed");
                }
            }
        }
    }
    debug!(worker_id = %worker_id, "Component executor stopped");
}
