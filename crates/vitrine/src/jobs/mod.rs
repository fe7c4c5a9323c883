//! Background job queue for orchestration work.
//!
//! Long-running operations are submitted as [`DemoJob`]s and executed by one
//! [`JobWorker`]. Jobs for different sessions run concurrently; ordering
//! within a session is kept by the coordinator's session lock.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use crate::session::{Credentials, DemoError, DemoResult, DemoSessionOrchestrator, StartedSession};
use crate::sweeper::{ReconciliationSweeper, SweepReport};

/// How much a sweep pass covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepScope {
    /// Timer pass; orphan collection only every few passes.
    Scheduled,
    /// Everything, including orphan containers.
    Full,
    /// A full pass at process start. Sessions left mid-operation by the
    /// previous process are failed and cleaned up first.
    Startup,
}

type Reply<T> = Option<oneshot::Sender<DemoResult<T>>>;

/// Work the orchestrator runs in the background.
pub enum DemoJob {
    StartSession {
        project: String,
        username: String,
        reply: Reply<StartedSession>,
    },
    SwitchUser {
        session_id: String,
        username: String,
        reply: Reply<Credentials>,
    },
    Terminate {
        session_id: String,
        reply: Reply<bool>,
    },
    Sweep {
        scope: SweepScope,
        reply: Reply<SweepReport>,
    },
}

impl DemoJob {
    fn kind(&self) -> &'static str {
        match self {
            DemoJob::StartSession { .. } => "start",
            DemoJob::SwitchUser { .. } => "switch",
            DemoJob::Terminate { .. } => "terminate",
            DemoJob::Sweep { .. } => "sweep",
        }
    }
}

/// Submitting side of the queue.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<DemoJob>,
}

fn queue_closed() -> DemoError {
    DemoError::Storage(anyhow::anyhow!("job queue is shut down"))
}

impl JobQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DemoJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn submit(&self, job: DemoJob) -> DemoResult<()> {
        self.tx.send(job).await.map_err(|_| queue_closed())
    }

    async fn request<T>(&self, job: impl FnOnce(Reply<T>) -> DemoJob) -> DemoResult<T> {
        let (reply, rx) = oneshot::channel();
        self.submit(job(Some(reply))).await?;
        rx.await.map_err(|_| queue_closed())?
    }

    pub async fn start_session(&self, project: &str, username: &str) -> DemoResult<StartedSession> {
        let (project, username) = (project.to_string(), username.to_string());
        self.request(|reply| DemoJob::StartSession {
            project,
            username,
            reply,
        })
        .await
    }

    pub async fn switch_user(&self, session_id: &str, username: &str) -> DemoResult<Credentials> {
        let (session_id, username) = (session_id.to_string(), username.to_string());
        self.request(|reply| DemoJob::SwitchUser {
            session_id,
            username,
            reply,
        })
        .await
    }

    pub async fn terminate(&self, session_id: &str) -> DemoResult<bool> {
        let session_id = session_id.to_string();
        self.request(|reply| DemoJob::Terminate { session_id, reply })
            .await
    }

    pub async fn sweep(&self, scope: SweepScope) -> DemoResult<SweepReport> {
        self.request(|reply| DemoJob::Sweep { scope, reply }).await
    }

    /// Queue a sweep without waiting. `false` if the queue is full or closed.
    pub fn try_submit_sweep(&self, scope: SweepScope) -> bool {
        self.tx
            .try_send(DemoJob::Sweep { scope, reply: None })
            .is_ok()
    }
}

/// Executes queued jobs.
#[derive(Clone)]
pub struct JobWorker {
    demo: DemoSessionOrchestrator,
    sweeper: Arc<ReconciliationSweeper>,
}

fn respond<T>(kind: &str, reply: Reply<T>, result: DemoResult<T>) {
    match reply {
        Some(reply) => {
            let _ = reply.send(result);
        }
        None => {
            if let Err(e) = result {
                warn!("Background {} job failed: {}", kind, e);
            }
        }
    }
}

impl JobWorker {
    pub fn new(demo: DemoSessionOrchestrator, sweeper: Arc<ReconciliationSweeper>) -> Self {
        Self { demo, sweeper }
    }

    pub fn spawn(self, rx: mpsc::Receiver<DemoJob>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    /// Run until every queue handle is dropped, then drain in-flight jobs.
    pub async fn run(self, mut rx: mpsc::Receiver<DemoJob>) {
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => {
                        debug!("Dispatching {} job", job.kind());
                        let worker = self.clone();
                        in_flight.spawn(async move { worker.dispatch(job).await });
                    }
                    None => break,
                },
                Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = done {
                        warn!("Job task panicked: {}", e);
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!("Waiting for {} in-flight jobs", in_flight.len());
        }
        while let Some(done) = in_flight.join_next().await {
            if let Err(e) = done {
                warn!("Job task panicked: {}", e);
            }
        }
        debug!("Job worker stopped");
    }

    async fn dispatch(&self, job: DemoJob) {
        let kind = job.kind();
        match job {
            DemoJob::StartSession {
                project,
                username,
                reply,
            } => {
                let result = self.demo.start_session(&project, &username).await;
                respond(kind, reply, result);
            }
            DemoJob::SwitchUser {
                session_id,
                username,
                reply,
            } => {
                let result = self.demo.switch_user(&session_id, &username).await;
                respond(kind, reply, result);
            }
            DemoJob::Terminate { session_id, reply } => {
                let result = self.demo.terminate_session(&session_id).await;
                respond(kind, reply, result);
            }
            DemoJob::Sweep { scope, reply } => {
                let result = self.sweeper.sweep_sessions(scope).await;
                respond(kind, reply, result);
            }
        }
    }
}
