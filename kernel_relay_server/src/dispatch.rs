// THEORY:
// The dispatcher decides *when* an accepted connection gets a handler. It is
// the only piece that differs between the two scheduling strategies; the
// handler and the accept loop are shared.
//
// - `Unbounded`: every connection becomes its own task in a `JoinSet`.
// - `Bounded`: a `WorkerPool` of long-lived workers pulls connections from a
//   bounded queue. The tokio `mpsc` receiver is shared behind an async mutex,
//   which turns the single-consumer channel into a multi-consumer queue.
//
// `admit` is handed the shutdown future so that a `Block` pool waiting for a
// queue slot still notices shutdown. The waiting connection is then told the
// server is shutting down and `admit` returns `Break`.
//
// `drain` is the second half of graceful shutdown. It consumes the dispatcher,
// so nothing can be admitted once draining has begun.

use std::future::Future;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::join_all;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{Admission, DispatchStrategy};
use crate::handler::{BUSY_MESSAGE, ConnectionHandler, SHUTTING_DOWN_MESSAGE};

/// An accepted socket waiting for a handler.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

pub enum Dispatcher {
    Unbounded {
        handler: Arc<ConnectionHandler>,
        tasks: JoinSet<()>,
    },
    Bounded(WorkerPool),
}

impl Dispatcher {
    /// Must be called inside a tokio runtime: the bounded pool spawns its
    /// workers immediately.
    pub fn new(strategy: &DispatchStrategy, handler: Arc<ConnectionHandler>) -> Self {
        match strategy {
            DispatchStrategy::Unbounded => Dispatcher::Unbounded {
                handler,
                tasks: JoinSet::new(),
            },
            DispatchStrategy::Bounded {
                workers,
                queue_capacity,
                admission,
            } => Dispatcher::Bounded(WorkerPool::new(*workers, *queue_capacity, *admission, handler)),
        }
    }

    /// Hands a connection to the strategy. Under `Bounded` + `Block` this
    /// suspends until the queue has room or `shutdown` resolves; the latter
    /// yields `Break` and the caller must not poll `shutdown` again.
    pub async fn admit<F>(&mut self, connection: Connection, shutdown: Pin<&mut F>) -> ControlFlow<()>
    where
        F: Future<Output = ()>,
    {
        match self {
            Dispatcher::Unbounded { handler, tasks } => {
                // Reap whatever finished since the last accept.
                while let Some(result) = tasks.try_join_next() {
                    log_task_result(result);
                }
                let handler = Arc::clone(handler);
                tasks.spawn(async move { handler.handle(connection.stream, connection.peer).await });
                ControlFlow::Continue(())
            }
            Dispatcher::Bounded(pool) => pool.submit(connection, shutdown).await,
        }
    }

    /// Waits for every admitted connection to finish.
    pub async fn drain(self) {
        match self {
            Dispatcher::Unbounded { mut tasks, .. } => {
                info!(in_flight = tasks.len(), "waiting for connection tasks");
                while let Some(result) = tasks.join_next().await {
                    log_task_result(result);
                }
            }
            Dispatcher::Bounded(pool) => pool.shutdown().await,
        }
    }
}

/// A fixed set of workers fed by a bounded connection queue.
pub struct WorkerPool {
    job_sender: mpsc::Sender<Connection>,
    workers: Vec<JoinHandle<()>>,
    rejections: JoinSet<()>,
    admission: Admission,
    handler: Arc<ConnectionHandler>,
}

impl WorkerPool {
    pub fn new(
        worker_count: usize,
        queue_capacity: usize,
        admission: Admission,
        handler: Arc<ConnectionHandler>,
    ) -> Self {
        let (job_sender, job_receiver) = mpsc::channel::<Connection>(queue_capacity.max(1));
        let job_receiver = Arc::new(Mutex::new(job_receiver));

        let workers = (0..worker_count.max(1))
            .map(|worker_id| {
                let job_receiver = Arc::clone(&job_receiver);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    loop {
                        // The lock is held only while waiting for the next job.
                        let next = job_receiver.lock().await.recv().await;
                        let Some(connection) = next else {
                            break;
                        };
                        debug!(worker_id, peer = %connection.peer, "worker picked up connection");
                        handler.handle(connection.stream, connection.peer).await;
                    }
                    debug!(worker_id, "worker exiting");
                })
            })
            .collect();

        Self {
            job_sender,
            workers,
            rejections: JoinSet::new(),
            admission,
            handler,
        }
    }

    pub async fn submit<F>(&mut self, connection: Connection, shutdown: Pin<&mut F>) -> ControlFlow<()>
    where
        F: Future<Output = ()>,
    {
        while let Some(result) = self.rejections.try_join_next() {
            log_task_result(result);
        }

        match self.admission {
            Admission::Block => {
                if self.job_sender.capacity() == 0 {
                    debug!(peer = %connection.peer, "job queue full; accept loop waiting for a free slot");
                }
                let job_sender = self.job_sender.clone();
                tokio::select! {
                    biased;
                    () = shutdown => {
                        info!(peer = %connection.peer, "shutdown while waiting for a queue slot; turning it away");
                        self.turn_away(connection, SHUTTING_DOWN_MESSAGE);
                        return ControlFlow::Break(());
                    }
                    permit = job_sender.reserve() => match permit {
                        Ok(permit) => permit.send(connection),
                        Err(_) => error!(peer = %connection.peer, "job queue closed; dropping connection"),
                    },
                }
            }
            Admission::Reject => match self.job_sender.try_send(connection) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(connection)) => {
                    warn!(peer = %connection.peer, "job queue full; rejecting connection");
                    self.turn_away(connection, BUSY_MESSAGE);
                }
                Err(mpsc::error::TrySendError::Closed(connection)) => {
                    error!(peer = %connection.peer, "job queue closed; dropping connection");
                }
            },
        }
        ControlFlow::Continue(())
    }

    fn turn_away(&mut self, connection: Connection, reason: &'static str) {
        let handler = Arc::clone(&self.handler);
        self.rejections
            .spawn(async move { handler.reject(connection.stream, connection.peer, reason).await });
    }

    /// Closes the queue, lets the workers finish everything already queued,
    /// and joins them.
    pub async fn shutdown(self) {
        let WorkerPool {
            job_sender,
            workers,
            mut rejections,
            ..
        } = self;

        info!(
            queued = job_sender.max_capacity() - job_sender.capacity(),
            workers = workers.len(),
            "closing job queue"
        );
        drop(job_sender);

        for (worker_id, result) in join_all(workers).await.into_iter().enumerate() {
            if let Err(err) = result {
                error!(worker_id, error = %err, "worker task failed");
            }
        }
        while let Some(result) = rejections.join_next().await {
            log_task_result(result);
        }
    }
}

fn log_task_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(err) = result {
        error!(error = %err, "connection task failed");
    }
}
