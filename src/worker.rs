//! Fixed pool of dispatch workers.
//!
//! Each worker drains its own bounded queue. A connection's requests always
//! go to worker `conn_id % size`, so one connection's messages are handled
//! one at a time, in arrival order, while different connections spread
//! across workers. There is no rebalancing if one worker runs hot.
//!
//! A full queue makes [`WorkerPool::submit`] wait. That stalls the reader
//! of the submitting connection, which stops it pulling more frames off
//! the socket.

use crate::error::{Error, Result};
use crate::message::Request;
use crate::router::MsgHandler;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

pub struct WorkerPool {
    queues: Vec<mpsc::Sender<Request>>,
    /// Receivers waiting for [`WorkerPool::start`] to hand them to workers.
    pending: Mutex<Vec<mpsc::Receiver<Request>>>,
}

impl WorkerPool {
    /// Create `size` queues of `max_task_len` slots each. A size of zero
    /// creates a disabled pool.
    pub fn new(size: usize, max_task_len: usize) -> Self {
        let (queues, pending): (Vec<_>, Vec<_>) = (0..size)
            .map(|_| mpsc::channel(max_task_len.max(1)))
            .unzip();

        Self {
            queues,
            pending: Mutex::new(pending),
        }
    }

    pub fn size(&self) -> usize {
        self.queues.len()
    }

    pub fn is_enabled(&self) -> bool {
        !self.queues.is_empty()
    }

    /// Worker index that owns `conn_id`.
    pub fn worker_for(&self, conn_id: u32) -> usize {
        conn_id as usize % self.queues.len()
    }

    /// Spawn one task per queue. Later calls spawn nothing.
    pub fn start(&self, handler: Arc<MsgHandler>) -> Vec<JoinHandle<()>> {
        let receivers = std::mem::take(&mut *self.pending.lock());
        if !receivers.is_empty() {
            info!(workers = receivers.len(), "Starting worker pool");
        }

        receivers
            .into_iter()
            .enumerate()
            .map(|(worker_id, rx)| tokio::spawn(run_worker(worker_id, rx, Arc::clone(&handler))))
            .collect()
    }

    /// Queue `request` on its connection's worker, waiting while that
    /// queue is full.
    pub async fn submit(&self, request: Request) -> Result<()> {
        if !self.is_enabled() {
            return Err(Error::PoolDisabled);
        }

        let conn_id = request.connection().conn_id();
        let worker_id = self.worker_for(conn_id);
        trace!(conn_id, msg_id = request.msg_id(), worker_id, "Queueing request");

        self.queues[worker_id]
            .send(request)
            .await
            .map_err(|_| Error::WorkerStopped(worker_id))
    }
}

async fn run_worker(worker_id: usize, mut queue: mpsc::Receiver<Request>, handler: Arc<MsgHandler>) {
    debug!(worker_id, "Worker started");
    while let Some(request) = queue.recv().await {
        handler.dispatch(request).await;
    }
    debug!(worker_id, "Worker queue closed, exiting");
}
