//! Fire-and-forget persistence.
//!
//! Every mutation enqueues a [`PersistOp`]; a worker on the blocking pool
//! applies them in order. Failures are logged and never undo the in-memory
//! change that caused them. The queue never drops an operation: a slow store
//! only grows the backlog, which is reported once it passes a threshold.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use wayfinder_core::{Findable, GraphId, Group, GroupId, Marker, NodeId, UserId};
use wayfinder_graph::{EdgeKey, GraphRecord, GraphStore, StoreError};

/// One write to durable storage.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOp {
    SaveGraph(GraphRecord),
    DeleteGraph(GraphId),
    SaveNode(Findable),
    DeleteNode(GraphId, NodeId),
    SaveEdge(GraphId, EdgeKey),
    DeleteEdge(GraphId, EdgeKey),
    SaveGroup(Group),
    DeleteGroup(GraphId, GroupId),
    SaveDiscoveries(UserId, BTreeSet<Marker>),
}

/// Where persisted operations end up.
pub trait Repository: Send + 'static {
    fn apply(&self, op: &PersistOp) -> Result<(), StoreError>;

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl Repository for GraphStore {
    fn apply(&self, op: &PersistOp) -> Result<(), StoreError> {
        match op {
            PersistOp::SaveGraph(record) => self.save_graph(record),
            PersistOp::DeleteGraph(graph) => self.delete_graph(*graph),
            PersistOp::SaveNode(node) => self.save_node(node),
            PersistOp::DeleteNode(graph, node) => self.delete_node(*graph, *node),
            PersistOp::SaveEdge(graph, edge) => self.save_edge(*graph, *edge),
            PersistOp::DeleteEdge(graph, edge) => self.delete_edge(*graph, *edge),
            PersistOp::SaveGroup(group) => self.save_group(group),
            PersistOp::DeleteGroup(graph, group) => self.delete_group(*graph, *group),
            PersistOp::SaveDiscoveries(user, markers) => self.save_discoveries(*user, markers),
        }
    }

    fn flush(&self) -> Result<(), StoreError> {
        GraphStore::flush(self)
    }
}

impl<R: Repository + Sync> Repository for Arc<R> {
    fn apply(&self, op: &PersistOp) -> Result<(), StoreError> {
        (**self).apply(op)
    }

    fn flush(&self) -> Result<(), StoreError> {
        (**self).flush()
    }
}

/// Handle to the persistence worker.
pub struct Persistence {
    tx: Option<mpsc::UnboundedSender<PersistOp>>,
    backlog: Arc<AtomicUsize>,
    warn_at: usize,
    worker: Option<JoinHandle<()>>,
}

impl Persistence {
    /// Starts a worker applying operations to `repo`, warning whenever the
    /// backlog reaches a multiple of `warn_at`. Must be called inside a
    /// tokio runtime.
    pub fn spawn<R: Repository>(repo: R, warn_at: usize) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistOp>();
        let backlog = Arc::new(AtomicUsize::new(0));
        let pending = Arc::clone(&backlog);
        let worker = tokio::task::spawn_blocking(move || {
            while let Some(op) = rx.blocking_recv() {
                if let Err(e) = repo.apply(&op) {
                    error!("persistence failed for {:?}: {}", op, e);
                }
                pending.fetch_sub(1, Ordering::Relaxed);
            }
            if let Err(e) = repo.flush() {
                error!("final flush failed: {}", e);
            }
            debug!("persistence worker stopped");
        });
        Self {
            tx: Some(tx),
            backlog,
            warn_at: warn_at.max(1),
            worker: Some(worker),
        }
    }

    /// A handle that drops every operation.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            backlog: Arc::default(),
            warn_at: 1,
            worker: None,
        }
    }

    pub fn enqueue(&self, op: PersistOp) {
        let Some(tx) = &self.tx else {
            return;
        };
        let depth = self.backlog.fetch_add(1, Ordering::Relaxed) + 1;
        if let Err(mpsc::error::SendError(op)) = tx.send(op) {
            self.backlog.fetch_sub(1, Ordering::Relaxed);
            warn!("persistence stopped, dropped {:?}", op);
            return;
        }
        if depth % self.warn_at == 0 {
            warn!(backlog = depth, "persistence is falling behind");
        }
    }

    /// Operations queued but not yet applied.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }

    /// Stops accepting work and waits until everything queued is written.
    pub async fn close(&mut self) {
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!("persistence worker panicked: {}", e);
            }
        }
    }
}
