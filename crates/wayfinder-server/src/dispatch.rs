//! Background task queue with ordered completions.
//!
//! Jobs run on tokio's blocking pool. Their results come back over a
//! channel and are handed out strictly in submission order, so a fast job
//! never overtakes a slow one submitted before it. Nothing here touches
//! engine state: the engine applies what [`Dispatcher::drain`] returns.

use std::collections::BTreeMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::warn;

/// Sequence number of a submitted job.
pub type Ticket = u64;

pub struct Dispatcher<T> {
    next_ticket: Ticket,
    next_to_apply: Ticket,
    tx: UnboundedSender<(Ticket, Option<T>)>,
    rx: UnboundedReceiver<(Ticket, Option<T>)>,
    ready: BTreeMap<Ticket, Option<T>>,
}

impl<T: Send + 'static> Dispatcher<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            next_ticket: 0,
            next_to_apply: 0,
            tx,
            rx,
            ready: BTreeMap::new(),
        }
    }

    /// Runs `job` off the calling context. Must be called inside a tokio
    /// runtime.
    pub fn submit<F>(&mut self, job: F) -> Ticket
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let output = match tokio::task::spawn_blocking(job).await {
                Ok(output) => Some(output),
                Err(e) => {
                    warn!(ticket, "background job failed: {}", e);
                    None
                }
            };
            let _ = tx.send((ticket, output));
        });
        ticket
    }

    /// Jobs submitted but not yet handed out.
    pub fn pending(&self) -> u64 {
        self.next_ticket - self.next_to_apply
    }

    /// Returns every finished result that is next in line, in submission
    /// order. Failed jobs are skipped.
    pub fn drain(&mut self) -> Vec<(Ticket, T)> {
        while let Ok((ticket, output)) = self.rx.try_recv() {
            self.ready.insert(ticket, output);
        }
        let mut done = Vec::new();
        while let Some(output) = self.ready.remove(&self.next_to_apply) {
            if let Some(output) = output {
                done.push((self.next_to_apply, output));
            }
            self.next_to_apply += 1;
        }
        done
    }

    /// Waits for every submitted job and returns all results in order.
    pub async fn settle(&mut self) -> Vec<(Ticket, T)> {
        let mut done = self.drain();
        while self.pending() > 0 {
            match self.rx.recv().await {
                Some((ticket, output)) => {
                    self.ready.insert(ticket, output);
                    done.extend(self.drain());
                }
                None => break,
            }
        }
        done
    }
}

impl<T: Send + 'static> Default for Dispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}
