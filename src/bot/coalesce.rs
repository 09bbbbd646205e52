//! Per-key event coalescing.
//!
//! Each source message id owns at most one slot: a single-element mailbox
//! holding the newest inbound event plus a cancellation token that fires
//! when a newer event supersedes it. One worker drains the slot; it computes
//! everything for the event it holds, then a compare-and-delete on the slot
//! map decides whether that event is still the latest. Only the latest event
//! ever commits side effects, and the map holds no entry once a worker
//! observes its slot unchanged and commits.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Two-phase event handling driven by a [`Coalescer`] worker.
///
/// `prepare` does all the work that may be superseded (executions, reply
/// queries); `commit` applies side effects and only runs when the
/// compare-and-delete proved the event is still the latest. Returning `None`
/// from `prepare` abandons the event (the slot is still cleaned up).
#[async_trait]
pub trait EventProcessor<E>: Send + Sync + 'static {
    type Prepared: Send;

    async fn prepare(&self, event: E, cancel: &CancellationToken) -> Option<Self::Prepared>;

    async fn commit(&self, prepared: Self::Prepared, cancel: &CancellationToken);
}

/// Capacity-1 hand-off between publisher and worker.
struct Mailbox<E> {
    event: Mutex<Option<E>>,
    superseded: CancellationToken,
}

pub struct Coalescer<E> {
    slots: Mutex<HashMap<u64, Arc<Mailbox<E>>>>,
    shutdown: CancellationToken,
}

impl<E: Send + 'static> Coalescer<E> {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Install `event` as the newest for `id`. A previous pending event for
    /// the same id is discarded and its in-flight work is cancelled; if no
    /// slot existed, a worker is spawned to drain this one.
    pub fn publish<P>(self: &Arc<Self>, id: u64, event: E, processor: &Arc<P>)
    where
        P: EventProcessor<E>,
    {
        let mailbox = Arc::new(Mailbox {
            event: Mutex::new(Some(event)),
            superseded: self.shutdown.child_token(),
        });
        let prior = self.slots.lock().insert(id, mailbox);
        match prior {
            Some(old) => old.superseded.cancel(),
            None => {
                let coalescer = Arc::clone(self);
                let processor = Arc::clone(processor);
                tokio::spawn(async move {
                    coalescer.drain(id, processor.as_ref()).await;
                });
            }
        }
    }

    /// Worker loop for one id. Exits only after a compare-and-delete of the
    /// slot succeeded, so the map never retains an entry past quiescence.
    async fn drain<P>(&self, id: u64, processor: &P)
    where
        P: EventProcessor<E>,
    {
        loop {
            let Some(mailbox) = self.slots.lock().get(&id).cloned() else {
                tracing::error!("no slot for message id {id}");
                return;
            };
            let Some(event) = mailbox.event.lock().take() else {
                tracing::error!("empty mailbox for message id {id}");
                return;
            };
            let cancel = mailbox.superseded.clone();

            let prepared = processor.prepare(event, &cancel).await;

            let committed = {
                let mut slots = self.slots.lock();
                match slots.get(&id) {
                    Some(current) if Arc::ptr_eq(current, &mailbox) => {
                        slots.remove(&id);
                        true
                    }
                    _ => false,
                }
            };
            if committed {
                if let Some(prepared) = prepared {
                    processor.commit(prepared, &cancel).await;
                }
                return;
            }
            // Superseded: whatever was prepared is discarded and the loop
            // picks up the newer event.
        }
    }

    /// True once no slot is pending. Quiescence indicator for shutdown and
    /// tests.
    pub fn is_idle(&self) -> bool {
        self.slots.lock().is_empty()
    }
}
