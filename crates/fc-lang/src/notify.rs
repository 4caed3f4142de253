//! Notification delivery.
//!
//! Each subscription owns a bounded queue and one delivery task that streams
//! queued events, in emission order, to a single listener. Producers never
//! block: a full queue drops its oldest event and the next delivered event
//! reports how many were lost.
//!
//! State machine: `Active -> Unsubscribing -> Closed` when the caller
//! unsubscribes (queued events are flushed first), `Active -> Closed` when
//! the connection goes away (queued events are discarded).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapter::{BridgedObject, ObjectAdapter};
use crate::bridge::protocol::ServerFrame;
use crate::error::BridgeError;
use crate::handle::{Handle, HandleTable, ObjectKind, Operation, Owner};
use crate::model::{EventSink, NotificationGuard};
use crate::nodeutil;

pub const DEFAULT_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Active,
    Unsubscribing,
    Closed,
}

struct Queue {
    state: DeliveryState,
    events: VecDeque<Value>,
    dropped: u64,
}

pub struct Subscription {
    source: Handle,
    depth: usize,
    queue: Mutex<Queue>,
    wake: Notify,
    guard: Mutex<Option<NotificationGuard>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
    /// Cancelled once the state reaches `Closed`.
    closed: CancellationToken,
}

impl Subscription {
    fn new(source: Handle, depth: usize) -> Self {
        Self {
            source,
            depth: depth.max(1),
            queue: Mutex::new(Queue {
                state: DeliveryState::Active,
                events: VecDeque::new(),
                dropped: 0,
            }),
            wake: Notify::new(),
            guard: Mutex::new(None),
            delivery: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// Selection handle this subscription was opened on.
    pub fn source(&self) -> Handle {
        self.source
    }

    pub fn state(&self) -> DeliveryState {
        self.lock_queue().state
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, event: Value) {
        {
            let mut q = self.lock_queue();
            if q.state != DeliveryState::Active {
                return;
            }
            if q.events.len() >= self.depth {
                q.events.pop_front();
                q.dropped += 1;
            }
            q.events.push_back(event);
        }
        self.wake.notify_one();
    }

    fn mark_closed(&self) {
        self.lock_queue().state = DeliveryState::Closed;
        self.closed.cancel();
    }

    fn detach(&self) {
        let guard = self
            .guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(guard) = guard {
            guard.close();
        }
    }

    /// Close without flushing. Safe to call repeatedly.
    pub fn close(&self) {
        {
            let mut q = self.lock_queue();
            q.state = DeliveryState::Closed;
            q.events.clear();
        }
        self.closed.cancel();
        self.detach();
        if let Some(task) = self
            .delivery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    async fn deliver(self: Arc<Self>, hnd: Handle, listener: mpsc::Sender<ServerFrame>) {
        let mut seq = 0u64;
        loop {
            let next = {
                let mut q = self.lock_queue();
                match q.events.pop_front() {
                    _ if q.state == DeliveryState::Closed => return,
                    Some(event) => Some((event, std::mem::take(&mut q.dropped))),
                    None if q.state == DeliveryState::Unsubscribing => return,
                    None => None,
                }
            };
            let Some((event, dropped)) = next else {
                self.wake.notified().await;
                continue;
            };
            if dropped > 0 {
                tracing::debug!(subscription = %hnd, dropped, "Events dropped by back-pressure");
            }
            let frame = ServerFrame::Event {
                subscription: hnd.get(),
                seq,
                dropped,
                value: nodeutil::encode(&event),
            };
            seq += 1;
            if listener.send(frame).await.is_err() {
                tracing::trace!(subscription = %hnd, "Listener gone, stopping delivery");
                self.mark_closed();
                return;
            }
        }
    }
}

#[async_trait]
impl ObjectAdapter for Subscription {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Subscription
    }

    /// Stop the producer, flush what is queued, then close. A caller that
    /// finds a flush already running waits for it to finish.
    async fn unsubscribe(&self) -> Result<(), BridgeError> {
        let already_draining = {
            let mut q = self.lock_queue();
            match q.state {
                DeliveryState::Active => {
                    q.state = DeliveryState::Unsubscribing;
                    false
                }
                DeliveryState::Unsubscribing => true,
                DeliveryState::Closed => return Ok(()),
            }
        };
        if already_draining {
            self.closed.cancelled().await;
            return Ok(());
        }
        self.detach();
        self.wake.notify_one();

        let task = self
            .delivery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.mark_closed();
        Ok(())
    }
}

/// Creates subscriptions and tears them down.
#[derive(Clone)]
pub struct NotificationHub {
    table: Arc<HandleTable>,
    depth: usize,
}

impl NotificationHub {
    pub fn new(table: Arc<HandleTable>, depth: usize) -> Self {
        Self { table, depth }
    }

    /// Subscribe to the notification selection `source` and stream its events
    /// to `listener`. Returns the new subscription's handle.
    pub async fn subscribe(
        &self,
        source: Handle,
        owner: Owner,
        listener: mpsc::Sender<ServerFrame>,
    ) -> Result<Handle, BridgeError> {
        let selection = self.table.require(source.get(), Operation::Subscribe)?;
        let sub = Arc::new(Subscription::new(source, self.depth));

        let sink = EventSink::new({
            let weak = Arc::downgrade(&sub);
            move |event| {
                if let Some(sub) = weak.upgrade() {
                    sub.push(event);
                }
            }
        });
        let guard = selection.adapter().subscribe(sink).await?;
        *sub.guard.lock().unwrap_or_else(PoisonError::into_inner) = Some(guard);

        let hnd = self
            .table
            .allocate(BridgedObject::Subscription(sub.clone()), owner);
        let task = tokio::spawn(sub.clone().deliver(hnd, listener));
        *sub.delivery.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        tracing::debug!(subscription = %hnd, source = %source, "Subscribed");
        Ok(hnd)
    }

    /// Drain and close a subscription, then release its handle. The caller
    /// acknowledges only after this returns, so the ack trails every flushed
    /// event on the listener.
    pub async fn unsubscribe(&self, hnd: Handle) -> Result<(), BridgeError> {
        let object = self.table.require(hnd.get(), Operation::Unsubscribe)?;
        object.adapter().unsubscribe().await?;
        // Already gone if the connection dropped or a concurrent unsubscribe
        // released it first.
        let _ = self.table.release(hnd);
        tracing::debug!(subscription = %hnd, "Unsubscribed");
        Ok(())
    }

    pub fn open(&self) -> usize {
        self.table.count_kind(ObjectKind::Subscription)
    }
}
