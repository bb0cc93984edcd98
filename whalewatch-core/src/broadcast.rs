//! Multi-client event fan-out.
//!
//! Every [`SessionHandle`] owns a bounded queue. [`EventBroadcaster::publish`] stamps an event
//! with the next sequence number and copies it into every active queue while holding the
//! registry lock, so all sessions observe the same relative order. A full queue evicts its
//! oldest event (drop-oldest) and counts it as lost for that session only: the publisher never
//! waits on a consumer.
//!
//! Session lifecycle:
//!
//! ```text
//! Active --unsubscribe/drop/close_all--> Draining --queue consumed or grace elapsed--> Closed
//! ```

use crate::event::{BroadcastEvent, EventKind};
use derive_more::{Display, From};
use fnv::FnvHashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, info};

/// Unique identifier of a client session.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, From)]
pub struct SessionId(pub u64);

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Active,
    Draining,
    Closed,
}

#[derive(Debug)]
struct QueueInner {
    events: VecDeque<BroadcastEvent>,
    state: SessionState,
    lost: u64,
    drain_deadline: Option<Instant>,
}

impl QueueInner {
    fn close(&mut self) {
        self.state = SessionState::Closed;
        self.drain_deadline = None;
        self.events = VecDeque::new();
    }
}

#[derive(Debug)]
struct SessionQueue {
    id: SessionId,
    capacity: usize,
    inner: Mutex<QueueInner>,
    /// Wakes the session's consumer.
    readable: Notify,
    /// Wakes anyone waiting for the session to close.
    closed: Notify,
}

impl SessionQueue {
    fn new(id: SessionId, capacity: usize, replay: impl Iterator<Item = BroadcastEvent>) -> Self {
        let mut events = VecDeque::with_capacity(capacity);
        events.extend(replay);
        while events.len() > capacity {
            events.pop_front();
        }

        Self {
            id,
            capacity,
            inner: Mutex::new(QueueInner {
                events,
                state: SessionState::Active,
                lost: 0,
                drain_deadline: None,
            }),
            readable: Notify::new(),
            closed: Notify::new(),
        }
    }

    /// Enqueue without ever blocking on the consumer. Returns the number of lost events if the
    /// push evicted the oldest queued event.
    fn push(&self, event: BroadcastEvent) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Active {
            return None;
        }

        let evicted = if inner.events.len() >= self.capacity {
            inner.events.pop_front();
            inner.lost += 1;
            Some(inner.lost)
        } else {
            None
        };
        inner.events.push_back(event);
        drop(inner);

        self.readable.notify_one();
        evicted
    }

    /// Stop accepting events. Returns `true` if queued events keep the session in `Draining`.
    fn begin_drain(&self, grace: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Active {
            return false;
        }

        if inner.events.is_empty() {
            inner.close();
            drop(inner);
            self.notify_closed();
            false
        } else {
            inner.state = SessionState::Draining;
            inner.drain_deadline = Some(Instant::now() + grace);
            drop(inner);
            self.readable.notify_one();
            true
        }
    }

    /// Close the session once `grace` elapses, whether or not its consumer is still polling.
    fn close_after(self: Arc<Self>, grace: Duration) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if self.inner.lock().state == SessionState::Draining {
                        debug!(session = %self.id, "drain grace period elapsed, closing session");
                    }
                    self.close();
                });
            }
            // No timer available to enforce the deadline
            Err(_) => self.close(),
        }
    }

    fn close(&self) {
        let was_open = {
            let mut inner = self.inner.lock();
            let was_open = inner.state != SessionState::Closed;
            inner.close();
            was_open
        };

        if was_open {
            self.notify_closed();
        }
    }

    fn notify_closed(&self) {
        self.readable.notify_one();
        self.closed.notify_waiters();
    }

    /// Non-blocking dequeue following the lifecycle rules.
    fn poll_event(&self) -> Dequeue {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Closed => return Dequeue::Closed,
            SessionState::Draining
                if inner
                    .drain_deadline
                    .is_some_and(|deadline| Instant::now() >= deadline) =>
            {
                inner.close();
                drop(inner);
                self.notify_closed();
                return Dequeue::Closed;
            }
            _ => {}
        }

        if let Some(event) = inner.events.pop_front() {
            return Dequeue::Ready(event);
        }

        if inner.state == SessionState::Draining {
            inner.close();
            drop(inner);
            self.notify_closed();
            return Dequeue::Closed;
        }

        Dequeue::Empty
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().state == SessionState::Closed
    }

    async fn wait_closed(&self) {
        loop {
            let notified = self.closed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

enum Dequeue {
    Ready(BroadcastEvent),
    Empty,
    Closed,
}

#[derive(Debug, Default)]
struct Registry {
    next_sequence: u64,
    sessions: FnvHashMap<SessionId, Arc<SessionQueue>>,
    /// Unsubscribed sessions still holding queued events.
    draining: Vec<Weak<SessionQueue>>,
    replay: VecDeque<BroadcastEvent>,
    closed: bool,
}

impl Registry {
    fn draining(&mut self) -> impl Iterator<Item = Arc<SessionQueue>> + '_ {
        self.draining
            .retain(|queue| queue.upgrade().is_some_and(|queue| !queue.is_closed()));
        self.draining.iter().filter_map(Weak::upgrade)
    }
}

/// Fan-out hub delivering every published event to all registered sessions.
#[derive(Debug)]
pub struct EventBroadcaster {
    capacity: usize,
    replay_size: usize,
    drain_grace: Duration,
    next_session_id: AtomicU64,
    registry: Mutex<Registry>,
}

impl EventBroadcaster {
    /// Construct a broadcaster whose sessions each queue at most `capacity` events.
    pub fn new(capacity: usize, replay_size: usize, drain_grace: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            replay_size,
            drain_grace,
            next_session_id: AtomicU64::new(1),
            registry: Mutex::new(Registry {
                next_sequence: 1,
                ..Default::default()
            }),
        }
    }

    /// Stamp `kind` with the next sequence number and copy it into every active session queue.
    ///
    /// Returns the sequence number assigned to the event.
    pub fn publish(&self, kind: impl Into<EventKind>) -> u64 {
        let mut registry = self.registry.lock();

        let sequence = registry.next_sequence;
        registry.next_sequence += 1;
        let event = BroadcastEvent {
            sequence,
            kind: kind.into(),
        };

        for queue in registry.sessions.values() {
            if let Some(lost) = queue.push(event.clone()) {
                debug!(
                    session = %queue.id,
                    sequence,
                    lost,
                    "session queue full, evicted oldest event"
                );
            }
        }

        if self.replay_size > 0 {
            if registry.replay.len() >= self.replay_size {
                registry.replay.pop_front();
            }
            registry.replay.push_back(event);
        }

        sequence
    }

    /// Register a new session. Its queue starts with the recent replay window.
    pub fn subscribe(self: &Arc<Self>) -> SessionHandle {
        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let mut registry = self.registry.lock();

        let queue = Arc::new(SessionQueue::new(
            id,
            self.capacity,
            registry.replay.iter().cloned(),
        ));

        if registry.closed {
            queue.close();
        } else {
            registry.sessions.insert(id, Arc::clone(&queue));
            info!(session = %id, sessions = registry.sessions.len(), "session subscribed");
        }

        SessionHandle {
            id,
            queue,
            broadcaster: Arc::downgrade(self),
        }
    }

    /// Stop delivering to a session. Already queued events stay consumable until drained or the
    /// grace period elapses.
    ///
    /// A session left `Draining` is closed and its queue freed once the grace period elapses,
    /// even if its consumer has stalled. Requires a tokio runtime to enforce the deadline,
    /// otherwise a session with queued events is closed immediately.
    pub fn unsubscribe(&self, id: SessionId) {
        if let Some(queue) = self.remove(id) {
            if queue.begin_drain(self.drain_grace) {
                self.registry.lock().draining.push(Arc::downgrade(&queue));
                queue.close_after(self.drain_grace);
            }
            info!(session = %id, "session unsubscribed");
        }
    }

    fn remove(&self, id: SessionId) -> Option<Arc<SessionQueue>> {
        self.registry.lock().sessions.remove(&id)
    }

    /// Drain every session, wait up to the grace period for consumers to finish, then close
    /// whatever remains. No new sessions become active afterwards.
    pub async fn close_all(&self) {
        let queues = {
            let mut registry = self.registry.lock();
            registry.closed = true;
            registry.replay.clear();
            let draining = registry.draining().collect::<Vec<_>>();
            registry.draining.clear();
            registry
                .sessions
                .drain()
                .map(|(_, queue)| queue)
                .chain(draining)
                .collect::<Vec<_>>()
        };

        if queues.is_empty() {
            return;
        }

        info!(sessions = queues.len(), grace = ?self.drain_grace, "draining all sessions");

        for queue in &queues {
            queue.begin_drain(self.drain_grace);
        }

        let drained = join_all(queues.iter().map(|queue| queue.wait_closed()));
        if tokio::time::timeout(self.drain_grace, drained).await.is_err() {
            debug!("drain grace period elapsed, closing remaining sessions");
        }

        for queue in &queues {
            queue.close();
        }
    }

    pub fn session_count(&self) -> usize {
        self.registry.lock().sessions.len()
    }

    /// Number of events published so far.
    pub fn published(&self) -> u64 {
        self.registry.lock().next_sequence - 1
    }

    /// Total events currently buffered across all session queues, draining ones included, and
    /// the replay window.
    pub fn buffered(&self) -> usize {
        let mut registry = self.registry.lock();
        let draining = registry.draining().collect::<Vec<_>>();
        let queued = registry
            .sessions
            .values()
            .chain(draining.iter())
            .map(|queue| queue.inner.lock().events.len())
            .sum::<usize>();
        registry.replay.len() + queued
    }
}

/// Consumer side of one client session.
///
/// Dropping the handle unsubscribes and frees the queue, so a transport task that errors out or
/// is aborted always releases its session.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    queue: Arc<SessionQueue>,
    broadcaster: Weak<EventBroadcaster>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Wait for the next event. Returns `None` once the session is closed.
    pub async fn next_event(&mut self) -> Option<BroadcastEvent> {
        loop {
            match self.queue.poll_event() {
                Dequeue::Ready(event) => return Some(event),
                Dequeue::Closed => return None,
                Dequeue::Empty => self.queue.readable.notified().await,
            }
        }
    }

    /// Dequeue without waiting.
    pub fn try_next_event(&mut self) -> Option<BroadcastEvent> {
        match self.queue.poll_event() {
            Dequeue::Ready(event) => Some(event),
            Dequeue::Empty | Dequeue::Closed => None,
        }
    }

    /// Events evicted from this session's queue because the consumer fell behind.
    pub fn lost_events(&self) -> u64 {
        self.queue.inner.lock().lost
    }

    pub fn pending(&self) -> usize {
        self.queue.inner.lock().events.len()
    }

    pub fn state(&self) -> SessionState {
        self.queue.inner.lock().state
    }

    /// Stop receiving new events while keeping queued ones consumable.
    pub fn unsubscribe(&self) {
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            broadcaster.unsubscribe(self.id);
        } else {
            self.queue.begin_drain(Duration::ZERO);
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(broadcaster) = self.broadcaster.upgrade() {
            if broadcaster.remove(self.id).is_some() {
                info!(session = %self.id, "session handle dropped");
            }
        }
        self.queue.close();
    }
}
