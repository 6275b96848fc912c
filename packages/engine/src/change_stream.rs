use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;

use futures_util::future::poll_fn;
use futures_util::task::AtomicWaker;
use serde_json::Value as JsonValue;

use crate::operation::Operation;

const MAX_PENDING_EVENTS_PER_LISTENER: usize = 256;

/// One flushed batch as observed by listeners. `old_value` is the deep clone
/// captured at the start of the turn; the initial event delivered on
/// subscription carries no old value and no operations.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub revision: u64,
    pub new_value: Option<JsonValue>,
    pub old_value: Option<JsonValue>,
    pub operations: Vec<Operation>,
}

impl ChangeEvent {
    pub fn is_initial(&self) -> bool {
        self.old_value.is_none() && self.operations.is_empty()
    }
}

pub struct ChangeStream {
    listener_id: u64,
    queue: Arc<ListenerQueue>,
    bus: Arc<ChangeBus>,
    closed: AtomicBool,
}

impl ChangeStream {
    /// Synchronous poll; returns immediately whether or not an event is
    /// pending. The initial subscription event is observable here without
    /// awaiting.
    pub fn try_next(&self) -> Option<ChangeEvent> {
        self.queue.try_pop()
    }

    pub async fn next(&self) -> Option<ChangeEvent> {
        poll_fn(|cx| {
            if let Some(event) = self.queue.try_pop() {
                return Poll::Ready(Some(event));
            }
            if self.closed.load(Ordering::SeqCst) {
                return Poll::Ready(None);
            }
            self.queue.waker.register(cx.waker());
            if let Some(event) = self.queue.try_pop() {
                return Poll::Ready(Some(event));
            }
            if self.closed.load(Ordering::SeqCst) {
                return Poll::Ready(None);
            }
            Poll::Pending
        })
        .await
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bus.unsubscribe(self.listener_id);
        self.queue.waker.wake();
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Default)]
pub(crate) struct ChangeBus {
    inner: Mutex<ChangeBusInner>,
}

#[derive(Default)]
struct ChangeBusInner {
    next_listener_id: u64,
    listeners: HashMap<u64, Arc<ListenerQueue>>,
}

impl ChangeBus {
    /// Registers a listener. When `initial` is given (replicant already
    /// declared), the event is seeded into the new listener's queue alone, so
    /// it is delivered exactly once and never re-armed.
    pub(crate) fn subscribe(self: &Arc<Self>, initial: Option<ChangeEvent>) -> ChangeStream {
        let queue = Arc::new(ListenerQueue::default());
        if let Some(event) = initial {
            queue.queue.lock().unwrap().push_back(event);
        }

        let mut inner = self.inner.lock().unwrap();
        let listener_id = inner.next_listener_id;
        inner.next_listener_id = inner.next_listener_id.saturating_add(1);
        inner.listeners.insert(listener_id, Arc::clone(&queue));
        drop(inner);

        ChangeStream {
            listener_id,
            queue,
            bus: Arc::clone(self),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn emit(&self, event: ChangeEvent) {
        let listeners: Vec<Arc<ListenerQueue>> = {
            let inner = self.inner.lock().unwrap();
            inner.listeners.values().cloned().collect()
        };
        for listener in listeners {
            listener.push(event.clone());
        }
    }

    fn unsubscribe(&self, listener_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.remove(&listener_id);
    }
}

#[derive(Default)]
struct ListenerQueue {
    queue: Mutex<VecDeque<ChangeEvent>>,
    waker: AtomicWaker,
}

impl ListenerQueue {
    fn try_pop(&self) -> Option<ChangeEvent> {
        let mut queue = self.queue.lock().unwrap();
        queue.pop_front()
    }

    fn push(&self, event: ChangeEvent) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= MAX_PENDING_EVENTS_PER_LISTENER {
            tracing::warn!("change listener queue overflow; dropping oldest batch");
            queue.pop_front();
        }
        queue.push_back(event);
        drop(queue);
        self.waker.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(revision: u64) -> ChangeEvent {
        ChangeEvent {
            revision,
            new_value: Some(json!({"n": revision})),
            old_value: Some(json!({"n": revision - 1})),
            operations: Vec::new(),
        }
    }

    #[test]
    fn seeded_initial_event_is_delivered_once() {
        let bus = Arc::new(ChangeBus::default());
        let stream = bus.subscribe(Some(ChangeEvent {
            revision: 0,
            new_value: Some(json!({"n": 0})),
            old_value: None,
            operations: Vec::new(),
        }));

        let initial = stream.try_next().unwrap();
        assert!(initial.is_initial());
        assert!(stream.try_next().is_none());

        bus.emit(event(1));
        assert_eq!(stream.try_next().unwrap().revision, 1);
        assert!(stream.try_next().is_none());
    }

    #[test]
    fn emit_fans_out_to_every_listener() {
        let bus = Arc::new(ChangeBus::default());
        let first = bus.subscribe(None);
        let second = bus.subscribe(None);

        bus.emit(event(1));
        assert_eq!(first.try_next().unwrap().revision, 1);
        assert_eq!(second.try_next().unwrap().revision, 1);
    }

    #[test]
    fn closed_listener_stops_receiving() {
        let bus = Arc::new(ChangeBus::default());
        let stream = bus.subscribe(None);
        stream.close();
        bus.emit(event(1));
        assert!(stream.try_next().is_none());
    }

    #[test]
    fn overflow_drops_oldest() {
        let bus = Arc::new(ChangeBus::default());
        let stream = bus.subscribe(None);
        for revision in 0..(MAX_PENDING_EVENTS_PER_LISTENER as u64 + 10) {
            bus.emit(event(revision + 1));
        }
        assert_eq!(stream.try_next().unwrap().revision, 11);
    }

    #[tokio::test]
    async fn next_wakes_on_emit() {
        let bus = Arc::new(ChangeBus::default());
        let stream = bus.subscribe(None);

        let emitter = Arc::clone(&bus);
        let handle = tokio::spawn(async move {
            emitter.emit(event(1));
        });

        let received = stream.next().await.unwrap();
        assert_eq!(received.revision, 1);
        handle.await.unwrap();
    }
}
