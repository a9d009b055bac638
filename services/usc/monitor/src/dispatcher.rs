//! Asynchronous event dispatch.
//!
//! [`EventDispatcher::publish`] only enqueues. A fixed set of worker tasks
//! drains the queues and calls every registered listener. Events are routed to
//! a worker by device id, so all events for one device are delivered in the
//! order they were published.

use crate::event::MonitorEvent;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Receives monitor events
#[async_trait]
pub trait MonitorListener: Send + Sync {
    /// Name used when reporting listener failures
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Handle one event
    ///
    /// Errors and panics are logged by the dispatcher and never reach the
    /// publisher.
    async fn on_event(&self, event: Arc<MonitorEvent>) -> anyhow::Result<()>;
}

/// Handle returned by [`EventDispatcher::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type ListenerMap = DashMap<ListenerId, Arc<dyn MonitorListener>>;

/// Fans events out to listeners on a bounded worker pool
pub struct EventDispatcher {
    listeners: Arc<ListenerMap>,
    next_listener: AtomicU64,
    queues: Mutex<Vec<mpsc::UnboundedSender<Arc<MonitorEvent>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    published: AtomicU64,
}

impl EventDispatcher {
    /// Create a dispatcher with `workers` worker tasks (at least one)
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(workers: usize) -> Self {
        let worker_count = workers.max(1);
        let listeners: Arc<ListenerMap> = Arc::new(DashMap::new());

        let mut queues = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.push(tx);
            handles.push(tokio::spawn(run_worker(index, rx, listeners.clone())));
        }

        debug!("Started event dispatcher with {} workers", worker_count);

        Self {
            listeners,
            next_listener: AtomicU64::new(1),
            queues: Mutex::new(queues),
            workers: Mutex::new(handles),
            worker_count,
            published: AtomicU64::new(0),
        }
    }

    /// Register a listener
    pub fn add_listener(&self, listener: Arc<dyn MonitorListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        debug!("Registered monitor listener {} as {:?}", listener.name(), id);
        self.listeners.insert(id, listener);
        id
    }

    /// Unregister a listener; returns whether it was registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Number of worker tasks
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Number of events accepted so far
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Queue an event for delivery; never waits for listeners
    pub fn publish(&self, event: MonitorEvent) {
        let index = self.worker_for(&event.device_id);
        let queues = match self.queues.lock() {
            Ok(queues) => queues,
            Err(poisoned) => poisoned.into_inner(),
        };

        match queues.get(index) {
            Some(queue) => {
                if queue.send(Arc::new(event)).is_ok() {
                    self.published.fetch_add(1, Ordering::Relaxed);
                } else {
                    warn!("Event worker {} is gone, dropping event", index);
                }
            }
            None => debug!(
                "Dispatcher shut down, dropping {} event for {}",
                event.kind.name(),
                event.device_id
            ),
        }
    }

    /// Stop accepting events and wait for queued ones to be delivered
    pub async fn shutdown(&self) {
        {
            let mut queues = match self.queues.lock() {
                Ok(queues) => queues,
                Err(poisoned) => poisoned.into_inner(),
            };
            queues.clear();
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = match self.workers.lock() {
                Ok(workers) => workers,
                Err(poisoned) => poisoned.into_inner(),
            };
            workers.drain(..).collect()
        };

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Event worker terminated abnormally: {}", e);
            }
        }
        debug!("Event dispatcher stopped");
    }

    fn worker_for(&self, device_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        device_id.hash(&mut hasher);
        (hasher.finish() % self.worker_count as u64) as usize
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("workers", &self.worker_count)
            .field("listeners", &self.listeners.len())
            .field("published", &self.published_count())
            .finish()
    }
}

async fn run_worker(
    index: usize,
    mut rx: mpsc::UnboundedReceiver<Arc<MonitorEvent>>,
    listeners: Arc<ListenerMap>,
) {
    while let Some(event) = rx.recv().await {
        // Snapshot so no map guard is held across an await
        let targets: Vec<Arc<dyn MonitorListener>> =
            listeners.iter().map(|entry| entry.value().clone()).collect();

        for listener in targets {
            let outcome = AssertUnwindSafe(listener.on_event(event.clone()))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    "Listener {} failed on {} event for {}: {}",
                    listener.name(),
                    event.kind.name(),
                    event.device_id,
                    e
                ),
                Err(_) => error!(
                    "Listener {} panicked on {} event for {}",
                    listener.name(),
                    event.kind.name(),
                    event.device_id
                ),
            }
        }
    }
    debug!("Event worker {} exiting", index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::listener::ForwardingListener;
    use std::time::Duration;

    struct FailingListener;

    #[async_trait]
    impl MonitorListener for FailingListener {
        async fn on_event(&self, _event: Arc<MonitorEvent>) -> anyhow::Result<()> {
            anyhow::bail!("listener rejected event")
        }
    }

    struct PanickingListener;

    #[async_trait]
    impl MonitorListener for PanickingListener {
        async fn on_event(&self, _event: Arc<MonitorEvent>) -> anyhow::Result<()> {
            panic!("listener bug");
        }
    }

    struct SlowListener;

    #[async_trait]
    impl MonitorListener for SlowListener {
        async fn on_event(&self, _event: Arc<MonitorEvent>) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn transaction(device: &str, seq: u64) -> MonitorEvent {
        MonitorEvent::new(
            device,
            EventKind::SessionTransaction {
                session_id: 1,
                bytes_in: seq,
                bytes_out: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_delivers_to_all_listeners() {
        let dispatcher = EventDispatcher::new(2);
        let (first, mut first_rx) = ForwardingListener::new();
        let (second, mut second_rx) = ForwardingListener::new();
        dispatcher.add_listener(Arc::new(first));
        dispatcher.add_listener(Arc::new(second));

        dispatcher.publish(MonitorEvent::new("dev-a", EventKind::ChannelClose));

        assert_eq!(first_rx.recv().await.unwrap().device_id, "dev-a");
        assert_eq!(second_rx.recv().await.unwrap().device_id, "dev-a");
        assert_eq!(dispatcher.published_count(), 1);
    }

    #[tokio::test]
    async fn test_per_device_order() {
        let dispatcher = EventDispatcher::new(4);
        let (listener, mut rx) = ForwardingListener::new();
        dispatcher.add_listener(Arc::new(listener));

        for seq in 0..50 {
            dispatcher.publish(transaction("dev-a", seq));
            dispatcher.publish(transaction("dev-b", seq));
        }

        let mut next = std::collections::HashMap::new();
        for _ in 0..100 {
            let event = rx.recv().await.unwrap();
            if let EventKind::SessionTransaction { bytes_in, .. } = event.kind {
                let expected = next.entry(event.device_id.clone()).or_insert(0u64);
                assert_eq!(bytes_in, *expected);
                *expected += 1;
            }
        }
    }

    #[tokio::test]
    async fn test_listener_failures_are_isolated() {
        let dispatcher = EventDispatcher::new(1);
        dispatcher.add_listener(Arc::new(FailingListener));
        dispatcher.add_listener(Arc::new(PanickingListener));
        let (listener, mut rx) = ForwardingListener::new();
        dispatcher.add_listener(Arc::new(listener));

        dispatcher.publish(MonitorEvent::new("dev", EventKind::ChannelClose));
        dispatcher.publish(MonitorEvent::new("dev", EventKind::ChannelClose));

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_does_not_wait_for_listeners() {
        let dispatcher = EventDispatcher::new(1);
        dispatcher.add_listener(Arc::new(SlowListener));

        for seq in 0..1000 {
            dispatcher.publish(transaction("dev", seq));
        }
        assert_eq!(dispatcher.published_count(), 1000);
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let dispatcher = EventDispatcher::new(1);
        let (listener, mut rx) = ForwardingListener::new();
        let id = dispatcher.add_listener(Arc::new(listener));
        assert_eq!(dispatcher.listener_count(), 1);

        assert!(dispatcher.remove_listener(id));
        assert!(!dispatcher.remove_listener(id));

        dispatcher.publish(MonitorEvent::new("dev", EventKind::ChannelClose));
        dispatcher.shutdown().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_stops() {
        let dispatcher = EventDispatcher::new(3);
        let (listener, mut rx) = ForwardingListener::new();
        dispatcher.add_listener(Arc::new(listener));

        dispatcher.publish(MonitorEvent::new("dev", EventKind::ChannelClose));
        dispatcher.shutdown().await;
        dispatcher.publish(MonitorEvent::new("dev", EventKind::ChannelClose));

        assert!(rx.try_recv().is_ok());
        assert_eq!(dispatcher.published_count(), 1);
    }
}
