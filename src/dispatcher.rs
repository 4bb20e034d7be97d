//! Concurrent fan-out of decoded events to registered listeners

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, trace, warn};

use crate::constants::{DEFAULT_DISPATCH_WORKERS, MAX_EVENT_QUEUE_SIZE, WILDCARD_EVENT};
use crate::error::{EslError, EslResult};
use crate::event::EslEvent;

/// Callback invoked for every matching event.
pub type Listener = Arc<dyn Fn(&EslEvent) + Send + Sync>;

/// Worker pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Deliveries running at once. Default: 8.
    pub workers: usize,
    /// Deliveries queued before `dispatch` waits. Default: 1000.
    pub backlog: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_DISPATCH_WORKERS,
            backlog: MAX_EVENT_QUEUE_SIZE,
        }
    }
}

#[derive(Default)]
struct Registry {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
}

impl Registry {
    /// Wildcard listeners first, then the ones registered for `name`.
    fn snapshot(&self, name: &str) -> Vec<Listener> {
        let listeners = self
            .listeners
            .read();
        let mut matched = Vec::new();
        if let Some(wildcard) = listeners.get(WILDCARD_EVENT) {
            matched.extend(
                wildcard
                    .iter()
                    .cloned(),
            );
        }
        if name != WILDCARD_EVENT {
            if let Some(named) = listeners.get(name) {
                matched.extend(
                    named
                        .iter()
                        .cloned(),
                );
            }
        }
        matched
    }

    fn deliver(&self, event: &EslEvent) {
        let listeners = self.snapshot(event.name());
        trace!(
            "[DISPATCH] Delivering {} to {} listeners",
            event.name(),
            listeners.len()
        );
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!("[DISPATCH] Listener for {} panicked", event.name());
            }
        }
    }
}

async fn worker_loop(
    id: usize,
    registry: Arc<Registry>,
    queue: Arc<Mutex<mpsc::Receiver<Arc<EslEvent>>>>,
) {
    loop {
        let next = queue
            .lock()
            .await
            .recv()
            .await;
        let Some(event) = next else {
            break;
        };
        let registry = Arc::clone(&registry);
        if let Err(e) = tokio::task::spawn_blocking(move || registry.deliver(&event)).await {
            error!("[DISPATCH] Worker {} delivery failed: {}", id, e);
        }
    }
    debug!("[DISPATCH] Worker {} exiting", id);
}

/// Delivers events to listeners on a fixed set of worker tasks.
///
/// Listeners registered under `"*"` see every event. Within one delivery,
/// wildcard listeners run before named ones, each group in registration
/// order. A panicking listener is logged and skipped. There is no ordering
/// between different events.
///
/// Listeners run on tokio's blocking thread pool, so a slow listener holds a
/// worker but never a runtime thread.
pub struct EventDispatcher {
    registry: Arc<Registry>,
    queue: mpsc::Sender<Arc<EslEvent>>,
    dropped_events: AtomicU64,
}

impl EventDispatcher {
    /// Spawn `config.workers` delivery tasks. Must be called within a tokio
    /// runtime.
    pub fn new(config: DispatcherConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.backlog.max(1));
        let registry = Arc::new(Registry::default());
        let rx = Arc::new(Mutex::new(rx));

        for id in 0..config.workers.max(1) {
            tokio::spawn(worker_loop(id, Arc::clone(&registry), Arc::clone(&rx)));
        }

        Self {
            registry,
            queue: tx,
            dropped_events: AtomicU64::new(0),
        }
    }

    /// Add a listener for `name`, or for every event with `"*"`.
    pub fn register<F>(&self, name: impl Into<String>, listener: F)
    where
        F: Fn(&EslEvent) + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("[DISPATCH] Registering listener for {}", name);
        self.registry
            .listeners
            .write()
            .entry(name)
            .or_default()
            .push(Arc::new(listener));
    }

    /// Number of listeners registered under exactly `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        self.registry
            .listeners
            .read()
            .get(name)
            .map_or(0, Vec::len)
    }

    /// Queue one delivery, waiting only while the backlog is full.
    ///
    /// The event name is taken from the `Event-Name` header when present.
    pub async fn dispatch(&self, mut event: EslEvent) -> EslResult<()> {
        event.resolve_name();
        self.submit(Arc::new(event))
            .await
    }

    /// Queue one delivery without waiting.
    ///
    /// When the backlog is full the event is dropped, counted, and
    /// [`EslError::QueueFull`] is returned.
    pub fn try_dispatch(&self, mut event: EslEvent) -> EslResult<()> {
        event.resolve_name();
        match self
            .queue
            .try_send(Arc::new(event))
        {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped_events
                    .fetch_add(1, Ordering::Relaxed);
                warn!("[DISPATCH] Event queue full, dropping {}", event.name());
                Err(EslError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EslError::DispatcherClosed),
        }
    }

    pub(crate) async fn submit(&self, event: Arc<EslEvent>) -> EslResult<()> {
        self.queue
            .send(event)
            .await
            .map_err(|_| EslError::DispatcherClosed)
    }

    /// Events dropped by [`try_dispatch`](Self::try_dispatch).
    pub fn dropped_event_count(&self) -> u64 {
        self.dropped_events
            .load(Ordering::Relaxed)
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field(
                "queued",
                &(self
                    .queue
                    .max_capacity()
                    - self
                        .queue
                        .capacity()),
            )
            .field("dropped_events", &self.dropped_event_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    fn named(name: &str) -> EslEvent {
        let mut event = EslEvent::new();
        event.set_header("Event-Name", name);
        event
    }

    #[tokio::test]
    async fn test_wildcard_runs_before_named_listeners() {
        let dispatcher = EventDispatcher::new(DispatcherConfig {
            workers: 1,
            backlog: 8,
        });
        let order = Arc::new(StdMutex::new(Vec::new()));
        let (done_tx, mut done_rx) = unbounded_channel();

        let o = Arc::clone(&order);
        dispatcher.register("X", move |_| {
            o.lock()
                .unwrap()
                .push("x1")
        });
        let o = Arc::clone(&order);
        dispatcher.register("*", move |_| {
            o.lock()
                .unwrap()
                .push("w")
        });
        let o = Arc::clone(&order);
        dispatcher.register("X", move |_| {
            o.lock()
                .unwrap()
                .push("x2");
            let _ = done_tx.send(());
        });

        dispatcher
            .dispatch(named("X"))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["w", "x1", "x2"]);
    }

    #[tokio::test]
    async fn test_name_comes_from_event_name_header() {
        let dispatcher = EventDispatcher::default();
        let (tx, mut rx) = unbounded_channel();
        dispatcher.register("CHANNEL_ANSWER", move |event| {
            let _ = tx.send(
                event
                    .name()
                    .to_string(),
            );
        });

        let mut event = EslEvent::with_name("SOMETHING_ELSE");
        event.set_header("Event-Name", "CHANNEL_ANSWER");
        dispatcher
            .dispatch(event)
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "CHANNEL_ANSWER");
    }

    #[tokio::test]
    async fn test_panicking_listener_is_isolated() {
        let dispatcher = EventDispatcher::new(DispatcherConfig {
            workers: 1,
            backlog: 8,
        });
        let (tx, mut rx) = unbounded_channel();
        dispatcher.register("BOOM", |_| panic!("listener failure"));
        dispatcher.register("BOOM", move |_| {
            let _ = tx.send(());
        });

        for _ in 0..2 {
            dispatcher
                .dispatch(named("BOOM"))
                .await
                .unwrap();
        }
        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_try_dispatch_drops_when_backlog_full() {
        let dispatcher = EventDispatcher::new(DispatcherConfig {
            workers: 1,
            backlog: 1,
        });
        let gate = Arc::new(std::sync::Barrier::new(2));
        let (started_tx, mut started_rx) = unbounded_channel();

        let g = Arc::clone(&gate);
        dispatcher.register("SLOW", move |_| {
            let _ = started_tx.send(());
            g.wait();
        });

        // first event occupies the only worker
        dispatcher
            .try_dispatch(named("SLOW"))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), started_rx.recv())
            .await
            .unwrap();

        // second fills the backlog, third overflows
        dispatcher
            .try_dispatch(named("SLOW"))
            .unwrap();
        assert!(matches!(
            dispatcher.try_dispatch(named("SLOW")),
            Err(EslError::QueueFull)
        ));
        assert_eq!(dispatcher.dropped_event_count(), 1);

        let g = Arc::clone(&gate);
        tokio::task::spawn_blocking(move || g.wait())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), started_rx.recv())
            .await
            .unwrap();
        tokio::task::spawn_blocking(move || gate.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_blocking_listener_does_not_stall_runtime() {
        let dispatcher = EventDispatcher::default();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = StdMutex::new(release_rx);
        let (done_tx, mut done_rx) = unbounded_channel();

        dispatcher.register("SLOW", move |_| {
            let released = release_rx
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(2))
                .is_ok();
            let _ = done_tx.send(released);
        });
        dispatcher
            .dispatch(named("SLOW"))
            .await
            .unwrap();

        // this task must keep running while the listener blocks
        tokio::time::sleep(Duration::from_millis(50)).await;
        release_tx
            .send(())
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_secs(3), done_rx.recv())
                .await
                .unwrap()
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_listener_count() {
        let dispatcher = EventDispatcher::default();
        assert_eq!(dispatcher.listener_count("HEARTBEAT"), 0);
        dispatcher.register("HEARTBEAT", |_| {});
        dispatcher.register("HEARTBEAT", |_| {});
        dispatcher.register("*", |_| {});
        assert_eq!(dispatcher.listener_count("HEARTBEAT"), 2);
        assert_eq!(dispatcher.listener_count("*"), 1);
    }
}
