//! Bounded pool of authenticated transports

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::PoolConfig;
use crate::error::{EslError, EslResult};
use crate::transport::Transport;

/// One unit of pool capacity, owned by the transport that uses it.
///
/// Registered in the open count on creation and released on drop, so a
/// transport that is never returned still gives its capacity back.
pub(crate) struct Slot {
    _permit: OwnedSemaphorePermit,
    open: Arc<AtomicUsize>,
}

impl Slot {
    fn new(permit: OwnedSemaphorePermit, open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::AcqRel);
        Self {
            _permit: permit,
            open,
        }
    }
}

impl Slot {
    /// Whether this slot counts against the pool owning `open`.
    pub(crate) fn belongs_to(&self, open: &Arc<AtomicUsize>) -> bool {
        Arc::ptr_eq(&self.open, open)
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        // runs before the permit field is released
        self.open
            .fetch_sub(1, Ordering::AcqRel);
    }
}

/// Point-in-time pool counters. Best effort; fields are read separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Transports in existence, including checked-out ones and dials in flight.
    pub open_connections: usize,
    pub idle_connections: usize,
    pub max_open: usize,
    pub max_idle: usize,
    /// `get` calls that had to wait.
    pub wait_count: u64,
    /// Total time those calls spent waiting.
    pub wait_duration: Duration,
}

struct PoolShared {
    config: Arc<PoolConfig>,
    idle: Mutex<VecDeque<Transport>>,
    slots: Arc<Semaphore>,
    open: Arc<AtomicUsize>,
    returned: Notify,
    shutdown: CancellationToken,
    wait_count: AtomicU64,
    wait_nanos: AtomicU64,
}

/// Adds the time spent blocked to the pool counters, even when the waiting
/// future is dropped by a deadline.
struct WaitGuard<'a> {
    shared: &'a PoolShared,
    started: Instant,
}

impl<'a> WaitGuard<'a> {
    fn start(shared: &'a PoolShared) -> Self {
        shared
            .wait_count
            .fetch_add(1, Ordering::Relaxed);
        Self {
            shared,
            started: Instant::now(),
        }
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let waited = u64::try_from(
            self.started
                .elapsed()
                .as_nanos(),
        )
        .unwrap_or(u64::MAX);
        self.shared
            .wait_nanos
            .fetch_add(waited, Ordering::Relaxed);
    }
}

impl PoolShared {
    fn is_closed(&self) -> bool {
        self.shutdown
            .is_cancelled()
    }

    fn pop_idle(&self) -> Option<Transport> {
        self.idle
            .lock()
            .pop_front()
    }

    async fn create(&self, permit: OwnedSemaphorePermit) -> EslResult<Transport> {
        let slot = Slot::new(permit, Arc::clone(&self.open));
        let mut transport = Transport::connect(Arc::clone(&self.config)).await?;
        transport.attach_slot(slot);
        debug!(
            "[POOL] Created transport {} (open={})",
            transport.id(),
            self.open
                .load(Ordering::Acquire)
        );
        Ok(transport)
    }

    async fn discard(&self, transport: Transport, reason: &str) {
        debug!("[POOL] Discarding transport {}: {}", transport.id(), reason);
        transport
            .close()
            .await;
    }

    async fn warm_up(&self) {
        let target = self
            .config
            .warm_up
            .min(
                self.config
                    .max_idle,
            );
        for _ in 0..target {
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                break;
            };
            match self
                .create(permit)
                .await
            {
                Ok(transport) => self
                    .idle
                    .lock()
                    .push_back(transport),
                Err(e) => warn!("[POOL] Warm-up connection failed: {}", e),
            }
        }
        debug!(
            "[POOL] Warm-up finished with {} idle transports",
            self.idle
                .lock()
                .len()
        );
    }

    async fn acquire(&self) -> EslResult<Transport> {
        let mut waiting: Option<WaitGuard<'_>> = None;

        loop {
            if self.is_closed() {
                return Err(EslError::PoolClosed);
            }

            // registered before the idle check so a put in between still wakes us
            let returned = self
                .returned
                .notified();
            tokio::pin!(returned);
            returned
                .as_mut()
                .enable();

            if let Some(transport) = self.pop_idle() {
                if transport
                    .is_valid()
                    .await
                {
                    trace!("[POOL] Reusing idle transport {}", transport.id());
                    return Ok(transport);
                }
                self.discard(transport, "failed liveness probe")
                    .await;
            }

            if let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() {
                return self
                    .create(permit)
                    .await;
            }

            if waiting.is_none() {
                trace!("[POOL] No transport available, waiting");
                waiting = Some(WaitGuard::start(self));
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(EslError::PoolClosed),
                permit = Arc::clone(&self.slots).acquire_owned() => {
                    let Ok(permit) = permit else {
                        return Err(EslError::PoolClosed);
                    };
                    return self.create(permit).await;
                }
                _ = &mut returned => {}
            }
        }
    }

    /// Put survivors of a scan back, oldest first. Returns what did not fit.
    fn restore(&self, survivors: Vec<Transport>) -> Vec<Transport> {
        let mut idle = self
            .idle
            .lock();
        if self.is_closed() {
            return survivors;
        }

        for transport in survivors
            .into_iter()
            .rev()
        {
            idle.push_front(transport);
        }

        let mut overflow = Vec::new();
        while idle.len()
            > self
                .config
                .max_idle
        {
            if let Some(transport) = idle.pop_back() {
                overflow.push(transport);
            }
        }
        overflow
    }

    /// Snapshot the idle set, drop expired (and, with `probe`, dead)
    /// entries, then restore the rest. Returns how many were discarded.
    ///
    /// The idle set looks empty while the scan runs; transports put back in
    /// the meantime stay and are merged with the survivors.
    async fn scan(&self, probe: bool) -> usize {
        let snapshot: Vec<Transport> = self
            .idle
            .lock()
            .drain(..)
            .collect();
        if snapshot.is_empty() {
            return 0;
        }

        let idle_timeout = self
            .config
            .idle_timeout;
        let mut survivors = Vec::with_capacity(snapshot.len());
        let mut discarded = 0;

        for transport in snapshot {
            if transport.idle_for() > idle_timeout {
                self.discard(transport, "idle timeout exceeded")
                    .await;
                discarded += 1;
            } else if probe
                && !transport
                    .is_valid()
                    .await
            {
                self.discard(transport, "failed health check")
                    .await;
                discarded += 1;
            } else {
                survivors.push(transport);
            }
        }

        let restored = survivors.len();
        for transport in self.restore(survivors) {
            self.discard(transport, "idle set full")
                .await;
            discarded += 1;
        }
        if restored > 0 {
            self.returned
                .notify_waiters();
        }
        discarded
    }
}

fn spawn_scan_loop(
    shared: Arc<PoolShared>,
    name: &'static str,
    period: Duration,
    probe: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // a cancelled scan drops its snapshot, which closes those sockets
            tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => break,
                discarded = shared.scan(probe) => {
                    if discarded > 0 {
                        debug!("[POOL] {} discarded {} idle transports", name, discarded);
                    }
                }
            }
        }
        debug!("[POOL] {} loop stopped", name);
    })
}

/// A bounded set of authenticated transports to one FreeSWITCH node.
///
/// At most `max_open` transports exist at any time, idle or checked out.
/// Callers borrow with [`get`](Self::get) and return with [`put`](Self::put);
/// a transport that is dropped instead of returned releases its capacity.
///
/// ```no_run
/// # async fn example() -> Result<(), freeswitch_esl_pool::EslError> {
/// use freeswitch_esl_pool::{Pool, PoolConfig};
///
/// let pool = Pool::new(PoolConfig::new("127.0.0.1", 8021)).await?;
/// let transport = pool.get().await?;
/// transport.write_frame(b"api status").await?;
/// let reply = transport.read_frame().await?;
/// pool.put(transport).await;
/// # drop(reply);
/// pool.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Pool {
    shared: Arc<PoolShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// Validate `config`, pre-create `warm_up` transports and start the
    /// health-check and eviction loops.
    ///
    /// Warm-up failures are logged and skipped. Must be called from within
    /// a tokio runtime.
    pub async fn new(config: PoolConfig) -> EslResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let shared = Arc::new(PoolShared {
            idle: Mutex::new(VecDeque::with_capacity(config.max_idle)),
            slots: Arc::new(Semaphore::new(config.max_open)),
            open: Arc::new(AtomicUsize::new(0)),
            returned: Notify::new(),
            shutdown: CancellationToken::new(),
            wait_count: AtomicU64::new(0),
            wait_nanos: AtomicU64::new(0),
            config,
        });

        shared
            .warm_up()
            .await;

        let tasks = vec![
            spawn_scan_loop(
                Arc::clone(&shared),
                "health check",
                shared
                    .config
                    .health_check_interval,
                true,
            ),
            spawn_scan_loop(
                Arc::clone(&shared),
                "eviction",
                shared
                    .config
                    .eviction_interval,
                false,
            ),
        ];

        info!(
            "[POOL] Pool for {} ready (max_open={}, max_idle={})",
            shared
                .config
                .addr(),
            shared
                .config
                .max_open,
            shared
                .config
                .max_idle
        );
        Ok(Self {
            shared,
            tasks: Mutex::new(tasks),
        })
    }

    /// Borrow a transport, waiting up to the configured `acquire_timeout`.
    pub async fn get(&self) -> EslResult<Transport> {
        self.get_timeout(
            self.shared
                .config
                .acquire_timeout,
        )
        .await
    }

    /// Borrow a transport, waiting at most `wait`.
    ///
    /// The deadline covers dialing a new transport as well as waiting for a
    /// free one.
    pub async fn get_timeout(&self, wait: Duration) -> EslResult<Transport> {
        match tokio::time::timeout(
            wait,
            self.shared
                .acquire(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                debug!("[POOL] Acquire timed out after {}ms", wait.as_millis());
                Err(EslError::PoolTimeout)
            }
        }
    }

    /// Borrow a transport, giving up with [`EslError::PoolTimeout`] when
    /// `cancel` fires.
    pub async fn get_with_cancel(&self, cancel: &CancellationToken) -> EslResult<Transport> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EslError::PoolTimeout),
            result = self.shared.acquire() => result,
        }
    }

    /// Return a borrowed transport.
    ///
    /// It is probed first; a dead transport, one returned after
    /// [`close`](Self::close), or one that does not fit in the idle set is
    /// closed and its capacity released. A transport this pool did not
    /// create is closed rather than adopted, since it holds no capacity.
    pub async fn put(&self, mut transport: Transport) {
        let shared = &self.shared;
        if !transport
            .slot()
            .is_some_and(|slot| slot.belongs_to(&shared.open))
        {
            shared
                .discard(transport, "not created by this pool")
                .await;
            return;
        }
        if shared.is_closed() {
            shared
                .discard(transport, "pool is closed")
                .await;
            return;
        }
        if !transport
            .is_valid()
            .await
        {
            shared
                .discard(transport, "failed liveness probe")
                .await;
            return;
        }

        transport.touch();
        let rejected = {
            let mut idle = shared
                .idle
                .lock();
            if shared.is_closed() {
                Some((transport, "pool is closed"))
            } else if idle.len()
                < shared
                    .config
                    .max_idle
            {
                idle.push_back(transport);
                None
            } else {
                Some((transport, "idle set full"))
            }
        };

        match rejected {
            None => shared
                .returned
                .notify_one(),
            Some((transport, reason)) => {
                shared
                    .discard(transport, reason)
                    .await
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        PoolStats {
            open_connections: shared
                .open
                .load(Ordering::Acquire),
            idle_connections: shared
                .idle
                .lock()
                .len(),
            max_open: shared
                .config
                .max_open,
            max_idle: shared
                .config
                .max_idle,
            wait_count: shared
                .wait_count
                .load(Ordering::Relaxed),
            wait_duration: Duration::from_nanos(
                shared
                    .wait_nanos
                    .load(Ordering::Relaxed),
            ),
        }
    }

    /// Configuration the pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared
            .is_closed()
    }

    /// Stop the background loops, close idle transports and fail all
    /// waiters with [`EslError::PoolClosed`]. Idempotent.
    ///
    /// Checked-out transports are discarded when they are put back.
    pub async fn close(&self) {
        let shared = &self.shared;
        let first = !shared.is_closed();
        shared
            .shutdown
            .cancel();
        shared
            .slots
            .close();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("[POOL] Background loop ended abnormally: {}", e);
            }
        }

        let drained: Vec<Transport> = shared
            .idle
            .lock()
            .drain(..)
            .collect();
        for transport in drained {
            shared
                .discard(transport, "pool is closed")
                .await;
        }
        shared
            .returned
            .notify_waiters();

        if first {
            info!("[POOL] Pool for {} closed", shared.config.addr());
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shared
            .shutdown
            .cancel();
        self.shared
            .slots
            .close();
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("addr", &self.shared.config.addr())
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slot_tracks_open_count() {
        let slots = Arc::new(Semaphore::new(2));
        let open = Arc::new(AtomicUsize::new(0));

        let a = Slot::new(
            Arc::clone(&slots)
                .try_acquire_owned()
                .unwrap(),
            Arc::clone(&open),
        );
        let b = Slot::new(
            Arc::clone(&slots)
                .try_acquire_owned()
                .unwrap(),
            Arc::clone(&open),
        );
        assert_eq!(open.load(Ordering::Acquire), 2);
        assert!(Arc::clone(&slots)
            .try_acquire_owned()
            .is_err());

        drop(a);
        assert_eq!(open.load(Ordering::Acquire), 1);
        assert_eq!(slots.available_permits(), 1);
        drop(b);
        assert_eq!(open.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_slot_belongs_to_its_own_counter() {
        let slots = Arc::new(Semaphore::new(1));
        let open = Arc::new(AtomicUsize::new(0));
        let other = Arc::new(AtomicUsize::new(0));

        let slot = Slot::new(
            Arc::clone(&slots)
                .try_acquire_owned()
                .unwrap(),
            Arc::clone(&open),
        );
        assert!(slot.belongs_to(&open));
        assert!(!slot.belongs_to(&other));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let mut config = PoolConfig::new("127.0.0.1", 1);
        config.max_open = 1;
        config.max_idle = 2;
        assert!(matches!(
            Pool::new(config).await,
            Err(EslError::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_get() {
        let mut config = PoolConfig::new("127.0.0.1", 1);
        config.warm_up = 0;
        let pool = Pool::new(config)
            .await
            .unwrap();
        pool.close()
            .await;
        pool.close()
            .await;
        assert!(pool.is_closed());
        assert!(matches!(
            pool.get()
                .await,
            Err(EslError::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn test_stats_serialize() {
        let mut config = PoolConfig::new("127.0.0.1", 1);
        config.warm_up = 0;
        let pool = Pool::new(config)
            .await
            .unwrap();
        let stats = pool.stats();
        assert_eq!(stats.open_connections, 0);
        assert_eq!(stats.max_open, 10);
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["idle_connections"], 0);
        pool.close()
            .await;
    }
}
