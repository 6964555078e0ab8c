//! Bounded connection pool
//!
//! - Capacity is a fair `tokio::sync::Semaphore` with `max_connections`
//!   permits. Every lent connection owns one permit, so waiters are woken in
//!   FIFO order and never more than `max_connections` are lent at once.
//! - New connections are only opened while the idle set is empty, which keeps
//!   the number of open connections at or below `max_connections`.
//! - The idle set sits behind a `std::sync::Mutex` that is never held across
//!   an `.await`.
//!
//! Connections go back to the pool when their [`PooledConnection`] is dropped
//! or passed to [`Pool::release`]. Broken connections, connections past
//! `max_uses` and connections idle past `idle_timeout` are closed instead.
//!
//! A dead session only shows itself when it is used. Every connection
//! records the pool epoch it was opened in; the first connection-level
//! failure on a lent connection bumps the epoch, and every connection from
//! an older epoch (idle now, or lent and returned later) is closed as
//! [`RemoveReason::Stale`]. A server restart therefore costs one failed
//! attempt, not one per idle connection.
//!
//! # Example
//!
//! ```ignore
//! let pool = Pool::new(PoolConfig::default(), Arc::new(PgConnector::new(options)));
//! let mut conn = pool.acquire().await?;
//! let rows = conn.query("SELECT 1", &[]).await?;
//! pool.release(conn);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::{Connection, Connector};
use crate::error::{DbError, Result};
use crate::value::{Row, SqlValue};

const EVENT_CAPACITY: usize = 256;

/// Pool sizing and recycling options
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on open connections
    pub max_connections: usize,
    /// Idle connections older than this are closed (None = keep forever)
    pub idle_timeout: Option<Duration>,
    /// Maximum wait for a connection, including opening a new one
    pub acquire_timeout: Duration,
    /// Close a connection after this many queries (None = unlimited)
    pub max_uses: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            idle_timeout: Some(Duration::from_secs(30)),
            acquire_timeout: Duration::from_secs(2),
            max_uses: None,
        }
    }
}

impl PoolConfig {
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_max_uses(mut self, max_uses: Option<u64>) -> Self {
        self.max_uses = max_uses;
        self
    }
}

/// Why a connection left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    MaxUses,
    IdleTimeout,
    Broken,
    /// Opened before a connection failure was seen on another connection
    Stale,
    Closed,
}

/// Lifecycle events for logging and metrics collectors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Connected { id: u64 },
    Acquired { id: u64, reused: bool },
    Released { id: u64, uses: u64 },
    Removed { id: u64, reason: RemoveReason },
}

/// Cumulative counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub closed: u64,
    pub acquired: u64,
    pub timeouts: u64,
    /// Connections removed because they went bad
    pub evicted_broken: u64,
}

/// Point-in-time occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max: usize,
}

#[derive(Debug, Default)]
struct AtomicStats {
    created: AtomicU64,
    closed: AtomicU64,
    acquired: AtomicU64,
    timeouts: AtomicU64,
    evicted_broken: AtomicU64,
}

impl AtomicStats {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            evicted_broken: self.evicted_broken.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ConnMeta {
    id: u64,
    uses: u64,
    epoch: u64,
}

struct IdleEntry {
    conn: Box<dyn Connection>,
    meta: ConnMeta,
    idle_since: Instant,
}

/// Shared handle to a connection pool. Cloning is cheap.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleEntry>>,
    open: AtomicUsize,
    next_id: AtomicU64,
    epoch: AtomicU64,
    closed: AtomicBool,
    events: broadcast::Sender<PoolEvent>,
    stats: AtomicStats,
}

impl Pool {
    /// Create an empty pool; connections are opened lazily on demand.
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let mut config = config;
        config.max_connections = config.max_connections.max(1);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.max_connections)),
                idle: Mutex::new(VecDeque::with_capacity(config.max_connections)),
                config,
                connector,
                open: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                epoch: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                events,
                stats: AtomicStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrow a connection, waiting up to `acquire_timeout` for capacity.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        if self.inner.is_closed() {
            return Err(DbError::PoolClosed);
        }

        let waited = self.inner.config.acquire_timeout;
        match tokio::time::timeout(waited, Arc::clone(&self.inner).checkout()).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    timeout_ms = waited.as_millis() as u64,
                    status = ?self.status(),
                    "timed out acquiring database connection"
                );
                Err(DbError::AcquisitionTimeout { waited })
            }
        }
    }

    /// Return a connection to the pool. Same as dropping it.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Run a single statement on a pooled connection, without retry.
    ///
    /// Kept for callers that need direct access; handlers should go through
    /// [`QueryExecutor`](crate::QueryExecutor).
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let mut conn = self.acquire().await?;
        conn.query(sql, params).await
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats.snapshot()
    }

    pub fn status(&self) -> PoolStatus {
        let max = self.inner.config.max_connections;
        PoolStatus {
            open: self.inner.open.load(Ordering::Acquire),
            idle: self.inner.idle_guard().len(),
            in_use: max.saturating_sub(self.inner.permits.available_permits()),
            max,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Close idle connections that exceeded the idle timeout or went bad.
    ///
    /// Returns how many were evicted.
    pub fn reap_idle(&self) -> usize {
        let stale: Vec<(IdleEntry, RemoveReason)> = {
            let mut idle = self.inner.idle_guard();
            let mut keep = VecDeque::with_capacity(idle.len());
            let mut stale = Vec::new();
            for entry in idle.drain(..) {
                match self.inner.eviction_reason(&entry) {
                    Some(reason) => stale.push((entry, reason)),
                    None => keep.push_back(entry),
                }
            }
            *idle = keep;
            stale
        };

        let count = stale.len();
        for (entry, reason) in stale {
            self.inner.discard(entry.conn, entry.meta.id, reason);
        }
        count
    }

    /// Ping up to `max_connections` idle connections, evicting failures.
    ///
    /// Each checked connection is held with a permit like any lent
    /// connection, so the capacity bound still holds while it is out.
    pub async fn check_idle(&self) -> usize {
        let mut evicted = 0;
        for _ in 0..self.inner.config.max_connections {
            let Ok(permit) = Arc::clone(&self.inner.permits).try_acquire_owned() else {
                break;
            };
            let next = self.inner.idle_guard().pop_front();
            let Some(entry) = next else {
                break;
            };

            let mut conn = PooledConnection::new(entry.conn, entry.meta, permit, Arc::clone(&self.inner));
            if let Err(err) = conn.ping().await {
                debug!(id = conn.id(), error = %err, "idle connection failed health check");
                conn.mark_broken();
                evicted += 1;
            }
        }
        evicted
    }

    /// Spawn a background task that periodically reaps and health-checks
    /// idle connections. The task stops once the pool is closed.
    pub fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if pool.is_closed() {
                    break;
                }
                let reaped = pool.reap_idle();
                let failed = pool.check_idle().await;
                if reaped + failed > 0 {
                    debug!(reaped, failed, "pool maintenance evicted connections");
                }
            }
        })
    }

    /// Close the pool: pending and future `acquire` calls fail with
    /// [`DbError::PoolClosed`], idle connections are closed now and lent
    /// ones when they are released.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();

        let drained: Vec<IdleEntry> = self.inner.idle_guard().drain(..).collect();
        for entry in drained {
            self.inner.forget(entry.meta.id, RemoveReason::Closed);
            entry.conn.close().await;
        }
        tracing::info!(stats = ?self.stats(), "connection pool closed");
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

impl PoolInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn idle_guard(&self) -> MutexGuard<'_, VecDeque<IdleEntry>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PoolEvent) {
        debug!(?event, "pool event");
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn eviction_reason(&self, entry: &IdleEntry) -> Option<RemoveReason> {
        if entry.conn.is_broken() {
            return Some(RemoveReason::Broken);
        }
        if entry.meta.epoch < self.epoch.load(Ordering::Acquire) {
            return Some(RemoveReason::Stale);
        }
        match self.config.idle_timeout {
            Some(timeout) if entry.idle_since.elapsed() >= timeout => Some(RemoveReason::IdleTimeout),
            _ => None,
        }
    }

    async fn checkout(self: Arc<Self>) -> Result<PooledConnection> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DbError::PoolClosed)?;

        loop {
            let next = self.idle_guard().pop_back();
            let Some(entry) = next else {
                break;
            };
            if let Some(reason) = self.eviction_reason(&entry) {
                self.discard(entry.conn, entry.meta.id, reason);
                continue;
            }
            self.stats.acquired.fetch_add(1, Ordering::Relaxed);
            self.emit(PoolEvent::Acquired {
                id: entry.meta.id,
                reused: true,
            });
            return Ok(PooledConnection::new(entry.conn, entry.meta, permit, self));
        }

        // Idle set empty: open a fresh connection under our permit. A
        // connect failure drops the permit on the way out.
        let epoch = self.epoch.load(Ordering::Acquire);
        let conn = self.connector.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.open.fetch_add(1, Ordering::AcqRel);
        self.stats.created.fetch_add(1, Ordering::Relaxed);
        self.emit(PoolEvent::Connected { id });

        self.stats.acquired.fetch_add(1, Ordering::Relaxed);
        self.emit(PoolEvent::Acquired { id, reused: false });
        Ok(PooledConnection::new(
            conn,
            ConnMeta { id, uses: 0, epoch },
            permit,
            self,
        ))
    }

    fn check_in(&self, conn: Box<dyn Connection>, meta: ConnMeta, broken: bool) {
        if self.is_closed() {
            self.discard(conn, meta.id, RemoveReason::Closed);
            return;
        }
        if broken || conn.is_broken() {
            self.discard(conn, meta.id, RemoveReason::Broken);
            return;
        }
        if meta.epoch < self.epoch.load(Ordering::Acquire) {
            self.discard(conn, meta.id, RemoveReason::Stale);
            return;
        }
        if self.config.max_uses.is_some_and(|max| meta.uses >= max) {
            self.discard(conn, meta.id, RemoveReason::MaxUses);
            return;
        }

        self.emit(PoolEvent::Released {
            id: meta.id,
            uses: meta.uses,
        });
        self.idle_guard().push_back(IdleEntry {
            conn,
            meta,
            idle_since: Instant::now(),
        });
    }

    /// A connection opened in `epoch` hit a connection-level failure: start a
    /// new epoch and close every idle connection from the old ones.
    ///
    /// Only the first failure of an epoch does the sweep; later failures from
    /// the same epoch find the counter already moved on.
    fn invalidate(&self, epoch: u64) {
        if self
            .epoch
            .compare_exchange(epoch, epoch + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let stale: Vec<IdleEntry> = {
            let mut idle = self.idle_guard();
            let (stale, keep): (VecDeque<IdleEntry>, VecDeque<IdleEntry>) =
                idle.drain(..).partition(|entry| entry.meta.epoch <= epoch);
            *idle = keep;
            stale.into_iter().collect()
        };

        if !stale.is_empty() {
            warn!(
                evicted = stale.len(),
                "connection failure seen, closing idle connections opened before it"
            );
        }
        for entry in stale {
            self.discard(entry.conn, entry.meta.id, RemoveReason::Stale);
        }
    }

    /// Account for a connection leaving the pool.
    fn forget(&self, id: u64, reason: RemoveReason) {
        self.open.fetch_sub(1, Ordering::AcqRel);
        self.stats.closed.fetch_add(1, Ordering::Relaxed);
        if reason == RemoveReason::Broken {
            self.stats.evicted_broken.fetch_add(1, Ordering::Relaxed);
        }
        self.emit(PoolEvent::Removed { id, reason });
    }

    /// Remove a connection and close it in the background.
    fn discard(&self, conn: Box<dyn Connection>, id: u64, reason: RemoveReason) {
        self.forget(id, reason);
        // Outside a runtime the connection is simply dropped.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(conn.close());
        }
    }
}

/// A connection lent out by the pool; returns itself on drop.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    meta: ConnMeta,
    broken: bool,
    pool: Arc<PoolInner>,
    // Released after `conn` is back in the idle set (fields drop after `Drop::drop`).
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn new(
        conn: Box<dyn Connection>,
        meta: ConnMeta,
        permit: OwnedSemaphorePermit,
        pool: Arc<PoolInner>,
    ) -> Self {
        Self {
            conn: Some(conn),
            meta,
            broken: false,
            pool,
            _permit: permit,
        }
    }

    /// Pool-assigned connection id, stable for the connection's lifetime
    pub fn id(&self) -> u64 {
        self.meta.id
    }

    /// Queries run on this connection so far, across all loans
    pub fn uses(&self) -> u64 {
        self.meta.uses
    }

    /// Have the pool close this connection instead of recycling it
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let conn = self.conn.as_mut().ok_or(DbError::PoolClosed)?;
        self.meta.uses += 1;
        let result = conn.query(sql, params).await;
        if matches!(&result, Err(err) if err.is_transient()) {
            self.broken = true;
            self.pool.invalidate(self.meta.epoch);
        }
        result
    }

    pub async fn ping(&mut self) -> Result<()> {
        let conn = self.conn.as_mut().ok_or(DbError::PoolClosed)?;
        conn.ping().await
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn, self.meta, self.broken);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.meta.id)
            .field("uses", &self.meta.uses)
            .field("broken", &self.broken)
            .finish()
    }
}
