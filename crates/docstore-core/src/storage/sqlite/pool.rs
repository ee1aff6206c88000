//! Bounded SQLite connection pool.
//!
//! All connections target one database file and are opened up front.
//! Callers that find no idle connection queue in FIFO order; `release`
//! hands the freed connection straight to the longest waiter, so a
//! connection never returns to the idle list while anyone is queued.

use crate::error::{Error, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pool sizing and timeouts.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub size: usize,
    pub busy_timeout: Duration,
    /// `None` waits for a connection indefinitely
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 4,
            busy_timeout: Duration::from_secs(5),
            acquire_timeout: None,
        }
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub waiting: usize,
    pub closed: bool,
}

/// Outcome of one health-check pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolHealth {
    pub checked: usize,
    pub failed: usize,
}

/// Idle list and wait queue; always updated together under one lock.
struct PoolState {
    idle: VecDeque<Connection>,
    waiters: VecDeque<oneshot::Sender<Connection>>,
    checked_out: usize,
    closed: bool,
}

struct PoolInner {
    path: PathBuf,
    size: usize,
    acquire_timeout: Option<Duration>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, mut conn: Connection) {
        let mut state = self.lock();
        if state.closed {
            state.checked_out = state.checked_out.saturating_sub(1);
            drop(state);
            close_connection(conn, &self.path);
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(conn) {
                Ok(()) => return,
                // Waiter gave up; try the next one.
                Err(returned) => conn = returned,
            }
        }
        state.checked_out = state.checked_out.saturating_sub(1);
        state.idle.push_back(conn);
    }
}

fn close_connection(conn: Connection, path: &Path) {
    if let Err((_, e)) = conn.close() {
        warn!("Error closing connection to {}: {}", path.display(), e);
    }
}

/// Open and configure one connection.
pub fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    // journal_mode returns a row, so it cannot go through execute_batch.
    let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    debug!("Opened {} (journal_mode={})", path.display(), mode);
    conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA synchronous=NORMAL;")?;
    Ok(conn)
}

/// A fixed set of connections to one database file.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Open `options.size` connections to `path`.
    pub fn open(path: impl AsRef<Path>, options: PoolOptions) -> Result<Self> {
        if options.size == 0 {
            return Err(Error::Config("pool size must be at least 1".into()));
        }
        let path = path.as_ref().to_path_buf();
        let mut idle = VecDeque::with_capacity(options.size);
        for _ in 0..options.size {
            idle.push_back(open_connection(&path, options.busy_timeout)?);
        }
        info!("Opened pool of {} connections to {}", options.size, path.display());
        Ok(Self {
            inner: Arc::new(PoolInner {
                path,
                size: options.size,
                acquire_timeout: options.acquire_timeout,
                state: Mutex::new(PoolState {
                    idle,
                    waiters: VecDeque::new(),
                    checked_out: 0,
                    closed: false,
                }),
            }),
        })
    }

    /// Database file the pool serves.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Check out a connection, queueing behind earlier callers if none is idle.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let rx = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }
            if let Some(conn) = state.idle.pop_front() {
                state.checked_out += 1;
                return Ok(self.wrap(conn));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            debug!("Pool exhausted, {} waiting", state.waiters.len());
            rx
        };

        let mut waiter = Waiter {
            rx,
            pool: Arc::clone(&self.inner),
        };
        let received = match self.inner.acquire_timeout {
            None => (&mut waiter.rx).await.ok(),
            Some(limit) => tokio::select! {
                conn = &mut waiter.rx => conn.ok(),
                _ = tokio::time::sleep(limit) => {
                    // A hand-off may have landed just as the timer fired.
                    waiter.rx.close();
                    match waiter.rx.try_recv() {
                        Ok(conn) => Some(conn),
                        Err(_) => return Err(Error::PoolTimeout(limit.as_millis() as u64)),
                    }
                }
            },
        };
        match received {
            Some(conn) => Ok(self.wrap(conn)),
            None => Err(Error::PoolClosed),
        }
    }

    fn wrap(&self, conn: Connection) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Return a connection explicitly; equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock();
        PoolStatus {
            size: self.inner.size,
            idle: state.idle.len(),
            checked_out: state.checked_out,
            waiting: state.waiters.len(),
            closed: state.closed,
        }
    }

    /// Ping every idle connection with a trivial query.
    ///
    /// Failures are logged, never fatal.
    pub fn health_check(&self) -> PoolHealth {
        let state = self.inner.lock();
        let mut health = PoolHealth::default();
        for (i, conn) in state.idle.iter().enumerate() {
            health.checked += 1;
            if let Err(e) = conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)) {
                health.failed += 1;
                warn!("Health check failed for idle connection {}: {}", i, e);
            }
        }
        debug!("Health check: {}/{} idle connections ok", health.checked - health.failed, health.checked);
        health
    }

    /// Run [`health_check`](Self::health_check) every `interval` until the
    /// pool is closed or dropped.
    pub fn spawn_health_check(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let pool = ConnectionPool { inner };
                if pool.status().closed {
                    break;
                }
                pool.health_check();
            }
        })
    }

    /// Close every connection without waiting for checked-out ones.
    ///
    /// Idle connections close now; checked-out connections close when
    /// their holders release them. Queued callers fail with
    /// [`Error::PoolClosed`].
    pub fn close(&self) {
        let (idle, waiters, busy) = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
                state.checked_out,
            )
        };
        if busy > 0 {
            warn!(
                "Closing pool for {} with {} connection(s) still checked out",
                self.inner.path.display(),
                busy
            );
        }
        drop(waiters);
        for conn in idle {
            close_connection(conn, &self.inner.path);
        }
        info!("Closed pool for {}", self.inner.path.display());
    }
}

/// Pending acquire; returns a hand-off that arrives after cancellation.
struct Waiter {
    rx: oneshot::Receiver<Connection>,
    pool: Arc<PoolInner>,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(conn) = self.rx.try_recv() {
            self.pool.release(conn);
        }
    }
}

/// A checked-out connection; returns to the pool on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only taken in Drop.
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
