//! Per-server connection pool.
//!
//! Connections are checked out as [`PooledConnection`] guards and checked
//! back in when the guard drops. Closing the pool drops idle connections
//! immediately, waits for checked-out connections to come back, and
//! force-closes whatever is still out once the caller's context ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use ouroboros_common::{DriverError, Result};
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{Connector, StreamConnection};
use crate::context::Context;

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Maximum number of connections per server, idle plus checked out (default: 100)
    pub max_pool_size: u32,
    /// Idle connections older than this are discarded on checkout (default: none)
    pub max_idle_time: Option<Duration>,
    /// Time allowed to establish a new connection (default: 30s)
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 100,
            max_idle_time: None,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
}

/// A checked-out connection's shared state. The pool keeps a handle so it
/// can close the connection out from under its holder.
struct Slot {
    conn: tokio::sync::Mutex<Option<Box<dyn StreamConnection>>>,
    closed: CancellationToken,
}

struct IdleConnection {
    conn: Box<dyn StreamConnection>,
    since: Instant,
}

struct PoolState {
    open: bool,
    idle: Vec<IdleConnection>,
    in_use: HashMap<u64, Arc<Slot>>,
    /// Checkouts currently dialing a new connection
    dialing: usize,
}

pub struct Pool {
    address: String,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    permits: Arc<Semaphore>,
    checked_in: Notify,
    force_closed: CancellationToken,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Pool")
            .field("address", &self.address)
            .field("idle", &stats.idle)
            .field("in_use", &stats.in_use)
            .finish()
    }
}

impl Pool {
    pub fn new(address: impl Into<String>, config: PoolConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_pool_size as usize));
        Arc::new(Self {
            address: address.into(),
            config,
            connector,
            state: Mutex::new(PoolState {
                open: true,
                idle: Vec::new(),
                in_use: HashMap::new(),
                dialing: 0,
            }),
            permits,
            checked_in: Notify::new(),
            force_closed: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            idle: state.idle.len(),
            in_use: state.in_use.len(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Check out a connection, reusing an idle one when possible.
    ///
    /// # Errors
    ///
    /// `PoolClosed` once the pool is closing; context errors if `ctx` ends
    /// while waiting for capacity; connector errors when dialing fails.
    pub async fn checkout(self: &Arc<Self>, ctx: &Context) -> Result<PooledConnection> {
        let permit = ctx
            .run(self.permits.clone().acquire_owned())
            .await?
            .map_err(|_| DriverError::PoolClosed)?;

        let reused = {
            let mut state = self.state.lock();
            if !state.open {
                return Err(DriverError::PoolClosed);
            }
            let reused = self.pop_fresh_idle(&mut state);
            if reused.is_none() {
                state.dialing += 1;
            }
            reused
        };

        // Released only after the new connection is registered as in use, so
        // `close` never sees a gap between dialing and checked out
        let _dialing = reused.is_none().then(|| DialGuard(self.as_ref()));

        let conn = match reused {
            Some(conn) => conn,
            None => {
                let dial = ctx.child_with_timeout(self.config.connect_timeout);
                let conn = tokio::select! {
                    biased;
                    _ = self.force_closed.cancelled() => return Err(DriverError::PoolClosed),
                    conn = dial.run(self.connector.connect(&self.address)) => conn??,
                };
                debug!(address = %self.address, "opened pooled connection");
                conn
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot {
            conn: tokio::sync::Mutex::new(Some(conn)),
            closed: CancellationToken::new(),
        });

        let mut state = self.state.lock();
        if !state.open {
            // The freshly dialed connection drops with the slot
            return Err(DriverError::PoolClosed);
        }
        state.in_use.insert(id, slot.clone());
        Ok(PooledConnection {
            id,
            slot,
            pool: self.clone(),
            _permit: permit,
        })
    }

    fn pop_fresh_idle(&self, state: &mut PoolState) -> Option<Box<dyn StreamConnection>> {
        while let Some(idle) = state.idle.pop() {
            match self.config.max_idle_time {
                Some(max) if idle.since.elapsed() > max => {
                    debug!(address = %self.address, "discarding stale idle connection");
                }
                _ => return Some(idle.conn),
            }
        }
        None
    }

    fn check_in(&self, id: u64, slot: &Slot) {
        // No command can be running once the guard is gone, so the lock is free
        let conn = slot.conn.try_lock().ok().and_then(|mut conn| conn.take());

        let mut state = self.state.lock();
        state.in_use.remove(&id);
        match conn {
            Some(conn) if state.open && !slot.closed.is_cancelled() => {
                state.idle.push(IdleConnection {
                    conn,
                    since: Instant::now(),
                });
            }
            Some(conn) => {
                drop(state);
                debug!(address = %self.address, connection = id, "discarding returned connection");
                drop(conn);
            }
            None => {}
        }
        self.checked_in.notify_waiters();
    }

    fn dial_finished(&self) {
        self.state.lock().dialing -= 1;
        self.checked_in.notify_waiters();
    }

    /// Close the pool.
    ///
    /// Idle connections are dropped at once. Checked-out connections and
    /// connections still being dialed are awaited until they are all returned
    /// or `ctx` ends; anything still out at that point is force-closed and its
    /// in-flight command fails. When this returns every connection the pool
    /// opened has been closed.
    pub async fn close(&self, ctx: &Context) -> Result<()> {
        let idle = {
            let mut state = self.state.lock();
            state.open = false;
            std::mem::take(&mut state.idle)
        };
        self.permits.close();
        let idle_count = idle.len();
        drop(idle);
        debug!(address = %self.address, idle = idle_count, "closed idle connections");

        loop {
            let notified = self.checked_in.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_drained() {
                info!(address = %self.address, "connection pool drained");
                return Ok(());
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = ctx.done() => break,
            }
        }

        self.force_closed.cancel();
        let remaining: Vec<Arc<Slot>> = {
            let mut state = self.state.lock();
            state.in_use.drain().map(|(_, slot)| slot).collect()
        };
        warn!(
            address = %self.address,
            in_use = remaining.len(),
            "context ended before pool drained, force-closing in-use connections"
        );
        for slot in &remaining {
            slot.closed.cancel();
        }
        for slot in remaining {
            // In-flight commands observe the cancellation and release the lock
            let conn = slot.conn.lock().await.take();
            drop(conn);
        }

        // Pending dials observe `force_closed` and give up promptly
        loop {
            let notified = self.checked_in.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().dialing == 0 {
                return Ok(());
            }
            notified.await;
        }
    }

    fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.in_use.is_empty() && state.dialing == 0
    }
}

/// Counts a checkout as dialing until dropped
struct DialGuard<'a>(&'a Pool);

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        self.0.dial_finished();
    }
}

/// A checked-out connection. Returned to its pool on drop.
pub struct PooledConnection {
    id: u64,
    slot: Arc<Slot>,
    pool: Arc<Pool>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("address", &self.pool.address)
            .finish()
    }
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.pool.address
    }

    /// Run a command on this connection.
    ///
    /// # Errors
    ///
    /// Fails with a `Connection` error if the pool force-closes the
    /// connection before or while the command runs.
    pub async fn run_command(&self, db: &str, command: Document) -> Result<Document> {
        let closed = || {
            DriverError::Connection(format!(
                "connection {} to {} was closed by client disconnect",
                self.id, self.pool.address
            ))
        };

        let mut guard = self.slot.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;

        // A reply may still be in flight if this future is dropped midway, so
        // the connection must not go back to the idle list
        let abandoned = AbandonGuard(Some(&self.slot.closed));
        let reply = tokio::select! {
            biased;
            _ = self.slot.closed.cancelled() => Err(closed()),
            reply = conn.run_command(db, command) => reply,
        };
        abandoned.disarm();
        reply
    }
}

/// Marks a slot closed unless the command it guards ran to completion
struct AbandonGuard<'a>(Option<&'a CancellationToken>);

impl AbandonGuard<'_> {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if let Some(closed) = self.0 {
            closed.cancel();
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.check_in(self.id, &self.slot);
    }
}
