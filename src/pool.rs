//! Bounded pool of reusable storage connections.
//!
//! A [`ResourcePool`] hands out at most `max_size` connections at a time.
//! Capacity is a [`Semaphore`]; a caller that cannot get a permit before
//! its timeout gets [`Error::ResourceExhausted`] instead of queueing
//! forever. Each checkout is a [`PooledConnection`] lease that returns
//! the connection to the idle list when dropped, so release happens on
//! every exit path including cancellation of the holding future.
//!
//! Idle connections are checked with [`Manage::is_alive`] before they are
//! handed out again. A dead one is closed and a fresh connection is
//! opened in its place without the caller noticing.
//!
//! The pool is an explicit value: build it with [`ResourcePool::new`],
//! share it by cloning (clones share one set of connections), and tear it
//! down with [`ResourcePool::close`].

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Opens, checks and closes connections of one kind.
#[async_trait]
pub trait Manage: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection>;

    /// Cheap round-trip used before reusing an idle connection.
    async fn is_alive(&self, conn: &mut Self::Connection) -> bool;

    /// Whether a connection coming back from a lease can go to the idle
    /// set. Checked synchronously on drop, so it must not do I/O.
    fn is_reusable(&self, _conn: &Self::Connection) -> bool {
        true
    }

    async fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub test_before_acquire: bool,
}

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_size: usize,
    pub in_use: usize,
    pub idle: usize,
    pub opened: u64,
    pub discarded: u64,
}

struct Shared<M: Manage> {
    manager: M,
    options: PoolOptions,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<M::Connection>>,
    closed: AtomicBool,
    opened: AtomicU64,
    discarded: AtomicU64,
}

impl<M: Manage> Shared<M> {
    fn pop_idle(&self) -> Option<M::Connection> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn push_idle(&self, conn: M::Connection) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(conn);
    }

    fn idle_len(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub struct ResourcePool<M: Manage> {
    shared: Arc<Shared<M>>,
}

impl<M: Manage> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M: Manage> ResourcePool<M> {
    /// Create an empty pool. Connections are opened lazily on demand.
    pub fn new(manager: M, options: PoolOptions) -> Self {
        let max_size = options.max_size.max(1);
        Self {
            shared: Arc::new(Shared {
                manager,
                options: PoolOptions { max_size, ..options },
                permits: Arc::new(Semaphore::new(max_size)),
                idle: Mutex::new(VecDeque::with_capacity(max_size)),
                closed: AtomicBool::new(false),
                opened: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    pub fn options(&self) -> PoolOptions {
        self.shared.options
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    /// Check out a connection, waiting at most `timeout` for capacity.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection<M>> {
        self.acquire_until(Instant::now() + timeout).await
    }

    /// Check out a connection with the pool's configured timeout, cut
    /// short by `deadline` if that comes first. Running out of the
    /// caller's deadline is [`Error::DeadlineExceeded`]; running out of
    /// the pool's own timeout is [`Error::ResourceExhausted`].
    pub async fn acquire_within(&self, deadline: Option<Instant>) -> Result<PooledConnection<M>> {
        let own = Instant::now() + self.shared.options.acquire_timeout;
        match deadline {
            Some(d) if d < own => match self.acquire_until(d).await {
                Err(Error::ResourceExhausted { .. }) if Instant::now() >= d => {
                    Err(Error::DeadlineExceeded)
                }
                other => other,
            },
            _ => self.acquire_until(own).await,
        }
    }

    pub async fn acquire_until(&self, deadline: Instant) -> Result<PooledConnection<M>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let started = Instant::now();

        let permit = match tokio::time::timeout_at(
            deadline,
            self.shared.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::Closed),
            Err(_) => {
                debug!(waited_ms = started.elapsed().as_millis() as u64, "pool exhausted");
                return Err(Error::ResourceExhausted {
                    waited: started.elapsed(),
                });
            }
        };

        while let Some(mut conn) = self.shared.pop_idle() {
            if !self.shared.options.test_before_acquire {
                return Ok(self.lease(conn, permit));
            }
            match tokio::time::timeout_at(deadline, self.shared.manager.is_alive(&mut conn)).await
            {
                Ok(true) => return Ok(self.lease(conn, permit)),
                Ok(false) => {
                    warn!("discarding dead pooled connection");
                    self.shared.discarded.fetch_add(1, Ordering::Relaxed);
                    self.shared.manager.close(conn).await;
                }
                Err(_) => {
                    self.shared.discarded.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::ResourceExhausted {
                        waited: started.elapsed(),
                    });
                }
            }
        }

        let conn = match tokio::time::timeout_at(deadline, self.shared.manager.connect()).await {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(Error::ResourceExhausted {
                    waited: started.elapsed(),
                })
            }
        };
        self.shared.opened.fetch_add(1, Ordering::Relaxed);
        Ok(self.lease(conn, permit))
    }

    /// Give a connection back. Equivalent to dropping the lease.
    pub fn release(&self, conn: PooledConnection<M>) {
        drop(conn);
    }

    pub fn status(&self) -> PoolStatus {
        let max_size = self.shared.options.max_size;
        PoolStatus {
            max_size,
            in_use: max_size.saturating_sub(self.shared.permits.available_permits()),
            idle: self.shared.idle_len(),
            opened: self.shared.opened.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop handing out connections and close every idle one. Leases
    /// still out are closed when they are dropped.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.permits.close();
        while let Some(conn) = self.shared.pop_idle() {
            self.shared.manager.close(conn).await;
        }
    }

    fn lease(&self, conn: M::Connection, permit: OwnedSemaphorePermit) -> PooledConnection<M> {
        PooledConnection {
            conn: Some(conn),
            shared: self.shared.clone(),
            broken: false,
            _permit: permit,
        }
    }
}

/// A checked-out connection. Dereferences to the underlying connection.
pub struct PooledConnection<M: Manage> {
    conn: Option<M::Connection>,
    shared: Arc<Shared<M>>,
    broken: bool,
    // Dropped after `Drop::drop` has put the connection back, so a waiter
    // woken by the permit finds it idle.
    _permit: OwnedSemaphorePermit,
}

impl<M: Manage> PooledConnection<M> {
    /// Do not return this connection to the pool when released.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<M: Manage> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<M: Manage> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<M: Manage> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.broken
            || std::thread::panicking()
            || self.shared.closed.load(Ordering::Acquire)
            || !self.shared.manager.is_reusable(&conn)
        {
            self.shared.discarded.fetch_add(1, Ordering::Relaxed);
            drop(conn);
        } else {
            self.shared.push_idle(conn);
        }
    }
}
