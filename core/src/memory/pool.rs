//! Bounded object pool.
//!
//! A fixed-capacity free-list guarded by one mutex and a condvar. At most
//! `capacity` objects exist at any time; `get` blocks (with a timeout, so
//! shutdown can interrupt) once the pool is exhausted. Alloc and return
//! counters back the packet-conservation invariant checked at shutdown.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool {0} exhausted")]
    Exhausted(String),
}

struct PoolInner<T> {
    free: VecDeque<T>,
    /// Objects created so far; never exceeds capacity.
    created: usize,
    outstanding: usize,
}

/// A bounded pool of reusable objects.
pub struct Pool<T> {
    name: String,
    capacity: usize,
    inner: Mutex<PoolInner<T>>,
    cond: Condvar,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    alloc_cnt: AtomicU64,
    return_cnt: AtomicU64,
}

impl<T> Pool<T> {
    /// Creates a pool holding at most `capacity` objects, `prealloc` of them
    /// built eagerly.
    pub fn new<F>(name: &str, capacity: usize, prealloc: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let prealloc = prealloc.min(capacity);
        let mut free = VecDeque::with_capacity(capacity);
        for _ in 0..prealloc {
            free.push_back(factory());
        }
        Pool {
            name: name.to_string(),
            capacity,
            inner: Mutex::new(PoolInner {
                free,
                created: prealloc,
                outstanding: 0,
            }),
            cond: Condvar::new(),
            factory: Box::new(factory),
            alloc_cnt: AtomicU64::new(0),
            return_cnt: AtomicU64::new(0),
        }
    }

    /// Takes an object without blocking.
    pub fn try_get(&self) -> Result<T, PoolError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(obj) = inner.free.pop_front() {
            inner.outstanding += 1;
            self.alloc_cnt.fetch_add(1, Ordering::Relaxed);
            return Ok(obj);
        }
        if inner.created < self.capacity {
            inner.created += 1;
            inner.outstanding += 1;
            self.alloc_cnt.fetch_add(1, Ordering::Relaxed);
            return Ok((self.factory)());
        }
        Err(PoolError::Exhausted(self.name.clone()))
    }

    /// Takes an object, waiting up to `timeout` for one to be returned.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, PoolError> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(obj) = inner.free.pop_front() {
                inner.outstanding += 1;
                self.alloc_cnt.fetch_add(1, Ordering::Relaxed);
                return Ok(obj);
            }
            if inner.created < self.capacity {
                inner.created += 1;
                inner.outstanding += 1;
                self.alloc_cnt.fetch_add(1, Ordering::Relaxed);
                return Ok((self.factory)());
            }
            let (guard, res) = self.cond.wait_timeout(inner, timeout).unwrap();
            inner = guard;
            if res.timed_out() && inner.free.is_empty() {
                return Err(PoolError::Exhausted(self.name.clone()));
            }
        }
    }

    /// Returns an object to the free list.
    pub fn put(&self, obj: T) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.outstanding > 0, "pool {} over-returned", self.name);
        inner.outstanding = inner.outstanding.saturating_sub(1);
        inner.free.push_back(obj);
        self.return_cnt.fetch_add(1, Ordering::Relaxed);
        drop(inner);
        self.cond.notify_one();
    }

    pub fn outstanding(&self) -> usize {
        self.inner.lock().unwrap().outstanding
    }

    pub fn alloc_count(&self) -> u64 {
        self.alloc_cnt.load(Ordering::Relaxed)
    }

    pub fn return_count(&self) -> u64 {
        self.return_cnt.load(Ordering::Relaxed)
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
