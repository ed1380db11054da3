//! Bounded connection pool.
//!
//! Each pool owns a buffer of idle values and a counting semaphore whose
//! permits bound the number of simultaneously *live* values. A permit is
//! consumed when a value is constructed and returned only when the value is
//! closed. Releasing a value back to the idle buffer keeps its permit,
//! so `live values + available permits == capacity` holds at all times.
//!
//! Acquisition prefers an idle value; otherwise it waits up to the
//! acquisition timeout for a creation permit, and after a timeout makes one
//! final non-blocking attempt on the idle buffer before failing.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::error::{Error, Result};

type Constructor<T> = Box<dyn Fn() -> Pin<Box<dyn Future<Output = Result<T>> + Send>> + Send + Sync>;
type Destructor<T> = Box<dyn Fn(T) + Send + Sync>;

/// A bounded pool of reusable values (connections, in practice).
pub struct Pool<T> {
    /// Idle values ready for reuse.
    store: Mutex<VecDeque<T>>,
    /// Permits for live values; held for each value's lifetime.
    sema: Semaphore,
    /// Terminal state flag; never cleared once set.
    closed: AtomicBool,
    new_conn: Constructor<T>,
    close_conn: Destructor<T>,
    acquire_timeout: Duration,
    capacity: usize,
}

impl<T: Send + 'static> Pool<T> {
    /// Create a pool with the given capacity.
    ///
    /// `new_conn` is invoked to construct a value when no idle one is
    /// available and a permit could be reserved; `close_conn` tears a value
    /// down on close and destroy.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new<C, Fut, D>(
        capacity: usize,
        acquire_timeout: Duration,
        new_conn: C,
        close_conn: D,
    ) -> Self
    where
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        assert!(capacity > 0, "invalid pool capacity");

        Self {
            store: Mutex::new(VecDeque::with_capacity(capacity)),
            sema: Semaphore::new(capacity),
            closed: AtomicBool::new(false),
            new_conn: Box::new(move || Box::pin(new_conn())),
            close_conn: Box::new(close_conn),
            acquire_timeout,
            capacity,
        }
    }

    /// Number of idle values currently buffered.
    pub fn len(&self) -> usize {
        self.store.lock().expect("pool lock poisoned").len()
    }

    /// Whether the idle buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the pool has been destroyed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get an idle value or create one.
    ///
    /// Waits at most the acquisition timeout for a creation permit. If the
    /// wait expires, one last non-blocking dequeue is attempted before
    /// failing with [`Error::AcquireTimeout`].
    pub async fn acquire(&self) -> Result<T> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        if let Some(v) = self.pop() {
            return Ok(v);
        }

        match timeout(self.acquire_timeout, self.sema.acquire()).await {
            Err(_elapsed) => {
                // A release may have raced the permit wait.
                self.pop().ok_or(Error::AcquireTimeout)
            }
            Ok(Err(_closed)) => Err(Error::PoolClosed),
            Ok(Ok(permit)) => {
                if self.is_closed() {
                    drop(permit);
                    return Err(Error::PoolClosed);
                }
                // The permit now belongs to the value being built; it is
                // handed back in close() or on constructor failure.
                permit.forget();
                match (self.new_conn)().await {
                    Ok(v) => Ok(v),
                    Err(e) => {
                        self.sema.add_permits(1);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Non-blocking dequeue of an idle value.
    pub fn pop(&self) -> Option<T> {
        if self.is_closed() {
            return None;
        }
        self.store.lock().expect("pool lock poisoned").pop_front()
    }

    /// Return a value to the idle buffer.
    ///
    /// Dropped silently if the pool is closed, or if the buffer is already
    /// at capacity (over-returning is a caller bug but must not panic).
    pub fn release(&self, v: T) {
        if self.is_closed() {
            drop(v);
            return;
        }
        let mut store = self.store.lock().expect("pool lock poisoned");
        if store.len() < self.capacity {
            store.push_back(v);
        }
    }

    /// Tear down a value and hand its permit back.
    ///
    /// Must only be called by the single holder of the value.
    pub fn close(&self, v: T) {
        if !self.is_closed() {
            self.sema.add_permits(1);
        }
        (self.close_conn)(v);
    }

    /// Destroy the pool: drain and tear down every idle value and fail all
    /// future acquisitions. Idempotent.
    pub fn destroy(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sema.close();

        let drained: Vec<T> = {
            let mut store = self.store.lock().expect("pool lock poisoned");
            store.drain(..).collect()
        };
        for v in drained {
            (self.close_conn)(v);
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.capacity)
            .field("idle", &self.store.lock().map(|s| s.len()).unwrap_or(0))
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn counting_pool(capacity: usize) -> (Arc<Pool<usize>>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let created2 = created.clone();
        let closed2 = closed.clone();
        let pool = Pool::new(
            capacity,
            Duration::from_millis(20),
            move || {
                let n = created2.fetch_add(1, Ordering::SeqCst);
                async move { Ok(n) }
            },
            move |_v| {
                closed2.fetch_add(1, Ordering::SeqCst);
            },
        );
        (Arc::new(pool), created, closed)
    }

    #[tokio::test]
    async fn test_acquire_creates_up_to_capacity() {
        let (pool, created, _) = counting_pool(3);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 3);

        pool.release(a);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test]
    async fn test_acquire_prefers_idle() {
        let (pool, created, _) = counting_pool(3);

        let v = pool.acquire().await.unwrap();
        pool.release(v);
        let _v = pool.acquire().await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acquire_times_out_at_capacity() {
        let (pool, _, _) = counting_pool(2);

        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err, Error::AcquireTimeout);
    }

    #[tokio::test]
    async fn test_release_during_permit_wait_is_picked_up() {
        let (pool, _, _) = counting_pool(1);

        let v = pool.acquire().await.unwrap();
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.release(v);

        let got = waiter.await.unwrap();
        assert!(got.is_ok());
    }

    #[tokio::test]
    async fn test_close_frees_a_permit() {
        let (pool, _, closed) = counting_pool(1);

        let v = pool.acquire().await.unwrap();
        pool.close(v);
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        // The permit returned, so a fresh acquire succeeds.
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_constructor_error_returns_permit() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = attempts.clone();
        let pool: Pool<usize> = Pool::new(
            1,
            Duration::from_millis(20),
            move || {
                let n = attempts2.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::Io(std::io::ErrorKind::ConnectionRefused))
                    } else {
                        Ok(n)
                    }
                }
            },
            |_| {},
        );

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err, Error::Io(std::io::ErrorKind::ConnectionRefused));

        // The failed attempt must not leak its permit.
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_destroy_drains_idle_and_fails_acquire() {
        let (pool, _, closed) = counting_pool(2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a);
        pool.release(b);

        pool.destroy();
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.acquire().await.unwrap_err(), Error::PoolClosed);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (pool, _, closed) = counting_pool(1);
        let v = pool.acquire().await.unwrap();
        pool.release(v);

        pool.destroy();
        pool.destroy();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_after_destroy_drops() {
        let (pool, _, _) = counting_pool(1);
        let v = pool.acquire().await.unwrap();

        pool.destroy();
        pool.release(v);
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn test_over_release_is_dropped_not_stored() {
        let (pool, _, _) = counting_pool(1);
        pool.release(7);
        pool.release(8);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_pop_is_non_blocking() {
        let (pool, _, _) = counting_pool(1);
        assert_eq!(pool.pop(), None);

        let v = pool.acquire().await.unwrap();
        pool.release(v);
        assert!(pool.pop().is_some());
        assert_eq!(pool.pop(), None);
    }

    #[tokio::test]
    async fn test_pop_on_destroyed_pool() {
        let (pool, _, _) = counting_pool(1);
        let v = pool.acquire().await.unwrap();
        pool.release(v);
        pool.destroy();
        assert_eq!(pool.pop(), None);
    }

    #[test]
    #[should_panic(expected = "invalid pool capacity")]
    fn test_zero_capacity_panics() {
        let _ = Pool::<usize>::new(0, Duration::from_millis(1), || async { Ok(1) }, |_| {});
    }
}
