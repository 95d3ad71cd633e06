use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::sync::Notify;

/// Source of current time and schedulable delays.
///
/// Everything in the lease subsystem that reads a wall clock or waits for
/// one goes through this trait, so tests can substitute [`ManualClock`]
/// and drive expiry deterministically.
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> SystemTime;

    /// Complete after `duration` has elapsed on this clock.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Wall-clock time and tokio timers.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// A clock that only moves when told to. Sleepers wake once the held
/// instant passes their deadline.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<ManualInner>,
}

struct ManualInner {
    // Nanoseconds since the unix epoch.
    now_nanos: AtomicU64,
    tick: Notify,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> ManualClock {
        let nanos = start
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos() as u64;
        ManualClock {
            inner: Arc::new(ManualInner {
                now_nanos: AtomicU64::new(nanos),
                tick: Notify::new(),
            }),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.inner
            .now_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
        self.inner.tick.notify_waiters();
    }

    pub fn set(&self, now: SystemTime) {
        let nanos = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos() as u64;
        self.inner.now_nanos.store(nanos, Ordering::SeqCst);
        self.inner.tick.notify_waiters();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.inner.now_nanos.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        let inner = self.inner.clone();
        let deadline = self.now() + duration;
        async move {
            loop {
                // Register for the next tick before checking the deadline,
                // otherwise an advance between the check and the await is
                // lost.
                let tick = inner.tick.notified();
                let now =
                    UNIX_EPOCH + Duration::from_nanos(inner.now_nanos.load(Ordering::SeqCst));
                if now >= deadline {
                    return;
                }
                tick.await;
            }
        }
    }
}
