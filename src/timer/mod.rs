#[cfg(test)]
mod timer_test;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use util::sync::Mutex as SyncMutex;

/// How often the dispatcher scans the live timers. Deliberately coarse; the
/// protocols driven by the wheel tolerate 10 ms of jitter and a finer scan
/// would only burn CPU.
pub(crate) const GRANULARITY: Duration = Duration::from_millis(10);

/// A scan step above this is treated as a suspended process rather than
/// elapsed protocol time.
pub(crate) const MAX_STEP: Duration = Duration::from_secs(1);

pub type TimerId = u64;

pub type TimerCallbackFn =
    Box<dyn (Fn() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;

struct TimerEntry {
    interval: Duration,
    repeating: bool,
    armed: bool,
    deadline: Instant,
    callback: Arc<TimerCallbackFn>,
}

struct WheelInner {
    timers: HashMap<TimerId, TimerEntry>,
    last_scan: Instant,
}

/// A single dispatcher driving every timer of an agent off one background
/// task and the monotonic clock.
///
/// Callbacks run sequentially on the dispatch context and must not block for
/// long; they acquire the agent locks themselves.
pub struct TimerWheel {
    inner: Arc<SyncMutex<WheelInner>>,
    next_id: AtomicU64,
    done_tx: SyncMutex<Option<mpsc::Sender<()>>>,
}

impl TimerWheel {
    pub fn new() -> Arc<Self> {
        let (done_tx, mut done_rx) = mpsc::channel(1);

        let wheel = Arc::new(Self {
            inner: Arc::new(SyncMutex::new(WheelInner {
                timers: HashMap::new(),
                last_scan: Instant::now(),
            })),
            next_id: AtomicU64::new(1),
            done_tx: SyncMutex::new(Some(done_tx)),
        });

        let inner = Arc::clone(&wheel.inner);
        tokio::spawn(async move {
            loop {
                let timer = tokio::time::sleep(GRANULARITY);
                tokio::pin!(timer);

                tokio::select! {
                    _ = timer.as_mut() => {}
                    _ = done_rx.recv() => return,
                }

                let due = Self::collect_due(&inner);
                for callback in due {
                    callback().await;
                }
            }
        });

        wheel
    }

    /// Pulls out callbacks whose deadline has passed, re-arming repeating
    /// timers. Runs under the wheel lock; callbacks fire after it drops.
    fn collect_due(inner: &Arc<SyncMutex<WheelInner>>) -> Vec<Arc<TimerCallbackFn>> {
        let mut inner = inner.lock();
        let now = Instant::now();

        let step = now.saturating_duration_since(inner.last_scan);
        inner.last_scan = now;
        if step > MAX_STEP {
            // The clock jumped (suspend, debugger, wall-clock change leaking
            // into a virtualized monotonic source). Treat it as if no time
            // passed instead of firing a storm of catch-up callbacks.
            let shift = step - GRANULARITY;
            for entry in inner.timers.values_mut() {
                if entry.armed {
                    entry.deadline += shift;
                }
            }
            return vec![];
        }

        let mut due = vec![];
        for entry in inner.timers.values_mut() {
            if !entry.armed || entry.deadline > now {
                continue;
            }
            if entry.repeating {
                // Next fire is relative to now, so a late scan never causes
                // back-to-back catch-up fires.
                entry.deadline = now + entry.interval;
            } else {
                entry.armed = false;
            }
            due.push(Arc::clone(&entry.callback));
        }
        due
    }

    /// Creates a timer in the stopped state and returns its identifier.
    pub fn register(
        &self,
        interval: Duration,
        repeating: bool,
        callback: TimerCallbackFn,
    ) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.timers.insert(
            id,
            TimerEntry {
                interval,
                repeating,
                armed: false,
                deadline: Instant::now(),
                callback: Arc::new(callback),
            },
        );
        id
    }

    /// Arms the timer to fire one interval from now.
    pub fn start(&self, id: TimerId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.timers.get_mut(&id) {
            entry.armed = true;
            entry.deadline = Instant::now() + entry.interval;
        }
    }

    /// Disarms the timer; the registration stays usable.
    pub fn stop(&self, id: TimerId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.timers.get_mut(&id) {
            entry.armed = false;
        }
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        let inner = self.inner.lock();
        inner.timers.get(&id).map_or(false, |entry| entry.armed)
    }

    /// Changes the repeat interval. Takes effect from the next arming or
    /// fire.
    pub fn set_interval(&self, id: TimerId, interval: Duration) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.timers.get_mut(&id) {
            entry.interval = interval;
        }
    }

    /// Arms the timer for an absolute monotonic deadline.
    pub fn set_next_fire(&self, id: TimerId, deadline: Instant) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.timers.get_mut(&id) {
            entry.armed = true;
            entry.deadline = deadline;
        }
    }

    /// Removes the timer entirely.
    pub fn unregister(&self, id: TimerId) {
        let mut inner = self.inner.lock();
        inner.timers.remove(&id);
    }

    /// Stops the dispatcher. Live registrations are dropped.
    pub fn close(&self) {
        let mut done_tx = self.done_tx.lock();
        done_tx.take();
        let mut inner = self.inner.lock();
        inner.timers.clear();
    }
}
