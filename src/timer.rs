//! Delayed callbacks with cancellation.
//!
//! A connection keeps at most one timer armed at a time; the [`Timer`] trait
//! is the seam it talks to. [`ThreadTimer`] is what a live [`crate::Interface`]
//! uses. [`ManualTimer`] runs on a virtual clock that only moves when
//! [`ManualTimer::advance`] is called.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error as ThisError;

pub type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, ThisError)]
pub enum TimerError {
    #[error("could not spawn timer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Identifies one scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

pub trait Timer: Send + Sync {
    /// Run `callback` once after `delay`, unless cancelled first.
    fn schedule(&self, delay: Duration, callback: Callback) -> Result<TimerHandle, TimerError>;

    /// Cancel a pending callback. Cancelling a fired or already cancelled
    /// handle does nothing.
    fn cancel(&self, handle: TimerHandle);
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Slot {
    cancelled: Mutex<bool>,
    var: Condvar,
}

/// One parked thread per armed timer.
///
/// The thread sleeps on a condition variable until its deadline, so a
/// cancellation wakes it and it exits without running the callback.
#[derive(Default)]
pub struct ThreadTimer {
    next_id: AtomicU64,
    slots: Arc<Mutex<HashMap<u64, Arc<Slot>>>>,
}

impl ThreadTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of timers that have neither fired nor been cancelled.
    pub fn pending(&self) -> usize {
        lock(&self.slots).len()
    }
}

impl Timer for ThreadTimer {
    fn schedule(&self, delay: Duration, callback: Callback) -> Result<TimerHandle, TimerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot::default());
        lock(&self.slots).insert(id, slot.clone());

        let slots = self.slots.clone();
        let deadline = Instant::now() + delay;
        let spawned = thread::Builder::new()
            .name(format!("timer-{id}"))
            .spawn(move || {
                let mut cancelled = lock(&slot.cancelled);
                loop {
                    if *cancelled {
                        return;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    cancelled = slot
                        .var
                        .wait_timeout(cancelled, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                drop(cancelled);
                lock(&slots).remove(&id);
                callback();
            });

        if let Err(e) = spawned {
            lock(&self.slots).remove(&id);
            return Err(e.into());
        }
        Ok(TimerHandle(id))
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(slot) = lock(&self.slots).remove(&handle.0) {
            *lock(&slot.cancelled) = true;
            slot.var.notify_all();
        }
    }
}

struct Pending {
    deadline: Duration,
    callback: Callback,
}

#[derive(Default)]
struct Clock {
    now: Duration,
    next_id: u64,
    pending: HashMap<u64, Pending>,
}

/// Virtual-clock scheduler for deterministic runs.
///
/// Callbacks run on the thread calling [`ManualTimer::advance`], never while
/// the clock's own lock is held, so they are free to schedule or cancel.
#[derive(Default)]
pub struct ManualTimer {
    clock: Mutex<Clock>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time elapsed on the virtual clock.
    pub fn now(&self) -> Duration {
        lock(&self.clock).now
    }

    pub fn pending(&self) -> usize {
        lock(&self.clock).pending.len()
    }

    /// Move the clock forward by `by`, firing every callback that falls due,
    /// earliest deadline first. Callbacks armed while advancing fire too if
    /// their deadline is within the window.
    pub fn advance(&self, by: Duration) {
        let target = lock(&self.clock).now + by;
        loop {
            let due = {
                let mut clock = lock(&self.clock);
                let next = clock
                    .pending
                    .iter()
                    .filter(|(_, p)| p.deadline <= target)
                    .min_by_key(|(id, p)| (p.deadline, **id))
                    .map(|(id, _)| *id);
                match next {
                    Some(id) => {
                        let p = clock.pending.remove(&id);
                        if let Some(p) = &p {
                            clock.now = p.deadline;
                        }
                        p
                    }
                    None => {
                        clock.now = target;
                        None
                    }
                }
            };
            match due {
                Some(p) => (p.callback)(),
                None => return,
            }
        }
    }
}

impl Timer for ManualTimer {
    fn schedule(&self, delay: Duration, callback: Callback) -> Result<TimerHandle, TimerError> {
        let mut clock = lock(&self.clock);
        let id = clock.next_id;
        clock.next_id += 1;
        let deadline = clock.now + delay;
        clock.pending.insert(id, Pending { deadline, callback });
        Ok(TimerHandle(id))
    }

    fn cancel(&self, handle: TimerHandle) {
        lock(&self.clock).pending.remove(&handle.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Callback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let make = move |name: &'static str| -> Callback {
            let l = l.clone();
            Box::new(move || l.lock().unwrap().push(name))
        };
        (log, make)
    }

    #[test]
    fn manual_timer_fires_in_deadline_order() {
        let timer = ManualTimer::new();
        let (log, cb) = recorder();
        timer.schedule(Duration::from_secs(30), cb("quiet")).unwrap();
        timer.schedule(Duration::from_secs(1), cb("rto")).unwrap();

        timer.advance(Duration::from_millis(999));
        assert!(log.lock().unwrap().is_empty());

        timer.advance(Duration::from_millis(1));
        assert_eq!(*log.lock().unwrap(), vec!["rto"]);

        timer.advance(Duration::from_secs(29));
        assert_eq!(*log.lock().unwrap(), vec!["rto", "quiet"]);
        assert_eq!(timer.now(), Duration::from_secs(30));
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn manual_timer_cancel_is_idempotent() {
        let timer = ManualTimer::new();
        let (log, cb) = recorder();
        let h = timer.schedule(Duration::from_secs(1), cb("never")).unwrap();
        timer.cancel(h);
        timer.cancel(h);
        timer.advance(Duration::from_secs(5));
        assert!(log.lock().unwrap().is_empty());

        let h = timer.schedule(Duration::from_secs(1), cb("fired")).unwrap();
        timer.advance(Duration::from_secs(1));
        timer.cancel(h);
        assert_eq!(*log.lock().unwrap(), vec!["fired"]);
    }

    #[test]
    fn manual_timer_runs_callbacks_rearmed_during_advance() {
        let timer = Arc::new(ManualTimer::new());
        let count = Arc::new(Mutex::new(0));

        fn rearm(timer: Arc<ManualTimer>, count: Arc<Mutex<u32>>) {
            let t = timer.clone();
            timer
                .schedule(
                    Duration::from_secs(1),
                    Box::new(move || {
                        *count.lock().unwrap() += 1;
                        rearm(t, count);
                    }),
                )
                .unwrap();
        }
        rearm(timer.clone(), count.clone());

        timer.advance(Duration::from_secs(3));
        assert_eq!(*count.lock().unwrap(), 3);
        assert_eq!(timer.pending(), 1);
    }

    #[test]
    fn thread_timer_fires_after_delay() {
        let timer = ThreadTimer::new();
        let (tx, rx) = mpsc::channel();
        timer
            .schedule(Duration::from_millis(20), Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn thread_timer_cancel_prevents_callback() {
        let timer = ThreadTimer::new();
        let (tx, rx) = mpsc::channel();
        let h = timer
            .schedule(Duration::from_millis(100), Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        assert_eq!(timer.pending(), 1);
        timer.cancel(h);
        timer.cancel(h);
        assert_eq!(timer.pending(), 0);
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }
}
