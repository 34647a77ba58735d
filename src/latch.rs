//! This module provides the blocking primitives used to join work, called
//! Latches.
//!
//! In the abstract, a latch is a way to block some logic from progressing on a
//! given thread. All latches begin "closed", blocking some logic. When the
//! latch is "opened", the logic progresses. The exact meaning of "closed" and
//! "open" depend on the latch in question.
//!
//! Latches implement one or both of the two core traits: [`Latch`] and
//! [`Probe`].
//!
//! [`Latch`] represents the "write-side" of the api, which allows consumers to
//! open arbitrary latches (and thus unblock whatever logic is blocked using the
//! latch). It defines a single function, [`Latch::set`], which (possibly)
//! opens the latch.
//!
//! [`Probe`] represents the "read-side" of the api, which allows consumers to
//! test if is latch is closed without blocking. It defines a single method,
//! [`Probe::probe`], which returns a boolean to indicate if the latch is open.
//!
//! Every latch here is reached through a shared reference (usually inside an
//! `Arc`), so unlike stack-allocated latches they stay valid for as long as
//! anyone can still call `set`.

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

// -----------------------------------------------------------------------------
// Latches and probes

/// This trait represents the "write-side" of the latch api. It exists to allow
/// consumers to open arbitrary latches (and thus unblock whatever logic is
/// blocked using the latch).
pub trait Latch {
    /// Possibly opens the latch. Calling this method does not have to open the
    /// latch, but there should be some situation in which it does.
    ///
    /// Returns `true` only for the call that moved the latch from closed to
    /// open.
    fn set(&self) -> bool;
}

/// This trait represents the "read-side" of the latch api. It exists to allow
/// consumers to check is a latch is open.
pub trait Probe {
    /// Returns `true` if the latch is open, and `false` if it is closed.
    fn probe(&self) -> bool;
}

// -----------------------------------------------------------------------------
// Atomic latch

/// A simple latch implemented using an atomic bool. It cannot block a thread
/// by itself; it is polled by loops that already have some other way to sleep.
pub struct AtomicLatch {
    /// The state of the latch, `true` for open and `false` for closed.
    state: AtomicBool,
}

impl AtomicLatch {
    /// Creates a new closed latch.
    #[inline]
    pub const fn new() -> Self {
        Self {
            state: AtomicBool::new(false),
        }
    }

    /// Resets the latch back to closed.
    #[inline]
    pub fn reset(&self) {
        self.state.store(false, Ordering::Release);
    }
}

impl Default for AtomicLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch for AtomicLatch {
    #[inline]
    fn set(&self) -> bool {
        !self.state.swap(true, Ordering::AcqRel)
    }
}

impl Probe for AtomicLatch {
    #[inline]
    fn probe(&self) -> bool {
        self.state.load(Ordering::Acquire)
    }
}

// -----------------------------------------------------------------------------
// Mutex-lock latch

/// A latch that can be used to block a thread, implemented using a mutex. This
/// is a signal-once, wait-many gate: any number of threads may wait, and all of
/// them are released when the latch is set.
pub struct LockLatch {
    mutex: Mutex<bool>,
    cond: Condvar,
}

impl LockLatch {
    /// Creates a new closed latch.
    #[inline]
    pub const fn new() -> LockLatch {
        LockLatch {
            mutex: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Waits for the latch to open by blocking the thread.
    pub fn wait(&self) {
        let mut guard = self.mutex.lock();
        while !*guard {
            self.cond.wait(&mut guard);
        }
    }

    /// Waits for the latch to open, giving up after `timeout`. Returns `true`
    /// if the latch opened and `false` if the timeout elapsed first.
    ///
    /// A timeout too large to be represented as an `Instant` waits without a
    /// limit.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        // Spurious wakeups must not extend the total wait, so we wait against
        // a fixed instant rather than re-arming the timeout.
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut guard = self.mutex.lock();
        while !*guard {
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return *guard;
            }
        }
        true
    }
}

impl Default for LockLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch for LockLatch {
    #[inline]
    fn set(&self) -> bool {
        let mut guard = self.mutex.lock();
        if *guard {
            return false;
        }
        *guard = true;
        self.cond.notify_all();
        true
    }
}

impl Probe for LockLatch {
    #[inline]
    fn probe(&self) -> bool {
        *self.mutex.lock()
    }
}

// -----------------------------------------------------------------------------
// Counting latch

/// A counting latch stores a decrementing counter and only opens when the
/// counter reaches zero. This means that, unlike other latches, multiple calls
/// to `Latch::set` are required to open the latch: exactly as many as the
/// initial count.
///
/// This is the countdown barrier behind batch joins. A batch of `n` jobs uses
/// a count of `n + 1`, where the extra permit belongs to the thread launching
/// the jobs. That thread only releases its permit once every job has been
/// launched, so the latch cannot open while launching is still in progress,
/// even if every launched job has already finished.
///
/// Counting latches wrap a lock latch, so they can block a waiting thread.
pub struct CountLatch {
    counter: AtomicUsize,
    latch: LockLatch,
}

impl CountLatch {
    /// Creates a new closed latch with the specified count. A count of zero
    /// produces a latch that is already open.
    #[inline]
    pub fn with_count(count: usize) -> Self {
        let latch = LockLatch::new();
        if count == 0 {
            latch.set();
        }
        Self {
            counter: AtomicUsize::new(count),
            latch,
        }
    }

    /// Returns the number of `Latch::set` calls still needed to open the
    /// latch. This is a snapshot and may be stale as soon as it returns.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.counter.load(Ordering::Acquire)
    }

    /// Blocks until the count reaches zero.
    pub fn wait(&self) {
        self.latch.wait();
    }

    /// Blocks until the count reaches zero or `timeout` elapses. Returns `true`
    /// if the latch opened.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.latch.wait_for(timeout)
    }
}

impl Latch for CountLatch {
    /// Decrements the count, opening the latch when it reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if the count is already zero. Every permit must be released
    /// exactly once, so an extra release means some job reported completion
    /// twice.
    #[inline]
    fn set(&self) -> bool {
        let previous = self.counter.fetch_sub(1, Ordering::AcqRel);
        assert_ne!(previous, 0, "count latch released more times than its count");
        previous == 1 && self.latch.set()
    }
}

impl Probe for CountLatch {
    #[inline]
    fn probe(&self) -> bool {
        self.latch.probe()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{atomic::AtomicUsize, Arc},
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn atomic_latch_opens_once_and_resets() {
        let latch = AtomicLatch::new();
        assert!(!latch.probe());
        assert!(latch.set());
        assert!(!latch.set());
        assert!(latch.probe());
        latch.reset();
        assert!(!latch.probe());
    }

    #[test]
    fn lock_latch_releases_every_waiter() {
        let latch = Arc::new(LockLatch::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        assert!(latch.set());
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert!(latch.probe());
    }

    #[test]
    fn lock_latch_wait_for_times_out_while_closed() {
        let latch = LockLatch::new();
        assert!(!latch.wait_for(Duration::from_millis(20)));
        latch.set();
        assert!(latch.wait_for(Duration::from_millis(20)));
    }

    #[test]
    fn lock_latch_wait_for_accepts_unbounded_timeout() {
        let latch = Arc::new(LockLatch::new());
        let setter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                latch.set();
            })
        };
        assert!(latch.wait_for(Duration::MAX));
        setter.join().unwrap();
    }

    #[test]
    fn count_latch_with_zero_count_is_open() {
        let latch = CountLatch::with_count(0);
        assert!(latch.probe());
        latch.wait();
    }

    #[test]
    fn count_latch_opens_on_last_release() {
        let latch = CountLatch::with_count(3);
        assert!(!latch.set());
        assert!(!latch.set());
        assert!(!latch.probe());
        assert_eq!(latch.remaining(), 1);
        assert!(latch.set());
        assert!(latch.probe());
        assert_eq!(latch.remaining(), 0);
    }

    #[test]
    #[should_panic(expected = "released more times than its count")]
    fn count_latch_rejects_extra_release() {
        let latch = CountLatch::with_count(1);
        latch.set();
        latch.set();
    }

    #[test]
    fn count_latch_opens_exactly_once_under_contention() {
        const THREADS: usize = 64;

        for _ in 0..20 {
            // One permit per thread plus one held back by this thread, in the
            // same shape a batch uses.
            let latch = Arc::new(CountLatch::with_count(THREADS + 1));
            let openings = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let latch = Arc::clone(&latch);
                    let openings = Arc::clone(&openings);
                    thread::spawn(move || {
                        if latch.set() {
                            openings.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }
            assert!(!latch.probe());
            assert_eq!(latch.remaining(), 1);

            if latch.set() {
                openings.fetch_add(1, Ordering::SeqCst);
            }
            latch.wait();
            assert_eq!(openings.load(Ordering::SeqCst), 1);
        }
    }
}
