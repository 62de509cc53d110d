//! Signals: atomically observable values with blocking condition waits
//!
//! A [`Signal`] is a cloneable handle to a shared 64-bit value. Every
//! mutation bumps the signal's store generation and notifies a process-wide
//! event hub, so a single waiter can block on an arbitrary set of signals
//! without registering itself with each one.
//!
//! # Waiting
//!
//! ```rust
//! use hsa_core::{Signal, SignalCondition};
//! use std::time::Duration;
//!
//! let signal = Signal::new(1);
//! let worker = {
//!     let signal = signal.clone();
//!     std::thread::spawn(move || signal.subtract(1))
//! };
//! let observed = signal.wait(SignalCondition::Eq, 0, Some(Duration::from_secs(5)));
//! assert_eq!(observed, 0);
//! worker.join().unwrap();
//! ```

use parking_lot::{const_mutex, Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Value carried by a signal
pub type SignalValue = i64;

/// Comparison applied between a signal's current value and a target value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalCondition {
    /// current == target
    Eq,
    /// current != target
    Ne,
    /// current < target
    Lt,
    /// current >= target
    Gte,
}

impl SignalCondition {
    /// Evaluate the condition.
    pub const fn is_satisfied(self, current: SignalValue, target: SignalValue) -> bool {
        match self {
            SignalCondition::Eq => current == target,
            SignalCondition::Ne => current != target,
            SignalCondition::Lt => current < target,
            SignalCondition::Gte => current >= target,
        }
    }
}

impl fmt::Display for SignalCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            SignalCondition::Eq => "==",
            SignalCondition::Ne => "!=",
            SignalCondition::Lt => "<",
            SignalCondition::Gte => ">=",
        };
        f.write_str(op)
    }
}

// ================================================================================================
// Event hub
// ================================================================================================

/// Process-wide notification point shared by every signal.
///
/// Mutators update the atomic state first and then take the hub lock to
/// notify; waiters evaluate their predicate while holding the lock. A
/// mutation can therefore never slip between a waiter's check and its sleep.
struct SignalHub {
    lock: Mutex<()>,
    changed: Condvar,
}

static HUB: SignalHub = SignalHub {
    lock: const_mutex(()),
    changed: Condvar::new(),
};

static NEXT_SIGNAL_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn notify_all() {
    let _guard = HUB.lock.lock();
    HUB.changed.notify_all();
}

/// Block until `ready` returns true, the timeout elapses, or forever.
///
/// `slice` bounds each individual sleep so that polling-mode waits re-check
/// the predicate periodically even without notifications. `ready` runs with
/// the hub lock held and must not mutate any signal.
///
/// Returns whether `ready` was satisfied.
pub(crate) fn wait_until<F>(mut ready: F, timeout: Option<Duration>, slice: Option<Duration>) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut guard = HUB.lock.lock();
    loop {
        if ready() {
            return true;
        }

        let now = Instant::now();
        if deadline.is_some_and(|d| now >= d) {
            return false;
        }

        let wake_at = match (deadline, slice) {
            (Some(d), Some(s)) => Some(d.min(now + s)),
            (Some(d), None) => Some(d),
            (None, Some(s)) => Some(now + s),
            (None, None) => None,
        };

        match wake_at {
            Some(at) => {
                HUB.changed.wait_until(&mut guard, at);
            }
            None => HUB.changed.wait(&mut guard),
        }
    }
}

// ================================================================================================
// Signal
// ================================================================================================

struct SignalInner {
    id: u64,
    value: AtomicI64,
    /// Twice the mutation count, odd while a mutation is in flight
    sequence: AtomicU64,
    /// Serializes mutators so the sequence parity stays meaningful
    writer: Mutex<()>,
}

/// Shared, atomically observable signal value.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl Signal {
    /// Create a signal holding `initial`.
    pub fn new(initial: SignalValue) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                id: NEXT_SIGNAL_ID.fetch_add(1, Ordering::Relaxed),
                value: AtomicI64::new(initial),
                sequence: AtomicU64::new(0),
                writer: Mutex::new(()),
            }),
        }
    }

    /// Unique identifier of the underlying signal (shared by clones).
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current value.
    pub fn load(&self) -> SignalValue {
        self.inner.value.load(Ordering::Acquire)
    }

    /// Number of mutations completed so far.
    pub fn generation(&self) -> u64 {
        self.inner.sequence.load(Ordering::Acquire) / 2
    }

    /// Value and generation read as one consistent pair.
    ///
    /// The value is the one written by exactly that many mutations.
    pub fn snapshot(&self) -> (SignalValue, u64) {
        loop {
            let before = self.inner.sequence.load(Ordering::Acquire);
            if before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let value = self.inner.value.load(Ordering::Acquire);
            if self.inner.sequence.load(Ordering::Acquire) == before {
                return (value, before / 2);
            }
        }
    }

    /// Replace the value.
    pub fn store(&self, value: SignalValue) {
        self.mutate(|cell| cell.store(value, Ordering::Release));
    }

    /// Add `delta` and return the new value.
    pub fn add(&self, delta: SignalValue) -> SignalValue {
        let previous = self.mutate(|cell| cell.fetch_add(delta, Ordering::AcqRel));
        previous.wrapping_add(delta)
    }

    /// Subtract `delta` and return the new value.
    pub fn subtract(&self, delta: SignalValue) -> SignalValue {
        let previous = self.mutate(|cell| cell.fetch_sub(delta, Ordering::AcqRel));
        previous.wrapping_sub(delta)
    }

    /// Replace the value, returning the previous one.
    pub fn exchange(&self, value: SignalValue) -> SignalValue {
        self.mutate(|cell| cell.swap(value, Ordering::AcqRel))
    }

    /// Block until `cond` holds against `value` or the timeout expires.
    ///
    /// Returns the value observed last, which satisfies the condition unless
    /// the wait timed out.
    pub fn wait(&self, cond: SignalCondition, value: SignalValue, timeout: Option<Duration>) -> SignalValue {
        self.wait_sliced(cond, value, timeout, None)
    }

    pub(crate) fn wait_sliced(
        &self,
        cond: SignalCondition,
        value: SignalValue,
        timeout: Option<Duration>,
        slice: Option<Duration>,
    ) -> SignalValue {
        let mut observed = self.load();
        wait_until(
            || {
                observed = self.load();
                cond.is_satisfied(observed, value)
            },
            timeout,
            slice,
        );
        observed
    }

    /// Block until any of `watches` is satisfied and return its index
    /// (lowest index wins when several hold), or `None` on timeout.
    pub fn wait_any(watches: &[(&Signal, SignalCondition, SignalValue)], timeout: Option<Duration>) -> Option<usize> {
        let mut hit = None;
        wait_until(
            || {
                hit = watches
                    .iter()
                    .position(|(signal, cond, value)| cond.is_satisfied(signal.load(), *value));
                hit.is_some()
            },
            timeout,
            None,
        );
        hit
    }

    /// Whether two handles refer to the same signal.
    pub fn same_as(&self, other: &Signal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn mutate<T>(&self, write: impl FnOnce(&AtomicI64) -> T) -> T {
        let result = {
            let _writer = self.inner.writer.lock();
            self.inner.sequence.fetch_add(1, Ordering::AcqRel);
            let result = write(&self.inner.value);
            self.inner.sequence.fetch_add(1, Ordering::Release);
            result
        };
        notify_all();
        result
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.inner.id)
            .field("value", &self.load())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_conditions() {
        assert!(SignalCondition::Eq.is_satisfied(3, 3));
        assert!(!SignalCondition::Eq.is_satisfied(3, 4));
        assert!(SignalCondition::Ne.is_satisfied(3, 4));
        assert!(SignalCondition::Lt.is_satisfied(-1, 0));
        assert!(!SignalCondition::Lt.is_satisfied(0, 0));
        assert!(SignalCondition::Gte.is_satisfied(0, 0));
        assert_eq!(SignalCondition::Gte.to_string(), ">=");
    }

    #[test]
    fn test_arithmetic_bumps_generation() {
        let signal = Signal::new(5);
        assert_eq!(signal.generation(), 0);
        assert_eq!(signal.subtract(2), 3);
        assert_eq!(signal.add(10), 13);
        assert_eq!(signal.exchange(-1), 13);
        signal.store(7);
        assert_eq!(signal.load(), 7);
        assert_eq!(signal.generation(), 4);
    }

    #[test]
    fn test_snapshot_pairs_value_with_generation() {
        const STORES: i64 = 20_000;
        let signal = Signal::new(0);
        let writer = {
            let signal = signal.clone();
            thread::spawn(move || {
                for i in 1..=STORES {
                    signal.store(i);
                }
            })
        };

        let mut last = 0;
        while last < STORES as u64 {
            let (value, generation) = signal.snapshot();
            assert_eq!(value, generation as i64, "value and generation torn apart");
            assert!(generation >= last);
            last = generation;
        }
        writer.join().unwrap();
        assert_eq!(signal.snapshot(), (STORES, STORES as u64));
    }

    #[test]
    fn test_clones_share_state() {
        let a = Signal::new(0);
        let b = a.clone();
        b.store(9);
        assert_eq!(a.load(), 9);
        assert!(a.same_as(&b));
        assert!(!a.same_as(&Signal::new(9)));
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_wait_times_out() {
        let signal = Signal::new(1);
        let observed = signal.wait(SignalCondition::Eq, 0, Some(Duration::from_millis(20)));
        assert_eq!(observed, 1);
    }

    #[test]
    fn test_wait_wakes_on_store() {
        let signal = Signal::new(1);
        let setter = {
            let signal = signal.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                signal.store(0);
            })
        };
        let observed = signal.wait(SignalCondition::Eq, 0, Some(Duration::from_secs(5)));
        assert_eq!(observed, 0);
        setter.join().unwrap();
    }

    #[test]
    fn test_polling_wait() {
        let signal = Signal::new(2);
        let setter = {
            let signal = signal.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                signal.subtract(2);
            })
        };
        let observed = signal.wait_sliced(
            SignalCondition::Lt,
            1,
            Some(Duration::from_secs(5)),
            Some(Duration::from_micros(100)),
        );
        assert_eq!(observed, 0);
        setter.join().unwrap();
    }

    #[test]
    fn test_wait_any_reports_lowest_satisfied_index() {
        let a = Signal::new(1);
        let b = Signal::new(0);
        let c = Signal::new(0);
        let index = Signal::wait_any(
            &[
                (&a, SignalCondition::Eq, 0),
                (&b, SignalCondition::Eq, 0),
                (&c, SignalCondition::Eq, 0),
            ],
            Some(Duration::from_secs(1)),
        );
        assert_eq!(index, Some(1));

        let none = Signal::wait_any(&[(&a, SignalCondition::Eq, 0)], Some(Duration::from_millis(10)));
        assert_eq!(none, None);
    }
}
