//! Sequence numbers for outgoing frames.
//!
//! Every frame a client sends carries a `sequence` string.  Devices echo it
//! back and use it to tell commands apart, so within one session the values
//! must strictly increase.  Devices themselves use millisecond timestamps
//! (`"1548124045842"`), and [`SequenceCounter::from_clock`] seeds the counter
//! the same way so our values look alike in captures.
//!
//! The counter is an `AtomicU64`: concurrent dispatcher calls each get a
//! distinct value without taking a lock.

use std::sync::atomic::{AtomicU64, Ordering};

use super::handshake::unix_millis;

/// A thread-safe, monotonically increasing counter.
///
/// # Examples
///
/// ```rust
/// use sonoff_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::starting_at(10);
/// assert_eq!(counter.next(), 10);
/// assert_eq!(counter.next(), 11);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    /// Creates a counter starting at 0.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            inner: AtomicU64::new(first),
        }
    }

    /// Creates a counter seeded with the current unix time in milliseconds.
    pub fn from_clock() -> Self {
        Self::starting_at(unix_millis())
    }

    /// Returns the next sequence number.
    ///
    /// Wraps from `u64::MAX` to 0 without panicking.  `Relaxed` ordering is
    /// enough: the value orders frames, it does not publish memory.
    pub fn next(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// The value the next call to [`next`](Self::next) will return.
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
