//! Auxiliary state shared between concurrent pipeline invocations
//!
//! In the kernel this is a BPF map, in userspace anything that provides per
//! key atomic updates. Stages and the trampoline only ever see it through
//! [`AuxState`], and never rely on cross-key consistency.

use std::sync::atomic::{AtomicU64, Ordering};

/// Narrow key/value accessors into externally managed, shared state
///
/// Implementations must make [`Self::add`] atomic per key, as many
/// invocations on different cores may update the same key concurrently
pub trait AuxState: Sync {
    /// Gets the current value of `key`, `None` if the key does not exist
    fn get(&self, key: u32) -> Option<u64>;
    /// Atomically adds `delta` to `key`, returning the previous value, or
    /// `None` if the key does not exist
    fn add(&self, key: u32, delta: u64) -> Option<u64>;

    /// Increments the specified diagnostic counter
    #[inline]
    fn increment(&self, counter: Counter) {
        // Missing counters are not an error, the state may simply be smaller
        // than the number of stages
        let _ = self.add(counter.key(), 1);
    }
}

/// State that holds no keys, for pipelines that do not track anything
impl AuxState for () {
    #[inline]
    fn get(&self, _key: u32) -> Option<u64> {
        None
    }

    #[inline]
    fn add(&self, _key: u32, _delta: u64) -> Option<u64> {
        None
    }
}

/// The number of keys reserved for non-stage counters, [`Counter::Stage`]
/// keys start after these
pub const RESERVED_COUNTERS: u32 = 8;

/// Diagnostic counters maintained by [`crate::Pipeline::run`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Counter {
    /// An invocation finished with [`crate::Disposition::Pass`]
    Pass,
    /// An invocation finished with [`crate::Disposition::Drop`]
    Drop,
    /// An invocation finished with [`crate::Disposition::Tx`]
    Tx,
    /// An invocation finished with [`crate::Disposition::Redirect`]
    Redirect,
    /// An invocation finished with [`crate::Disposition::Aborted`]
    Aborted,
    /// A stage requested a transfer to an unregistered or out of range index
    InvalidIndex,
    /// An invocation exceeded the configured number of transfers
    ChainLimit,
    /// The number of times the stage at the index was entered
    Stage(u32),
}

impl Counter {
    /// The key the counter is stored under
    #[inline]
    pub fn key(self) -> u32 {
        match self {
            Self::Pass => 0,
            Self::Drop => 1,
            Self::Tx => 2,
            Self::Redirect => 3,
            Self::Aborted => 4,
            Self::InvalidIndex => 5,
            Self::ChainLimit => 6,
            Self::Stage(index) => RESERVED_COUNTERS.saturating_add(index),
        }
    }
}

/// A fixed size array of atomic counters, the userspace equivalent of a
/// `BPF_MAP_TYPE_ARRAY` of `u64`
pub struct CounterArray<const N: usize> {
    slots: [AtomicU64; N],
}

impl<const N: usize> CounterArray<N> {
    /// Creates an array with every counter set to zero
    #[inline]
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Gets the value of a diagnostic counter, zero if it does not exist
    #[inline]
    pub fn counter(&self, counter: Counter) -> u64 {
        self.get(counter.key()).unwrap_or_default()
    }

    /// Resets every counter to zero
    #[inline]
    pub fn reset(&self) {
        for slot in &self.slots {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

impl<const N: usize> Default for CounterArray<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> AuxState for CounterArray<N> {
    #[inline]
    fn get(&self, key: u32) -> Option<u64> {
        self.slots
            .get(key as usize)
            .map(|slot| slot.load(Ordering::Relaxed))
    }

    #[inline]
    fn add(&self, key: u32, delta: u64) -> Option<u64> {
        self.slots
            .get(key as usize)
            .map(|slot| slot.fetch_add(delta, Ordering::Relaxed))
    }
}
