//! Bounded counter used to cap concurrent first-connection attempts.

use parking_lot::Mutex;

/// Default number of callers allowed to wait on a broker connection at once.
pub const DEFAULT_MAX_CONNECTION_WAITERS: u32 = 100;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("value {requested} exceeds maximum {maximum}")]
pub struct ExceedsMaximum {
    pub requested: u64,
    pub maximum: u32,
}

/// A mutex-protected counter that never leaves `0..=maximum`.
#[derive(Debug)]
pub struct BoundedCounter {
    maximum: u32,
    count: Mutex<u32>,
}

impl BoundedCounter {
    /// Creates a counter; an initial value above `maximum` is clamped.
    pub fn new(maximum: u32, initial: u32) -> Self {
        Self {
            maximum,
            count: Mutex::new(initial.min(maximum)),
        }
    }

    pub fn maximum(&self) -> u32 {
        self.maximum
    }

    pub fn value(&self) -> u32 {
        *self.count.lock()
    }

    pub fn set(&self, value: u32) -> Result<(), ExceedsMaximum> {
        if value > self.maximum {
            return Err(ExceedsMaximum {
                requested: value as u64,
                maximum: self.maximum,
            });
        }
        *self.count.lock() = value;
        Ok(())
    }

    /// Adds `delta`, leaving the count untouched when the result would exceed the maximum.
    pub fn add(&self, delta: u32) -> Result<(), ExceedsMaximum> {
        let mut count = self.count.lock();
        let next = *count as u64 + delta as u64;
        if next > self.maximum as u64 {
            return Err(ExceedsMaximum {
                requested: next,
                maximum: self.maximum,
            });
        }
        *count = next as u32;
        Ok(())
    }

    /// Subtracts `delta`, clamping at zero.
    pub fn subtract(&self, delta: u32) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(delta);
    }
}

impl Default for BoundedCounter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONNECTION_WAITERS, 0)
    }
}
