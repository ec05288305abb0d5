//! Process-wide cap on staged-but-unassembled bytes.

use crate::errors::{UploadError, UploadResult};
use std::sync::atomic::{AtomicU64, Ordering};

/// Admission control for the staging area.
///
/// Chunk writes reserve bytes as they stream in; cleanup, overwrite and
/// discarded writes release them. `used` never exceeds `capacity`.
#[derive(Debug)]
pub struct StagingBudget {
    capacity: u64,
    used: AtomicU64,
}

impl StagingBudget {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: AtomicU64::new(0),
        }
    }

    /// Reserve `bytes` or fail with `StorageExhausted` leaving usage untouched.
    pub fn try_reserve(&self, bytes: u64) -> UploadResult<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|next| *next <= self.capacity)
            })
            .map(|_| ())
            .map_err(|used| UploadError::StorageExhausted {
                requested: bytes,
                available: self.capacity.saturating_sub(used),
            })
    }

    pub fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        // fetch_update only fails when the closure returns None, which it never does here.
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used())
    }

    /// True when no new session should be admitted.
    pub fn is_full(&self) -> bool {
        self.used() >= self.capacity
    }
}
