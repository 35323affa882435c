//! # Serial Allocation
//!
//! Request serials correlate an outbound command with its eventual response.
//! The 64-bit space is split into an epoch (high 32 bits) and a sequence
//! (low 32 bits). [`SerialAllocator::reset`] opens a new epoch, so a serial
//! handed out before a transport reset is never issued again and a late
//! response carrying it can only ever miss.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

const EPOCH_SHIFT: u32 = 32;
const SEQUENCE_MASK: u64 = (1 << EPOCH_SHIFT) - 1;

/// Process-unique request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Serial(pub u64);

impl Serial {
    /// Reset epoch this serial was issued in.
    pub fn epoch(self) -> u32 {
        (self.0 >> EPOCH_SHIFT) as u32
    }

    /// Position within the epoch.
    pub fn sequence(self) -> u32 {
        (self.0 & SEQUENCE_MASK) as u32
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}.{:04}]", self.epoch(), self.sequence())
    }
}

/// Lock-free, strictly increasing serial source.
#[derive(Debug, Default)]
pub struct SerialAllocator {
    next: AtomicU64,
}

impl SerialAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next serial.
    pub fn next(&self) -> Serial {
        Serial(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Start a fresh request space. Returns the new epoch.
    ///
    /// The counter only ever moves forward, so concurrent `next()` calls
    /// racing a reset still hand out distinct serials.
    pub fn reset(&self) -> u32 {
        let prev = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(((cur >> EPOCH_SHIFT) + 1) << EPOCH_SHIFT)
            })
            .unwrap_or_else(|cur| cur);
        ((prev >> EPOCH_SHIFT) + 1) as u32
    }

    /// Epoch the next serial will be issued in.
    pub fn current_epoch(&self) -> u32 {
        (self.next.load(Ordering::Relaxed) >> EPOCH_SHIFT) as u32
    }
}
