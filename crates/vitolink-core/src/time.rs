//! Monotonic millisecond timestamps
//!
//! The protocol engines are driven by a host loop that supplies the current
//! time on every poll. Timestamps are 32-bit millisecond counters compared
//! by wrapping subtraction, so a counter rollover (every ~49.7 days) does not
//! disturb any running timeout.

use serde::{Deserialize, Serialize};

/// A monotonic millisecond timestamp supplied by the poll driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Millis(pub u32);

impl Millis {
    /// Milliseconds elapsed since `earlier`, wraparound-safe.
    pub fn elapsed_since(self, earlier: Millis) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }
}

impl From<u32> for Millis {
    fn from(ms: u32) -> Self {
        Millis(ms)
    }
}
