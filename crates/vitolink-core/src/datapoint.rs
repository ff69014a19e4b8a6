//! Datapoint descriptors
//!
//! A datapoint is one addressable memory cell of the controller: a 16-bit
//! address, a fixed byte width and a direction. For the GWG dialect the high
//! address byte carries a function code selecting the operation class; KW
//! and P300 use the full 16 bits as a flat memory address.

use serde::{Deserialize, Serialize};

use crate::optolink::MAX_DP_LENGTH;
use crate::value::ValueKind;

/// Pack a GWG address from a function code and a physical 1-byte address.
pub const fn pack_gwg_address(function: u8, physical: u8) -> u16 {
    ((function as u16) << 8) | physical as u16
}

/// Description of one controller memory cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    /// Human-readable name, used for logging only
    pub name: String,
    /// Cell address (see module docs for the GWG packing)
    pub address: u16,
    /// Byte width of the cell, `1..=MAX_DP_LENGTH`
    pub length: usize,
    /// Whether values may be written to this cell
    pub writeable: bool,
    /// Raw byte interpretation
    pub kind: ValueKind,
    /// Divisor applied when decoding (and multiplied back in when encoding),
    /// e.g. 10 for temperatures stored in tenths of a degree
    pub div_ratio: f64,
}

impl Datapoint {
    /// Create a read-only datapoint with a divisor of 1.
    pub fn new(name: impl Into<String>, address: u16, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            address,
            length: kind.width(),
            writeable: false,
            kind,
            div_ratio: 1.0,
        }
    }

    /// Set the decode divisor.
    pub fn with_div_ratio(mut self, div_ratio: f64) -> Self {
        self.div_ratio = div_ratio;
        self
    }

    /// Mark the datapoint writeable.
    pub fn writeable(mut self) -> Self {
        self.writeable = true;
        self
    }

    /// Whether the descriptor is structurally sound.
    pub fn is_valid(&self) -> bool {
        self.length >= 1 && self.length <= MAX_DP_LENGTH && self.div_ratio > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_gwg_address() {
        assert_eq!(pack_gwg_address(0x04, 0x20), 0x0420);
        assert_eq!(pack_gwg_address(0x00, 0xFF), 0x00FF);
        assert_eq!(pack_gwg_address(0x67, 0x00), 0x6700);
    }

    #[test]
    fn test_builder() {
        let dp = Datapoint::new("boiler_temp", 0x5525, ValueKind::I16)
            .with_div_ratio(10.0)
            .writeable();
        assert_eq!(dp.length, 2);
        assert!(dp.writeable);
        assert!(dp.is_valid());
    }
}
