//! Edge-triggered fault-occurrence counters.
//!
//! A protection flag tripping is only counted once per occurrence: the
//! counter increments on a false->true transition between two consecutive
//! successful polls and on nothing else.

use crate::protocol::ProtectionStatus;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One saturating occurrence counter per protection flag.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FaultCounts {
    pub single_cell_overvoltage: u8,
    pub single_cell_undervoltage: u8,
    pub pack_overvoltage: u8,
    pub pack_undervoltage: u8,
    pub charge_over_temperature: u8,
    pub charge_under_temperature: u8,
    pub discharge_over_temperature: u8,
    pub discharge_under_temperature: u8,
    pub charge_overcurrent: u8,
    pub discharge_overcurrent: u8,
    pub short_circuit: u8,
    pub frontend_ic_error: u8,
    pub software_lock: u8,
}

fn edge(previous: bool, current: bool, count: u8) -> u8 {
    if !previous && current {
        count.saturating_add(1)
    } else {
        count
    }
}

impl FaultCounts {
    /// Fold one pair of consecutive protection-status snapshots into the
    /// counters. Each flag is compared independently; true->true,
    /// true->false and false->false leave its counter untouched.
    #[must_use]
    pub fn observe(self, previous: ProtectionStatus, current: ProtectionStatus) -> Self {
        Self {
            single_cell_overvoltage: edge(
                previous.single_cell_overvoltage,
                current.single_cell_overvoltage,
                self.single_cell_overvoltage,
            ),
            single_cell_undervoltage: edge(
                previous.single_cell_undervoltage,
                current.single_cell_undervoltage,
                self.single_cell_undervoltage,
            ),
            pack_overvoltage: edge(
                previous.pack_overvoltage,
                current.pack_overvoltage,
                self.pack_overvoltage,
            ),
            pack_undervoltage: edge(
                previous.pack_undervoltage,
                current.pack_undervoltage,
                self.pack_undervoltage,
            ),
            charge_over_temperature: edge(
                previous.charge_over_temperature,
                current.charge_over_temperature,
                self.charge_over_temperature,
            ),
            charge_under_temperature: edge(
                previous.charge_under_temperature,
                current.charge_under_temperature,
                self.charge_under_temperature,
            ),
            discharge_over_temperature: edge(
                previous.discharge_over_temperature,
                current.discharge_over_temperature,
                self.discharge_over_temperature,
            ),
            discharge_under_temperature: edge(
                previous.discharge_under_temperature,
                current.discharge_under_temperature,
                self.discharge_under_temperature,
            ),
            charge_overcurrent: edge(
                previous.charge_overcurrent,
                current.charge_overcurrent,
                self.charge_overcurrent,
            ),
            discharge_overcurrent: edge(
                previous.discharge_overcurrent,
                current.discharge_overcurrent,
                self.discharge_overcurrent,
            ),
            short_circuit: edge(previous.short_circuit, current.short_circuit, self.short_circuit),
            frontend_ic_error: edge(
                previous.frontend_ic_error,
                current.frontend_ic_error,
                self.frontend_ic_error,
            ),
            software_lock: edge(previous.software_lock, current.software_lock, self.software_lock),
        }
    }

    /// Zero every counter. Invoked on an explicit external trigger only,
    /// never automatically.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
