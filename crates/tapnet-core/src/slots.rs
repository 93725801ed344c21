//! Static slot table: pre-computed TAP descriptors.
//!
//! Built once at startup from the pool configuration and never mutated
//! afterwards. Every field of a slot is a pure function of the
//! configuration and the slot index.

use crate::config::{PoolConfig, MAX_SLOTS};
use crate::error::CoreError;
use std::net::Ipv4Addr;

/// One pre-computed resource descriptor in the fixed pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    /// Position in the table, `0..MAX_SLOTS`.
    pub index: usize,
    /// TAP device name, e.g. `tap3`.
    pub device_name: String,
    /// IPv4 address assigned to the device.
    pub address: Ipv4Addr,
    /// UDP port the worker is told to serve on.
    pub primary_port: u16,
}

/// Immutable table of [`MAX_SLOTS`] slots.
#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    /// Derive the full table from the pool configuration.
    ///
    /// # Errors
    ///
    /// [`CoreError::ConfigurationFatal`] if `base_address` does not parse
    /// as an IPv4 address, or derivation overflows the address or port
    /// space. Callers abort startup on this error.
    pub fn new(config: &PoolConfig) -> Result<Self, CoreError> {
        let base: Ipv4Addr = config.base_address.parse().map_err(|_| {
            CoreError::ConfigurationFatal(format!(
                "base_address {:?} is not a valid IPv4 address",
                config.base_address
            ))
        })?;
        let base_bits = u32::from(base);

        let mut slots = Vec::with_capacity(MAX_SLOTS);
        for index in 0..MAX_SLOTS {
            let addr_bits = (index as u32)
                .checked_mul(config.address_step)
                .and_then(|offset| base_bits.checked_add(offset))
                .ok_or_else(|| {
                    CoreError::ConfigurationFatal(format!(
                        "address derivation overflows at slot {index}"
                    ))
                })?;
            let primary_port = config
                .base_port
                .checked_add(index as u16)
                .ok_or_else(|| {
                    CoreError::ConfigurationFatal(format!(
                        "port derivation overflows at slot {index}"
                    ))
                })?;

            slots.push(Slot {
                index,
                device_name: format!("{}{}", config.device_base, config.start_offset + index),
                address: Ipv4Addr::from(addr_bits),
                primary_port,
            });
        }

        tracing::debug!(
            slots = slots.len(),
            base = %base,
            step = config.address_step,
            "Slot table derived"
        );
        Ok(Self { slots })
    }

    /// Look up a slot by index. Pure; panics only on an out-of-range index,
    /// which callers bound by [`len`](Self::len).
    pub fn get(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    /// Number of physical slots in the table.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table is empty (never true for a derived table).
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate over all slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }
}
