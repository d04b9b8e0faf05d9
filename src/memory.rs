//! Access to the bytes behind tracked regions.
//!
//! The shadow heap never owns the memory it describes. Reading it out for
//! the external executor goes through [`MemoryReader`] so the same storage
//! code works against the live process and against captured snapshots.

use std::collections::BTreeMap;

use crate::{error::ShadowError, interval::Address};

pub trait MemoryReader {
    fn read(&self, address: Address, buffer: &mut [u8]) -> Result<(), ShadowError>;
}

/// Reads straight out of the current process.
///
/// The instrumented application and this runtime share an address space,
/// so a tracked object's address is a valid pointer for as long as the
/// collector is paused.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemory;

impl MemoryReader for ProcessMemory {
    fn read(&self, address: Address, buffer: &mut [u8]) -> Result<(), ShadowError> {
        if address == 0 || address.checked_add(buffer.len()).is_none() {
            return Err(ShadowError::MemoryRead {
                address,
                size: buffer.len(),
            });
        }
        // Safety: callers only pass addresses of regions the storage tracks,
        // which are mapped and not moving while the command lock is held
        unsafe {
            std::ptr::copy_nonoverlapping(
                address as *const u8,
                buffer.as_mut_ptr(),
                buffer.len(),
            );
        }
        Ok(())
    }
}

/// Memory captured as a set of disjoint blocks, keyed by base address.
#[derive(Debug, Clone, Default)]
pub struct SnapshotMemory {
    blocks: BTreeMap<Address, Vec<u8>>,
}

impl SnapshotMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: Address, bytes: Vec<u8>) {
        self.blocks.insert(address, bytes);
    }

    pub fn write_word(&mut self, address: Address, value: u64) -> Result<(), ShadowError> {
        let (base, block) = self
            .blocks
            .range_mut(..=address)
            .next_back()
            .ok_or(ShadowError::MemoryRead { address, size: 8 })?;
        let start = address - *base;
        let target = block
            .get_mut(start..start + 8)
            .ok_or(ShadowError::MemoryRead { address, size: 8 })?;
        target.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

impl MemoryReader for SnapshotMemory {
    fn read(&self, address: Address, buffer: &mut [u8]) -> Result<(), ShadowError> {
        let size = buffer.len();
        let error = || ShadowError::MemoryRead { address, size };
        let (base, block) = self.blocks.range(..=address).next_back().ok_or_else(error)?;
        let start = address - base;
        let source = block.get(start..start + size).ok_or_else(error)?;
        buffer.copy_from_slice(source);
        Ok(())
    }
}
