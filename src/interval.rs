//! Address ranges tracked by the shadow heap.
//!
//! An [`Interval`] is closed on both ends: `[left, right]` covers
//! `right - left + 1` bytes. Besides geometry it carries the per-region
//! flags the interval tree needs for GC bookkeeping (`marked`), new-region
//! announcement (`flushed`) and forest placement (`handled_by_gc`).

use std::fmt;

pub type Address = usize;

/// Null reference. Always resolves to the sentinel zero object.
pub const NULL_ADDRESS: Address = 0;

/// Placeholder address of a stack cell that has no real memory yet.
pub const UNKNOWN_ADDRESS: Address = 1;

/// Relocation of a block of memory from `old_base` to `new_base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shift {
    pub old_base: Address,
    pub new_base: Address,
}

impl Shift {
    pub fn new(old_base: Address, new_base: Address) -> Self {
        Self { old_base, new_base }
    }

    pub fn move_address(&self, address: Address) -> Address {
        debug_assert!(
            self.old_base <= address,
            "Shift applied below its base: {:#x} < {:#x}",
            address,
            self.old_base
        );
        self.new_base.wrapping_add(address - self.old_base)
    }

    /// Signed distance of the relocation.
    pub fn delta(&self) -> isize {
        self.new_base.wrapping_sub(self.old_base) as isize
    }
}

#[derive(Debug, Clone)]
pub struct Interval {
    pub left: Address,
    pub right: Address,
    marked: bool,
    flushed: bool,
    handled_by_gc: bool,
}

impl Interval {
    pub fn new(left: Address, size: usize) -> Self {
        assert!(size > 0, "Interval must cover at least one byte");
        Self {
            left,
            right: left + size - 1,
            marked: false,
            flushed: false,
            handled_by_gc: true,
        }
    }

    pub fn from_bounds(left: Address, right: Address) -> Self {
        assert!(left <= right, "Interval bounds reversed");
        Self {
            left,
            right,
            marked: false,
            flushed: false,
            handled_by_gc: true,
        }
    }

    pub fn size(&self) -> usize {
        self.right - self.left + 1
    }

    pub fn contains(&self, point: Address) -> bool {
        self.left <= point && point <= self.right
    }

    pub fn includes(&self, other: &Interval) -> bool {
        self.left <= other.left && other.right <= self.right
    }

    pub fn intersects(&self, other: &Interval) -> bool {
        self.left <= other.right && other.left <= self.right
    }

    pub fn intersect(&self, other: &Interval) -> Option<Interval> {
        if !self.intersects(other) {
            return None;
        }
        Some(Interval::from_bounds(
            self.left.max(other.left),
            self.right.min(other.right),
        ))
    }

    pub fn move_by(&mut self, shift: &Shift) {
        self.left = shift.move_address(self.left);
        self.right = shift.move_address(self.right);
    }

    /// Rebase the interval keeping its size.
    pub fn rebase(&mut self, address: Address) {
        let size = self.size();
        self.left = address;
        self.right = address + size - 1;
    }

    pub fn resize(&mut self, size: usize) {
        assert!(size > 0, "Interval must cover at least one byte");
        self.right = self.left + size - 1;
    }

    pub fn mark(&mut self) {
        if self.marked {
            log::warn!("Interval {} was double marked", self);
        }
        self.marked = true;
    }

    pub fn unmark(&mut self) {
        if !self.marked {
            log::warn!("Interval {} was double unmarked", self);
        }
        self.marked = false;
    }

    pub fn is_marked(&self) -> bool {
        self.marked
    }

    pub fn flush(&mut self) {
        debug_assert!(!self.flushed, "Interval {} flushed twice", self);
        self.flushed = true;
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    pub fn disable_gc(&mut self) {
        self.handled_by_gc = false;
    }

    pub fn is_handled_by_gc(&self) -> bool {
        self.handled_by_gc
    }
}

impl PartialEq for Interval {
    fn eq(&self, other: &Self) -> bool {
        self.left == other.left && self.right == other.right
    }
}

impl Eq for Interval {}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x} ... {:#x}]", self.left, self.right)
    }
}
