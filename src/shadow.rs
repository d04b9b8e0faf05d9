//! Process-wide shadow heap context.
//!
//! The probes reach the [`Storage`] through a [`ShadowHeap`]. Building and
//! sending one command to the executor happens under a single coarse lock:
//! [`ShadowHeap::lock`] hands out a [`CommandGuard`] which owns the storage
//! until it is dropped. GC callbacks arrive through the same guard.

use std::{
    ops::{Deref, DerefMut},
    sync::OnceLock,
    thread::{self, ThreadId},
};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    error::{ShadowError, fail_loud},
    interval::Address,
    protocol::MemoryUpdate,
    storage::{Storage, VirtualAddress},
};

pub const SEED_VAR: &str = "SHADOWHEAP_SEED";
pub const VALIDATE_VAR: &str = "SHADOWHEAP_VALIDATE";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShadowOptions {
    /// Fixes treap priorities, making tree shapes reproducible.
    pub seed: Option<u64>,
    /// Re-check the no-overlap invariant after every GC hook.
    pub validate: bool,
}

impl ShadowOptions {
    /// Options for a runtime attached without a command line.
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var(SEED_VAR).ok().as_deref(),
            std::env::var(VALIDATE_VAR).ok().as_deref(),
        )
    }

    fn from_vars(seed: Option<&str>, validate: Option<&str>) -> Self {
        let seed = seed.and_then(|value| match parse_number(value) {
            Some(seed) => Some(seed),
            None => {
                log::warn!("Ignoring {}={:?}: not a number", SEED_VAR, value);
                None
            }
        });
        let validate = match validate.map(str::trim) {
            None | Some("") | Some("0") | Some("false") => false,
            Some("1") | Some("true") => true,
            Some(other) => {
                log::warn!("Ignoring {}={:?}: expected 0 or 1", VALIDATE_VAR, other);
                false
            }
        };
        ShadowOptions { seed, validate }
    }
}

/// Decimal or `0x`-prefixed hexadecimal.
pub fn parse_number(text: &str) -> Option<u64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

pub struct ShadowHeap {
    storage: Mutex<Storage>,
    options: ShadowOptions,
    main_thread: OnceLock<ThreadId>,
}

impl ShadowHeap {
    pub fn new(options: ShadowOptions) -> Self {
        log::debug!("Creating shadow heap with {:?}", options);
        ShadowHeap {
            storage: Mutex::new(Storage::with_options(&options)),
            options,
            main_thread: OnceLock::new(),
        }
    }

    pub fn options(&self) -> &ShadowOptions {
        &self.options
    }

    /// Blocks until no other command is being built.
    pub fn lock(&self) -> CommandGuard<'_> {
        CommandGuard {
            storage: self.storage.lock(),
            validate: self.options.validate,
        }
    }

    /// Records the calling thread as the tracked main thread.
    pub fn enter_main(&self) {
        let current = thread::current().id();
        if let Err(current) = self.main_thread.set(current) {
            if self.main_thread.get() != Some(&current) {
                log::warn!("Main thread already entered, ignoring {:?}", current);
            }
        }
    }

    pub fn is_main_thread(&self) -> bool {
        self.main_thread.get() == Some(&thread::current().id())
    }
}

impl Default for ShadowHeap {
    fn default() -> Self {
        Self::new(ShadowOptions::default())
    }
}

/// Exclusive access to the storage for the duration of one command.
pub struct CommandGuard<'a> {
    storage: MutexGuard<'a, Storage>,
    validate: bool,
}

impl CommandGuard<'_> {
    fn check(&self) {
        if self.validate {
            if let Err(err) = self.storage.validate() {
                fail_loud(err);
            }
        }
    }

    /// The collector relocated `[old_left, old_left + length)`.
    pub fn moved_references(&mut self, old_left: Address, new_left: Address, length: usize) {
        if let Err(err) = self.storage.move_and_mark(old_left, new_left, length) {
            fail_loud(err);
        }
        self.check();
    }

    pub fn surviving_references(&mut self, start: Address, length: usize) {
        if let Err(err) = self.storage.mark_survived_objects(start, length) {
            fail_loud(err);
        }
        self.check();
    }

    /// Sweep after the collector finished; returns the number of objects
    /// that died.
    pub fn garbage_collection_finished(&mut self) -> usize {
        let swept = self.storage.clear_after_gc();
        self.check();
        swept
    }

    /// Resolution at a call site that cannot continue without an object.
    pub fn resolve_or_fail(&self, address: Address) -> VirtualAddress {
        match self.storage.phys_to_virt(address) {
            Ok(resolved) => resolved,
            Err(err) => fail_loud(err),
        }
    }

    pub fn drain_update(&mut self) -> MemoryUpdate {
        MemoryUpdate::drain(&mut self.storage)
    }

    pub fn try_validate(&self) -> Result<(), ShadowError> {
        self.storage.validate()
    }
}

impl Deref for CommandGuard<'_> {
    type Target = Storage;

    fn deref(&self) -> &Storage {
        &self.storage
    }
}

impl DerefMut for CommandGuard<'_> {
    fn deref_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{LocalObject, ObjectLocation};

    #[test]
    fn test_options_from_vars() {
        assert_eq!(ShadowOptions::from_vars(None, None), ShadowOptions::default());
        assert_eq!(
            ShadowOptions::from_vars(Some("0x10"), Some("1")),
            ShadowOptions {
                seed: Some(16),
                validate: true
            }
        );
        assert_eq!(
            ShadowOptions::from_vars(Some("seven"), Some("maybe")),
            ShadowOptions::default()
        );
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number(" 0x2A "), Some(42));
        assert_eq!(parse_number("0xZZ"), None);
    }

    #[test]
    fn test_main_thread_is_recorded_once() {
        let heap = ShadowHeap::default();
        assert!(!heap.is_main_thread());
        heap.enter_main();
        heap.enter_main();
        assert!(heap.is_main_thread());
        thread::scope(|scope| {
            scope.spawn(|| {
                heap.enter_main();
                assert!(!heap.is_main_thread());
            });
        });
    }

    #[test]
    fn test_guard_serialises_threads() {
        let heap = ShadowHeap::new(ShadowOptions {
            seed: Some(1),
            validate: true,
        });
        thread::scope(|scope| {
            for t in 0..4usize {
                let heap = &heap;
                scope.spawn(move || {
                    for i in 0..50usize {
                        let address = 0x10_0000 * (t + 1) + i * 0x20;
                        let mut guard = heap.lock();
                        guard.allocate_object(address, 16, Vec::new(), false).unwrap();
                    }
                });
            }
        });
        let mut guard = heap.lock();
        assert_eq!(guard.len(), 200);
        assert_eq!(guard.drain_update().new_objects.len(), 200);
        guard.try_validate().unwrap();
    }

    #[test]
    fn test_gc_hooks_move_objects() {
        let heap = ShadowHeap::new(ShadowOptions {
            seed: Some(3),
            validate: true,
        });
        let mut guard = heap.lock();
        let id = guard.allocate_object(0x1000, 16, Vec::new(), false).unwrap();
        guard.allocate_object(0x1010, 16, Vec::new(), false).unwrap();
        guard.moved_references(0x1000, 0x8000, 16);
        assert_eq!(guard.garbage_collection_finished(), 1);
        assert_eq!(guard.resolve_or_fail(0x8008).obj, id);
    }

    #[test]
    #[should_panic(expected = "unexpectedly moved")]
    fn test_moving_stack_memory_fails_loud() {
        let heap = ShadowHeap::default();
        let mut guard = heap.lock();
        let mut local = LocalObject::addressed(0x7000, 8, ObjectLocation::local(0, 1));
        guard.allocate_local(&mut local).unwrap();
        guard.moved_references(0x7000, 0x9000, 8);
    }

    #[test]
    #[should_panic]
    fn test_strict_resolution_fails_loud() {
        let heap = ShadowHeap::default();
        let guard = heap.lock();
        guard.resolve_or_fail(0x4242);
    }
}
