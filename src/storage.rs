//! The shadow heap.
//!
//! [`Storage`] is the single authority translating managed addresses into
//! tracked objects and back. It owns the interval tree, keeps the logs of
//! events the external executor has not heard about yet, and answers
//! concreteness queries for the probes.
//!
//! Object identity is an [`ObjectId`]: the wire form of the tree node that
//! holds the object. It survives relocation by the collector and becomes
//! invalid only when the object is swept or retired.

use std::collections::{HashMap, HashSet};
use std::fmt;

use bincode::{Decode, Encode};

use crate::{
    arena::SlotId,
    error::ShadowError,
    interval::{Address, Interval, NULL_ADDRESS, Shift, UNKNOWN_ADDRESS},
    interval_tree::{Forest, IntervalTree, Span},
    memory::MemoryReader,
    object::{LocalObject, Object, ObjectLocation},
    shadow::ShadowOptions,
};

pub const WORD_SIZE: usize = std::mem::size_of::<usize>();
pub const ARRAY_LENGTH_OFFSET: usize = WORD_SIZE;
pub const ARRAY_LENGTH_SIZE: usize = std::mem::size_of::<i64>();
pub const ARRAY_DATA_OFFSET: usize = ARRAY_LENGTH_OFFSET + ARRAY_LENGTH_SIZE;

/// Machine-word identity of a tracked object. `0` is the null object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Encode, Decode)]
pub struct ObjectId(u64);

impl ObjectId {
    pub const NULL: ObjectId = ObjectId(0);

    pub fn from_word(word: u64) -> Self {
        ObjectId(word)
    }

    pub fn to_word(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    fn slot(self) -> Option<SlotId> {
        let low = self.0 as u32;
        if low == 0 {
            return None;
        }
        Some(SlotId::new(low - 1, (self.0 >> 32) as u32))
    }
}

impl From<SlotId> for ObjectId {
    fn from(slot: SlotId) -> Self {
        ObjectId(((slot.generation() as u64) << 32) | (slot.index() as u64 + 1))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A physical address expressed as object identity plus byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualAddress {
    pub obj: ObjectId,
    pub offset: usize,
    pub location: ObjectLocation,
}

impl VirtualAddress {
    /// What the null reference resolves to.
    pub fn null() -> Self {
        Self {
            obj: ObjectId::NULL,
            offset: 0,
            location: ObjectLocation::heap(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.obj.is_null()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct NewObject {
    pub id: ObjectId,
    pub type_name: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct DelegateRecord {
    pub delegate: ObjectId,
    pub function_id: i32,
    pub closure: ObjectId,
}

pub struct Storage {
    tree: IntervalTree<Object>,
    new_objects: Vec<ObjectId>,
    pending: HashSet<ObjectId>,
    deleted: Vec<ObjectId>,
    delegates: Vec<DelegateRecord>,
    delegate_index: HashMap<ObjectId, usize>,
    unmarshalled: HashSet<ObjectId>,
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage {
    pub fn new() -> Self {
        Self::with_tree(IntervalTree::new())
    }

    pub fn with_options(options: &ShadowOptions) -> Self {
        match options.seed {
            Some(seed) => Self::with_tree(IntervalTree::with_seed(seed)),
            None => Self::new(),
        }
    }

    fn with_tree(tree: IntervalTree<Object>) -> Self {
        Self {
            tree,
            new_objects: Vec::new(),
            pending: HashSet::new(),
            deleted: Vec::new(),
            delegates: Vec::new(),
            delegate_index: HashMap::new(),
            unmarshalled: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn object(&self, id: ObjectId) -> Option<&Object> {
        self.tree.get(id.slot()?)
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.tree.get_mut(id.slot()?)
    }

    fn live_object(&self, id: ObjectId) -> Result<&Object, ShadowError> {
        self.object(id)
            .ok_or(ShadowError::StaleObject { id: id.to_word() })
    }

    fn live_object_mut(&mut self, id: ObjectId) -> Result<&mut Object, ShadowError> {
        self.object_mut(id)
            .ok_or(ShadowError::StaleObject { id: id.to_word() })
    }

    pub fn forest_of(&self, id: ObjectId) -> Option<Forest> {
        self.tree.forest_of(id.slot()?)
    }

    /// Tracked objects, collector-owned first, each forest in address order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &Object)> {
        self.tree.iter().map(|(slot, object)| (ObjectId::from(slot), object))
    }

    /// Checks that no two tracked regions overlap.
    pub fn validate(&self) -> Result<(), ShadowError> {
        self.tree.check_disjoint()
    }

    // Allocation

    /// Fails if `interval` reaches into any tracked region.
    fn ensure_unclaimed(&self, interval: &Interval) -> Result<(), ShadowError> {
        match self.tree.overlapping(interval).and_then(|id| self.tree.get(id)) {
            Some(existing) => {
                let existing = existing.interval();
                Err(ShadowError::AllocationOverlap {
                    left: interval.left,
                    right: interval.right,
                    existing: (existing.left, existing.right),
                })
            }
            None => Ok(()),
        }
    }

    /// The region registered at exactly `address`, if any.
    fn registered_at(&self, address: Address) -> Option<ObjectId> {
        self.tree
            .find(address)
            .filter(|&id| self.tree.get(id).is_some_and(|o| o.interval().left == address))
            .map(ObjectId::from)
    }

    pub fn allocate_object(
        &mut self,
        address: Address,
        size: usize,
        type_name: Vec<u8>,
        is_array: bool,
    ) -> Result<ObjectId, ShadowError> {
        if size == 0 {
            return Err(ShadowError::EmptyRegion { address });
        }
        self.ensure_unclaimed(&Interval::new(address, size))?;
        let object = Object::new_heap(address, size, type_name, is_array);
        let id = ObjectId::from(self.tree.add(object));
        log::trace!("Allocated object {} at [{:#x}; {}]", id, address, size);
        self.new_objects.push(id);
        self.pending.insert(id);
        Ok(id)
    }

    /// Registers an address-taken stack slot. Taking the address of the same
    /// slot again returns the identity registered first and keeps its
    /// concreteness.
    pub fn allocate_local(&mut self, local: &mut LocalObject) -> Result<ObjectId, ShadowError> {
        if local.left() == UNKNOWN_ADDRESS {
            return Err(ShadowError::UnknownAddress);
        }
        if local.size() == 0 {
            return Err(ShadowError::EmptyRegion {
                address: local.left(),
            });
        }
        if let Some(existing) = self.registered_at(local.left()) {
            return Ok(existing);
        }
        self.ensure_unclaimed(&Interval::new(local.left(), local.size()))?;
        local.disable_gc();
        let id = ObjectId::from(self.tree.add(local.object().clone()));
        log::trace!("Allocated local {} at [{:#x}; {}]", id, local.left(), local.size());
        Ok(id)
    }

    pub fn allocate_static_field(
        &mut self,
        address: Address,
        size: usize,
        field_id: i16,
    ) -> Result<ObjectId, ShadowError> {
        if size == 0 {
            return Err(ShadowError::EmptyRegion { address });
        }
        if let Some(existing) = self.registered_at(address) {
            return Ok(existing);
        }
        self.ensure_unclaimed(&Interval::new(address, size))?;
        let mut object = Object::new(address, size, ObjectLocation::static_field(field_id));
        object.interval_mut().disable_gc();
        let id = ObjectId::from(self.tree.add(object));
        log::trace!("Allocated static field {} at [{:#x}; {}]", id, address, size);
        Ok(id)
    }

    pub fn allocate_delegate(&mut self, delegate: ObjectId, function_id: i32, closure: ObjectId) {
        log::debug!(
            "Allocating action object for delegate [{}, {}, {}]",
            delegate,
            function_id,
            closure
        );
        let record = DelegateRecord {
            delegate,
            function_id,
            closure,
        };
        match self.delegate_index.get(&delegate) {
            Some(&index) => {
                log::warn!("Rewriting action object {}", delegate);
                self.delegates[index] = record;
            }
            None => {
                self.delegate_index.insert(delegate, self.delegates.len());
                self.delegates.push(record);
            }
        }
    }

    // Resolution

    /// `None` if nothing is tracked at `address`.
    pub fn resolve(&self, address: Address) -> Option<VirtualAddress> {
        if address == NULL_ADDRESS {
            return Some(VirtualAddress::null());
        }
        if address == UNKNOWN_ADDRESS {
            log::warn!("Resolving a stack cell that has no memory");
            return None;
        }
        let slot = self.tree.find(address)?;
        let object = self.tree.get(slot)?;
        Some(VirtualAddress {
            obj: ObjectId::from(slot),
            offset: address - object.left(),
            location: object.location(),
        })
    }

    /// Like [`Storage::resolve`], for call sites where the address must be
    /// tracked.
    pub fn phys_to_virt(&self, address: Address) -> Result<VirtualAddress, ShadowError> {
        self.resolve(address)
            .ok_or(ShadowError::Unresolved { address })
    }

    pub fn virt_to_phys(&self, address: &VirtualAddress) -> Result<Address, ShadowError> {
        if address.is_null() {
            return Ok(NULL_ADDRESS);
        }
        Ok(self.live_object(address.obj)?.left() + address.offset)
    }

    // Concreteness

    /// Untracked memory is reported concrete.
    pub fn read_concreteness(&self, address: Address, size: usize) -> Result<bool, ShadowError> {
        let Some(resolved) = self.resolve(address) else {
            log::warn!("readConcreteness, unbound pointer = {:#x}", address);
            return Ok(true);
        };
        match self.object(resolved.obj) {
            Some(object) => object.read_concreteness(resolved.offset, size),
            None => Ok(true),
        }
    }

    pub fn read_concreteness_whole_object(&self, address: Address) -> bool {
        let Some(resolved) = self.resolve(address) else {
            log::warn!("readConcretenessWholeObject, unbound pointer = {:#x}", address);
            return true;
        };
        if resolved.offset != 0 {
            log::warn!("readConcretenessWholeObject, offset in address != 0");
        }
        self.object(resolved.obj)
            .is_none_or(|object| object.is_fully_concrete())
    }

    /// Writes to untracked memory are dropped.
    pub fn write_concreteness(
        &mut self,
        address: Address,
        size: usize,
        concrete: bool,
    ) -> Result<(), ShadowError> {
        let Some(resolved) = self.resolve(address) else {
            log::warn!("writeConcreteness, unbound pointer = {:#x}", address);
            return Ok(());
        };
        match self.object_mut(resolved.obj) {
            Some(object) => object.write_concreteness(resolved.offset, size, concrete),
            None => Ok(()),
        }
    }

    pub fn write_concreteness_whole_object(
        &mut self,
        address: Address,
        concrete: bool,
    ) -> Result<(), ShadowError> {
        let resolved = self.phys_to_virt(address)?;
        if resolved.offset != 0 {
            log::warn!("writeConcretenessWholeObject, offset in address != 0");
        }
        self.live_object_mut(resolved.obj)?
            .write_concreteness_whole_object(concrete);
        Ok(())
    }

    // Reading memory out for the executor

    fn resolve_reference(&self, bytes: &mut [u8], offset: usize) -> Result<(), ShadowError> {
        let object_size = bytes.len();
        let out_of_bounds = || ShadowError::OutOfBounds {
            offset,
            size: WORD_SIZE,
            object_size,
        };
        let slot = offset
            .checked_add(WORD_SIZE)
            .and_then(|end| bytes.get_mut(offset..end))
            .ok_or_else(out_of_bounds)?;
        let mut word = [0u8; WORD_SIZE];
        word.copy_from_slice(slot);
        let reference = usize::from_ne_bytes(word);

        let id = match self.resolve(reference) {
            Some(resolved) => {
                if resolved.offset != 0 {
                    log::warn!("Reference {:#x} points inside an object", reference);
                }
                resolved.obj
            }
            None => {
                log::warn!("Reference {:#x} is not tracked", reference);
                ObjectId::NULL
            }
        };
        slot.copy_from_slice(&(id.to_word() as usize).to_ne_bytes());
        Ok(())
    }

    /// Bytes at `address` with every reference at `ref_offsets` replaced by
    /// the referenced object's identity.
    pub fn read_bytes<M: MemoryReader + ?Sized>(
        &self,
        address: &VirtualAddress,
        size: usize,
        ref_offsets: &[usize],
        memory: &M,
    ) -> Result<Vec<u8>, ShadowError> {
        let object = self.live_object(address.obj)?;
        let mut bytes = object.read_bytes(address.offset, size, memory)?;
        for &offset in ref_offsets {
            self.resolve_reference(&mut bytes, offset)?;
        }
        Ok(bytes)
    }

    pub fn read_whole_object<M: MemoryReader + ?Sized>(
        &self,
        id: ObjectId,
        ref_offsets: &[usize],
        memory: &M,
    ) -> Result<Vec<u8>, ShadowError> {
        let size = self.live_object(id)?.size();
        let address = VirtualAddress {
            obj: id,
            offset: 0,
            location: ObjectLocation::heap(),
        };
        self.read_bytes(&address, size, ref_offsets, memory)
    }

    /// Array layout: header word, `i64` length, then `length` elements of
    /// `elem_size` bytes. `ref_offsets` are relative to each element.
    pub fn read_array<M: MemoryReader + ?Sized>(
        &self,
        id: ObjectId,
        elem_size: usize,
        ref_offsets: &[usize],
        memory: &M,
    ) -> Result<Vec<u8>, ShadowError> {
        let object = self.live_object(id)?;
        let mut bytes = object.read_bytes(0, object.size(), memory)?;
        let header = bytes
            .get(ARRAY_LENGTH_OFFSET..ARRAY_DATA_OFFSET)
            .ok_or(ShadowError::OutOfBounds {
                offset: ARRAY_LENGTH_OFFSET,
                size: ARRAY_LENGTH_SIZE,
                object_size: object.size(),
            })?;
        let mut length = [0u8; ARRAY_LENGTH_SIZE];
        length.copy_from_slice(header);
        let length = i64::from_ne_bytes(length).max(0) as usize;

        let object_size = object.size();
        let capacity = (object_size - ARRAY_DATA_OFFSET).checked_div(elem_size);
        if capacity.is_none_or(|capacity| length > capacity) {
            return Err(ShadowError::ArrayLayout {
                elem_size,
                length,
                object_size,
            });
        }

        if !ref_offsets.is_empty() {
            for element in 0..length {
                let base = ARRAY_DATA_OFFSET + element * elem_size;
                for &offset in ref_offsets {
                    let at = base.checked_add(offset).ok_or(ShadowError::OutOfBounds {
                        offset,
                        size: WORD_SIZE,
                        object_size,
                    })?;
                    self.resolve_reference(&mut bytes, at)?;
                }
            }
        }
        Ok(bytes)
    }

    /// Hands the object's bytes to unmanaged code. Its concrete mirror can
    /// no longer be trusted, so every byte becomes symbolic.
    pub fn unmarshall<M: MemoryReader + ?Sized>(
        &mut self,
        id: ObjectId,
        ref_offsets: &[usize],
        memory: &M,
    ) -> Result<Vec<u8>, ShadowError> {
        let bytes = self.read_whole_object(id, ref_offsets, memory)?;
        self.mark_unmarshalled(id)?;
        Ok(bytes)
    }

    pub fn unmarshall_array<M: MemoryReader + ?Sized>(
        &mut self,
        id: ObjectId,
        elem_size: usize,
        ref_offsets: &[usize],
        memory: &M,
    ) -> Result<Vec<u8>, ShadowError> {
        let bytes = self.read_array(id, elem_size, ref_offsets, memory)?;
        self.mark_unmarshalled(id)?;
        Ok(bytes)
    }

    fn mark_unmarshalled(&mut self, id: ObjectId) -> Result<(), ShadowError> {
        if !self.unmarshalled.insert(id) {
            log::warn!("Object {} was unmarshalled before", id);
        }
        self.live_object_mut(id)?
            .write_concreteness_whole_object(false);
        Ok(())
    }

    pub fn check_unmarshalled(&self, id: ObjectId) -> bool {
        self.unmarshalled.contains(&id)
    }

    // Garbage collection

    /// The collector moved `[old_left, old_left + length)` to `new_left`.
    pub fn move_and_mark(
        &mut self,
        old_left: Address,
        new_left: Address,
        length: usize,
    ) -> Result<(), ShadowError> {
        if length == 0 {
            return Ok(());
        }
        let interval = Interval::new(old_left, length);
        if old_left == new_left {
            self.tree.mark(&interval)
        } else {
            self.tree
                .move_and_mark(&interval, &Shift::new(old_left, new_left))
        }
    }

    pub fn mark_survived_objects(&mut self, start: Address, length: usize) -> Result<(), ShadowError> {
        if length == 0 {
            return Ok(());
        }
        self.tree.mark(&Interval::new(start, length))
    }

    /// Sweeps everything not marked since the last sweep. Objects the
    /// executor never heard of are dropped silently, the rest are logged as
    /// deleted.
    pub fn clear_after_gc(&mut self) -> usize {
        let swept = self.tree.clear_unmarked();
        let count = swept.len();
        let mut dropped = 0;
        for (slot, _) in swept {
            let id = ObjectId::from(slot);
            self.unmarshalled.remove(&id);
            if self.pending.remove(&id) {
                dropped += 1;
            } else {
                self.deleted.push(id);
            }
        }
        if dropped > 0 {
            let pending = &self.pending;
            self.new_objects.retain(|id| pending.contains(id));
        }
        log::debug!(
            "GC sweep: {} objects deleted, {} never reported",
            count - dropped,
            dropped
        );
        count
    }

    /// Retires GC-exempt regions, e.g. when their stack frame is popped.
    pub fn delete_objects(&mut self, ids: &[ObjectId]) -> usize {
        let slots: Vec<_> = ids.iter().filter_map(|id| id.slot()).collect();
        let deleted = self.tree.delete_intervals(&slots);
        for (slot, _) in &deleted {
            self.unmarshalled.remove(&ObjectId::from(*slot));
        }
        deleted.len()
    }

    // Event logs

    pub fn flush_objects(&mut self) -> Vec<NewObject> {
        self.pending.clear();
        let ids = std::mem::take(&mut self.new_objects);
        ids.into_iter()
            .filter_map(|id| {
                self.object(id).map(|object| NewObject {
                    id,
                    type_name: object.type_name().to_vec(),
                })
            })
            .collect()
    }

    pub fn flush_deleted_by_gc(&mut self) -> Vec<ObjectId> {
        std::mem::take(&mut self.deleted)
    }

    pub fn flush_delegates(&mut self) -> Vec<DelegateRecord> {
        self.delegate_index.clear();
        std::mem::take(&mut self.delegates)
    }

    /// Every tracked region, including stack slots and statics, not returned
    /// by an earlier call.
    pub fn flush_regions(&mut self) -> Vec<ObjectId> {
        self.tree.flush().into_iter().map(ObjectId::from).collect()
    }
}
