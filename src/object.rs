//! Tracked memory regions.
//!
//! An [`Object`] is an [`Interval`] plus a per-byte concreteness bitmap and a
//! location tag saying where the memory lives (heap, stack slot, static
//! field). [`LocalObject`] is the stack flavour: its address is only known
//! once the slot is address-taken, and its size can change in place.

use crate::{
    error::ShadowError,
    interval::{Address, Interval, UNKNOWN_ADDRESS},
    interval_tree::Span,
    memory::MemoryReader,
};

type Cell = u8;

pub const CELL_BITS: usize = Cell::BITS as usize;
const FULL: Cell = Cell::MAX;
const EMPTY: Cell = 0;

fn cell_count(size: usize) -> usize {
    size.div_ceil(CELL_BITS)
}

/// Bytes `offset..CELL_BITS` of a cell, i.e. `00..011..1`.
/// Byte `k` of a cell is bit `CELL_BITS - 1 - k`.
fn leading_mask(offset: usize) -> Cell {
    ((1u16 << (CELL_BITS - offset)) - 1) as Cell
}

/// Bytes `0..offset` of a cell, i.e. `11..100..0`.
fn trailing_mask(offset: usize) -> Cell {
    let shift = CELL_BITS - offset;
    ((FULL as u16 >> shift) << shift) as Cell
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    ReferenceType = 1,
    LocalVariable = 2,
    Parameter = 3,
    Statics = 4,
    TemporaryAllocatedStruct = 5,
}

impl ObjectKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ObjectKind::ReferenceType),
            2 => Some(ObjectKind::LocalVariable),
            3 => Some(ObjectKind::Parameter),
            4 => Some(ObjectKind::Statics),
            5 => Some(ObjectKind::TemporaryAllocatedStruct),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::ReferenceType => "heap",
            ObjectKind::LocalVariable => "local",
            ObjectKind::Parameter => "parameter",
            ObjectKind::Statics => "static",
            ObjectKind::TemporaryAllocatedStruct => "temporary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ObjectKey {
    #[default]
    None,
    Stack {
        frame: u8,
        index: u8,
    },
    StaticField(i16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub kind: ObjectKind,
    pub key: ObjectKey,
}

impl ObjectLocation {
    pub fn heap() -> Self {
        Self {
            kind: ObjectKind::ReferenceType,
            key: ObjectKey::None,
        }
    }

    pub fn local(frame: u8, index: u8) -> Self {
        Self {
            kind: ObjectKind::LocalVariable,
            key: ObjectKey::Stack { frame, index },
        }
    }

    pub fn parameter(frame: u8, index: u8) -> Self {
        Self {
            kind: ObjectKind::Parameter,
            key: ObjectKey::Stack { frame, index },
        }
    }

    pub fn temporary_struct(frame: u8, index: u8) -> Self {
        Self {
            kind: ObjectKind::TemporaryAllocatedStruct,
            key: ObjectKey::Stack { frame, index },
        }
    }

    pub fn static_field(id: i16) -> Self {
        Self {
            kind: ObjectKind::Statics,
            key: ObjectKey::StaticField(id),
        }
    }

    /// Location of a stack cell nobody has taken the address of.
    pub fn stack_cell() -> Self {
        Self {
            kind: ObjectKind::LocalVariable,
            key: ObjectKey::None,
        }
    }

    /// The two key bytes of the wire layout.
    pub fn key_bytes(&self) -> [u8; 2] {
        match (self.kind, self.key) {
            (
                ObjectKind::LocalVariable
                | ObjectKind::Parameter
                | ObjectKind::TemporaryAllocatedStruct,
                ObjectKey::Stack { frame, index },
            ) => [frame, index],
            (ObjectKind::Statics, ObjectKey::StaticField(id)) => id.to_le_bytes(),
            _ => [0, 0],
        }
    }
}

/// One bit per byte, 1 = concrete. `full` caches the AND of every bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Concreteness {
    cells: Vec<Cell>,
    size: usize,
    full: bool,
}

impl Concreteness {
    /// All contents are concrete at the beginning.
    pub fn new(size: usize) -> Self {
        Self::filled(size, true)
    }

    fn filled(size: usize, concrete: bool) -> Self {
        let value = if concrete { FULL } else { EMPTY };
        Self {
            cells: vec![value; cell_count(size)],
            size,
            full: concrete,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn cells(&self) -> &[u8] {
        &self.cells
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    fn check_bounds(&self, offset: usize, size: usize) -> Result<(), ShadowError> {
        if size == 0 || offset.checked_add(size).is_none_or(|end| end > self.size) {
            return Err(ShadowError::OutOfBounds {
                offset,
                size,
                object_size: self.size,
            });
        }
        Ok(())
    }

    pub fn read(&self, offset: usize, size: usize) -> Result<bool, ShadowError> {
        self.check_bounds(offset, size)?;
        Ok(self.read_unchecked(offset, size))
    }

    fn read_unchecked(&self, offset: usize, size: usize) -> bool {
        let end = offset + size;
        let (start_index, start_offset) = (offset / CELL_BITS, offset % CELL_BITS);
        let (end_index, end_offset) = (end / CELL_BITS, end % CELL_BITS);

        if start_index == end_index {
            let mask = leading_mask(start_offset) & trailing_mask(end_offset);
            return self.cells[start_index] & mask == mask;
        }

        let first_whole = start_index + usize::from(start_offset != 0);
        if self.cells[first_whole..end_index].iter().any(|&c| c != FULL) {
            return false;
        }
        if start_offset != 0 {
            let mask = leading_mask(start_offset);
            if self.cells[start_index] & mask != mask {
                return false;
            }
        }
        if end_offset != 0 {
            let mask = trailing_mask(end_offset);
            if self.cells[end_index] & mask != mask {
                return false;
            }
        }
        true
    }

    pub fn write(&mut self, offset: usize, size: usize, concrete: bool) -> Result<(), ShadowError> {
        self.check_bounds(offset, size)?;
        let end = offset + size;
        let (start_index, start_offset) = (offset / CELL_BITS, offset % CELL_BITS);
        let (end_index, end_offset) = (end / CELL_BITS, end % CELL_BITS);

        if start_index == end_index {
            let mask = leading_mask(start_offset) & trailing_mask(end_offset);
            Self::apply(&mut self.cells[start_index], mask, concrete);
        } else {
            let first_whole = start_index + usize::from(start_offset != 0);
            let value = if concrete { FULL } else { EMPTY };
            self.cells[first_whole..end_index].fill(value);
            if start_offset != 0 {
                Self::apply(&mut self.cells[start_index], leading_mask(start_offset), concrete);
            }
            if end_offset != 0 {
                Self::apply(&mut self.cells[end_index], trailing_mask(end_offset), concrete);
            }
        }

        // a symbolic byte disproves full concreteness at once, a concrete one
        // proves it only after rechecking everything
        if !concrete {
            self.full = false;
        } else if !self.full {
            self.full = self.read_unchecked(0, self.size);
        }
        Ok(())
    }

    fn apply(cell: &mut Cell, mask: Cell, concrete: bool) {
        if concrete {
            *cell |= mask;
        } else {
            *cell &= !mask;
        }
    }

    pub fn write_whole(&mut self, concrete: bool) {
        self.cells.fill(if concrete { FULL } else { EMPTY });
        self.full = concrete;
    }

    /// Reallocates the bitmap, every byte taking the current full flag.
    pub fn resize(&mut self, size: usize) {
        let value = if self.full { FULL } else { EMPTY };
        self.cells = vec![value; cell_count(size)];
        self.size = size;
    }
}

#[derive(Debug, Clone)]
pub struct Object {
    interval: Interval,
    concreteness: Concreteness,
    location: ObjectLocation,
    is_array: bool,
    type_name: Vec<u8>,
}

impl Object {
    pub fn new(address: Address, size: usize, location: ObjectLocation) -> Self {
        Self {
            interval: Interval::new(address, size),
            concreteness: Concreteness::new(size),
            location,
            is_array: false,
            type_name: Vec::new(),
        }
    }

    /// A collector-owned heap object. `type_name` is the serialized type
    /// descriptor handed to the external executor with the allocation.
    pub fn new_heap(address: Address, size: usize, type_name: Vec<u8>, is_array: bool) -> Self {
        Self {
            interval: Interval::new(address, size),
            concreteness: Concreteness::new(size),
            location: ObjectLocation::heap(),
            is_array,
            type_name,
        }
    }

    pub fn left(&self) -> Address {
        self.interval.left
    }

    pub fn right(&self) -> Address {
        self.interval.right
    }

    pub fn size(&self) -> usize {
        self.interval.size()
    }

    pub fn location(&self) -> ObjectLocation {
        self.location
    }

    pub fn is_array(&self) -> bool {
        self.is_array
    }

    pub fn type_name(&self) -> &[u8] {
        &self.type_name
    }

    pub fn concreteness(&self) -> &Concreteness {
        &self.concreteness
    }

    pub fn is_fully_concrete(&self) -> bool {
        self.concreteness.is_full()
    }

    pub fn read_concreteness(&self, offset: usize, size: usize) -> Result<bool, ShadowError> {
        self.concreteness.read(offset, size)
    }

    pub fn write_concreteness(
        &mut self,
        offset: usize,
        size: usize,
        concrete: bool,
    ) -> Result<(), ShadowError> {
        self.concreteness.write(offset, size, concrete)
    }

    pub fn write_concreteness_whole_object(&mut self, concrete: bool) {
        self.concreteness.write_whole(concrete);
    }

    /// Copies `size` bytes of the live memory behind this object.
    pub fn read_bytes<M: MemoryReader + ?Sized>(
        &self,
        offset: usize,
        size: usize,
        memory: &M,
    ) -> Result<Vec<u8>, ShadowError> {
        if self.left() == UNKNOWN_ADDRESS {
            return Err(ShadowError::UnknownAddress);
        }
        if size == 0 || offset + size > self.size() {
            return Err(ShadowError::OutOfBounds {
                offset,
                size,
                object_size: self.size(),
            });
        }
        let mut buffer = vec![0; size];
        memory.read(self.left() + offset, &mut buffer)?;
        Ok(buffer)
    }
}

impl Span for Object {
    fn interval(&self) -> &Interval {
        &self.interval
    }

    fn interval_mut(&mut self) -> &mut Interval {
        &mut self.interval
    }
}

/// A stack cell: evaluation stack entry, local or argument.
///
/// Simplified cells (size 1 at [`UNKNOWN_ADDRESS`]) stand for scalars that
/// were never address-taken. Once `ldloca`/`ldarga` happens the cell is
/// given its real size and address and can be registered with the storage.
#[derive(Debug, Clone)]
pub struct LocalObject {
    object: Object,
}

impl LocalObject {
    pub fn new(size: usize, location: ObjectLocation) -> Self {
        Self {
            object: Object::new(UNKNOWN_ADDRESS, size, location),
        }
    }

    pub fn simplified() -> Self {
        Self::new(1, ObjectLocation::stack_cell())
    }

    pub fn addressed(address: Address, size: usize, location: ObjectLocation) -> Self {
        Self {
            object: Object::new(address, size, location),
        }
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    pub fn object_mut(&mut self) -> &mut Object {
        &mut self.object
    }

    pub fn into_object(self) -> Object {
        self.object
    }

    pub fn left(&self) -> Address {
        self.object.left()
    }

    pub fn size(&self) -> usize {
        self.object.size()
    }

    pub fn is_simplified(&self) -> bool {
        self.left() == UNKNOWN_ADDRESS && self.size() == 1
    }

    pub fn change_address(&mut self, address: Address) {
        self.object.interval.rebase(address);
    }

    pub fn set_size(&mut self, size: usize) {
        self.object.concreteness.resize(size);
        self.object.interval.resize(size);
    }

    pub fn set_location(&mut self, location: ObjectLocation) {
        self.object.location = location;
    }

    pub fn disable_gc(&mut self) {
        self.object.interval.disable_gc();
    }

    /// Copy-assignment. Bitmaps are never shared; on a size mismatch the
    /// larger description wins so no concreteness information is truncated.
    pub fn assign_from(&mut self, other: &LocalObject) {
        self.copy_concreteness(other);
        self.object.location = other.object.location;
        self.change_address(other.left());
    }

    fn copy_concreteness(&mut self, other: &LocalObject) {
        let size = self.size();
        let other_size = other.size();
        if size == other_size {
            self.object.concreteness = other.object.concreteness.clone();
        } else if size > other_size {
            // the other side is a simplified cell
            self.object
                .write_concreteness_whole_object(other.object.is_fully_concrete());
        } else {
            self.set_size(other_size);
            self.object.concreteness = other.object.concreteness.clone();
        }
    }
}

impl Default for LocalObject {
    fn default() -> Self {
        Self::simplified()
    }
}
