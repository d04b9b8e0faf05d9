//! Shadow memory for a dynamic symbolic-execution runtime.
//!
//! Tracks every heap object, address-taken stack slot and static field the
//! instrumented program touches, with a per-byte record of which bytes are
//! concrete and which are symbolic. The model follows the managed heap
//! through collections: relocated objects keep their identity, unmarked
//! ones are swept.

pub mod arena;
pub mod dump;
pub mod error;
pub mod interval;
pub mod interval_tree;
pub mod memory;
pub mod object;
pub mod protocol;
pub mod shadow;
pub mod storage;
pub mod trace;

pub use error::{ShadowError, fail_loud};
pub use interval::{Address, Interval, NULL_ADDRESS, Shift, UNKNOWN_ADDRESS};
pub use object::{LocalObject, Object, ObjectKind, ObjectLocation};
pub use shadow::{CommandGuard, ShadowHeap, ShadowOptions};
pub use storage::{ObjectId, Storage, VirtualAddress};
