//! What the shadow heap hands to the wire component.
//!
//! Framing and the confirmation handshake belong to the transport. This
//! module only fixes the byte layout of the payloads: little-endian,
//! fixed-width integers, byte strings prefixed by their length.

use bincode::{
    Decode, Encode,
    config::{self, Config},
};

use crate::{
    error::ShadowError,
    object::{ObjectKind, ObjectLocation},
    storage::{DelegateRecord, NewObject, ObjectId, Storage, VirtualAddress},
};

/// Size of [`VirtualAddress::serialize`] output.
pub const VIRTUAL_ADDRESS_SIZE: usize = 8 + 8 + 1 + 2;

fn wire_config() -> impl Config {
    config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Every heap event since the previous outward message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct MemoryUpdate {
    pub new_objects: Vec<NewObject>,
    pub deleted: Vec<ObjectId>,
    pub delegates: Vec<DelegateRecord>,
}

impl MemoryUpdate {
    /// Empties the storage's event logs into one update.
    pub fn drain(storage: &mut Storage) -> Self {
        MemoryUpdate {
            new_objects: storage.flush_objects(),
            deleted: storage.flush_deleted_by_gc(),
            delegates: storage.flush_delegates(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.new_objects.is_empty() && self.deleted.is_empty() && self.delegates.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ShadowError> {
        bincode::encode_to_vec(self, wire_config())
            .map_err(|e| ShadowError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ShadowError> {
        let (update, read) = bincode::decode_from_slice(bytes, wire_config())
            .map_err(|e| ShadowError::Encoding(e.to_string()))?;
        if read != bytes.len() {
            return Err(ShadowError::Encoding(format!(
                "{} trailing bytes after memory update",
                bytes.len() - read
            )));
        }
        Ok(update)
    }
}

impl VirtualAddress {
    /// Object word, offset word, location kind, two key bytes.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.obj.to_word().to_le_bytes());
        out.extend_from_slice(&(self.offset as u64).to_le_bytes());
        out.push(self.location.kind as u8);
        out.extend_from_slice(&self.location.key_bytes());
    }

    /// Reads the object and offset words. Incoming addresses carry no
    /// location, so the result is tagged as heap memory.
    pub fn deserialize(bytes: &[u8]) -> Result<(Self, usize), ShadowError> {
        let word = |at: usize| -> Result<u64, ShadowError> {
            let slice = bytes.get(at..at + 8).ok_or_else(|| {
                ShadowError::Encoding(format!(
                    "virtual address truncated at byte {} of {}",
                    at,
                    bytes.len()
                ))
            })?;
            let mut word = [0u8; 8];
            word.copy_from_slice(slice);
            Ok(u64::from_le_bytes(word))
        };
        let obj = ObjectId::from_word(word(0)?);
        let offset = usize::try_from(word(8)?)
            .map_err(|e| ShadowError::Encoding(e.to_string()))?;
        let address = VirtualAddress {
            obj,
            offset,
            location: ObjectLocation::heap(),
        };
        Ok((address, 16))
    }
}

/// Decodes the location tail written by [`VirtualAddress::serialize`].
pub fn location_kind(byte: u8) -> Result<ObjectKind, ShadowError> {
    ObjectKind::from_u8(byte)
        .ok_or_else(|| ShadowError::Encoding(format!("unknown location kind {}", byte)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_address_layout() {
        let address = VirtualAddress {
            obj: ObjectId::from_word(0x0000_0002_0000_0007),
            offset: 0x18,
            location: ObjectLocation::static_field(-2),
        };
        let mut out = Vec::new();
        address.serialize(&mut out);
        assert_eq!(out.len(), VIRTUAL_ADDRESS_SIZE);
        assert_eq!(&out[0..8], &[7, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(&out[8..16], &[0x18, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(location_kind(out[16]).unwrap(), ObjectKind::Statics);
        assert_eq!(&out[17..19], &(-2i16).to_le_bytes());

        let (back, read) = VirtualAddress::deserialize(&out).unwrap();
        assert_eq!(read, 16);
        assert_eq!(back.obj, address.obj);
        assert_eq!(back.offset, address.offset);
        assert!(VirtualAddress::deserialize(&out[..12]).is_err());
        assert!(location_kind(9).is_err());
    }

    #[test]
    fn test_stack_key_bytes() {
        let mut out = Vec::new();
        VirtualAddress {
            obj: ObjectId::NULL,
            offset: 0,
            location: ObjectLocation::parameter(3, 1),
        }
        .serialize(&mut out);
        assert_eq!(&out[16..], &[ObjectKind::Parameter as u8, 3, 1]);
    }

    #[test]
    fn test_update_layout_is_fixed_width() {
        let update = MemoryUpdate {
            new_objects: vec![NewObject {
                id: ObjectId::from_word(1),
                type_name: b"Foo".to_vec(),
            }],
            deleted: vec![],
            delegates: vec![],
        };
        let bytes = update.encode().unwrap();
        #[rustfmt::skip]
        let expected: Vec<u8> = [
            &[1, 0, 0, 0, 0, 0, 0, 0][..], // one new object
            &[1, 0, 0, 0, 0, 0, 0, 0],     // id
            &[3, 0, 0, 0, 0, 0, 0, 0],     // type length
            b"Foo",
            &[0; 8],                       // no deletions
            &[0; 8],                       // no delegates
        ]
        .concat();
        assert_eq!(bytes, expected);
        assert_eq!(MemoryUpdate::decode(&bytes).unwrap(), update);

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(MemoryUpdate::decode(&trailing).is_err());
    }

    #[test]
    fn test_drain_empties_logs() {
        let mut storage = Storage::new();
        let id = storage
            .allocate_object(0x1000, 8, b"T".to_vec(), false)
            .unwrap();
        storage.allocate_delegate(id, 4, ObjectId::NULL);

        let update = MemoryUpdate::drain(&mut storage);
        assert_eq!(update.new_objects.len(), 1);
        assert_eq!(update.delegates.len(), 1);
        assert!(MemoryUpdate::drain(&mut storage).is_empty());
    }
}
