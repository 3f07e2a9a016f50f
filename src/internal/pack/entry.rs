//! Lightweight representation of a Git object going into or coming out of a pack stream, with
//! conversions from the strongly typed objects.

use std::hash::{Hash, Hasher};

use crate::{
    hash::ObjectHash,
    internal::object::{blob::Blob, commit::Commit, tree::Tree, types::ObjectType},
};

///
/// Git object data from pack file
///
#[derive(Eq, Clone, Debug)]
pub struct Entry {
    pub obj_type: ObjectType,
    pub data: Vec<u8>,
    pub hash: ObjectHash,
    /// Number of deltas applied to reach this object (0 for base objects).
    pub chain_len: usize,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.obj_type == other.obj_type && self.hash == other.hash
    }
}

impl Hash for Entry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.obj_type.hash(state);
        self.hash.hash(state);
    }
}

impl Entry {
    /// Builds a base entry, computing its id from type and payload.
    pub fn new(obj_type: ObjectType, data: Vec<u8>) -> Self {
        let hash = ObjectHash::from_type_and_data(obj_type, &data);
        Entry {
            obj_type,
            data,
            hash,
            chain_len: 0,
        }
    }
}

impl From<Blob> for Entry {
    fn from(value: Blob) -> Self {
        Self {
            obj_type: ObjectType::Blob,
            data: value.data,
            hash: value.id,
            chain_len: 0,
        }
    }
}

impl From<Commit> for Entry {
    fn from(value: Commit) -> Self {
        Self {
            obj_type: ObjectType::Commit,
            data: value.to_data(),
            hash: value.id,
            chain_len: 0,
        }
    }
}

impl From<Tree> for Entry {
    fn from(value: Tree) -> Self {
        Self {
            obj_type: ObjectType::Tree,
            data: value.to_data(),
            hash: value.id,
            chain_len: 0,
        }
    }
}
