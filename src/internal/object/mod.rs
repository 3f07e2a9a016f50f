//! Object model for the four stored Git object kinds. Parsers only extract what the server
//! needs to walk history (tree links, parents, tag targets); builders exist for the objects
//! the server authors itself when seeding a repository.

pub mod blob;
pub mod commit;
pub mod signature;
pub mod tag;
pub mod tree;
pub mod types;

use std::fmt::Display;

use crate::{errors::GitError, hash::ObjectHash, internal::object::types::ObjectType};

/// **The Object Trait**
/// Defines the common interface for blobs, trees, commits, and tags.
pub trait ObjectTrait: Send + Sync + Display {
    /// Creates a new object from a byte slice.
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError>
    where
        Self: Sized;

    /// Returns the type of the object.
    fn get_type(&self) -> ObjectType;

    fn to_data(&self) -> Result<Vec<u8>, GitError>;

    /// Computes the object hash from serialized data.
    fn object_hash(&self) -> Result<ObjectHash, GitError> {
        let data = self.to_data()?;
        Ok(ObjectHash::from_type_and_data(self.get_type(), &data))
    }
}
