//! Blobs hold file contents with no further structure.

use std::fmt::Display;

use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::object::{ObjectTrait, types::ObjectType},
};

#[derive(Eq, Debug, Clone)]
pub struct Blob {
    pub id: ObjectHash,
    pub data: Vec<u8>,
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "blob {} ({} bytes)", self.id, self.data.len())
    }
}

impl Blob {
    pub fn from_content(content: &str) -> Self {
        let data = content.as_bytes().to_vec();
        Blob {
            id: ObjectHash::from_type_and_data(ObjectType::Blob, &data),
            data,
        }
    }
}

impl ObjectTrait for Blob {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError> {
        Ok(Blob {
            id: hash,
            data: data.to_vec(),
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Blob
    }

    fn to_data(&self) -> Result<Vec<u8>, GitError> {
        Ok(self.data.clone())
    }
}
