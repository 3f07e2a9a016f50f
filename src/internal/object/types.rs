//! Object type enumeration shared by the object model, the pack codec and storage.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::errors::GitError;

/// In Git, each object type is assigned a unique integer value, which is used to identify the
/// type of the object in pack entry headers.
///
/// * `Commit` (1), `Tree` (2), `Blob` (3) and `Tag` (4) are the four stored object kinds.
/// * `OffsetDelta` (6): a delta whose base is addressed by a negative offset inside the pack.
/// * `HashDelta` (7): a delta whose base is addressed by object id.
///
/// The delta kinds only ever appear inside packs; they are never stored.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Commit = 1,
    Tree = 2,
    Blob = 3,
    Tag = 4,
    OffsetDelta = 6,
    HashDelta = 7,
}

const COMMIT_OBJECT_TYPE: &[u8] = b"commit";
const TREE_OBJECT_TYPE: &[u8] = b"tree";
const BLOB_OBJECT_TYPE: &[u8] = b"blob";
const TAG_OBJECT_TYPE: &[u8] = b"tag";
const OFS_DELTA_OBJECT_TYPE: &[u8] = b"ofs-delta";
const REF_DELTA_OBJECT_TYPE: &[u8] = b"ref-delta";

impl Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // `to_bytes` only yields ASCII literals.
        f.write_str(&String::from_utf8_lossy(self.to_bytes()))
    }
}

impl ObjectType {
    /// Convert object type to the 3-bit pack header type id.
    pub fn to_pack_type_u8(&self) -> u8 {
        *self as u8
    }

    /// Decode 3-bit pack header type id to object type.
    pub fn from_pack_type_u8(number: u8) -> Result<ObjectType, GitError> {
        match number {
            1 => Ok(ObjectType::Commit),
            2 => Ok(ObjectType::Tree),
            3 => Ok(ObjectType::Blob),
            4 => Ok(ObjectType::Tag),
            6 => Ok(ObjectType::OffsetDelta),
            7 => Ok(ObjectType::HashDelta),
            _ => Err(GitError::InvalidObjectType(format!(
                "Invalid pack object type number: {number}"
            ))),
        }
    }

    pub fn to_bytes(&self) -> &'static [u8] {
        match self {
            ObjectType::Commit => COMMIT_OBJECT_TYPE,
            ObjectType::Tree => TREE_OBJECT_TYPE,
            ObjectType::Blob => BLOB_OBJECT_TYPE,
            ObjectType::Tag => TAG_OBJECT_TYPE,
            ObjectType::OffsetDelta => OFS_DELTA_OBJECT_TYPE,
            ObjectType::HashDelta => REF_DELTA_OBJECT_TYPE,
        }
    }

    /// Parses the textual name used in loose-object headers and tag bodies.
    /// Only the four stored kinds are accepted.
    pub fn from_string(s: &str) -> Result<ObjectType, GitError> {
        match s {
            "blob" => Ok(ObjectType::Blob),
            "tree" => Ok(ObjectType::Tree),
            "commit" => Ok(ObjectType::Commit),
            "tag" => Ok(ObjectType::Tag),
            _ => Err(GitError::InvalidObjectType(s.to_string())),
        }
    }

    /// True for commit, tree, blob and tag.
    pub fn is_base(&self) -> bool {
        matches!(
            self,
            ObjectType::Commit | ObjectType::Tree | ObjectType::Blob | ObjectType::Tag
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::internal::object::types::ObjectType;

    #[test]
    fn test_object_type_round_trip_names() {
        for t in [
            ObjectType::Commit,
            ObjectType::Tree,
            ObjectType::Blob,
            ObjectType::Tag,
        ] {
            assert_eq!(ObjectType::from_string(&t.to_string()).unwrap(), t);
            assert_eq!(ObjectType::from_pack_type_u8(t.to_pack_type_u8()).unwrap(), t);
            assert!(t.is_base());
        }
    }

    /// Delta kinds have pack ids but no loose-object name.
    #[test]
    fn test_delta_types() {
        assert_eq!(ObjectType::OffsetDelta.to_pack_type_u8(), 6);
        assert_eq!(ObjectType::HashDelta.to_pack_type_u8(), 7);
        assert!(!ObjectType::OffsetDelta.is_base());
        assert!(ObjectType::from_string("ofs-delta").is_err());
        assert!(ObjectType::from_pack_type_u8(5).is_err());
        assert!(ObjectType::from_pack_type_u8(0).is_err());
    }
}
