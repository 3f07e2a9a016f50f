//! Object identifiers. Every Git object served by this crate is addressed by the SHA-1 of its
//! canonical encoding (`"<type> <len>\0" + payload`); pack trailers use the same digest.

use std::{fmt::Display, io, str::FromStr};

use serde::{Deserialize, Serialize};
use sha1::Digest;

use crate::internal::object::types::ObjectType;

/// Number of raw bytes in an object id.
pub const HASH_SIZE: usize = 20;
/// Number of hex characters in an object id.
pub const HASH_HEX_LEN: usize = 40;

/// A 20-byte SHA-1 object id. Displays as 40 lowercase hex characters.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize,
)]
pub struct ObjectHash([u8; HASH_SIZE]);

impl Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for ObjectHash {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Parses a 40-character hex id. Upper-case input is accepted and normalised on display.
impl FromStr for ObjectHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASH_HEX_LEN {
            return Err(format!("Invalid hash length: {}", s.len()));
        }
        let mut h = [0u8; HASH_SIZE];
        hex::decode_to_slice(s, &mut h).map_err(|e| e.to_string())?;
        Ok(ObjectHash(h))
    }
}

impl ObjectHash {
    /// The all-zero id, used on the wire for "no object".
    pub const ZERO: ObjectHash = ObjectHash([0u8; HASH_SIZE]);

    /// Returns the all-zero id as a hex string.
    pub fn zero_str() -> String {
        "0".repeat(HASH_HEX_LEN)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }

    /// Digest of arbitrary bytes.
    pub fn new(data: &[u8]) -> ObjectHash {
        let h = sha1::Sha1::digest(data);
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(h.as_ref());
        ObjectHash(bytes)
    }

    /// Id of an object with the given type and payload.
    pub fn from_type_and_data(object_type: ObjectType, data: &[u8]) -> ObjectHash {
        let mut hasher = sha1::Sha1::new();
        hasher.update(object_header(object_type, data.len()));
        hasher.update(data);
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(hasher.finalize().as_ref());
        ObjectHash(bytes)
    }

    /// Create ObjectHash from a byte slice
    pub fn from_bytes(bytes: &[u8]) -> Result<ObjectHash, String> {
        if bytes.len() != HASH_SIZE {
            return Err(format!(
                "Invalid byte length: got {}, expected {}",
                bytes.len(),
                HASH_SIZE
            ));
        }
        let mut h = [0u8; HASH_SIZE];
        h.copy_from_slice(bytes);
        Ok(ObjectHash(h))
    }

    /// Create ObjectHash from a stream
    pub fn from_stream(data: &mut impl io::Read) -> io::Result<ObjectHash> {
        let mut h = [0u8; HASH_SIZE];
        data.read_exact(&mut h)?;
        Ok(ObjectHash(h))
    }

    /// Export the id as raw bytes.
    pub fn to_data(self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// First two hex characters and the remaining 38, as used by the loose-object layout.
    pub fn fanout(&self) -> (String, String) {
        let hex = self.to_string();
        let (dir, file) = hex.split_at(2);
        (dir.to_string(), file.to_string())
    }
}

/// `"<type> <len>\0"`, the prefix hashed (and stored) in front of every loose object.
pub fn object_header(object_type: ObjectType, len: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(24);
    header.extend_from_slice(object_type.to_bytes());
    header.push(b' ');
    header.extend_from_slice(len.to_string().as_bytes());
    header.push(b'\0');
    header
}
