//! Annotated tag objects. Only the target (`object` and `type` headers) and the tag name are
//! interpreted; they drive `^{}` peeling in advertisements and include-tag on fetch.

use std::fmt::Display;

use bstr::ByteSlice;

use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::object::{ObjectTrait, types::ObjectType},
};

#[derive(Eq, Debug, Clone)]
pub struct Tag {
    pub id: ObjectHash,
    pub object_hash: ObjectHash,
    pub object_type: ObjectType,
    pub tag_name: String,
    /// Everything after the `tag` header, kept verbatim so the object re-encodes identically.
    raw: Vec<u8>,
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "tag {} -> {} {}",
            self.tag_name, self.object_type, self.object_hash
        )
    }
}

impl ObjectTrait for Tag {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError> {
        let invalid = |what: &str| GitError::InvalidTagObject(what.to_string());

        let headers = match data.find(b"\n\n") {
            Some(pos) => &data[..pos],
            None => data,
        };

        let mut object_hash = None;
        let mut object_type = None;
        let mut tag_name = None;
        for line in headers.lines() {
            let Some((key, value)) = line.split_once_str(" ") else {
                continue;
            };
            let value = value.to_str().map_err(|_| invalid("non-utf8 header"))?;
            match key {
                b"object" => {
                    object_hash = Some(
                        value
                            .parse::<ObjectHash>()
                            .map_err(GitError::InvalidHashValue)?,
                    )
                }
                b"type" => object_type = Some(ObjectType::from_string(value)?),
                b"tag" => tag_name = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(Tag {
            id: hash,
            object_hash: object_hash.ok_or_else(|| invalid("missing object"))?,
            object_type: object_type.ok_or_else(|| invalid("missing type"))?,
            tag_name: tag_name.ok_or_else(|| invalid("missing tag name"))?,
            raw: data.to_vec(),
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Tag
    }

    fn to_data(&self) -> Result<Vec<u8>, GitError> {
        Ok(self.raw.clone())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        hash::ObjectHash,
        internal::object::{ObjectTrait, tag::Tag, types::ObjectType},
    };

    #[test]
    fn test_tag_from_bytes() {
        let data = b"object ce013625030ba8dba906f756967f9e9ca394464a\n\
type commit\n\
tag v1.0\n\
tagger A <a@x> 1 +0000\n\
\n\
release\n";
        let hash = ObjectHash::from_type_and_data(ObjectType::Tag, data);
        let tag = Tag::from_bytes(data, hash).unwrap();
        assert_eq!(tag.tag_name, "v1.0");
        assert_eq!(tag.object_type, ObjectType::Commit);
        assert_eq!(
            tag.object_hash.to_string(),
            "ce013625030ba8dba906f756967f9e9ca394464a"
        );
        assert_eq!(tag.object_hash().unwrap(), hash);
    }

    #[test]
    fn test_tag_missing_object() {
        assert!(Tag::from_bytes(b"type commit\ntag v1\n\nmsg", ObjectHash::default()).is_err());
    }
}
