//! The Commit object ties a root tree to its parent commits together with authorship and a
//! message. The server only needs the structural links (tree and parents) to walk history, and
//! the ability to produce a commit when seeding a new repository.

use std::fmt::Display;

use bstr::ByteSlice;

use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::object::{ObjectTrait, signature::Signature, types::ObjectType},
};

/// The `Commit` struct is used to represent a commit object.
///
/// Extra headers (`gpgsig`, `encoding`, `mergetag`, ...) are skipped when parsing; they are
/// never needed to serve a commit because stored bytes are sent verbatim.
#[derive(Eq, Debug, Clone)]
pub struct Commit {
    pub id: ObjectHash,
    pub tree_id: ObjectHash,
    pub parent_commit_ids: Vec<ObjectHash>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "tree: {}", self.tree_id)?;
        for parent in self.parent_commit_ids.iter() {
            writeln!(f, "parent: {parent}")?;
        }
        writeln!(f, "{}", self.author)?;
        writeln!(f, "{}", self.committer)?;
        writeln!(f, "{}", self.message)
    }
}

impl Commit {
    pub fn new(
        author: Signature,
        committer: Signature,
        tree_id: ObjectHash,
        parent_commit_ids: Vec<ObjectHash>,
        message: &str,
    ) -> Commit {
        let mut commit = Commit {
            id: ObjectHash::default(),
            tree_id,
            parent_commit_ids,
            author,
            committer,
            message: message.to_string(),
        };
        commit.id = ObjectHash::from_type_and_data(ObjectType::Commit, &commit.to_data());
        commit
    }

    pub fn to_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"tree ");
        data.extend_from_slice(self.tree_id.to_string().as_bytes());
        data.push(b'\n');
        for parent in &self.parent_commit_ids {
            data.extend_from_slice(b"parent ");
            data.extend_from_slice(parent.to_string().as_bytes());
            data.push(b'\n');
        }
        data.extend(self.author.to_data());
        data.push(b'\n');
        data.extend(self.committer.to_data());
        data.push(b'\n');
        data.push(b'\n');
        data.extend_from_slice(self.message.as_bytes());
        data
    }
}

fn parse_hash_field(value: &[u8], field: &str) -> Result<ObjectHash, GitError> {
    let text = value
        .to_str()
        .map_err(|_| GitError::InvalidCommit(format!("non-utf8 {field} id")))?;
    text.trim()
        .parse()
        .map_err(|_| GitError::InvalidHashValue(text.to_string()))
}

impl ObjectTrait for Commit {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError> {
        let (headers, message) = match data.find(b"\n\n") {
            Some(pos) => (&data[..pos], &data[pos + 2..]),
            None => (data, &b""[..]),
        };

        let mut tree_id = None;
        let mut parent_commit_ids = Vec::new();
        let mut author = None;
        let mut committer = None;

        for line in headers.lines() {
            // Continuation lines of multi-line headers (gpgsig) start with a space.
            if line.starts_with(b" ") {
                continue;
            }
            let (key, value) = line.split_once_str(" ").unwrap_or((line, &b""[..]));
            match key {
                b"tree" => tree_id = Some(parse_hash_field(value, "tree")?),
                b"parent" => parent_commit_ids.push(parse_hash_field(value, "parent")?),
                b"author" => author = Some(Signature::from_data(line)?),
                b"committer" => committer = Some(Signature::from_data(line)?),
                _ => {}
            }
        }

        Ok(Commit {
            id: hash,
            tree_id: tree_id.ok_or_else(|| GitError::InvalidCommit("missing tree".into()))?,
            parent_commit_ids,
            author: author.ok_or_else(|| GitError::InvalidCommit("missing author".into()))?,
            committer: committer
                .ok_or_else(|| GitError::InvalidCommit("missing committer".into()))?,
            message: message.to_str_lossy().to_string(),
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Commit
    }

    fn to_data(&self) -> Result<Vec<u8>, GitError> {
        Ok(Commit::to_data(self))
    }
}
