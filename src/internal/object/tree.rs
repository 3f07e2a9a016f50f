//! Tree objects list the entries of one directory level. Each entry is encoded as
//! `<octal mode> <name>\0<20-byte id>`, with entries sorted by name.

use std::fmt::Display;

use bstr::ByteSlice;

use crate::{
    errors::GitError,
    hash::{HASH_SIZE, ObjectHash},
    internal::object::{ObjectTrait, types::ObjectType},
};

/// Entry modes Git writes into trees.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum TreeItemMode {
    Blob,
    BlobExecutable,
    Tree,
    Link,
    /// A submodule pointer; the referenced commit lives in another repository.
    Commit,
}

impl TreeItemMode {
    pub fn to_bytes(self) -> &'static [u8] {
        match self {
            TreeItemMode::Blob => b"100644",
            TreeItemMode::BlobExecutable => b"100755",
            TreeItemMode::Tree => b"40000",
            TreeItemMode::Link => b"120000",
            TreeItemMode::Commit => b"160000",
        }
    }

    /// Accepts the canonical modes plus the legacy zero-padded `040000` and group-writable
    /// `100664` forms found in old repositories.
    pub fn tree_item_type_from_bytes(mode: &[u8]) -> Result<TreeItemMode, GitError> {
        match mode {
            b"100644" | b"100664" | b"100640" => Ok(TreeItemMode::Blob),
            b"100755" => Ok(TreeItemMode::BlobExecutable),
            b"40000" | b"040000" => Ok(TreeItemMode::Tree),
            b"120000" => Ok(TreeItemMode::Link),
            b"160000" => Ok(TreeItemMode::Commit),
            _ => Err(GitError::InvalidTreeItem(mode.to_str_lossy().to_string())),
        }
    }

    /// The object kind the entry id points at.
    pub fn object_type(self) -> ObjectType {
        match self {
            TreeItemMode::Tree => ObjectType::Tree,
            TreeItemMode::Commit => ObjectType::Commit,
            _ => ObjectType::Blob,
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct TreeItem {
    pub mode: TreeItemMode,
    pub id: ObjectHash,
    pub name: String,
}

impl TreeItem {
    pub fn new(mode: TreeItemMode, id: ObjectHash, name: String) -> Self {
        TreeItem { mode, id, name }
    }

    pub fn to_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(self.mode.to_bytes());
        data.push(b' ');
        data.extend_from_slice(self.name.as_bytes());
        data.push(b'\0');
        data.extend_from_slice(self.id.as_ref());
        data
    }
}

#[derive(Eq, Debug, Clone)]
pub struct Tree {
    pub id: ObjectHash,
    pub tree_items: Vec<TreeItem>,
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for item in &self.tree_items {
            writeln!(
                f,
                "{} {} {}",
                item.mode.to_bytes().to_str_lossy(),
                item.id,
                item.name
            )?;
        }
        Ok(())
    }
}

impl Tree {
    /// Builds a tree from entries, sorting them the way Git does (directories compare as if
    /// their name ended in `/`).
    pub fn from_tree_items(mut tree_items: Vec<TreeItem>) -> Tree {
        tree_items.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        let mut tree = Tree {
            id: ObjectHash::default(),
            tree_items,
        };
        tree.id = ObjectHash::from_type_and_data(ObjectType::Tree, &tree.to_data());
        tree
    }

    pub fn to_data(&self) -> Vec<u8> {
        self.tree_items
            .iter()
            .flat_map(|item| item.to_data())
            .collect()
    }
}

fn sort_key(item: &TreeItem) -> Vec<u8> {
    let mut key = item.name.as_bytes().to_vec();
    if item.mode == TreeItemMode::Tree {
        key.push(b'/');
    }
    key
}

impl ObjectTrait for Tree {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError> {
        let mut tree_items = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let space = rest
                .find_byte(b' ')
                .ok_or_else(|| GitError::InvalidTreeObject("entry without mode".into()))?;
            let mode = TreeItemMode::tree_item_type_from_bytes(&rest[..space])?;
            let nul = rest[space..]
                .find_byte(b'\0')
                .map(|i| i + space)
                .ok_or_else(|| GitError::InvalidTreeObject("entry without name".into()))?;
            let name = rest[space + 1..nul].to_str_lossy().to_string();
            let id_end = nul + 1 + HASH_SIZE;
            if rest.len() < id_end {
                return Err(GitError::InvalidTreeObject(format!(
                    "truncated entry `{name}`"
                )));
            }
            let id = ObjectHash::from_bytes(&rest[nul + 1..id_end])
                .map_err(GitError::InvalidHashValue)?;
            tree_items.push(TreeItem { mode, id, name });
            rest = &rest[id_end..];
        }
        Ok(Tree {
            id: hash,
            tree_items,
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Tree
    }

    fn to_data(&self) -> Result<Vec<u8>, GitError> {
        Ok(Tree::to_data(self))
    }
}
