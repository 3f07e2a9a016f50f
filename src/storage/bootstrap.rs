//! Content every new repository starts with.

use crate::{
    hash::ObjectHash,
    internal::{
        object::{
            blob::Blob,
            commit::Commit,
            signature::{Signature, SignatureType},
            tree::{Tree, TreeItem, TreeItemMode},
        },
        pack::entry::Entry,
    },
    storage::{
        backend::StorageHandle,
        error::StorageError,
        types::{HEAD, Reference, RepoConfig, RepositoryName},
    },
};

const AUTHOR_NAME: &str = "Git Server";
const AUTHOR_EMAIL: &str = "git-server@localhost";
const INITIAL_MESSAGE: &str = "Initial commit\n";

/// How `create` seeds a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOptions {
    pub default_branch: String,
    /// When false the repository is empty and `HEAD` points at the unborn default branch.
    pub initial_commit: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        InitOptions {
            default_branch: "main".to_string(),
            initial_commit: true,
        }
    }
}

impl InitOptions {
    pub fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.default_branch)
    }
}

/// Objects in write order (blob, tree, commit) and the commit the default branch points at.
#[derive(Debug)]
pub struct InitialContent {
    pub objects: Vec<Entry>,
    pub commit: Option<ObjectHash>,
}

pub fn readme_text(name: &RepositoryName) -> String {
    format!(
        "# {}\n\nThis repository is hosted by git-smart-server.\n",
        name.base_name()
    )
}

pub fn initial_content(name: &RepositoryName, options: &InitOptions) -> InitialContent {
    if !options.initial_commit {
        return InitialContent {
            objects: Vec::new(),
            commit: None,
        };
    }
    let readme = Blob::from_content(&readme_text(name));
    let tree = Tree::from_tree_items(vec![TreeItem::new(
        TreeItemMode::Blob,
        readme.id,
        "README.md".to_string(),
    )]);
    let commit = Commit::new(
        Signature::new(SignatureType::Author, AUTHOR_NAME, AUTHOR_EMAIL),
        Signature::new(SignatureType::Committer, AUTHOR_NAME, AUTHOR_EMAIL),
        tree.id,
        vec![],
        INITIAL_MESSAGE,
    );
    let commit_id = commit.id;
    InitialContent {
        objects: vec![readme.into(), tree.into(), commit.into()],
        commit: Some(commit_id),
    }
}

/// Writes config, initial objects, the default branch and finally `HEAD`.
pub async fn seed(handle: &dyn StorageHandle, options: &InitOptions) -> Result<(), StorageError> {
    handle.set_config(&RepoConfig::default()).await?;
    seed_content(handle, options).await
}

/// The object and reference part of [`seed`], for backends that write their config separately.
pub async fn seed_content(
    handle: &dyn StorageHandle,
    options: &InitOptions,
) -> Result<(), StorageError> {
    let content = initial_content(handle.name(), options);
    for object in &content.objects {
        handle.put_object(object.obj_type, &object.data).await?;
    }
    if let Some(commit) = content.commit {
        handle
            .set_reference(&Reference::direct(options.branch_ref(), commit))
            .await?;
    }
    handle
        .set_reference(&Reference::symbolic(HEAD, options.branch_ref()))
        .await
}
