//! Values exchanged with storage backends: repository names, objects, references and the
//! repository config blob.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    hash::ObjectHash,
    internal::{object::types::ObjectType, pack::entry::Entry},
    storage::error::StorageError,
};

const GIT_SUFFIX: &str = ".git";

/// Normalised repository path, always ending in `.git`.
///
/// `demo`, `demo.git` and `/demo/` all normalise to `demo.git`; nested paths such as
/// `team/project` keep their separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepositoryName(String);

impl RepositoryName {
    pub fn normalize(raw: &str) -> Result<Self, StorageError> {
        let trimmed = raw.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Err(StorageError::InvalidRequest(
                "repository name is empty".to_string(),
            ));
        }
        if trimmed.contains('\\') {
            return Err(StorageError::InvalidRequest(format!(
                "repository name contains a backslash: {raw}"
            )));
        }
        let segments: Vec<&str> = trimmed.split('/').collect();
        for (i, segment) in segments.iter().enumerate() {
            if segment.is_empty() || *segment == "." || *segment == ".." {
                return Err(StorageError::InvalidRequest(format!(
                    "invalid repository path segment in {raw}"
                )));
            }
            if segment.chars().any(|c| c.is_control()) {
                return Err(StorageError::InvalidRequest(format!(
                    "repository name contains control characters: {raw}"
                )));
            }
            // Repositories never live inside another repository's directory.
            if i + 1 < segments.len() && segment.ends_with(GIT_SUFFIX) {
                return Err(StorageError::InvalidRequest(format!(
                    "repository name is nested inside a repository: {raw}"
                )));
            }
        }
        let name = if trimmed.ends_with(GIT_SUFFIX) {
            trimmed.to_string()
        } else {
            format!("{trimmed}{GIT_SUFFIX}")
        };
        if name == GIT_SUFFIX || name.ends_with("/.git") {
            return Err(StorageError::InvalidRequest(format!(
                "repository name has no base name: {raw}"
            )));
        }
        Ok(RepositoryName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment without the `.git` suffix.
    pub fn base_name(&self) -> &str {
        let last = self.0.rsplit('/').next().unwrap_or(&self.0);
        last.strip_suffix(GIT_SUFFIX).unwrap_or(last)
    }
}

impl Display for RepositoryName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RepositoryName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for RepositoryName {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RepositoryName::normalize(s)
    }
}

impl TryFrom<String> for RepositoryName {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RepositoryName::normalize(&value)
    }
}

impl From<RepositoryName> for String {
    fn from(value: RepositoryName) -> Self {
        value.0
    }
}

/// A stored object: id, kind and raw payload (no loose header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitObject {
    pub hash: ObjectHash,
    pub obj_type: ObjectType,
    pub data: Vec<u8>,
}

impl GitObject {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

impl From<Entry> for GitObject {
    fn from(entry: Entry) -> Self {
        GitObject {
            hash: entry.hash,
            obj_type: entry.obj_type,
            data: entry.data,
        }
    }
}

impl From<GitObject> for Entry {
    fn from(object: GitObject) -> Self {
        Entry {
            obj_type: object.obj_type,
            data: object.data,
            hash: object.hash,
            chain_len: 0,
        }
    }
}

pub type ObjectIter = std::vec::IntoIter<GitObject>;
pub type ReferenceIter = std::vec::IntoIter<Reference>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReferenceTarget {
    Direct(ObjectHash),
    /// Name of another reference, e.g. `refs/heads/main`.
    Symbolic(String),
}

impl Display for ReferenceTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReferenceTarget::Direct(hash) => write!(f, "{hash}"),
            ReferenceTarget::Symbolic(target) => write!(f, "ref: {target}"),
        }
    }
}

impl ReferenceTarget {
    /// On-medium encoding, newline terminated.
    pub fn encode(&self) -> String {
        format!("{self}\n")
    }

    /// Parses stored reference content; the trailing newline is optional.
    pub fn decode(content: &str) -> Result<Self, StorageError> {
        let content = content.trim_end_matches(['\n', '\r']).trim();
        if let Some(target) = content.strip_prefix("ref:") {
            let target = target.trim();
            if target.is_empty() {
                return Err(StorageError::backend("empty symbolic reference"));
            }
            return Ok(ReferenceTarget::Symbolic(target.to_string()));
        }
        content
            .parse::<ObjectHash>()
            .map(ReferenceTarget::Direct)
            .map_err(|e| StorageError::backend(format!("malformed reference `{content}`: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub name: String,
    pub target: ReferenceTarget,
}

impl Reference {
    pub fn direct(name: impl Into<String>, hash: ObjectHash) -> Self {
        Reference {
            name: name.into(),
            target: ReferenceTarget::Direct(hash),
        }
    }

    pub fn symbolic(name: impl Into<String>, target: impl Into<String>) -> Self {
        Reference {
            name: name.into(),
            target: ReferenceTarget::Symbolic(target.into()),
        }
    }

    pub fn hash(&self) -> Option<ObjectHash> {
        match &self.target {
            ReferenceTarget::Direct(hash) => Some(*hash),
            ReferenceTarget::Symbolic(_) => None,
        }
    }
}

pub const HEAD: &str = "HEAD";

/// Accepts `HEAD` and names under `refs/` made of non-empty, dot-safe components.
pub fn validate_reference_name(name: &str) -> Result<(), StorageError> {
    let invalid = |why: &str| StorageError::InvalidRequest(format!("invalid reference {name}: {why}"));
    if name == HEAD {
        return Ok(());
    }
    if !name.starts_with("refs/") {
        return Err(invalid("must be HEAD or start with refs/"));
    }
    if name.ends_with('/') || name.ends_with(".lock") || name.ends_with('.') {
        return Err(invalid("bad suffix"));
    }
    if name.contains("..") || name.contains("@{") {
        return Err(invalid("forbidden sequence"));
    }
    if name
        .chars()
        .any(|c| c.is_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return Err(invalid("forbidden character"));
    }
    if name.split('/').any(|c| c.is_empty() || c.starts_with('.')) {
        return Err(invalid("empty or hidden component"));
    }
    Ok(())
}

/// Opaque config blob stored with each repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoConfig(String);

pub const DEFAULT_REPO_CONFIG: &str =
    "[core]\n\trepositoryformatversion = 0\n\tfilemode = true\n\tbare = true\n";

impl Default for RepoConfig {
    fn default() -> Self {
        RepoConfig(DEFAULT_REPO_CONFIG.to_string())
    }
}

impl RepoConfig {
    pub fn new(text: impl Into<String>) -> Self {
        RepoConfig(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_bare(&self) -> bool {
        self.0
            .lines()
            .map(|l| l.split_whitespace().collect::<String>())
            .any(|l| l == "bare=true")
    }
}

/// Shallow boundary commits, one hex id per line.
pub fn encode_shallow(commits: &[ObjectHash]) -> String {
    commits.iter().map(|c| format!("{c}\n")).collect()
}

pub fn decode_shallow(content: &str) -> Result<Vec<ObjectHash>, StorageError> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| {
            l.parse::<ObjectHash>()
                .map_err(|e| StorageError::backend(format!("malformed shallow entry `{l}`: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_normalize_variants() {
        for raw in ["demo", "demo.git", "/demo/", "  demo  ", "demo.git/"] {
            assert_eq!(RepositoryName::normalize(raw).unwrap().as_str(), "demo.git");
        }
        let nested = RepositoryName::normalize("/team/project").unwrap();
        assert_eq!(nested.as_str(), "team/project.git");
        assert_eq!(nested.base_name(), "project");
    }

    #[test]
    fn test_normalize_rejects() {
        for raw in [
            "",
            "   ",
            "/",
            "a/../b",
            "a//b",
            "a\\b",
            "..",
            ".git",
            "team/.git",
            "demo.git/sub",
            "demo.git/sub.git",
            "a/demo.git/b",
        ] {
            assert!(
                matches!(
                    RepositoryName::normalize(raw),
                    Err(StorageError::InvalidRequest(_))
                ),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_reference_target_encoding() {
        let hash = ObjectHash::from_str("ce013625030ba8dba906f756967f9e9ca394464a").unwrap();
        let direct = ReferenceTarget::Direct(hash);
        assert_eq!(direct.encode(), "ce013625030ba8dba906f756967f9e9ca394464a\n");
        assert_eq!(ReferenceTarget::decode(&direct.encode()).unwrap(), direct);
        // missing newline tolerated
        assert_eq!(
            ReferenceTarget::decode("ce013625030ba8dba906f756967f9e9ca394464a").unwrap(),
            direct
        );

        let symbolic = ReferenceTarget::Symbolic("refs/heads/main".to_string());
        assert_eq!(symbolic.encode(), "ref: refs/heads/main\n");
        assert_eq!(ReferenceTarget::decode("ref: refs/heads/main").unwrap(), symbolic);
        assert!(ReferenceTarget::decode("garbage").is_err());
    }

    #[test]
    fn test_validate_reference_name() {
        for ok in ["HEAD", "refs/heads/main", "refs/tags/v1.0", "refs/heads/feature/x"] {
            validate_reference_name(ok).unwrap();
        }
        for bad in [
            "main",
            "refs/heads/",
            "refs/heads/a..b",
            "refs/heads/x.lock",
            "refs/heads/a b",
            "refs//heads",
            "refs/heads/.hidden",
        ] {
            assert!(validate_reference_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_repo_config_default_is_bare() {
        assert!(RepoConfig::default().is_bare());
        assert!(!RepoConfig::new("[core]\n\tbare = false\n").is_bare());
    }

    #[test]
    fn test_shallow_round_trip() {
        let a = ObjectHash::from_str("ce013625030ba8dba906f756967f9e9ca394464a").unwrap();
        let b = ObjectHash::from_str("4b825dc642cb6eb9a060e54bf8d69288fbee4904").unwrap();
        let text = encode_shallow(&[a, b]);
        assert_eq!(decode_shallow(&text).unwrap(), vec![a, b]);
        assert!(decode_shallow("").unwrap().is_empty());
    }
}
