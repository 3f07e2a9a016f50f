/// Git Protocol Module
///
/// This module provides a narrow, transport-agnostic Git smart protocol (v1) engine. It
/// abstracts away the differences between the stateless HTTP exchange and the
/// connection-oriented SSH exchange behind one interface.
pub mod core;
pub mod http;
pub mod pack;
pub mod smart;
pub mod types;
pub mod utils;

// Re-export main interfaces
pub use core::{GitProtocol, RepositoryAccess};
pub use types::*;

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::{BTreeMap, HashMap},
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;

    use super::{RefCommand, core::RepositoryAccess, types::ProtocolError};
    use crate::{
        hash::ObjectHash,
        internal::{object::types::ObjectType, pack::entry::Entry},
        storage::{
            GitObject, Reference, ReferenceTarget, StorageError,
            types::HEAD,
        },
    };

    /// In-memory repository for engine tests.
    #[derive(Clone, Default)]
    pub(crate) struct MemoryRepo {
        objects: Arc<Mutex<HashMap<ObjectHash, Entry>>>,
        refs: Arc<Mutex<BTreeMap<String, ReferenceTarget>>>,
        hooks: Arc<Mutex<Vec<RefCommand>>>,
    }

    impl MemoryRepo {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn insert(&self, entry: Entry) {
            self.objects.lock().unwrap().insert(entry.hash, entry);
        }

        pub(crate) fn set_ref(&self, name: &str, hash: ObjectHash) {
            self.refs
                .lock()
                .unwrap()
                .insert(name.to_string(), ReferenceTarget::Direct(hash));
        }

        pub(crate) fn set_symbolic(&self, name: &str, target: &str) {
            self.refs
                .lock()
                .unwrap()
                .insert(name.to_string(), ReferenceTarget::Symbolic(target.to_string()));
        }

        /// Direct value of `name`, if any.
        pub(crate) fn reference(&self, name: &str) -> Option<ObjectHash> {
            match self.refs.lock().unwrap().get(name) {
                Some(ReferenceTarget::Direct(hash)) => Some(*hash),
                _ => None,
            }
        }

        pub(crate) fn hook_calls(&self) -> Vec<RefCommand> {
            self.hooks.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RepositoryAccess for MemoryRepo {
        async fn get_repository_refs(&self) -> Result<Vec<Reference>, ProtocolError> {
            let refs = self.refs.lock().unwrap();
            let mut out: Vec<Reference> = refs
                .get(HEAD)
                .map(|target| Reference {
                    name: HEAD.to_string(),
                    target: target.clone(),
                })
                .into_iter()
                .collect();
            out.extend(
                refs.iter()
                    .filter(|(name, _)| name.as_str() != HEAD)
                    .map(|(name, target)| Reference {
                        name: name.clone(),
                        target: target.clone(),
                    }),
            );
            Ok(out)
        }

        async fn resolve(&self, name: &str) -> Result<Option<ObjectHash>, ProtocolError> {
            let refs = self.refs.lock().unwrap();
            let mut current = name.to_string();
            for _ in 0..5 {
                match refs.get(&current) {
                    Some(ReferenceTarget::Direct(hash)) => return Ok(Some(*hash)),
                    Some(ReferenceTarget::Symbolic(target)) => current = target.clone(),
                    None => return Ok(None),
                }
            }
            Ok(None)
        }

        async fn has_object(&self, hash: &ObjectHash) -> Result<bool, ProtocolError> {
            Ok(self.objects.lock().unwrap().contains_key(hash))
        }

        async fn get_object(&self, hash: &ObjectHash) -> Result<GitObject, ProtocolError> {
            self.objects
                .lock()
                .unwrap()
                .get(hash)
                .cloned()
                .map(GitObject::from)
                .ok_or_else(|| StorageError::not_found(hash).into())
        }

        async fn put_object(
            &self,
            obj_type: ObjectType,
            data: &[u8],
        ) -> Result<ObjectHash, ProtocolError> {
            let entry = Entry::new(obj_type, data.to_vec());
            let hash = entry.hash;
            self.insert(entry);
            Ok(hash)
        }

        async fn update_reference(
            &self,
            name: &str,
            old: Option<ObjectHash>,
            new: Option<ObjectHash>,
        ) -> Result<(), ProtocolError> {
            let mut refs = self.refs.lock().unwrap();
            let current = match refs.get(name) {
                Some(ReferenceTarget::Direct(hash)) => Some(*hash),
                Some(ReferenceTarget::Symbolic(_)) | None => None,
            };
            if current != old {
                return Err(StorageError::ReferenceConflict {
                    name: name.to_string(),
                    expected: format!("{old:?}"),
                    actual: format!("{current:?}"),
                }
                .into());
            }
            match new {
                Some(hash) => {
                    refs.insert(name.to_string(), ReferenceTarget::Direct(hash));
                }
                None => {
                    refs.remove(name);
                }
            }
            Ok(())
        }

        async fn post_receive_hook(&self, commands: &[RefCommand]) -> Result<(), ProtocolError> {
            self.hooks.lock().unwrap().extend_from_slice(commands);
            Ok(())
        }
    }

    /// Annotated tag object `name` pointing at commit `target`.
    pub(crate) fn annotated_tag(target: ObjectHash, name: &str) -> Entry {
        let data = format!(
            "object {target}\ntype commit\ntag {name}\ntagger tester <tester@example.com> 0 +0000\n\nrelease {name}\n"
        );
        Entry::new(ObjectType::Tag, data.into_bytes())
    }
}
