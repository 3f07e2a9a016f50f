use std::sync::Arc;

use tracing::{debug, info};

use crate::storage::{
    backend::{StorageBackend, StorageHandle},
    error::StorageError,
    types::RepositoryName,
};

/// Name-level entry point over a backend. Every method normalises its input first.
#[derive(Clone)]
pub struct Registry {
    backend: Arc<dyn StorageBackend>,
}

impl Registry {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Registry { backend }
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    pub async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        let name = RepositoryName::normalize(name)?;
        self.backend.exists(&name).await
    }

    pub async fn create(&self, name: &str) -> Result<RepositoryName, StorageError> {
        let name = RepositoryName::normalize(name)?;
        self.backend.create(&name).await?;
        Ok(name)
    }

    pub async fn delete(&self, name: &str) -> Result<(), StorageError> {
        let name = RepositoryName::normalize(name)?;
        self.backend.delete(&name).await
    }

    pub async fn list(&self) -> Result<Vec<RepositoryName>, StorageError> {
        self.backend.list().await
    }

    pub async fn open(&self, name: &str) -> Result<Box<dyn StorageHandle>, StorageError> {
        let name = RepositoryName::normalize(name)?;
        self.backend.open(&name).await
    }

    /// Opens `name`, creating it first when absent. Losing a creation race is not an error.
    pub async fn open_or_create(&self, name: &str) -> Result<Box<dyn StorageHandle>, StorageError> {
        let name = RepositoryName::normalize(name)?;
        if !self.backend.exists(&name).await? {
            match self.backend.create(&name).await {
                Ok(()) => info!(repo = %name, "auto-created repository on push"),
                Err(StorageError::AlreadyExists(_)) => {
                    debug!(repo = %name, "repository created concurrently")
                }
                Err(e) => return Err(e),
            }
        }
        self.backend.open(&name).await
    }
}
