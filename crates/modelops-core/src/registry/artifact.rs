use dashmap::DashMap;

use crate::error::{ModelOpsError, Result};
use crate::types::Version;

/// External blob store for model weights.
pub trait ArtifactStore: Send + Sync {
    /// Store weights and return an opaque reference.
    fn put(&self, model_id: &str, version: &Version, weights: &[u8]) -> Result<String>;

    fn get(&self, reference: &str) -> Result<Option<Vec<u8>>>;

    fn delete(&self, reference: &str) -> Result<()>;

    fn exists(&self, reference: &str) -> bool {
        matches!(self.get(reference), Ok(Some(_)))
    }
}

/// Process-local artifact store. References look like `mem://<model>/<version>`.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn put(&self, model_id: &str, version: &Version, weights: &[u8]) -> Result<String> {
        if weights.is_empty() {
            return Err(ModelOpsError::InvalidArtifact("weights are empty".into()));
        }
        let reference = format!("mem://{}/{}", model_id, version);
        self.blobs.insert(reference.clone(), weights.to_vec());
        Ok(reference)
    }

    fn get(&self, reference: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(reference).map(|b| b.value().clone()))
    }

    fn delete(&self, reference: &str) -> Result<()> {
        self.blobs.remove(reference);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let store = InMemoryArtifactStore::new();
        let r = store.put("churn", &Version::INITIAL, &[1, 2, 3]).unwrap();
        assert_eq!(r, "mem://churn/1.0.0");
        assert!(store.exists(&r));
        assert_eq!(store.get(&r).unwrap(), Some(vec![1, 2, 3]));
        store.delete(&r).unwrap();
        assert!(!store.exists(&r));
    }

    #[test]
    fn empty_weights_are_rejected() {
        let store = InMemoryArtifactStore::new();
        assert!(store.put("churn", &Version::INITIAL, &[]).is_err());
        assert!(store.is_empty());
    }
}
