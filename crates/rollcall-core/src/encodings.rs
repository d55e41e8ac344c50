//! Enrolled reference encodings, loaded once at startup.
//!
//! The artifact is produced by the enrollment tooling as a JSON object
//! holding two parallel lists:
//!
//! ```json
//! {"identities": ["alice", "alice", "bob"], "encodings": [[0.1, ...], [0.2, ...], [0.3, ...]]}
//! ```

use crate::types::{Embedding, EmptyIdentity, Identity};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("encoding store not found: {0} — run enrollment first")]
    NotFound(PathBuf),
    #[error("failed to read encoding store {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed encoding store {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("invalid encoding store {path}: {source}")]
    Invalid {
        path: PathBuf,
        source: StoreError,
    },
}

/// Parallel lists that do not form a usable store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{identities} identities but {encodings} encodings")]
    LengthMismatch { identities: usize, encodings: usize },
    #[error("entry {index}: {source}")]
    EmptyIdentity { index: usize, source: EmptyIdentity },
    #[error("entry {index} ({identity}): empty encoding")]
    EmptyEncoding { index: usize, identity: Identity },
    #[error("entry {index} ({identity}): expected {expected}-dim encoding, got {actual}")]
    DimensionMismatch {
        index: usize,
        identity: Identity,
        expected: usize,
        actual: usize,
    },
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    identities: Vec<String>,
    encodings: Vec<Vec<f32>>,
}

/// Reference encodings in enrollment order. Immutable once loaded.
#[derive(Debug, Clone, Default)]
pub struct EncodingStore {
    identities: Vec<Identity>,
    encodings: Vec<Embedding>,
}

impl EncodingStore {
    /// Build a store from parallel lists, validating the same rules as [`load`](Self::load).
    pub fn from_parts(
        identities: Vec<String>,
        encodings: Vec<Vec<f32>>,
    ) -> Result<Self, StoreError> {
        if identities.len() != encodings.len() {
            return Err(StoreError::LengthMismatch {
                identities: identities.len(),
                encodings: encodings.len(),
            });
        }

        let dimension = encodings.first().map(Vec::len).unwrap_or(0);
        let mut ids = Vec::with_capacity(identities.len());
        for (index, (label, values)) in identities.into_iter().zip(encodings.iter()).enumerate() {
            let identity =
                Identity::new(label).map_err(|source| StoreError::EmptyIdentity { index, source })?;
            if values.is_empty() {
                return Err(StoreError::EmptyEncoding { index, identity });
            }
            if values.len() != dimension {
                return Err(StoreError::DimensionMismatch {
                    index,
                    identity,
                    expected: dimension,
                    actual: values.len(),
                });
            }
            ids.push(identity);
        }

        Ok(Self {
            identities: ids,
            encodings: encodings.into_iter().map(Embedding::new).collect(),
        })
    }

    /// Load the store artifact. Any failure means a session must not start.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LoadError::NotFound(path.to_path_buf())
            } else {
                LoadError::Io {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;

        let file: StoreFile = serde_json::from_str(&raw).map_err(|e| LoadError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let store = Self::from_parts(file.identities, file.encodings).map_err(|source| {
            LoadError::Invalid {
                path: path.to_path_buf(),
                source,
            }
        })?;

        tracing::info!(
            path = %path.display(),
            references = store.len(),
            people = store.identities().len(),
            dimension = store.dimension(),
            "loaded encoding store"
        );

        Ok(store)
    }

    /// Write the store artifact in the format [`load`](Self::load) reads.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let file = StoreFile {
            identities: self.identities.iter().map(|i| i.to_string()).collect(),
            encodings: self.encodings.iter().map(|e| e.values.clone()).collect(),
        };
        let json = serde_json::to_string(&file)?;
        std::fs::write(path, json)
    }

    /// `(identity, reference)` pairs in enumeration order.
    pub fn iter(&self) -> impl Iterator<Item = (&Identity, &Embedding)> {
        self.identities.iter().zip(self.encodings.iter())
    }

    /// Distinct identities, in order of first enrollment.
    pub fn identities(&self) -> Vec<&Identity> {
        let mut seen = Vec::new();
        for id in &self.identities {
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        seen
    }

    pub fn len(&self) -> usize {
        self.encodings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encodings.is_empty()
    }

    /// Encoding dimension, or 0 for an empty store.
    pub fn dimension(&self) -> usize {
        self.encodings.first().map(Embedding::dimension).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("faces.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_load_preserves_order_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"{"identities":["alice","bob","alice"],"encodings":[[0.0,1.0],[1.0,0.0],[0.5,0.5]]}"#,
        );
        let store = EncodingStore::load(&path).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.dimension(), 2);
        let order: Vec<&str> = store.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["alice", "bob", "alice"]);
        let people: Vec<&str> = store.identities().iter().map(|id| id.as_str()).collect();
        assert_eq!(people, vec!["alice", "bob"]);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = EncodingStore::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, LoadError::NotFound(_)));
    }

    #[test]
    fn test_load_not_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "\u{80}pickle");
        assert!(matches!(
            EncodingStore::load(&path),
            Err(LoadError::Malformed { .. })
        ));
    }

    #[test]
    fn test_load_length_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{"identities":["alice","bob"],"encodings":[[0.0]]}"#);
        let err = EncodingStore::load(&path).unwrap_err();
        assert!(err.to_string().contains("2 identities but 1 encodings"), "{err}");
    }

    #[test]
    fn test_load_ragged_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"{"identities":["alice","bob"],"encodings":[[0.0,1.0],[1.0]]}"#,
        );
        assert!(matches!(
            EncodingStore::load(&path),
            Err(LoadError::Invalid {
                source: StoreError::DimensionMismatch { index: 1, expected: 2, actual: 1, .. },
                ..
            })
        ));
    }

    #[test]
    fn test_load_empty_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, r#"{"identities":[""],"encodings":[[0.0]]}"#);
        assert!(matches!(
            EncodingStore::load(&path),
            Err(LoadError::Invalid {
                source: StoreError::EmptyIdentity { index: 0, .. },
                ..
            })
        ));
    }

    #[test]
    fn test_from_parts_errors() {
        assert_eq!(
            EncodingStore::from_parts(vec!["alice".into()], vec![]).unwrap_err(),
            StoreError::LengthMismatch { identities: 1, encodings: 0 }
        );
        assert_eq!(
            EncodingStore::from_parts(vec!["alice".into()], vec![vec![]]).unwrap_err(),
            StoreError::EmptyEncoding { index: 0, identity: Identity::new("alice").unwrap() }
        );
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.json");
        let store = EncodingStore::from_parts(
            vec!["carol".into(), "dave".into()],
            vec![vec![0.25, 0.75], vec![0.5, 0.5]],
        )
        .unwrap();
        store.save(&path).unwrap();
        let loaded = EncodingStore::load(&path).unwrap();
        let pairs: Vec<(String, Vec<f32>)> = loaded
            .iter()
            .map(|(id, e)| (id.to_string(), e.values.clone()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("carol".to_string(), vec![0.25, 0.75]),
                ("dave".to_string(), vec![0.5, 0.5]),
            ]
        );
    }
}
