use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tempfile::Builder;
use tracing::info;

use crate::error::LayerError;
use crate::orchestrator::FetchedDatasets;

pub const SNAPSHOT_ENV: &str = "METRO_LAYERS_SNAPSHOT";
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSnapshot {
    pub schema_version: u32,
    pub built_at: String,
    pub datasets: FetchedDatasets,
}

impl DataSnapshot {
    pub fn new(datasets: FetchedDatasets) -> Self {
        Self {
            schema_version: SNAPSHOT_VERSION,
            built_at: Utc::now().to_rfc3339(),
            datasets,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: Utf8PathBuf,
}

impl SnapshotStore {
    pub fn new() -> Result<Self, LayerError> {
        if let Ok(path) = std::env::var(SNAPSHOT_ENV) {
            if !path.trim().is_empty() {
                return Ok(Self::at(path.trim()));
            }
        }
        let path = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(
                    dirs.home_dir()
                        .join(".cache")
                        .join("metro-layers")
                        .join("layers.json"),
                )
                .ok()
            })
            .ok_or_else(|| {
                LayerError::Filesystem("unable to resolve cache directory".to_string())
            })?;
        Ok(Self { path })
    }

    pub fn at(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.as_std_path().is_file()
    }

    pub fn persist(&self, datasets: &FetchedDatasets) -> Result<DataSnapshot, LayerError> {
        let snapshot = DataSnapshot::new(datasets.clone());
        let content = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| LayerError::Filesystem(err.to_string()))?;
        write_atomic(&self.path, &content)?;
        info!(path = %self.path, sources = datasets.len(), "saved snapshot");
        Ok(snapshot)
    }

    pub fn load(&self) -> Result<DataSnapshot, LayerError> {
        if !self.exists() {
            return Err(LayerError::SnapshotMissing(self.path.to_string()));
        }
        let content = fs::read(self.path.as_std_path())
            .map_err(|err| LayerError::Filesystem(format!("read {}: {err}", self.path)))?;
        let snapshot: DataSnapshot = serde_json::from_slice(&content)
            .map_err(|err| LayerError::Filesystem(format!("parse {}: {err}", self.path)))?;
        info!(
            path = %self.path,
            built_at = %snapshot.built_at,
            sources = snapshot.datasets.len(),
            "loaded snapshot"
        );
        Ok(snapshot)
    }
}

fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), LayerError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| LayerError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".metro-layers")
        .suffix(".tmp")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| LayerError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| LayerError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| LayerError::Filesystem(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::dataset::{PointCollection, TypedDataset};

    fn store_in(dir: &tempfile::TempDir) -> SnapshotStore {
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        SnapshotStore::at(root.join("nested").join("layers.json"))
    }

    #[test]
    fn persist_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(!store.exists());

        let mut datasets = FetchedDatasets::new();
        datasets.insert(
            "stops".parse().unwrap(),
            TypedDataset::Points(PointCollection::default()),
        );
        let written = store.persist(&datasets).unwrap();
        assert!(store.exists());

        let loaded = store.load().unwrap();
        assert_eq!(loaded, written);
        assert_eq!(loaded.datasets, datasets);
        assert!(chrono::DateTime::parse_from_rfc3339(&loaded.built_at).is_ok());
    }

    #[test]
    fn missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let err = store_in(&dir).load().unwrap_err();
        assert_matches!(err, LayerError::SnapshotMissing(_));
    }

    #[test]
    fn overwrite_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.persist(&FetchedDatasets::new()).unwrap();
        store.persist(&FetchedDatasets::new()).unwrap();
        let entries = fs::read_dir(store.path().parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
