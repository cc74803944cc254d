use std::collections::{BTreeMap, HashSet};
use std::sync::mpsc;
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::cancel::CancelToken;
use crate::dataset::{DemographicTable, PointCollection, RegionCollection, TypedDataset};
use crate::domain::{SourceName, SourceSpec};
use crate::error::LayerError;
use crate::fetch::{RetryPolicy, SourceClient, SourceFetcher};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FetchedDatasets {
    datasets: BTreeMap<SourceName, TypedDataset>,
}

impl FetchedDatasets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: SourceName, dataset: TypedDataset) {
        self.datasets.insert(name, dataset);
    }

    pub fn get(&self, name: &SourceName) -> Option<&TypedDataset> {
        self.datasets.get(name)
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &SourceName> {
        self.datasets.keys()
    }

    pub fn regions(&self, name: &SourceName) -> Result<&RegionCollection, LayerError> {
        match self.datasets.get(name) {
            Some(TypedDataset::Regions(regions)) => Ok(regions),
            Some(other) => Err(kind_mismatch(name, "regions", other)),
            None => Err(LayerError::MissingSource(name.to_string())),
        }
    }

    pub fn points(&self, name: &SourceName) -> Result<&PointCollection, LayerError> {
        match self.datasets.get(name) {
            Some(TypedDataset::Points(points)) => Ok(points),
            Some(other) => Err(kind_mismatch(name, "points", other)),
            None => Err(LayerError::MissingSource(name.to_string())),
        }
    }

    pub fn demographics(&self, name: &SourceName) -> Result<&DemographicTable, LayerError> {
        match self.datasets.get(name) {
            Some(TypedDataset::Demographics(table)) => Ok(table),
            Some(other) => Err(kind_mismatch(name, "demographics", other)),
            None => Err(LayerError::MissingSource(name.to_string())),
        }
    }

    /// Merges the named demographic tables in the given order. Later tables
    /// win on identical region ids.
    pub fn merged_demographics(&self, names: &[SourceName]) -> Result<DemographicTable, LayerError> {
        let mut merged = DemographicTable::new();
        for name in names {
            merged.merge(self.demographics(name)?.clone());
        }
        Ok(merged)
    }
}

fn kind_mismatch(name: &SourceName, expected: &str, found: &TypedDataset) -> LayerError {
    LayerError::MissingSource(format!(
        "{name} holds {} data, expected {expected}",
        found.kind()
    ))
}

pub struct FetchOrchestrator<'a, C: SourceClient> {
    client: &'a C,
    policy: RetryPolicy,
}

impl<'a, C: SourceClient> FetchOrchestrator<'a, C> {
    pub fn new(client: &'a C, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn run(&self, specs: &[SourceSpec]) -> Result<FetchedDatasets, LayerError> {
        self.run_with_cancel(specs, &CancelToken::new())
    }

    pub fn run_with_cancel(
        &self,
        specs: &[SourceSpec],
        cancel: &CancelToken,
    ) -> Result<FetchedDatasets, LayerError> {
        let mut names = HashSet::with_capacity(specs.len());
        for spec in specs {
            if !names.insert(&spec.name) {
                return Err(LayerError::InvalidSourceName(format!(
                    "duplicate source name {}",
                    spec.name
                )));
            }
        }

        info!(sources = specs.len(), "fetching sources");
        let fetcher = SourceFetcher::new(self.client, self.policy);
        let mut slots: Vec<Option<TypedDataset>> = specs.iter().map(|_| None).collect();
        let mut failure: Option<LayerError> = None;

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel();
            for (index, spec) in specs.iter().enumerate() {
                let tx = tx.clone();
                let fetcher = &fetcher;
                scope.spawn(move || {
                    let result = fetcher.fetch(spec, cancel);
                    let _ = tx.send((index, result));
                });
            }
            drop(tx);

            for (index, result) in rx {
                match result {
                    Ok(dataset) => slots[index] = Some(dataset),
                    Err(err) if failure.is_none() => {
                        error!(source = %specs[index].name, "fetch failed, cancelling siblings: {err}");
                        cancel.cancel();
                        failure = Some(err);
                    }
                    Err(err) => debug!(source = %specs[index].name, "sibling stopped: {err}"),
                }
            }
        });

        if let Some(err) = failure {
            return Err(err);
        }

        let mut fetched = FetchedDatasets::new();
        for (spec, slot) in specs.iter().zip(slots) {
            let dataset = slot.ok_or_else(|| LayerError::MissingSource(spec.name.to_string()))?;
            fetched.insert(spec.name.clone(), dataset);
        }
        info!(sources = fetched.len(), "finished fetching sources");
        Ok(fetched)
    }
}
