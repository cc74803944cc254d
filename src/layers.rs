use std::collections::BTreeMap;
use std::time::Instant;

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::aggregate::{AggregatedRegion, AggregationConfig, build_aggregated_regions};
use crate::config::{LayerSpec, ResolvedConfig};
use crate::dataset::PointCollection;
use crate::domain::{DatasetKind, RegionKind, SourceSpec};
use crate::error::LayerError;
use crate::fetch::SourceClient;
use crate::geometry::GeographicPoint;
use crate::index::RegionIndex;
use crate::orchestrator::{FetchOrchestrator, FetchedDatasets};
use crate::output::{ProgressEvent, ProgressSink};
use crate::resolve::{ResolutionStats, resolve_point, resolve_points};
use crate::store::SnapshotStore;

#[derive(Debug, Clone, Default)]
pub struct BuildMode {
    pub refresh: bool,
    pub save: bool,
    pub snapshot: Option<Utf8PathBuf>,
    pub layer: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataOrigin {
    Fetched,
    Snapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerOutput {
    pub name: String,
    pub kind: RegionKind,
    pub features: Vec<AggregatedRegion>,
    pub points: BTreeMap<String, PointCollection>,
    pub resolution: BTreeMap<String, ResolutionStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataLayers {
    pub origin: DataOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub built_at: Option<String>,
    pub layers: Vec<LayerOutput>,
}

impl DataLayers {
    pub fn layer(&self, name: &str) -> Option<&LayerOutput> {
        self.layers.iter().find(|layer| layer.name == name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveResult {
    pub layer: String,
    pub longitude: f64,
    pub latitude: f64,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourcesResult {
    pub sources: Vec<SourceEntryResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceEntryResult {
    pub name: String,
    pub kind: String,
    pub descriptor: String,
}

impl SourcesResult {
    pub fn from_config(config: &ResolvedConfig, kind: Option<DatasetKind>) -> Self {
        Self {
            sources: config
                .sources
                .iter()
                .filter(|spec| kind.is_none_or(|kind| spec.kind == kind))
                .map(|spec: &SourceSpec| SourceEntryResult {
                    name: spec.name.to_string(),
                    kind: spec.kind.to_string(),
                    descriptor: spec.descriptor.to_string(),
                })
                .collect(),
        }
    }
}

pub struct LayerPipeline<C: SourceClient> {
    client: C,
}

impl<C: SourceClient> LayerPipeline<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn build(
        &self,
        config: &ResolvedConfig,
        mode: &BuildMode,
        sink: &dyn ProgressSink,
    ) -> Result<DataLayers, LayerError> {
        let (datasets, origin, built_at) = self.datasets(config, mode, sink)?;
        let layers = build_from_datasets(config, &datasets, mode.layer.as_deref(), sink)?;
        Ok(DataLayers {
            origin,
            built_at,
            layers,
        })
    }

    pub fn resolve(
        &self,
        config: &ResolvedConfig,
        mode: &BuildMode,
        point: GeographicPoint,
        sink: &dyn ProgressSink,
    ) -> Result<ResolveResult, LayerError> {
        let layer = select_layers(config, mode.layer.as_deref())?
            .into_iter()
            .next()
            .ok_or_else(|| LayerError::UnknownLayer("no layers configured".to_string()))?;
        let (datasets, _, _) = self.datasets(config, mode, sink)?;
        let index = RegionIndex::try_from_regions(&datasets.regions(&layer.regions)?.features)?;
        let region = resolve_point(&point, &index).map(str::to_string);
        Ok(ResolveResult {
            layer: layer.name.clone(),
            longitude: point.lon(),
            latitude: point.lat(),
            region,
        })
    }

    fn datasets(
        &self,
        config: &ResolvedConfig,
        mode: &BuildMode,
        sink: &dyn ProgressSink,
    ) -> Result<(FetchedDatasets, DataOrigin, Option<String>), LayerError> {
        let store = match mode.snapshot.as_ref().or(config.snapshot.as_ref()) {
            Some(path) => SnapshotStore::at(path.clone()),
            None => SnapshotStore::new()?,
        };

        if !mode.refresh && store.exists() {
            sink.event(ProgressEvent::phase("Snapshot", format!("loading {}", store.path())));
            let snapshot = store.load()?;
            return Ok((snapshot.datasets, DataOrigin::Snapshot, Some(snapshot.built_at)));
        }

        sink.event(ProgressEvent::phase(
            "Fetch",
            format!("{} sources", config.sources.len()),
        ));
        let started = Instant::now();
        let datasets = FetchOrchestrator::new(&self.client, config.retry).run(&config.sources)?;
        sink.event(
            ProgressEvent::phase("Fetch", format!("fetched {} sources", datasets.len()))
                .with_elapsed(started.elapsed()),
        );

        let built_at = if mode.save {
            sink.event(ProgressEvent::phase("Snapshot", format!("saving {}", store.path())));
            Some(store.persist(&datasets)?.built_at)
        } else {
            None
        };
        Ok((datasets, DataOrigin::Fetched, built_at))
    }
}

fn select_layers<'a>(
    config: &'a ResolvedConfig,
    only: Option<&str>,
) -> Result<Vec<&'a LayerSpec>, LayerError> {
    match only {
        Some(name) => config
            .layer(name)
            .map(|layer| vec![layer])
            .ok_or_else(|| LayerError::UnknownLayer(name.to_string())),
        None => Ok(config.layers.iter().collect()),
    }
}

pub fn build_from_datasets(
    config: &ResolvedConfig,
    datasets: &FetchedDatasets,
    only: Option<&str>,
    sink: &dyn ProgressSink,
) -> Result<Vec<LayerOutput>, LayerError> {
    select_layers(config, only)?
        .into_iter()
        .map(|layer| build_layer(layer, datasets, &config.aggregation, sink))
        .collect()
}

pub fn build_layer(
    layer: &LayerSpec,
    datasets: &FetchedDatasets,
    aggregation: &AggregationConfig,
    sink: &dyn ProgressSink,
) -> Result<LayerOutput, LayerError> {
    let started = Instant::now();
    let regions = datasets.regions(&layer.regions)?;
    let index = RegionIndex::from_regions(&regions.features);
    sink.event(ProgressEvent::phase(
        "Index",
        format!("layer {}: {} of {} regions", layer.name, index.len(), regions.features.len()),
    ));

    let mut points = BTreeMap::new();
    let mut resolution = BTreeMap::new();
    for name in &layer.points {
        let mut collection = datasets.points(name)?.clone();
        for point in &mut collection.points {
            point.clear_region();
        }
        let stats = resolve_points(&mut collection, &index);
        sink.event(ProgressEvent::phase(
            "Resolve",
            format!(
                "layer {}: {name} {} resolved, {} unresolved",
                layer.name, stats.resolved, stats.unresolved
            ),
        ));
        resolution.insert(name.to_string(), stats);
        points.insert(name.to_string(), collection);
    }

    let table = datasets.merged_demographics(&layer.demographics)?;
    let collections: Vec<(&str, &PointCollection)> = points
        .iter()
        .map(|(name, collection)| (name.as_str(), collection))
        .collect();
    let features =
        build_aggregated_regions(regions, &collections, &table, layer.kind, aggregation)?;
    sink.event(
        ProgressEvent::phase(
            "Aggregate",
            format!("layer {}: {} regions", layer.name, features.len()),
        )
        .with_elapsed(started.elapsed()),
    );

    Ok(LayerOutput {
        name: layer.name.clone(),
        kind: layer.kind,
        features,
        points,
        resolution,
    })
}
