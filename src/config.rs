use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::aggregate::{AggregationConfig, PercentageMetric, default_percentages};
use crate::domain::{DatasetKind, RegionKind, SourceDescriptor, SourceName, SourceSpec};
use crate::error::LayerError;
use crate::fetch::RetryPolicy;

pub const DEFAULT_CONFIG: &str = "metro-layers.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub layers: Vec<LayerEntry>,
    #[serde(default)]
    pub percentages: Option<Vec<PercentageMetric>>,
    #[serde(default)]
    pub snapshot: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SourceEntry {
    Shorthand(String),
    Detailed(SourceEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SourceEntryObject {
    pub name: String,
    pub kind: DatasetKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LayerEntry {
    pub name: String,
    #[serde(default)]
    pub kind: Option<RegionKind>,
    pub regions: String,
    #[serde(default)]
    pub points: Vec<String>,
    #[serde(default)]
    pub demographics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSpec {
    pub name: String,
    pub kind: RegionKind,
    pub regions: SourceName,
    pub points: Vec<SourceName>,
    pub demographics: Vec<SourceName>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub sources: Vec<SourceSpec>,
    pub retry: RetryPolicy,
    pub layers: Vec<LayerSpec>,
    pub aggregation: AggregationConfig,
    pub snapshot: Option<Utf8PathBuf>,
}

impl ResolvedConfig {
    pub fn source(&self, name: &SourceName) -> Option<&SourceSpec> {
        self.sources.iter().find(|spec| &spec.name == name)
    }

    pub fn layer(&self, name: &str) -> Option<&LayerSpec> {
        self.layers.iter().find(|layer| layer.name == name)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, LayerError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG),
        };

        if path.is_none() && !config_path.exists() {
            return Err(LayerError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| LayerError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| LayerError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, LayerError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let sources = config
            .sources
            .into_iter()
            .map(|entry| match entry {
                SourceEntry::Shorthand(value) => value.parse::<SourceSpec>(),
                SourceEntry::Detailed(obj) => resolve_source(obj),
            })
            .collect::<Result<Vec<_>, LayerError>>()?;

        let mut names = HashSet::new();
        for spec in &sources {
            if !names.insert(spec.name.clone()) {
                return Err(LayerError::InvalidSourceName(format!(
                    "duplicate source name {}",
                    spec.name
                )));
            }
        }

        let layers = if config.layers.is_empty() {
            default_layers(&sources)
        } else {
            config
                .layers
                .into_iter()
                .map(|entry| resolve_layer(entry, &sources))
                .collect::<Result<Vec<_>, LayerError>>()?
        };

        let mut layer_names = HashSet::new();
        for layer in &layers {
            if !layer_names.insert(layer.name.as_str()) {
                return Err(LayerError::ConfigParse(format!(
                    "duplicate layer name {}",
                    layer.name
                )));
            }
        }

        Ok(ResolvedConfig {
            schema_version,
            sources,
            retry: config.retry.unwrap_or_default(),
            layers,
            aggregation: AggregationConfig {
                percentages: config.percentages.unwrap_or_else(default_percentages),
            },
            snapshot: config.snapshot.map(Utf8PathBuf::from),
        })
    }
}

fn resolve_source(obj: SourceEntryObject) -> Result<SourceSpec, LayerError> {
    let name: SourceName = obj.name.parse()?;
    let descriptor = match (obj.url, obj.path) {
        (Some(url), None) => {
            let descriptor: SourceDescriptor = url.parse()?;
            if !descriptor.is_url() {
                return Err(LayerError::InvalidDescriptor(format!(
                    "{name}: url must start with http:// or https://"
                )));
            }
            descriptor
        }
        (None, Some(path)) => SourceDescriptor::File(Utf8PathBuf::from(path)),
        _ => {
            return Err(LayerError::InvalidDescriptor(format!(
                "{name}: exactly one of url or path is required"
            )));
        }
    };
    Ok(SourceSpec {
        name,
        kind: obj.kind,
        descriptor,
    })
}

fn resolve_layer(entry: LayerEntry, sources: &[SourceSpec]) -> Result<LayerSpec, LayerError> {
    let lookup = |raw: &str, kind: DatasetKind| -> Result<SourceName, LayerError> {
        let name: SourceName = raw.parse()?;
        match sources.iter().find(|spec| spec.name == name) {
            Some(spec) if spec.kind == kind => Ok(name),
            Some(spec) => Err(LayerError::MissingSource(format!(
                "layer {} expects {kind} from {name}, found {}",
                entry.name, spec.kind
            ))),
            None => Err(LayerError::MissingSource(format!(
                "layer {} references unknown source {name}",
                entry.name
            ))),
        }
    };

    let regions = lookup(&entry.regions, DatasetKind::Regions)?;
    let points = entry
        .points
        .iter()
        .map(|raw| lookup(raw, DatasetKind::Points))
        .collect::<Result<Vec<_>, _>>()?;
    let demographics = entry
        .demographics
        .iter()
        .map(|raw| lookup(raw, DatasetKind::Demographics))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(LayerSpec {
        kind: entry.kind.unwrap_or(RegionKind::Tract),
        name: entry.name,
        regions,
        points,
        demographics,
    })
}

fn default_layers(sources: &[SourceSpec]) -> Vec<LayerSpec> {
    let of_kind = |kind: DatasetKind| -> Vec<SourceName> {
        sources
            .iter()
            .filter(|spec| spec.kind == kind)
            .map(|spec| spec.name.clone())
            .collect()
    };
    let points = of_kind(DatasetKind::Points);
    let demographics = of_kind(DatasetKind::Demographics);
    of_kind(DatasetKind::Regions)
        .into_iter()
        .map(|regions| LayerSpec {
            name: regions.to_string(),
            kind: RegionKind::Tract,
            regions,
            points: points.clone(),
            demographics: demographics.clone(),
        })
        .collect()
}
