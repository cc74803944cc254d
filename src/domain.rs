use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::LayerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Regions,
    Points,
    Demographics,
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetKind::Regions => write!(f, "regions"),
            DatasetKind::Points => write!(f, "points"),
            DatasetKind::Demographics => write!(f, "demographics"),
        }
    }
}

impl FromStr for DatasetKind {
    type Err = LayerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "regions" | "polygons" => Ok(DatasetKind::Regions),
            "points" | "stops" => Ok(DatasetKind::Points),
            "demographics" | "acs" => Ok(DatasetKind::Demographics),
            _ => Err(LayerError::InvalidDescriptor(format!(
                "unknown dataset kind: {value}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    Tract,
    County,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionKind::Tract => write!(f, "tract"),
            RegionKind::County => write!(f, "county"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceName(String);

impl SourceName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SourceName {
    type Err = LayerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !is_valid {
            return Err(LayerError::InvalidSourceName(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for SourceName {
    type Error = LayerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SourceName> for String {
    fn from(value: SourceName) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceDescriptor {
    Url(String),
    File(Utf8PathBuf),
}

impl SourceDescriptor {
    pub fn is_url(&self) -> bool {
        matches!(self, SourceDescriptor::Url(_))
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::Url(url) => write!(f, "{url}"),
            SourceDescriptor::File(path) => write!(f, "file:{path}"),
        }
    }
}

impl FromStr for SourceDescriptor {
    type Err = LayerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(LayerError::InvalidDescriptor(value.to_string()));
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Ok(SourceDescriptor::Url(trimmed.to_string()));
        }
        let path = trimmed.strip_prefix("file:").unwrap_or(trimmed);
        if path.is_empty() {
            return Err(LayerError::InvalidDescriptor(value.to_string()));
        }
        Ok(SourceDescriptor::File(Utf8PathBuf::from(path)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub name: SourceName,
    pub kind: DatasetKind,
    pub descriptor: SourceDescriptor,
}

impl FromStr for SourceSpec {
    type Err = LayerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (name, rest) = trimmed
            .split_once('=')
            .ok_or_else(|| LayerError::InvalidDescriptor(value.to_string()))?;
        let (kind, descriptor) = rest
            .split_once(':')
            .ok_or_else(|| LayerError::InvalidDescriptor(value.to_string()))?;
        Ok(SourceSpec {
            name: name.parse()?,
            kind: kind.parse()?,
            descriptor: descriptor.parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_descriptor_url() {
        let desc: SourceDescriptor = "https://api.census.gov/data".parse().unwrap();
        assert!(desc.is_url());
    }

    #[test]
    fn parse_descriptor_file() {
        let desc: SourceDescriptor = "file:data/bikes.json".parse().unwrap();
        assert_eq!(
            desc,
            SourceDescriptor::File(Utf8PathBuf::from("data/bikes.json"))
        );
        let bare: SourceDescriptor = "data/bikes.json".parse().unwrap();
        assert_eq!(bare, desc);
    }

    #[test]
    fn parse_source_name_invalid() {
        let err = "tracts 2023".parse::<SourceName>().unwrap_err();
        assert_matches!(err, LayerError::InvalidSourceName(_));
    }

    #[test]
    fn parse_source_spec() {
        let spec: SourceSpec = "tracts=regions:https://tigerweb.geo.census.gov/8/query"
            .parse()
            .unwrap();
        assert_eq!(spec.name.as_str(), "tracts");
        assert_eq!(spec.kind, DatasetKind::Regions);
        assert!(spec.descriptor.is_url());
    }
}
