use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{DatasetKind, SourceName};
use crate::error::LayerError;
use crate::geometry::GeographicPoint;

static SUMMARY_LEVEL_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{7}US").expect("valid summary level regex"));

const REGION_ID_FIELDS: [&str; 2] = ["GEOID", "GEO_ID"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Number(f64),
    Text(String),
}

impl AttributeValue {
    pub fn as_text(&self) -> String {
        match self {
            AttributeValue::Number(value) => value.to_string(),
            AttributeValue::Text(value) => value.clone(),
        }
    }

    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(AttributeValue::Text(text.clone())),
            Value::Number(number) => number.as_f64().map(AttributeValue::Number),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionGeometry {
    #[serde(default)]
    pub rings: Vec<Vec<Vec<f64>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionFeature {
    pub id: String,
    pub geometry: RegionGeometry,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl RegionFeature {
    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes.get(key).map(AttributeValue::as_text)
    }

    pub fn name(&self) -> Option<String> {
        self.attribute("NAME").or_else(|| self.attribute("BASENAME"))
    }

    pub fn tract(&self) -> Option<String> {
        self.attribute("TRACT")
    }

    pub fn area_land(&self) -> Option<String> {
        self.attribute("AREALAND")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionCollection {
    pub features: Vec<RegionFeature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointFeature {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "typ", default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(rename = "yx")]
    pub location: GeographicPoint,
    #[serde(rename = "tractGeoid", default, skip_serializing_if = "Option::is_none")]
    region: Option<String>,
}

impl PointFeature {
    pub fn new(id: impl Into<String>, location: GeographicPoint) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            category: None,
            location,
            region: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Records the resolved region. Only the first assignment sticks.
    pub fn assign_region(&mut self, region: impl Into<String>) -> bool {
        if self.region.is_some() {
            return false;
        }
        self.region = Some(region.into());
        true
    }

    pub fn clear_region(&mut self) {
        self.region = None;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCollection {
    pub points: Vec<PointFeature>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DemographicTable {
    records: BTreeMap<String, BTreeMap<String, String>>,
}

impl DemographicTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, region_id: impl Into<String>, fields: BTreeMap<String, String>) {
        self.records.insert(region_id.into(), fields);
    }

    pub fn get(&self, region_id: &str) -> Option<&BTreeMap<String, String>> {
        self.records.get(region_id)
    }

    pub fn field(&self, region_id: &str, field: &str) -> Option<&str> {
        self.records
            .get(region_id)
            .and_then(|fields| fields.get(field))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn merge(&mut self, other: DemographicTable) {
        self.records.extend(other.records);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum TypedDataset {
    Regions(RegionCollection),
    Points(PointCollection),
    Demographics(DemographicTable),
}

impl TypedDataset {
    pub fn kind(&self) -> DatasetKind {
        match self {
            TypedDataset::Regions(_) => DatasetKind::Regions,
            TypedDataset::Points(_) => DatasetKind::Points,
            TypedDataset::Demographics(_) => DatasetKind::Demographics,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TypedDataset::Regions(regions) => regions.features.len(),
            TypedDataset::Points(points) => points.points.len(),
            TypedDataset::Demographics(table) => table.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn decode_dataset(
    name: &SourceName,
    kind: DatasetKind,
    bytes: &[u8],
) -> Result<TypedDataset, LayerError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|err| decode_error(name, err))?;
    match kind {
        DatasetKind::Regions => decode_regions(name, value).map(TypedDataset::Regions),
        DatasetKind::Points => decode_points(name, value).map(TypedDataset::Points),
        DatasetKind::Demographics => {
            decode_demographics(name, value).map(TypedDataset::Demographics)
        }
    }
}

#[derive(Deserialize)]
struct RawFeatureSet {
    #[serde(default)]
    features: Vec<RawRegionFeature>,
}

#[derive(Deserialize)]
struct RawRegionFeature {
    #[serde(default)]
    attributes: BTreeMap<String, Value>,
    #[serde(default)]
    geometry: Option<RegionGeometry>,
}

fn decode_regions(name: &SourceName, value: Value) -> Result<RegionCollection, LayerError> {
    if let Some(error) = value.get("error") {
        return Err(decode_error(name, format!("feature service error: {error}")));
    }
    let raw: RawFeatureSet = serde_json::from_value(value).map_err(|err| decode_error(name, err))?;

    let mut seen = HashSet::with_capacity(raw.features.len());
    let mut features = Vec::with_capacity(raw.features.len());
    for (position, feature) in raw.features.into_iter().enumerate() {
        let id = REGION_ID_FIELDS
            .iter()
            .find_map(|key| feature.attributes.get(*key).and_then(AttributeValue::from_json))
            .map(|value| value.as_text())
            .ok_or_else(|| decode_error(name, format!("feature {position} has no GEOID")))?;
        if !seen.insert(id.clone()) {
            return Err(decode_error(name, LayerError::DuplicateRegion(id)));
        }
        let attributes = feature
            .attributes
            .iter()
            .filter_map(|(key, value)| {
                AttributeValue::from_json(value).map(|value| (key.clone(), value))
            })
            .collect();
        features.push(RegionFeature {
            id,
            geometry: feature.geometry.unwrap_or_default(),
            attributes,
        });
    }
    Ok(RegionCollection { features })
}

#[derive(Deserialize)]
struct RawStops {
    #[serde(default, alias = "points")]
    stops: Vec<RawStop>,
}

#[derive(Deserialize)]
struct RawStop {
    id: Value,
    #[serde(default)]
    name: String,
    #[serde(default)]
    typ: Option<String>,
    yx: GeographicPoint,
}

fn decode_points(name: &SourceName, value: Value) -> Result<PointCollection, LayerError> {
    let raw: RawStops = serde_json::from_value(value).map_err(|err| decode_error(name, err))?;
    let points = raw
        .stops
        .into_iter()
        .map(|stop| {
            let id = match AttributeValue::from_json(&stop.id) {
                Some(value) => value.as_text(),
                None => return Err(decode_error(name, "stop id must be a string or number")),
            };
            Ok(PointFeature {
                id,
                name: stop.name,
                category: stop.typ,
                location: stop.yx,
                region: None,
            })
        })
        .collect::<Result<Vec<_>, LayerError>>()?;
    Ok(PointCollection { points })
}

fn decode_demographics(name: &SourceName, value: Value) -> Result<DemographicTable, LayerError> {
    match value {
        Value::Array(_) => {
            let rows: Vec<Vec<Option<String>>> =
                serde_json::from_value(value).map_err(|err| decode_error(name, err))?;
            table_from_rows(name, rows)
        }
        Value::Object(_) => {
            let records: BTreeMap<String, BTreeMap<String, Value>> =
                serde_json::from_value(value).map_err(|err| decode_error(name, err))?;
            let mut table = DemographicTable::new();
            for (region_id, fields) in records {
                let fields = fields
                    .iter()
                    .filter_map(|(key, value)| {
                        AttributeValue::from_json(value).map(|value| (key.clone(), value.as_text()))
                    })
                    .collect();
                table.insert(normalize_region_id(&region_id), fields);
            }
            Ok(table)
        }
        other => Err(decode_error(
            name,
            format!("expected array or object, found {other}"),
        )),
    }
}

fn table_from_rows(
    name: &SourceName,
    rows: Vec<Vec<Option<String>>>,
) -> Result<DemographicTable, LayerError> {
    let mut rows = rows.into_iter();
    let Some(header) = rows.next() else {
        tracing::warn!(source = %name, "demographic source returned no rows");
        return Ok(DemographicTable::new());
    };
    let header: Vec<String> = header.into_iter().map(Option::unwrap_or_default).collect();
    let id_column = header
        .iter()
        .position(|column| REGION_ID_FIELDS.iter().any(|key| column == key))
        .ok_or_else(|| decode_error(name, "table has no GEO_ID column"))?;

    let mut table = DemographicTable::new();
    for row in rows {
        let Some(Some(raw_id)) = row.get(id_column) else {
            continue;
        };
        let region_id = normalize_region_id(raw_id);
        let fields = header
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let cell = row.get(i).cloned().flatten().unwrap_or_default();
                (column.clone(), cell)
            })
            .collect();
        table.insert(region_id, fields);
    }
    Ok(table)
}

pub fn normalize_region_id(raw: &str) -> String {
    SUMMARY_LEVEL_PREFIX.replace(raw.trim(), "").into_owned()
}

fn decode_error(name: &SourceName, err: impl ToString) -> LayerError {
    LayerError::DecodeFailure {
        source_name: name.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn name(value: &str) -> SourceName {
        value.parse().unwrap()
    }

    #[test]
    fn decode_tiger_features() {
        let body = br#"{"features":[
            {"attributes":{"GEOID":"29510101100","TRACT":"101100","AREALAND":"2589988","OBJECTID":7,"LSADC":null},
             "geometry":{"rings":[[[0,0],[0,1],[1,1],[1,0],[0,0]]]}}
        ]}"#;
        let dataset = decode_dataset(&name("tracts"), DatasetKind::Regions, body).unwrap();
        let TypedDataset::Regions(regions) = dataset else {
            panic!("expected regions");
        };
        let feature = &regions.features[0];
        assert_eq!(feature.id, "29510101100");
        assert_eq!(feature.tract().as_deref(), Some("101100"));
        assert_eq!(feature.area_land().as_deref(), Some("2589988"));
        assert_eq!(feature.attribute("OBJECTID").as_deref(), Some("7"));
        assert!(!feature.attributes.contains_key("LSADC"));
        assert_eq!(feature.geometry.rings[0].len(), 5);
    }

    #[test]
    fn duplicate_region_id_is_rejected() {
        let body = br#"{"features":[
            {"attributes":{"GEOID":"1"},"geometry":{"rings":[]}},
            {"attributes":{"GEOID":"1"},"geometry":{"rings":[]}}
        ]}"#;
        let err = decode_dataset(&name("tracts"), DatasetKind::Regions, body).unwrap_err();
        assert_matches!(err, LayerError::DecodeFailure { .. });
    }

    #[test]
    fn service_error_is_decode_failure() {
        let body = br#"{"error":{"code":400,"message":"Invalid query"}}"#;
        let err = decode_dataset(&name("counties"), DatasetKind::Regions, body).unwrap_err();
        assert_matches!(err, LayerError::DecodeFailure { source_name, .. } if source_name == "counties");
    }

    #[test]
    fn decode_stops() {
        let body = br#"{"stops":[
            {"id":"14125","name":"Grand MetroLink","typ":"mlc","yx":{"latitude":38.63,"longitude":-90.23}},
            {"id":42,"name":"Bus","yx":{"latitude":38.6,"longitude":-90.2}}
        ]}"#;
        let dataset = decode_dataset(&name("stops"), DatasetKind::Points, body).unwrap();
        let TypedDataset::Points(points) = dataset else {
            panic!("expected points");
        };
        assert_eq!(points.points.len(), 2);
        assert_eq!(points.points[0].category.as_deref(), Some("mlc"));
        assert_eq!(points.points[0].location.lon(), -90.23);
        assert_eq!(points.points[1].id, "42");
        assert!(points.points[1].region().is_none());
    }

    #[test]
    fn decode_acs_rows() {
        let body = br#"[
            ["B01003_001E","B01001_002E","GEO_ID"],
            ["2500","1200","1400000US29510101100"],
            ["-666666666",null,"1400000US29510101200"],
            ["10"]
        ]"#;
        let dataset = decode_dataset(&name("acs"), DatasetKind::Demographics, body).unwrap();
        let TypedDataset::Demographics(table) = dataset else {
            panic!("expected demographics");
        };
        assert_eq!(table.len(), 2);
        assert_eq!(table.field("29510101100", "B01003_001E"), Some("2500"));
        assert_eq!(table.field("29510101200", "B01001_002E"), Some(""));
    }

    #[test]
    fn acs_without_geo_id_fails() {
        let body = br#"[["B01003_001E"],["2500"]]"#;
        let err = decode_dataset(&name("acs"), DatasetKind::Demographics, body).unwrap_err();
        assert_matches!(err, LayerError::DecodeFailure { .. });
    }

    #[test]
    fn malformed_json_fails() {
        let err = decode_dataset(&name("acs"), DatasetKind::Demographics, b"[[").unwrap_err();
        assert_matches!(err, LayerError::DecodeFailure { .. });
    }

    #[test]
    fn point_region_assigned_once() {
        let mut point = PointFeature::new("a", GeographicPoint::new(0.0, 0.0));
        assert!(point.assign_region("1"));
        assert!(!point.assign_region("2"));
        assert_eq!(point.region(), Some("1"));
    }

    #[test]
    fn merge_replaces_rows() {
        let mut left = DemographicTable::new();
        left.insert("1", BTreeMap::from([("POP".to_string(), "1".to_string())]));
        let mut right = DemographicTable::new();
        right.insert("1", BTreeMap::from([("POP".to_string(), "2".to_string())]));
        right.insert("2", BTreeMap::new());
        left.merge(right);
        assert_eq!(left.len(), 2);
        assert_eq!(left.field("1", "POP"), Some("2"));
    }

    #[test]
    fn normalize_strips_summary_level() {
        assert_eq!(normalize_region_id("0500000US29510"), "29510");
        assert_eq!(normalize_region_id("29510"), "29510");
    }
}
