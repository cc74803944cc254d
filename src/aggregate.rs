use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::dataset::{
    DemographicTable, PointCollection, RegionCollection, RegionFeature, RegionGeometry,
};
use crate::domain::RegionKind;
use crate::error::LayerError;

pub const SQ_METERS_PER_SQ_MILE: f64 = 2_589_988.0;

pub mod fields {
    pub const TOTAL_POPULATION: &str = "B01003_001E";
    pub const MALE: &str = "B01001_002E";
    pub const FEMALE: &str = "B01001_026E";
    pub const WHITE: &str = "B02001_002E";
    pub const AFRICAN_AMERICAN: &str = "B02001_003E";
    pub const NATIVE_AMERICAN: &str = "B02001_004E";
    pub const ASIAN: &str = "B02001_005E";
    pub const PACIFIC_ISLANDER: &str = "B02001_006E";
    pub const OTHER_RACE: &str = "B02001_007E";
    pub const TWO_OR_MORE_RACES: &str = "B02001_008E";
    pub const MEDIAN_INCOME: &str = "B06011_001E";
    pub const MEDIAN_AGE: &str = "B01002_001E";
}

pub fn parse_numeric(raw: Option<&str>) -> f64 {
    raw.and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
}

// ACS annotation sentinels (-222222222 through -999999999) mark suppressed
// estimates. Other negative values pass through.
const ACS_SENTINEL_CEILING: f64 = -222_222_222.0;

fn estimate(table: &DemographicTable, region_id: &str, field: &str) -> f64 {
    let value = parse_numeric(table.field(region_id, field));
    if value <= ACS_SENTINEL_CEILING { 0.0 } else { value }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn population_density(area_sq_meters: &str, population: f64) -> f64 {
    let area = parse_numeric(Some(area_sq_meters));
    if area <= 0.0 {
        return 0.0;
    }
    round2(population / (area / SQ_METERS_PER_SQ_MILE))
}

pub fn percentage(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        return 0.0;
    }
    let value = (numerator / denominator * 10_000.0).round() / 100.0;
    if value.is_finite() { value } else { 0.0 }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PercentageMetric {
    pub name: String,
    pub numerator: String,
    pub denominator: String,
}

impl PercentageMetric {
    pub fn new(name: &str, numerator: &str, denominator: &str) -> Self {
        Self {
            name: name.to_string(),
            numerator: numerator.to_string(),
            denominator: denominator.to_string(),
        }
    }
}

pub fn default_percentages() -> Vec<PercentageMetric> {
    [
        ("PCT_MALE", fields::MALE),
        ("PCT_FEMALE", fields::FEMALE),
        ("PCT_WHITE", fields::WHITE),
        ("PCT_AFRICAN_AMERICAN", fields::AFRICAN_AMERICAN),
        ("PCT_ASIAN", fields::ASIAN),
        ("PCT_TWO_OR_MORE", fields::TWO_OR_MORE_RACES),
    ]
    .into_iter()
    .map(|(name, field)| PercentageMetric::new(name, field, fields::TOTAL_POPULATION))
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationConfig {
    pub percentages: Vec<PercentageMetric>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            percentages: default_percentages(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionAttributes {
    #[serde(rename = "GEOID")]
    pub geoid: String,
    #[serde(rename = "NAME", default)]
    pub name: String,
    #[serde(rename = "TRACT", default, skip_serializing_if = "Option::is_none")]
    pub tract: Option<String>,
    #[serde(rename = "COUNTY", default, skip_serializing_if = "Option::is_none")]
    pub county: Option<String>,
    #[serde(rename = "AREALAND", default)]
    pub area_land: String,
    #[serde(rename = "POPL")]
    pub population: f64,
    #[serde(rename = "POPLSQMI")]
    pub density: f64,
    #[serde(rename = "MALE")]
    pub male: f64,
    #[serde(rename = "FEMALE")]
    pub female: f64,
    #[serde(rename = "WHITE")]
    pub white: f64,
    #[serde(rename = "AFRICAN_AMERICAN")]
    pub african_american: f64,
    #[serde(rename = "NATIVE_AMERICAN")]
    pub native_american: f64,
    #[serde(rename = "ASIAN")]
    pub asian: f64,
    #[serde(rename = "PACIFIC_ISLANDER")]
    pub pacific_islander: f64,
    #[serde(rename = "OTHER_RACE")]
    pub other_race: f64,
    #[serde(rename = "TWO_OR_MORE_RACES")]
    pub two_or_more_races: f64,
    #[serde(rename = "MEDIAN_INCOME")]
    pub median_income: f64,
    #[serde(rename = "MEDIAN_AGE")]
    pub median_age: f64,
    #[serde(rename = "PERCENTAGES", default)]
    pub percentages: BTreeMap<String, f64>,
    #[serde(rename = "STOPS", default)]
    pub point_counts: BTreeMap<String, usize>,
    #[serde(rename = "STOPS_BY_TYPE", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub category_counts: BTreeMap<String, BTreeMap<String, usize>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRegion {
    pub geometry: RegionGeometry,
    pub attributes: RegionAttributes,
}

struct PointTally<'a> {
    totals: HashMap<&'a str, usize>,
    categories: HashMap<&'a str, BTreeMap<String, usize>>,
}

impl<'a> PointTally<'a> {
    fn count(points: &'a PointCollection) -> Self {
        let mut totals = HashMap::new();
        let mut categories: HashMap<&str, BTreeMap<String, usize>> = HashMap::new();
        for point in &points.points {
            let Some(region) = point.region() else {
                continue;
            };
            *totals.entry(region).or_insert(0) += 1;
            if let Some(category) = &point.category {
                *categories
                    .entry(region)
                    .or_default()
                    .entry(category.clone())
                    .or_insert(0) += 1;
            }
        }
        Self { totals, categories }
    }
}

pub fn build_aggregated_regions(
    regions: &RegionCollection,
    points: &[(&str, &PointCollection)],
    table: &DemographicTable,
    kind: RegionKind,
    config: &AggregationConfig,
) -> Result<Vec<AggregatedRegion>, LayerError> {
    let mut seen = HashSet::with_capacity(regions.features.len());
    for region in &regions.features {
        if !seen.insert(region.id.as_str()) {
            return Err(LayerError::DuplicateRegion(region.id.clone()));
        }
    }

    let tallies: Vec<(&str, PointTally)> = points
        .iter()
        .map(|(name, collection)| (*name, PointTally::count(collection)))
        .collect();

    Ok(regions
        .features
        .iter()
        .map(|region| aggregate_region(region, &tallies, table, kind, config))
        .collect())
}

fn aggregate_region(
    region: &RegionFeature,
    tallies: &[(&str, PointTally)],
    table: &DemographicTable,
    kind: RegionKind,
    config: &AggregationConfig,
) -> AggregatedRegion {
    let id = region.id.as_str();
    let field = |code: &str| estimate(table, id, code);
    let area_land = region.area_land().unwrap_or_default();
    let population = field(fields::TOTAL_POPULATION);

    let percentages = config
        .percentages
        .iter()
        .map(|metric| {
            (
                metric.name.clone(),
                percentage(field(&metric.numerator), field(&metric.denominator)),
            )
        })
        .collect();

    let mut point_counts = BTreeMap::new();
    let mut category_counts = BTreeMap::new();
    for (name, tally) in tallies {
        point_counts.insert(name.to_string(), tally.totals.get(id).copied().unwrap_or(0));
        if let Some(categories) = tally.categories.get(id) {
            category_counts.insert(name.to_string(), categories.clone());
        }
    }

    let (tract, county) = match kind {
        RegionKind::Tract => (region.tract(), region.attribute("COUNTY")),
        RegionKind::County => (None, region.attribute("COUNTY")),
    };

    AggregatedRegion {
        geometry: region.geometry.clone(),
        attributes: RegionAttributes {
            geoid: region.id.clone(),
            name: region.name().unwrap_or_default(),
            tract,
            county,
            density: population_density(&area_land, population),
            area_land,
            population,
            male: field(fields::MALE),
            female: field(fields::FEMALE),
            white: field(fields::WHITE),
            african_american: field(fields::AFRICAN_AMERICAN),
            native_american: field(fields::NATIVE_AMERICAN),
            asian: field(fields::ASIAN),
            pacific_islander: field(fields::PACIFIC_ISLANDER),
            other_race: field(fields::OTHER_RACE),
            two_or_more_races: field(fields::TWO_OR_MORE_RACES),
            median_income: field(fields::MEDIAN_INCOME),
            median_age: field(fields::MEDIAN_AGE),
            percentages,
            point_counts,
            category_counts,
        },
    }
}
