use std::fs;

use assert_matches::assert_matches;

use metro_layers::config::ConfigLoader;
use metro_layers::domain::{DatasetKind, RegionKind, SourceDescriptor};
use metro_layers::error::LayerError;

#[test]
fn parse_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metro-layers.json");
    fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "sources": [
                "tracts=regions:https://tigerweb.geo.census.gov/arcgis/rest/services/TIGERweb/tigerWMS_ACS2023/MapServer/8",
                "counties=regions:https://tigerweb.geo.census.gov/arcgis/rest/services/TIGERweb/tigerWMS_ACS2023/MapServer/82",
                {"name": "stops", "kind": "points", "path": "data/stops.json"},
                {"name": "acs_mo", "kind": "demographics", "url": "https://api.census.gov/data/2023/acs/acs5"}
            ],
            "retry": {"attempts": 5},
            "layers": [
                {"name": "tracts", "kind": "tract", "regions": "tracts", "points": ["stops"], "demographics": ["acs_mo"]},
                {"name": "counties", "kind": "county", "regions": "counties", "points": ["stops"]}
            ],
            "percentages": [{"name": "PCT_MALE", "numerator": "B01001_002E", "denominator": "B01003_001E"}],
            "snapshot": "cache/layers.json"
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.sources.len(), 4);
    assert_eq!(resolved.retry.attempts, 5);
    assert_eq!(resolved.retry.backoff.as_millis(), 2000);
    assert_eq!(resolved.layers.len(), 2);
    assert_eq!(resolved.layer("counties").unwrap().kind, RegionKind::County);
    assert!(resolved.layer("counties").unwrap().demographics.is_empty());
    assert_eq!(resolved.aggregation.percentages.len(), 1);
    assert_eq!(resolved.snapshot.as_deref().map(|p| p.as_str()), Some("cache/layers.json"));

    let stops = resolved.source(&"stops".parse().unwrap()).unwrap();
    assert_eq!(stops.kind, DatasetKind::Points);
    assert_matches!(stops.descriptor, SourceDescriptor::File(_));
}

#[test]
fn unknown_layer_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metro-layers.json");
    fs::write(
        &path,
        r#"{"sources": ["tracts=regions:tracts.json"],
            "layers": [{"name": "tracts", "regions": "tracts", "points": ["stops"]}]}"#,
    )
    .unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(LayerError::MissingSource(_))
    );
}

#[test]
fn malformed_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metro-layers.json");
    fs::write(&path, "{\"sources\": 3}").unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(LayerError::ConfigParse(_))
    );
    assert_matches!(
        ConfigLoader::resolve(dir.path().join("missing.json").to_str()),
        Err(LayerError::ConfigRead(_))
    );
}
