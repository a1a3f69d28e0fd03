use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use geo_harvest::config::{ConfigLoader, ConfigOverrides};
use geo_harvest::error::HarvestError;

#[test]
fn explicit_missing_file_is_a_read_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");

    let err = ConfigLoader::resolve(path.to_str(), &ConfigOverrides::default()).unwrap_err();

    assert_matches!(err, HarvestError::ConfigRead(_));
}

#[test]
fn file_values_are_loaded_and_overridden() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let path = root.join("geo-harvest.json");
    let json = format!(
        r#"{{
            "paths": {{
                "download_root": "{root}/dl",
                "extract_root": "{root}/ex",
                "transform_root": "{root}/cv",
                "merge_root": "{root}/mg",
                "scratch_root": "{root}/scratch",
                "state_db": "{root}/log.sqlite3"
            }},
            "pipeline": {{ "workers": 8 }},
            "catalog": {{ "regions": ["FL", "GA"] }}
        }}"#
    );
    std::fs::write(&path, json).unwrap();
    let overrides = ConfigOverrides {
        workers: Some(2),
        scratch_root: Some(root.join("fast")),
        encoding: Some("LATIN1".to_string()),
        ..ConfigOverrides::default()
    };

    let config = ConfigLoader::resolve(Some(path.as_str()), &overrides).unwrap();

    assert_eq!(config.pipeline.workers, 2);
    assert_eq!(config.catalog.regions, vec!["FL", "GA"]);
    assert_eq!(config.paths.download_root, root.join("dl"));
    assert_eq!(config.paths.scratch_root, root.join("fast"));
    assert_eq!(config.tool.encoding, "LATIN1");
    assert_eq!(config.pipeline.member_extension, "shp");
}

#[test]
fn malformed_json_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("broken.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = ConfigLoader::resolve(path.to_str(), &ConfigOverrides::default()).unwrap_err();

    assert_matches!(err, HarvestError::ConfigParse(_));
}

#[test]
fn extract_root_equal_to_download_root_is_rejected() {
    let mut config = ConfigLoader::parse("{}").unwrap();
    config.paths.extract_root = config.paths.download_root.clone();

    let err = ConfigLoader::validate(&config).unwrap_err();

    assert_matches!(err, HarvestError::ConfigInvalid(_));
}
