mod common;

use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use geo_harvest::domain::GroupKey;
use geo_harvest::error::HarvestError;
use geo_harvest::merge::MergeEngine;
use geo_harvest::store::{FsRelocator, Store};
use geo_harvest::tool::Ogr2Ogr;

use common::{MockTool, RejectingRelocator, test_config, utf8_root};

fn members(root: &Utf8PathBuf, names: &[&str]) -> Vec<Utf8PathBuf> {
    names
        .iter()
        .map(|name| {
            let path = root.join("converted").join(name).join("g.gpkg");
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, name.as_bytes()).unwrap();
            path
        })
        .collect()
}

#[test]
fn seeds_first_member_and_appends_the_rest_in_order() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8_root(&temp);
    let config = test_config(&root);
    let store = Store::new(&config);
    let tool = Ogr2Ogr::new(MockTool::default(), config.tool.clone(), store.tool_temp_dir()).unwrap();
    let sources = members(&root, &["alpha", "bravo", "charlie"]);
    let group: GroupKey = "g".parse().unwrap();

    let receipt = MergeEngine::new(&tool, &store, &FsRelocator)
        .merge_group(&group, &sources)
        .unwrap();

    assert_eq!(receipt.source_count, 3);
    assert_eq!(receipt.artifact, store.merge_path(&group));
    let lines = fs::read_to_string(&receipt.artifact)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let expected = sources.iter().map(ToString::to_string).collect::<Vec<_>>();
    assert_eq!(lines, expected);
    assert_eq!(receipt.bytes, fs::metadata(&receipt.artifact).unwrap().len());
    assert_eq!(tool.runner().invocations("ogrinfo"), 3);
    assert_eq!(tool.runner().appends(), 2);
}

#[test]
fn append_selects_normalised_fields() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8_root(&temp);
    let config = test_config(&root);
    let store = Store::new(&config);
    let tool = Ogr2Ogr::new(MockTool::default(), config.tool.clone(), store.tool_temp_dir()).unwrap();
    let sources = members(&root, &["alpha", "bravo"]);

    MergeEngine::new(&tool, &store, &FsRelocator)
        .merge_group(&"g".parse().unwrap(), &sources)
        .unwrap();

    let calls = tool.runner().calls.lock().unwrap();
    let (_, append) = calls
        .iter()
        .find(|(_, args)| args.iter().any(|arg| arg == "-append"))
        .unwrap();
    let sql = append
        .iter()
        .find(|arg| arg.starts_with("SELECT "))
        .unwrap();
    assert!(sql.contains("\"FLD_ZONE\" AS \"fld_zone\""));
    assert!(append.iter().any(|arg| arg == "-addfields"));
}

#[test]
fn member_failure_publishes_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8_root(&temp);
    let config = test_config(&root);
    let store = Store::new(&config);
    let tool = Ogr2Ogr::new(
        MockTool::failing_on(&["/bravo/"]),
        config.tool.clone(),
        store.tool_temp_dir(),
    )
    .unwrap();
    let sources = members(&root, &["alpha", "bravo", "charlie"]);
    let group: GroupKey = "g".parse().unwrap();

    let err = MergeEngine::new(&tool, &store, &FsRelocator)
        .merge_group(&group, &sources)
        .unwrap_err();

    assert_matches!(err, HarvestError::ToolFailed { .. });
    assert!(!store.merge_path(&group).exists());
    assert_eq!(fs::read_dir(store.merge_scratch_dir()).unwrap().count(), 0);
}

#[test]
fn relocation_failure_publishes_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8_root(&temp);
    let config = test_config(&root);
    let store = Store::new(&config);
    let tool = Ogr2Ogr::new(MockTool::default(), config.tool.clone(), store.tool_temp_dir()).unwrap();
    let sources = members(&root, &["alpha", "bravo"]);
    let group: GroupKey = "g".parse().unwrap();

    let err = MergeEngine::new(&tool, &store, &RejectingRelocator)
        .merge_group(&group, &sources)
        .unwrap_err();

    assert_matches!(err, HarvestError::Relocation { .. });
    assert!(!store.merge_path(&group).exists());
    assert_eq!(fs::read_dir(store.merge_scratch_dir()).unwrap().count(), 0);
}

#[test]
fn empty_group_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let config = test_config(&utf8_root(&temp));
    let store = Store::new(&config);
    let tool = Ogr2Ogr::new(MockTool::default(), config.tool.clone(), store.tool_temp_dir()).unwrap();

    let err = MergeEngine::new(&tool, &store, &FsRelocator)
        .merge_group(&"g".parse().unwrap(), &[])
        .unwrap_err();

    assert_matches!(err, HarvestError::InvalidGroup(_));
    assert_eq!(tool.runner().calls.lock().unwrap().len(), 0);
}
