use std::thread;

use camino::Utf8Path;

use geo_harvest::domain::{GroupKey, Outcome, Stage};
use geo_harvest::error::HarvestError;
use geo_harvest::stage_log::{OutcomeRecord, StageLog};

#[test]
fn outcomes_survive_reopen() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("stage-log.sqlite3");

    {
        let log = StageLog::open(&path).unwrap();
        log.record_outcome(&OutcomeRecord::success(Stage::Fetch, "P1")).unwrap();
        let err = HarvestError::TransportHttp("timed out".to_string());
        log.record_outcome(&OutcomeRecord::failure(Stage::Fetch, "P2", &err))
            .unwrap();
    }

    let log = StageLog::open(&path).unwrap();
    let done = log.completed_keys(Stage::Fetch).unwrap();
    assert_eq!(done.into_iter().collect::<Vec<_>>(), vec!["P1"]);
    let failures = log.failures(Some(Stage::Fetch), 10).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].item_key, "P2");
}

#[test]
fn concurrent_writers_lose_no_rows() {
    let log = StageLog::in_memory().unwrap();
    let handles = (0..8)
        .map(|worker| {
            let log = log.clone();
            thread::spawn(move || {
                for idx in 0..25 {
                    let key = format!("P{worker}-{idx}");
                    log.record_outcome(&OutcomeRecord::success(Stage::Fetch, key))
                        .unwrap();
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(log.completed_keys(Stage::Fetch).unwrap().len(), 200);
}

#[test]
fn stages_are_independent() {
    let log = StageLog::in_memory().unwrap();
    log.record_outcome(&OutcomeRecord::success(Stage::Fetch, "P1")).unwrap();

    assert!(log.completed_keys(Stage::Unpack).unwrap().is_empty());
    assert_eq!(log.clear(Stage::Unpack).unwrap(), 0);
    assert_eq!(log.completed_keys(Stage::Fetch).unwrap().len(), 1);
}

#[test]
fn latest_success_wins_for_artifact_path() {
    let log = StageLog::in_memory().unwrap();
    log.record_outcome(
        &OutcomeRecord::success(Stage::Transform, "P1::a.shp").with_artifact("/old/a.gpkg".into()),
    )
    .unwrap();
    log.record_outcome(
        &OutcomeRecord::success(Stage::Transform, "P1::a.shp").with_artifact("/new/a.gpkg".into()),
    )
    .unwrap();

    let successes = log.successes(Stage::Transform).unwrap();
    assert_eq!(successes.len(), 1);
    assert_eq!(successes[0].artifact_path.as_deref(), Some(Utf8Path::new("/new/a.gpkg")));
    let history = log.history(Stage::Transform, "P1::a.shp").unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|entry| entry.outcome == Outcome::Success));
}

#[test]
fn batch_is_recorded_together() {
    let log = StageLog::in_memory().unwrap();
    let records = ["P1::a.shp", "P1::b.shp"]
        .into_iter()
        .map(|key| OutcomeRecord::success(Stage::Unpack, key))
        .collect::<Vec<_>>();
    log.record_batch(&records).unwrap();

    assert_eq!(log.completed_keys(Stage::Unpack).unwrap().len(), 2);
}

#[test]
fn failures_report_newest_first_and_respect_limit() {
    let log = StageLog::in_memory().unwrap();
    for key in ["P1", "P2", "P3"] {
        let err = HarvestError::Archive(format!("{key} is corrupt"));
        log.record_outcome(&OutcomeRecord::failure(Stage::Unpack, key, &err))
            .unwrap();
    }

    let failures = log.failures(None, 2).unwrap();
    let keys = failures.iter().map(|entry| entry.item_key.as_str()).collect::<Vec<_>>();
    assert_eq!(keys, vec!["P3", "P2"]);
}

#[test]
fn group_table_is_replaced_on_materialize() {
    let log = StageLog::in_memory().unwrap();
    let g: GroupKey = "g".parse().unwrap();
    let h: GroupKey = "h".parse().unwrap();
    log.materialize_groups(&[(g.clone(), 2), (h, 1)]).unwrap();
    log.materialize_groups(&[(g.clone(), 3)]).unwrap();

    let counts = log.group_counts().unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].group_key, g);
    assert_eq!(counts[0].member_count, 3);

    log.clear(Stage::Transform).unwrap();
    assert!(log.group_counts().unwrap().is_empty());
}

#[test]
fn member_success_clears_archive_level_unpack_failure() {
    let log = StageLog::in_memory().unwrap();
    let err = HarvestError::Archive("P1.zip contains no .shp members".to_string());
    log.record_outcome(&OutcomeRecord::failure(Stage::Unpack, "P1", &err))
        .unwrap();
    log.record_outcome(&OutcomeRecord::failure(Stage::Unpack, "P10", &err))
        .unwrap();
    assert_eq!(log.failures(Some(Stage::Unpack), 10).unwrap().len(), 2);

    log.record_batch(&[OutcomeRecord::success(Stage::Unpack, "P1::A/g.shp")])
        .unwrap();

    let failures = log.failures(Some(Stage::Unpack), 10).unwrap();
    let keys = failures.iter().map(|entry| entry.item_key.as_str()).collect::<Vec<_>>();
    assert_eq!(keys, vec!["P10"]);
}

#[test]
fn entries_serialize_with_timestamps() {
    let log = StageLog::in_memory().unwrap();
    log.record_outcome(&OutcomeRecord::success(Stage::Fetch, "P1")).unwrap();
    log.materialize_groups(&[("g".parse().unwrap(), 2)]).unwrap();

    let entry = serde_json::to_value(&log.successes(Stage::Fetch).unwrap()[0]).unwrap();
    assert!(entry["recorded_at"].is_string());
    assert_eq!(entry["item_key"], "P1");
    let group = serde_json::to_value(&log.group_counts().unwrap()[0]).unwrap();
    assert_eq!(group["member_count"], 2);
}
