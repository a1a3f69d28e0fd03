use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::domain::{GroupKey, Stage};
use crate::error::HarvestError;
use crate::stage_log::{StageLog, StageLogEntry};

/// One converted artifact contributing to a group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct GroupMember {
    pub item_key: String,
    pub artifact: Utf8PathBuf,
}

/// Fan-in view over the current Transform success set. Always rebuilt from the log.
#[derive(Debug, Clone, Default)]
pub struct GroupIndex {
    groups: BTreeMap<GroupKey, Vec<GroupMember>>,
}

impl GroupIndex {
    /// Lower-cased base name of the artifact with directory and extension stripped.
    pub fn group_key_of(artifact: &Utf8Path) -> Result<GroupKey, HarvestError> {
        GroupKey::of_artifact(artifact.as_std_path())
    }

    pub fn from_log(log: &StageLog) -> Result<Self, HarvestError> {
        Ok(Self::from_entries(&log.successes(Stage::Transform)?))
    }

    pub fn from_entries(entries: &[StageLogEntry]) -> Self {
        let mut groups: BTreeMap<GroupKey, Vec<GroupMember>> = BTreeMap::new();
        for entry in entries {
            let Some(artifact) = entry.artifact_path.as_ref() else {
                tracing::warn!(item = %entry.item_key, "transform success without artifact path");
                continue;
            };
            match Self::group_key_of(artifact) {
                Ok(key) => groups.entry(key).or_default().push(GroupMember {
                    item_key: entry.item_key.clone(),
                    artifact: artifact.clone(),
                }),
                Err(err) => {
                    tracing::warn!(item = %entry.item_key, error = %err, "artifact has no group key");
                }
            }
        }
        for members in groups.values_mut() {
            members.sort();
        }
        Self { groups }
    }

    /// Artifact paths of the group, ordered by member key.
    pub fn group_members(&self, key: &GroupKey) -> Vec<Utf8PathBuf> {
        self.groups
            .get(key)
            .map(|members| members.iter().map(|member| member.artifact.clone()).collect())
            .unwrap_or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &GroupKey> {
        self.groups.keys()
    }

    pub fn member_count(&self, key: &GroupKey) -> u64 {
        self.groups.get(key).map_or(0, |members| members.len() as u64)
    }

    pub fn counts(&self) -> Vec<(GroupKey, u64)> {
        self.groups
            .iter()
            .map(|(key, members)| (key.clone(), members.len() as u64))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Refreshes the cached reporting table from this view.
    pub fn materialize(&self, log: &StageLog) -> Result<(), HarvestError> {
        log.materialize_groups(&self.counts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage_log::OutcomeRecord;

    fn transform_success(log: &StageLog, key: &str, artifact: &str) {
        log.record_outcome(
            &OutcomeRecord::success(Stage::Transform, key).with_artifact(Utf8PathBuf::from(artifact)),
        )
        .unwrap();
    }

    #[test]
    fn buckets_by_case_folded_stem() {
        let log = StageLog::in_memory().unwrap();
        transform_success(&log, "P2::S_Fld_Haz_Ar.shp", "/c/P2/S_Fld_Haz_Ar.gpkg");
        transform_success(&log, "P1::s_fld_haz_ar.shp", "/c/P1/s_fld_haz_ar.gpkg");
        transform_success(&log, "P1::S_Wtr_Ln.shp", "/c/P1/S_Wtr_Ln.gpkg");

        let index = GroupIndex::from_log(&log).unwrap();
        let hazard: GroupKey = "s_fld_haz_ar".parse().unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(index.member_count(&hazard), 2);
        assert_eq!(
            index.group_members(&hazard),
            vec![
                Utf8PathBuf::from("/c/P1/s_fld_haz_ar.gpkg"),
                Utf8PathBuf::from("/c/P2/S_Fld_Haz_Ar.gpkg"),
            ]
        );
    }

    #[test]
    fn reflects_partial_transform_set() {
        let log = StageLog::in_memory().unwrap();
        assert!(GroupIndex::from_log(&log).unwrap().is_empty());

        transform_success(&log, "P1::a.shp", "/c/P1/a.gpkg");
        let index = GroupIndex::from_log(&log).unwrap();
        index.materialize(&log).unwrap();

        let counts = log.group_counts().unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].group_key.as_str(), "a");
        assert_eq!(counts[0].member_count, 1);
    }
}
