use std::collections::{BTreeMap, BTreeSet};

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::domain::{GroupKey, LocalityKey, MemberKey, ProductName, Stage};
use crate::error::HarvestError;
use crate::grouping::GroupIndex;
use crate::stage_log::{DiscoveredProduct, StageLog};

/// A unit of work for one stage, carrying what its executor needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum WorkItem {
    Discover {
        locality: LocalityKey,
    },
    Fetch {
        product: ProductName,
        region: String,
        subregion: String,
        source_path: String,
        size_hint: Option<String>,
        /// Every region whose localities referenced this product.
        referenced_in: BTreeSet<String>,
    },
    Unpack {
        product: ProductName,
        archive: Utf8PathBuf,
        region: Option<String>,
    },
    Transform {
        member: MemberKey,
        source: Utf8PathBuf,
        region: Option<String>,
    },
    Merge {
        group: GroupKey,
        members: Vec<Utf8PathBuf>,
    },
}

impl WorkItem {
    pub fn stage(&self) -> Stage {
        match self {
            WorkItem::Discover { .. } => Stage::Discover,
            WorkItem::Fetch { .. } => Stage::Fetch,
            WorkItem::Unpack { .. } => Stage::Unpack,
            WorkItem::Transform { .. } => Stage::Transform,
            WorkItem::Merge { .. } => Stage::Merge,
        }
    }

    /// Natural key under which the outcome is logged.
    pub fn key(&self) -> String {
        match self {
            WorkItem::Discover { locality } => locality.to_string(),
            WorkItem::Fetch { product, .. } | WorkItem::Unpack { product, .. } => {
                product.to_string()
            }
            WorkItem::Transform { member, .. } => member.to_string(),
            WorkItem::Merge { group, .. } => group.to_string(),
        }
    }

    pub fn region(&self) -> Option<&str> {
        match self {
            WorkItem::Discover { locality } => Some(locality.region()),
            WorkItem::Fetch { region, .. } => Some(region),
            WorkItem::Unpack { region, .. } | WorkItem::Transform { region, .. } => {
                region.as_deref()
            }
            WorkItem::Merge { .. } => None,
        }
    }

    fn product(&self) -> Option<&ProductName> {
        match self {
            WorkItem::Fetch { product, .. } | WorkItem::Unpack { product, .. } => Some(product),
            WorkItem::Transform { member, .. } => Some(member.product()),
            WorkItem::Discover { .. } | WorkItem::Merge { .. } => None,
        }
    }
}

/// Selective re-run filter. An empty set means "no restriction" for that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Scope {
    pub regions: BTreeSet<String>,
    pub products: BTreeSet<String>,
    pub groups: BTreeSet<String>,
}

impl Scope {
    pub fn admits(&self, item: &WorkItem) -> bool {
        match item {
            WorkItem::Merge { group, .. } => {
                self.groups.is_empty() || self.groups.contains(group.as_str())
            }
            WorkItem::Discover { locality } => self.admits_region(Some(locality.region())),
            WorkItem::Fetch { referenced_in, .. } => {
                self.admits_product(item.product())
                    && (self.regions.is_empty()
                        || referenced_in.iter().any(|region| self.regions.contains(region)))
            }
            WorkItem::Unpack { .. } | WorkItem::Transform { .. } => {
                self.admits_product(item.product()) && self.admits_region(item.region())
            }
        }
    }

    fn admits_region(&self, region: Option<&str>) -> bool {
        self.regions.is_empty() || region.is_some_and(|region| self.regions.contains(region))
    }

    fn admits_product(&self, product: Option<&ProductName>) -> bool {
        self.products.is_empty()
            || product.is_some_and(|product| self.products.contains(product.as_str()))
    }
}

/// Candidate set for one stage plus the bookkeeping the run summary needs.
#[derive(Debug, Clone, Default)]
pub struct Enumeration {
    pub candidates: Vec<WorkItem>,
    /// In-scope upstream items that already carry a Success for this stage.
    pub already_done: usize,
    /// Merge groups whose recorded source count no longer matches the current membership.
    pub stale_groups: Vec<GroupKey>,
}

/// Diffs upstream completions against the stage's own completions.
pub struct Enumerator<'a> {
    log: &'a StageLog,
    /// Stages whose own completions are read as empty, as if already cleared.
    rebuilt: BTreeSet<Stage>,
}

impl<'a> Enumerator<'a> {
    pub fn new(log: &'a StageLog) -> Self {
        Self {
            log,
            rebuilt: BTreeSet::new(),
        }
    }

    /// Plans against the log a force-rebuild of `stages` would leave behind, without clearing it.
    pub fn assuming_cleared(mut self, stages: BTreeSet<Stage>) -> Self {
        self.rebuilt = stages;
        self
    }

    fn done_keys(&self, stage: Stage) -> Result<BTreeSet<String>, HarvestError> {
        if self.rebuilt.contains(&stage) {
            return Ok(BTreeSet::new());
        }
        self.log.completed_keys(stage)
    }

    /// Discovery candidates: catalog localities minus discovered localities.
    pub fn discover(
        &self,
        localities: &[LocalityKey],
        scope: &Scope,
    ) -> Result<Enumeration, HarvestError> {
        let upstream = localities
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|locality| WorkItem::Discover { locality });
        self.diff(Stage::Discover, upstream, scope)
    }

    /// Candidates for every stage fed by the stage log itself.
    pub fn candidates(&self, stage: Stage, scope: &Scope) -> Result<Enumeration, HarvestError> {
        match stage {
            Stage::Discover => Err(HarvestError::InvalidStage(
                "discover candidates come from the catalog".to_string(),
            )),
            Stage::Fetch => {
                let upstream = fetch_targets(self.log.discovered_products()?);
                self.diff(Stage::Fetch, upstream, scope)
            }
            Stage::Unpack => self.unpack_candidates(scope),
            Stage::Transform => self.transform_candidates(scope),
            Stage::Merge => self.merge_candidates(scope),
        }
    }

    fn diff(
        &self,
        stage: Stage,
        upstream: impl IntoIterator<Item = WorkItem>,
        scope: &Scope,
    ) -> Result<Enumeration, HarvestError> {
        let done = self.done_keys(stage)?;
        let mut enumeration = Enumeration::default();
        let mut seen = BTreeSet::new();
        for item in upstream {
            if !scope.admits(&item) {
                continue;
            }
            let key = item.key();
            if !seen.insert(key.clone()) {
                continue;
            }
            if done.contains(&key) {
                enumeration.already_done += 1;
            } else {
                enumeration.candidates.push(item);
            }
        }
        enumeration.candidates.sort_by_key(WorkItem::key);
        Ok(enumeration)
    }

    fn unpack_candidates(&self, scope: &Scope) -> Result<Enumeration, HarvestError> {
        // An archive is done once any of its members has an Unpack success.
        let unpacked = self
            .done_keys(Stage::Unpack)?
            .into_iter()
            .filter_map(|key| key.split_once("::").map(|(product, _)| product.to_string()))
            .collect::<BTreeSet<_>>();

        let mut enumeration = Enumeration::default();
        for entry in self.log.successes(Stage::Fetch)? {
            let Some(archive) = entry.artifact_path else {
                tracing::warn!(item = %entry.item_key, "fetch success without archive path");
                continue;
            };
            let item = WorkItem::Unpack {
                product: entry.item_key.parse()?,
                archive,
                region: entry.region,
            };
            if !scope.admits(&item) {
                continue;
            }
            if unpacked.contains(&entry.item_key) {
                enumeration.already_done += 1;
            } else {
                enumeration.candidates.push(item);
            }
        }
        enumeration.candidates.sort_by_key(WorkItem::key);
        Ok(enumeration)
    }

    fn transform_candidates(&self, scope: &Scope) -> Result<Enumeration, HarvestError> {
        let mut upstream = Vec::new();
        for entry in self.log.successes(Stage::Unpack)? {
            let Some(source) = entry.artifact_path else {
                tracing::warn!(item = %entry.item_key, "unpack success without member path");
                continue;
            };
            upstream.push(WorkItem::Transform {
                member: entry.item_key.parse()?,
                source,
                region: entry.region,
            });
        }
        self.diff(Stage::Transform, upstream, scope)
    }

    fn merge_candidates(&self, scope: &Scope) -> Result<Enumeration, HarvestError> {
        let index = GroupIndex::from_log(self.log)?;
        let upstream = index
            .keys()
            .map(|group| WorkItem::Merge {
                group: group.clone(),
                members: index.group_members(group),
            })
            .collect::<Vec<_>>();
        let mut enumeration = self.diff(Stage::Merge, upstream, scope)?;
        if self.rebuilt.contains(&Stage::Merge) {
            return Ok(enumeration);
        }

        for entry in self.log.successes(Stage::Merge)? {
            let Ok(group) = entry.item_key.parse::<GroupKey>() else {
                continue;
            };
            if !scope.groups.is_empty() && !scope.groups.contains(group.as_str()) {
                continue;
            }
            let current = index.member_count(&group);
            if entry.source_count.is_some_and(|recorded| recorded != current) {
                tracing::warn!(
                    group = %group,
                    recorded = entry.source_count.unwrap_or_default(),
                    current,
                    "merged group is stale; force-rebuild merge to refresh it"
                );
                enumeration.stale_groups.push(group);
            }
        }
        Ok(enumeration)
    }
}

/// Collapses discovery rows to one fetch target per product name, keeping the
/// lexicographically smallest source path as the representative.
pub fn fetch_targets(products: Vec<DiscoveredProduct>) -> Vec<WorkItem> {
    let mut by_name: BTreeMap<ProductName, Vec<DiscoveredProduct>> = BTreeMap::new();
    for product in products {
        by_name
            .entry(product.descriptor.name.clone())
            .or_default()
            .push(product);
    }

    by_name
        .into_iter()
        .filter_map(|(name, mut rows)| {
            let referenced_in = rows
                .iter()
                .map(|row| row.locality.region().to_string())
                .collect::<BTreeSet<_>>();
            rows.sort_by(|a, b| {
                a.descriptor
                    .source_path
                    .cmp(&b.descriptor.source_path)
                    .then_with(|| a.locality.cmp(&b.locality))
            });
            let representative = rows.into_iter().next()?;
            Some(WorkItem::Fetch {
                product: name,
                region: representative.locality.region().to_string(),
                subregion: representative.locality.subregion().to_string(),
                source_path: representative.descriptor.source_path,
                size_hint: representative.descriptor.size_hint,
                referenced_in,
            })
        })
        .collect()
}
