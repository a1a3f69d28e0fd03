use std::fs;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::Builder;

use crate::catalog::Catalog;
use crate::domain::{GroupKey, LocalityKey, MemberKey, Outcome, ProductName, Stage, parse_size_hint};
use crate::enumerator::WorkItem;
use crate::error::{ErrorClass, HarvestError};
use crate::fs_util;
use crate::merge::MergeEngine;
use crate::pool::Pacer;
use crate::stage_log::{OutcomeRecord, StageLog};
use crate::store::{Relocator, Store};
use crate::tool::{Ogr2Ogr, ToolRunner};
use crate::transport::{Transport, resolve_url};

/// What happened to one item attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub key: String,
    pub outcome: Outcome,
    /// Downstream items this attempt made available (products, members, artifacts).
    pub produced: u64,
    pub diagnostic: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub elapsed_ms: u64,
}

/// Applies a stage's operation to one item and records the outcome.
pub struct Executor<'a, C, T, R, M> {
    pub log: &'a StageLog,
    pub store: &'a Store,
    pub catalog: &'a C,
    pub transport: &'a T,
    pub tool: &'a Ogr2Ogr<R>,
    pub relocator: &'a M,
    pub pacer: &'a Pacer,
    pub base_url: &'a str,
    pub member_extension: &'a str,
}

impl<C, T, R, M> Executor<'_, C, T, R, M>
where
    C: Catalog,
    T: Transport,
    R: ToolRunner,
    M: Relocator,
{
    /// Item-level failures are logged and reported; only stage log errors escape.
    pub fn process(&self, item: WorkItem) -> Result<ItemReport, HarvestError> {
        let started = Instant::now();
        let stage = item.stage();
        let key = item.key();
        let region = item.region().map(str::to_string);

        let result = match item {
            WorkItem::Discover { locality } => self.discover(&locality),
            WorkItem::Fetch {
                product,
                region,
                subregion,
                source_path,
                size_hint,
                ..
            } => self.fetch(&product, &region, &subregion, &source_path, size_hint.as_deref()),
            WorkItem::Unpack {
                product,
                archive,
                region,
            } => self.unpack(&product, &archive, region),
            WorkItem::Transform {
                member,
                source,
                region,
            } => self.transform(&member, &source, region),
            WorkItem::Merge { group, members } => self.merge(&group, &members),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(produced) => {
                tracing::debug!(stage = %stage, item = %key, produced, elapsed_ms, "item succeeded");
                Ok(ItemReport {
                    key,
                    outcome: Outcome::Success,
                    produced,
                    diagnostic: None,
                    error_class: None,
                    elapsed_ms,
                })
            }
            Err(err @ HarvestError::StageLog(_)) => Err(err),
            Err(err) => {
                tracing::warn!(stage = %stage, item = %key, error = %err, elapsed_ms, "item failed");
                let record = OutcomeRecord::failure(stage, key.clone(), &err).with_region(region);
                self.log.record_outcome(&record)?;
                Ok(ItemReport {
                    key,
                    outcome: Outcome::Failure,
                    produced: 0,
                    diagnostic: record.diagnostic,
                    error_class: record.error_class,
                    elapsed_ms,
                })
            }
        }
    }

    fn discover(&self, locality: &LocalityKey) -> Result<u64, HarvestError> {
        self.pacer.pause();
        let products = self.catalog.products(locality)?;
        self.log.record_discovery(locality, &products)?;
        Ok(products.len() as u64)
    }

    fn fetch(
        &self,
        product: &ProductName,
        region: &str,
        subregion: &str,
        source_path: &str,
        size_hint: Option<&str>,
    ) -> Result<u64, HarvestError> {
        let destination = self.store.archive_path(region, subregion, product);
        let url = resolve_url(self.base_url, source_path);
        let size_hint_bytes = size_hint.and_then(parse_size_hint);
        let resume_from = fs::metadata(destination.as_std_path())
            .map(|meta| meta.len())
            .unwrap_or(0);
        if resume_from > 0 {
            tracing::debug!(item = %product, resume_from, size_hint_bytes, "resuming partial download");
        }

        self.pacer.pause();
        let receipt = self.transport.fetch(&url, &destination, resume_from)?;
        let actual = fs::metadata(destination.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("stat {destination}: {err}")))?
            .len();
        match receipt.total_size {
            Some(expected) if expected != actual => {
                tracing::warn!(
                    item = %product,
                    expected,
                    actual,
                    resume_from,
                    size_hint_bytes,
                    "download size mismatch"
                );
                // A local file that overshoots, or a resume that added nothing, would
                // reproduce the same mismatch on every rerun.
                if actual > expected || (resume_from > 0 && actual == resume_from) {
                    let _ = fs::remove_file(destination.as_std_path());
                }
                return Err(HarvestError::SizeMismatch { expected, actual });
            }
            Some(_) => {}
            None => {
                tracing::debug!(item = %product, actual, size_hint_bytes, "server reported no size");
            }
        }

        // A complete but unreadable archive is discarded so the next attempt starts clean.
        if let Err(err) = fs_util::validate_zip(destination.as_std_path()) {
            let _ = fs::remove_file(destination.as_std_path());
            return Err(err);
        }

        let record = OutcomeRecord::success(Stage::Fetch, product.to_string())
            .with_artifact(destination)
            .with_region(Some(region.to_string()));
        self.log.record_outcome(&record)?;
        Ok(1)
    }

    fn unpack(
        &self,
        product: &ProductName,
        archive: &Utf8Path,
        region: Option<String>,
    ) -> Result<u64, HarvestError> {
        let members = fs_util::list_members(archive.as_std_path(), self.member_extension)?;
        if members.is_empty() {
            return Err(HarvestError::Archive(format!(
                "{archive} contains no .{} members",
                self.member_extension.trim_start_matches('.')
            )));
        }

        let target = self.store.extract_dir(product);
        fs_util::extract_archive(archive.as_std_path(), target.as_std_path())?;

        let mut records = Vec::with_capacity(members.len());
        for member in &members {
            let key = MemberKey::new(product.clone(), member)?;
            let path = self.store.member_path(&key);
            if !path.exists() {
                return Err(HarvestError::Archive(format!("{key} missing after extraction")));
            }
            records.push(
                OutcomeRecord::success(Stage::Unpack, key.to_string())
                    .with_artifact(path)
                    .with_region(region.clone()),
            );
        }
        self.log.record_batch(&records)?;
        Ok(records.len() as u64)
    }

    fn transform(
        &self,
        member: &MemberKey,
        source: &Utf8Path,
        region: Option<String>,
    ) -> Result<u64, HarvestError> {
        let scratch_root = self.store.transform_scratch_dir();
        fs::create_dir_all(scratch_root.as_std_path())
            .map_err(|err| HarvestError::ScratchCollision(format!("{scratch_root}: {err}")))?;
        // Dropped on every exit path, so partial outputs never outlive a failed attempt.
        let workspace = Builder::new()
            .prefix("transform-")
            .tempdir_in(scratch_root.as_std_path())
            .map_err(|err| HarvestError::ScratchCollision(format!("{scratch_root}: {err}")))?;
        let workspace_path = Utf8PathBuf::from_path_buf(workspace.path().to_path_buf())
            .map_err(|path| {
                HarvestError::ScratchCollision(format!("non UTF-8 workspace {}", path.display()))
            })?;
        let scratch_output =
            workspace_path.join(format!("{}.{}", member.stem(), self.store.artifact_ext()));

        self.tool.convert(source, &scratch_output, member.stem())?;
        if !scratch_output.exists() {
            return Err(HarvestError::ToolFailed {
                program: self.tool.config().ogr2ogr.clone(),
                message: format!("no output produced for {member}"),
            });
        }

        let destination = self.store.transform_path(member);
        self.relocator.relocate(&scratch_output, &destination)?;

        let record = OutcomeRecord::success(Stage::Transform, member.to_string())
            .with_artifact(destination)
            .with_region(region);
        self.log.record_outcome(&record)?;
        Ok(1)
    }

    fn merge(&self, group: &GroupKey, members: &[Utf8PathBuf]) -> Result<u64, HarvestError> {
        let engine = MergeEngine::new(self.tool, self.store, self.relocator);
        let receipt = engine.merge_group(group, members)?;
        tracing::info!(
            group = %group,
            sources = receipt.source_count,
            bytes = receipt.bytes,
            "merged group"
        );
        let record = OutcomeRecord::success(Stage::Merge, group.to_string())
            .with_artifact(receipt.artifact)
            .with_source_count(receipt.source_count);
        self.log.record_outcome(&record)?;
        Ok(1)
    }
}
