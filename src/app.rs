use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::catalog::Catalog;
use crate::config::HarvestConfig;
use crate::domain::{Outcome, Stage};
use crate::enumerator::{Enumeration, Enumerator, Scope};
use crate::error::{ErrorClass, HarvestError};
use crate::executor::{Executor, ItemReport};
use crate::grouping::GroupIndex;
use crate::pool::{Pacer, ShutdownFlag, WorkerPool};
use crate::stage_log::{StageCounts, StageLog, StageLogEntry};
use crate::store::{FsRelocator, Relocator, Store};
use crate::tool::{Ogr2Ogr, ToolRunner};
use crate::transport::Transport;

/// What one invocation should do.
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    /// Executed in pipeline order regardless of the order given.
    pub stages: Vec<Stage>,
    pub scope: Scope,
    /// Each listed stage is cleared together with everything downstream of it.
    pub force_rebuild: BTreeSet<Stage>,
    pub dry_run: bool,
}

impl RunPlan {
    pub fn all_stages() -> Self {
        Self {
            stages: Stage::ALL.to_vec(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub key: String,
    pub diagnostic: String,
    pub error_class: Option<ErrorClass>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    pub stage: Stage,
    pub candidates: usize,
    pub processed: usize,
    pub skipped_already_done: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub produced: u64,
    pub stale_groups: Vec<String>,
    pub failures: Vec<ItemFailure>,
    /// Upstream listings that could not be enumerated (discovery only).
    pub enumeration_errors: Vec<ItemFailure>,
    /// Candidate keys, populated for dry runs.
    pub planned: Vec<String>,
    pub elapsed_ms: u64,
}

impl StageSummary {
    fn new(stage: Stage) -> Self {
        Self {
            stage,
            candidates: 0,
            processed: 0,
            skipped_already_done: 0,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            produced: 0,
            stale_groups: Vec::new(),
            failures: Vec::new(),
            enumeration_errors: Vec::new(),
            planned: Vec::new(),
            elapsed_ms: 0,
        }
    }

    fn absorb(&mut self, report: ItemReport) {
        self.processed += 1;
        match report.outcome {
            Outcome::Success => {
                self.succeeded += 1;
                self.produced += report.produced;
            }
            Outcome::Failure => {
                self.failed += 1;
                self.failures.push(ItemFailure {
                    key: report.key,
                    diagnostic: report.diagnostic.unwrap_or_default(),
                    error_class: report.error_class,
                });
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClearedStage {
    pub stage: Stage,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    pub interrupted: bool,
    pub cleared: Vec<ClearedStage>,
    pub stages: Vec<StageSummary>,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn stage(&self, stage: Stage) -> Option<&StageSummary> {
        self.stages.iter().find(|summary| summary.stage == stage)
    }

    pub fn total_failed(&self) -> usize {
        self.stages.iter().map(|summary| summary.failed).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub stages: Vec<StageCounts>,
    pub discovered_products: usize,
    pub groups: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailuresReport {
    pub failures: Vec<StageLogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStatus {
    pub group: String,
    pub members: u64,
    pub merged_source_count: Option<u64>,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupsReport {
    pub groups: Vec<GroupStatus>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Run Coordinator: sequences stages over the shared stage log.
pub struct Harvester<C, T, R, M = FsRelocator> {
    config: HarvestConfig,
    store: Store,
    log: StageLog,
    catalog: C,
    transport: T,
    tool: Ogr2Ogr<R>,
    relocator: M,
    shutdown: ShutdownFlag,
}

impl<C, T, R, M> Harvester<C, T, R, M>
where
    C: Catalog,
    T: Transport,
    R: ToolRunner,
    M: Relocator,
{
    pub fn new(
        config: HarvestConfig,
        log: StageLog,
        catalog: C,
        transport: T,
        tool: Ogr2Ogr<R>,
        relocator: M,
    ) -> Self {
        Self {
            store: Store::new(&config),
            config,
            log,
            catalog,
            transport,
            tool,
            relocator,
            shutdown: ShutdownFlag::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownFlag) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn log(&self) -> &StageLog {
        &self.log
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn tool(&self) -> &Ogr2Ogr<R> {
        &self.tool
    }

    pub fn run(&self, plan: &RunPlan, sink: &dyn ProgressSink) -> Result<RunReport, HarvestError> {
        let started = Instant::now();
        let stages = plan.stages.iter().copied().collect::<BTreeSet<_>>();

        if !plan.dry_run {
            self.store.ensure_roots()?;
        }
        let cleared = self.force_rebuild(plan, sink)?;

        let workers = self.config.pipeline.workers;
        let pool = WorkerPool::new(workers, self.shutdown.clone())?;
        let pacer = Pacer::new(workers, self.config.network.rate_limit());
        let executor = Executor {
            log: &self.log,
            store: &self.store,
            catalog: &self.catalog,
            transport: &self.transport,
            tool: &self.tool,
            relocator: &self.relocator,
            pacer: &pacer,
            base_url: &self.config.network.base_url,
            member_extension: &self.config.pipeline.member_extension,
        };

        let mut report = RunReport {
            dry_run: plan.dry_run,
            interrupted: false,
            cleared,
            stages: Vec::with_capacity(stages.len()),
            elapsed_ms: 0,
        };

        for stage in stages {
            if self.shutdown.is_requested() {
                tracing::warn!(stage = %stage, "shutdown requested; remaining stages skipped");
                report.interrupted = true;
                break;
            }
            let summary = self.run_stage(stage, plan, &pool, &executor, sink)?;
            report.stages.push(summary);
        }

        report.interrupted |= self.shutdown.is_requested();
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    fn force_rebuild(
        &self,
        plan: &RunPlan,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<ClearedStage>, HarvestError> {
        let targets = rebuild_targets(plan);
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        if plan.dry_run {
            tracing::warn!(stages = ?targets, "dry run: planning as if cleared, log left untouched");
            return Ok(Vec::new());
        }

        let mut cleared = Vec::with_capacity(targets.len());
        for stage in targets {
            let rows = self.log.clear(stage)?;
            tracing::info!(stage = %stage, rows, "stage log cleared");
            sink.event(ProgressEvent {
                message: format!("phase={stage}; cleared {rows} log rows"),
                elapsed: None,
            });
            cleared.push(ClearedStage { stage, rows });
        }
        Ok(cleared)
    }

    fn run_stage(
        &self,
        stage: Stage,
        plan: &RunPlan,
        pool: &WorkerPool,
        executor: &Executor<'_, C, T, R, M>,
        sink: &dyn ProgressSink,
    ) -> Result<StageSummary, HarvestError> {
        let started = Instant::now();
        let mut summary = StageSummary::new(stage);
        sink.event(ProgressEvent {
            message: format!("phase={stage}; enumerating candidates"),
            elapsed: None,
        });

        let enumeration = self.enumerate(stage, plan, &mut summary)?;
        summary.candidates = enumeration.candidates.len();
        summary.skipped_already_done = enumeration.already_done;
        summary.stale_groups = enumeration
            .stale_groups
            .iter()
            .map(ToString::to_string)
            .collect();
        tracing::info!(
            stage = %stage,
            candidates = summary.candidates,
            already_done = summary.skipped_already_done,
            "stage enumerated"
        );

        if plan.dry_run {
            summary.planned = enumeration.candidates.iter().map(|item| item.key()).collect();
            sink.event(ProgressEvent {
                message: format!("phase={stage}; dry run, {} candidates", summary.candidates),
                elapsed: Some(started.elapsed()),
            });
            summary.elapsed_ms = started.elapsed().as_millis() as u64;
            return Ok(summary);
        }

        sink.event(ProgressEvent {
            message: format!(
                "phase={stage}; processing {} items on {} workers",
                summary.candidates,
                pool.width()
            ),
            elapsed: None,
        });
        let run = pool.run(enumeration.candidates, |item| executor.process(item));
        summary.cancelled = run.cancelled;
        for result in run.outputs {
            summary.absorb(result?);
        }

        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        sink.event(ProgressEvent {
            message: format!(
                "phase={stage}; processed={} succeeded={} failed={} skipped={} cancelled={}",
                summary.processed,
                summary.succeeded,
                summary.failed,
                summary.skipped_already_done,
                summary.cancelled
            ),
            elapsed: Some(started.elapsed()),
        });
        tracing::info!(
            stage = %stage,
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            elapsed_ms = summary.elapsed_ms,
            "stage finished"
        );
        Ok(summary)
    }

    fn enumerate(
        &self,
        stage: Stage,
        plan: &RunPlan,
        summary: &mut StageSummary,
    ) -> Result<Enumeration, HarvestError> {
        let mut enumerator = Enumerator::new(&self.log);
        if plan.dry_run {
            enumerator = enumerator.assuming_cleared(rebuild_targets(plan));
        }
        match stage {
            Stage::Discover => {
                let regions = if plan.scope.regions.is_empty() {
                    self.config.catalog.regions.clone()
                } else {
                    plan.scope.regions.iter().cloned().collect()
                };
                if regions.is_empty() {
                    tracing::warn!("no regions configured; discovery has nothing to list");
                }
                let mut localities = Vec::new();
                for region in regions {
                    match self.catalog.localities(std::slice::from_ref(&region)) {
                        Ok(found) => localities.extend(found),
                        Err(err) => {
                            tracing::warn!(region = %region, error = %err, "locality listing failed");
                            summary.enumeration_errors.push(ItemFailure {
                                key: region,
                                diagnostic: err.diagnostic(),
                                error_class: Some(err.class()),
                            });
                        }
                    }
                }
                enumerator.discover(&localities, &plan.scope)
            }
            Stage::Merge => {
                if !plan.dry_run {
                    GroupIndex::from_log(&self.log)?.materialize(&self.log)?;
                }
                enumerator.candidates(stage, &plan.scope)
            }
            _ => enumerator.candidates(stage, &plan.scope),
        }
    }

    pub fn status(&self) -> Result<StatusReport, HarvestError> {
        Ok(StatusReport {
            stages: self.log.stage_counts()?,
            discovered_products: self.log.discovered_products()?.len(),
            groups: GroupIndex::from_log(&self.log)?.len(),
        })
    }

    pub fn failures(&self, stage: Option<Stage>, limit: usize) -> Result<FailuresReport, HarvestError> {
        Ok(FailuresReport {
            failures: self.log.failures(stage, limit)?,
        })
    }

    pub fn groups(&self) -> Result<GroupsReport, HarvestError> {
        let index = GroupIndex::from_log(&self.log)?;
        index.materialize(&self.log)?;
        let merged = self
            .log
            .successes(Stage::Merge)?
            .into_iter()
            .map(|entry| (entry.item_key, entry.source_count))
            .collect::<std::collections::BTreeMap<_, _>>();

        let groups = index
            .counts()
            .into_iter()
            .map(|(group, members)| {
                let merged_source_count = merged.get(group.as_str()).copied().flatten();
                GroupStatus {
                    stale: merged_source_count.is_some_and(|count| count != members),
                    group: group.to_string(),
                    members,
                    merged_source_count,
                }
            })
            .collect();
        Ok(GroupsReport { groups })
    }
}

/// Every stage a force-rebuild touches: each requested stage plus everything downstream.
fn rebuild_targets(plan: &RunPlan) -> BTreeSet<Stage> {
    plan.force_rebuild
        .iter()
        .flat_map(|stage| stage.with_downstream())
        .collect()
}
