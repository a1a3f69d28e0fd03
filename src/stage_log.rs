use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, Transaction, params};
use serde::Serialize;

use crate::domain::{GroupKey, LocalityKey, Outcome, ProductDescriptor, Stage};
use crate::error::{ErrorClass, HarvestError};

const ENTRY_COLUMNS: &str = "id, stage, item_key, outcome, artifact_path, diagnostic, error_class, region, source_count, recorded_at";

/// One immutable row of the durable stage log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageLogEntry {
    pub id: i64,
    pub stage: Stage,
    pub item_key: String,
    pub outcome: Outcome,
    pub artifact_path: Option<Utf8PathBuf>,
    pub diagnostic: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub region: Option<String>,
    pub source_count: Option<u64>,
    pub recorded_at: DateTime<Utc>,
}

/// A concluded attempt, ready to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRecord {
    pub stage: Stage,
    pub item_key: String,
    pub outcome: Outcome,
    pub artifact_path: Option<Utf8PathBuf>,
    pub diagnostic: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub region: Option<String>,
    pub source_count: Option<u64>,
}

impl OutcomeRecord {
    pub fn success(stage: Stage, item_key: impl Into<String>) -> Self {
        Self {
            stage,
            item_key: item_key.into(),
            outcome: Outcome::Success,
            artifact_path: None,
            diagnostic: None,
            error_class: None,
            region: None,
            source_count: None,
        }
    }

    pub fn failure(stage: Stage, item_key: impl Into<String>, err: &HarvestError) -> Self {
        Self {
            stage,
            item_key: item_key.into(),
            outcome: Outcome::Failure,
            artifact_path: None,
            diagnostic: Some(err.diagnostic()),
            error_class: Some(err.class()),
            region: None,
            source_count: None,
        }
    }

    pub fn with_artifact(mut self, path: Utf8PathBuf) -> Self {
        self.artifact_path = Some(path);
        self
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    pub fn with_source_count(mut self, count: u64) -> Self {
        self.source_count = Some(count);
        self
    }
}

/// A catalog product as recorded under the locality that reported it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredProduct {
    pub locality: LocalityKey,
    pub descriptor: ProductDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupCount {
    pub group_key: GroupKey,
    pub member_count: u64,
    pub refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub stage: Stage,
    pub completed: u64,
    pub failure_rows: u64,
}

/// Append-only record of per-item stage outcomes, backed by SQLite.
///
/// All access goes through one connection behind a mutex, so concurrent workers
/// are serialized and every committed write is durable before the call returns.
#[derive(Clone)]
pub struct StageLog {
    conn: Arc<Mutex<Connection>>,
}

impl StageLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HarvestError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|err| {
            HarvestError::StageLog(format!("open {}: {err}", path.display()))
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, HarvestError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, HarvestError> {
        let log = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        log.init_schema()?;
        Ok(log)
    }

    fn init_schema(&self) -> Result<(), HarvestError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS stage_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stage TEXT NOT NULL,
                item_key TEXT NOT NULL,
                outcome TEXT NOT NULL CHECK (outcome IN ('success', 'failure')),
                artifact_path TEXT,
                diagnostic TEXT,
                error_class TEXT,
                region TEXT,
                source_count INTEGER,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_stage_log_completed
                ON stage_log(stage, outcome, item_key);
            CREATE INDEX IF NOT EXISTS idx_stage_log_item
                ON stage_log(item_key);

            CREATE TABLE IF NOT EXISTS products (
                locality_key TEXT NOT NULL,
                region TEXT NOT NULL,
                subregion TEXT NOT NULL,
                locality TEXT NOT NULL,
                product_name TEXT NOT NULL,
                source_path TEXT NOT NULL,
                size_hint TEXT,
                PRIMARY KEY (locality_key, product_name, source_path)
            );
            CREATE INDEX IF NOT EXISTS idx_products_name
                ON products(product_name);

            CREATE TABLE IF NOT EXISTS group_index (
                group_key TEXT PRIMARY KEY,
                member_count INTEGER NOT NULL,
                refreshed_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, HarvestError> {
        self.conn
            .lock()
            .map_err(|_| HarvestError::StageLog("stage log connection poisoned".to_string()))
    }

    /// Appends one entry. Duplicate keys are expected across retries and never rejected.
    pub fn record_outcome(&self, record: &OutcomeRecord) -> Result<(), HarvestError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        insert_entry(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    /// Appends several entries as one unit; either all become visible or none do.
    pub fn record_batch(&self, records: &[OutcomeRecord]) -> Result<(), HarvestError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for record in records {
            insert_entry(&tx, record)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Replaces the locality's product list and marks it discovered in one transaction.
    pub fn record_discovery(
        &self,
        locality: &LocalityKey,
        products: &[ProductDescriptor],
    ) -> Result<(), HarvestError> {
        let key = locality.to_string();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM products WHERE locality_key = ?1", params![key])?;
        for product in products {
            tx.execute(
                "INSERT OR REPLACE INTO products
                    (locality_key, region, subregion, locality, product_name, source_path, size_hint)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    key,
                    locality.region(),
                    locality.subregion(),
                    locality.locality(),
                    product.name.as_str(),
                    product.source_path,
                    product.size_hint,
                ],
            )?;
        }
        let record = OutcomeRecord::success(Stage::Discover, key)
            .with_region(Some(locality.region().to_string()))
            .with_source_count(products.len() as u64);
        insert_entry(&tx, &record)?;
        tx.commit()?;
        Ok(())
    }

    /// Keys with at least one Success entry for `stage`.
    pub fn completed_keys(&self, stage: Stage) -> Result<BTreeSet<String>, HarvestError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT item_key FROM stage_log WHERE stage = ?1 AND outcome = 'success'",
        )?;
        let keys = stmt
            .query_map(params![stage.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(keys)
    }

    /// Latest Success entry per item key, ordered by key.
    pub fn successes(&self, stage: Stage) -> Result<Vec<StageLogEntry>, HarvestError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM stage_log
             WHERE id IN (
                SELECT MAX(id) FROM stage_log
                WHERE stage = ?1 AND outcome = 'success'
                GROUP BY item_key
             )
             ORDER BY item_key"
        );
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![stage.as_str()], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Latest Failure per item that has not since succeeded, newest first. An archive-level
    /// Unpack failure is cleared by a success for any of its members.
    pub fn failures(
        &self,
        stage: Option<Stage>,
        limit: usize,
    ) -> Result<Vec<StageLogEntry>, HarvestError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM stage_log AS f
             WHERE f.id IN (
                SELECT MAX(id) FROM stage_log
                WHERE outcome = 'failure' AND (?1 IS NULL OR stage = ?1)
                GROUP BY stage, item_key
             )
             AND NOT EXISTS (
                SELECT 1 FROM stage_log AS s
                WHERE s.stage = f.stage AND s.outcome = 'success'
                  AND (
                    s.item_key = f.item_key
                    OR (
                        f.stage = 'unpack'
                        AND substr(s.item_key, 1, length(f.item_key) + 2) = f.item_key || '::'
                    )
                  )
             )
             ORDER BY f.id DESC
             LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let entries = stmt
            .query_map(params![stage.map(Stage::as_str), limit], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Every entry for one item in a stage, oldest first.
    pub fn history(&self, stage: Stage, item_key: &str) -> Result<Vec<StageLogEntry>, HarvestError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM stage_log
             WHERE stage = ?1 AND item_key = ?2
             ORDER BY id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![stage.as_str(), item_key], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Force-rebuild: drops every entry of `stage`. Clearing Discover also drops the product table.
    pub fn clear(&self, stage: Stage) -> Result<usize, HarvestError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM stage_log WHERE stage = ?1",
            params![stage.as_str()],
        )?;
        match stage {
            Stage::Discover => {
                tx.execute("DELETE FROM products", [])?;
            }
            Stage::Transform => {
                tx.execute("DELETE FROM group_index", [])?;
            }
            _ => {}
        }
        tx.commit()?;
        Ok(removed)
    }

    pub fn discovered_products(&self) -> Result<Vec<DiscoveredProduct>, HarvestError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT region, subregion, locality, product_name, source_path, size_hint
             FROM products
             ORDER BY product_name, source_path, locality_key",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut products = Vec::with_capacity(rows.len());
        for (region, subregion, locality, name, source_path, size_hint) in rows {
            products.push(DiscoveredProduct {
                locality: LocalityKey::new(&region, &subregion, &locality)?,
                descriptor: ProductDescriptor {
                    name: name.parse()?,
                    source_path,
                    size_hint,
                },
            });
        }
        Ok(products)
    }

    /// Replaces the cached group table. Reporting only; merge candidates never read it.
    pub fn materialize_groups(&self, groups: &[(GroupKey, u64)]) -> Result<(), HarvestError> {
        let refreshed_at = Utc::now().to_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM group_index", [])?;
        for (group, count) in groups {
            tx.execute(
                "INSERT INTO group_index (group_key, member_count, refreshed_at) VALUES (?1, ?2, ?3)",
                params![group.as_str(), *count as i64, refreshed_at],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn group_counts(&self) -> Result<Vec<GroupCount>, HarvestError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT group_key, member_count, refreshed_at FROM group_index ORDER BY group_key",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    parse_timestamp(2, row.get::<_, String>(2)?)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(key, count, refreshed_at)| {
                Ok(GroupCount {
                    group_key: key.parse()?,
                    member_count: count.max(0) as u64,
                    refreshed_at,
                })
            })
            .collect()
    }

    pub fn stage_counts(&self) -> Result<Vec<StageCounts>, HarvestError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT
                COUNT(DISTINCT CASE WHEN outcome = 'success' THEN item_key END),
                SUM(CASE WHEN outcome = 'failure' THEN 1 ELSE 0 END)
             FROM stage_log WHERE stage = ?1",
        )?;
        let mut counts = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            let (completed, failure_rows) = stmt.query_row(params![stage.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                ))
            })?;
            counts.push(StageCounts {
                stage,
                completed: completed.max(0) as u64,
                failure_rows: failure_rows.max(0) as u64,
            });
        }
        Ok(counts)
    }
}

fn insert_entry(tx: &Transaction<'_>, record: &OutcomeRecord) -> Result<(), HarvestError> {
    tx.execute(
        "INSERT INTO stage_log
            (stage, item_key, outcome, artifact_path, diagnostic, error_class, region, source_count, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.stage.as_str(),
            record.item_key,
            record.outcome.as_str(),
            record.artifact_path.as_ref().map(|path| path.as_str()),
            record.diagnostic,
            record.error_class.map(ErrorClass::as_str),
            record.region,
            record.source_count.map(|count| count as i64),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<StageLogEntry> {
    let stage: String = row.get(1)?;
    let outcome: String = row.get(3)?;
    let error_class: Option<String> = row.get(6)?;
    Ok(StageLogEntry {
        id: row.get(0)?,
        stage: stage.parse().map_err(|err| conversion_error(1, err))?,
        item_key: row.get(2)?,
        outcome: outcome.parse().map_err(|err| conversion_error(3, err))?,
        artifact_path: row.get::<_, Option<String>>(4)?.map(Utf8PathBuf::from),
        diagnostic: row.get(5)?,
        error_class: error_class.as_deref().and_then(ErrorClass::parse),
        region: row.get(7)?,
        source_count: row
            .get::<_, Option<i64>>(8)?
            .map(|count| count.max(0) as u64),
        recorded_at: parse_timestamp(9, row.get(9)?)?,
    })
}

fn parse_timestamp(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| conversion_error(idx, err))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}
