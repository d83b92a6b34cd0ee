//! DuckDB storage for every pipeline table.
//!
//! All reads and writes are scoped by run identifier. Writes are idempotent
//! where re-running a stage must converge: mappings use insert-if-absent,
//! monthly rows use insert-or-replace, anomalies and models replace per run.

use std::collections::HashMap;
use std::path::Path;

use arrow::record_batch::RecordBatch;
use civicspend_core::{
    Anomaly, DetectorKind, MonthlyAggregate, RawAward, Run, RunStatus, Severity, VendorContext,
    VendorEntity, YearMonth,
};
use duckdb::{Connection, params};
use tracing::{debug, info};

use crate::StoreError;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS run_manifest (
    run_id          VARCHAR PRIMARY KEY,
    status          VARCHAR NOT NULL,
    created_at      VARCHAR NOT NULL,
    row_count_raw   BIGINT NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS raw_awards (
    run_id                VARCHAR NOT NULL,
    award_id              VARCHAR NOT NULL,
    recipient_name        VARCHAR NOT NULL,
    recipient_strong_id   VARCHAR,
    awarding_agency       VARCHAR,
    action_date           VARCHAR,
    obligation_amount     DOUBLE NOT NULL,
    place_of_performance  VARCHAR,
    PRIMARY KEY (run_id, award_id)
);
CREATE TABLE IF NOT EXISTS vendor_entities (
    vendor_id       VARCHAR PRIMARY KEY,
    canonical_name  VARCHAR NOT NULL,
    strong_id       VARCHAR
);
CREATE TABLE IF NOT EXISTS award_vendor_map (
    run_id      VARCHAR NOT NULL,
    award_id    VARCHAR NOT NULL,
    vendor_id   VARCHAR NOT NULL,
    PRIMARY KEY (run_id, award_id)
);
CREATE TABLE IF NOT EXISTS monthly_vendor_spend (
    run_id           VARCHAR NOT NULL,
    vendor_id        VARCHAR NOT NULL,
    year_month       VARCHAR NOT NULL,
    obligation_sum   DOUBLE NOT NULL,
    award_count      BIGINT NOT NULL,
    avg_award_size   DOUBLE NOT NULL,
    rolling_3m_mean  DOUBLE NOT NULL,
    rolling_3m_mad   DOUBLE NOT NULL,
    PRIMARY KEY (run_id, vendor_id, year_month)
);
CREATE TABLE IF NOT EXISTS anomalies (
    run_id       VARCHAR NOT NULL,
    vendor_id    VARCHAR NOT NULL,
    year_month   VARCHAR NOT NULL,
    detector     VARCHAR NOT NULL,
    severity     VARCHAR NOT NULL,
    score        DOUBLE NOT NULL,
    value        DOUBLE NOT NULL,
    award_count  BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS ml_models (
    run_id        VARCHAR PRIMARY KEY,
    payload       VARCHAR NOT NULL,
    sample_count  BIGINT NOT NULL,
    trained_at    VARCHAR NOT NULL
);
";

const AWARD_COLUMNS: &str = "run_id, award_id, recipient_name, recipient_strong_id, \
     awarding_agency, action_date, obligation_amount, place_of_performance";

/// A serialised trained model, keyed by the run it was trained on.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredModel {
    pub run_id: String,
    /// Opaque JSON document owned by the detector.
    pub payload: String,
    pub sample_count: u64,
    /// RFC 3339 timestamp string.
    pub trained_at: String,
}

/// DuckDB store for one CivicSpend database.
///
/// Supports both in-memory (ephemeral) and persistent (file-backed) modes.
/// Use [`open`](Self::open) for in-memory and [`open_persistent`](Self::open_persistent)
/// for a database file that survives across process invocations, which is
/// what lets each pipeline stage run separately.
pub struct DuckStore {
    conn: Connection,
}

impl DuckStore {
    /// Open an in-memory DuckDB database with the schema in place.
    pub fn open() -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open or create a persistent DuckDB database at the given path.
    ///
    /// Tables are created if missing; existing data is left untouched.
    pub fn open_persistent(path: &Path) -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open(path)?,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create every table that does not exist yet.
    pub fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Counts ──

    /// Raw awards ingested for a run.
    pub fn raw_award_count(&self, run_id: &str) -> Result<usize, StoreError> {
        self.count_where("raw_awards", run_id)
    }

    /// Mapping rows for a run.
    pub fn mapping_count(&self, run_id: &str) -> Result<usize, StoreError> {
        self.count_where("award_vendor_map", run_id)
    }

    /// Monthly rows for a run.
    pub fn monthly_row_count(&self, run_id: &str) -> Result<usize, StoreError> {
        self.count_where("monthly_vendor_spend", run_id)
    }

    /// Vendor entities across all runs.
    pub fn vendor_count(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .conn
            .query_row("SELECT count(*) FROM vendor_entities", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    fn count_where(&self, table: &str, run_id: &str) -> Result<usize, StoreError> {
        let sql = format!("SELECT count(*) FROM {table} WHERE run_id = ?");
        let n: i64 = self.conn.query_row(&sql, params![run_id], |row| row.get(0))?;
        Ok(n as usize)
    }

    // ── Runs ──

    /// Register a new run in `pending` state.
    pub fn create_run(&self, run_id: &str) -> Result<Run, StoreError> {
        let created_at = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO run_manifest (run_id, status, created_at, row_count_raw) VALUES (?, ?, ?, 0)",
            params![run_id, RunStatus::Pending.as_str(), created_at],
        )?;
        info!(run_id, "created run");
        Ok(Run {
            run_id: run_id.to_string(),
            status: RunStatus::Pending,
            created_at,
            row_count_raw: 0,
        })
    }

    /// Move a run to `status`, optionally recording its raw record count.
    ///
    /// A run that reached `completed` or `failed` is frozen; any further
    /// change is rejected with [`StoreError::RunFinalized`].
    pub fn set_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        row_count_raw: Option<u64>,
    ) -> Result<(), StoreError> {
        match self.run(run_id)? {
            None => return Err(StoreError::RunNotFound(run_id.to_string())),
            Some(run) => ensure_open(&run)?,
        }
        let changed = match row_count_raw {
            Some(n) => self.conn.execute(
                "UPDATE run_manifest SET status = ?, row_count_raw = ? WHERE run_id = ?",
                params![status.as_str(), n as i64, run_id],
            )?,
            None => self.conn.execute(
                "UPDATE run_manifest SET status = ? WHERE run_id = ?",
                params![status.as_str(), run_id],
            )?,
        };
        if changed == 0 {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        info!(run_id, status = status.as_str(), "run status updated");
        Ok(())
    }

    /// Rejects writes against a run that has reached a terminal status.
    /// Runs absent from the manifest are not checked.
    fn ensure_run_open(&self, run_id: &str) -> Result<(), StoreError> {
        match self.run(run_id)? {
            Some(run) => ensure_open(&run),
            None => Ok(()),
        }
    }

    /// Fetch a run manifest row.
    pub fn run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, status, created_at, row_count_raw FROM run_manifest WHERE run_id = ?",
        )?;
        let mut rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        let Some(row) = rows.next() else {
            return Ok(None);
        };
        let (run_id, status, created_at, count) = row?;
        let status = RunStatus::parse(&status).ok_or_else(|| StoreError::Corrupt {
            table: "run_manifest",
            detail: format!("unknown status {status:?}"),
        })?;
        Ok(Some(Run {
            run_id,
            status,
            created_at,
            row_count_raw: count.max(0) as u64,
        }))
    }

    // ── Raw awards ──

    /// Insert one award. A second award with the same identifier in the same
    /// run is rejected, never merged.
    pub fn insert_raw_award(&self, award: &RawAward) -> Result<(), StoreError> {
        self.ensure_run_open(&award.run_id)?;
        let exists: i64 = self.conn.query_row(
            "SELECT count(*) FROM raw_awards WHERE run_id = ? AND award_id = ?",
            params![award.run_id, award.award_id],
            |row| row.get(0),
        )?;
        if exists > 0 {
            return Err(StoreError::DuplicateAward {
                run_id: award.run_id.clone(),
                award_id: award.award_id.clone(),
            });
        }
        let sql = format!("INSERT INTO raw_awards ({AWARD_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)");
        self.conn.execute(
            &sql,
            params![
                award.run_id,
                award.award_id,
                award.recipient_name,
                award.recipient_strong_id,
                award.awarding_agency,
                award.action_date,
                award.obligation_amount,
                award.place_of_performance,
            ],
        )?;
        Ok(())
    }

    /// Bulk-load awards for a run from a CSV or Parquet file.
    ///
    /// The file must provide the columns `award_id`, `recipient_name`,
    /// `recipient_strong_id`, `awarding_agency`, `action_date`,
    /// `obligation_amount` and `place_of_performance`. Files ending in
    /// `.parquet` go through `read_parquet` with their own column types.
    /// Everything else is read as CSV with every column kept as text, so
    /// identifiers like `007` keep their leading zeros. The load is rejected
    /// as a whole if any award identifier repeats within the file or the run.
    pub fn import_raw_awards(&self, run_id: &str, path: &Path) -> Result<usize, StoreError> {
        if !path.exists() {
            return Err(StoreError::FileNotFound(path.to_path_buf()));
        }
        self.ensure_run_open(run_id)?;
        let literal = sql_literal(&path.display().to_string());
        let source = match path.extension().and_then(|e| e.to_str()) {
            Some("parquet") => format!("read_parquet('{literal}')"),
            _ => format!("read_csv('{literal}', header = true, all_varchar = true)"),
        };

        let dup_sql = format!(
            "SELECT award_id FROM (
                SELECT CAST(award_id AS VARCHAR) AS award_id FROM {source}
                UNION ALL
                SELECT award_id FROM raw_awards WHERE run_id = ?
            )
            GROUP BY award_id HAVING count(*) > 1
            ORDER BY award_id LIMIT 1"
        );
        let mut stmt = self.conn.prepare(&dup_sql)?;
        let mut dups = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
        if let Some(award_id) = dups.next() {
            return Err(StoreError::DuplicateAward {
                run_id: run_id.to_string(),
                award_id: award_id?,
            });
        }

        let insert_sql = format!(
            "INSERT INTO raw_awards ({AWARD_COLUMNS})
             SELECT ?,
                    CAST(award_id AS VARCHAR),
                    CAST(recipient_name AS VARCHAR),
                    CAST(recipient_strong_id AS VARCHAR),
                    CAST(awarding_agency AS VARCHAR),
                    CAST(action_date AS VARCHAR),
                    CAST(obligation_amount AS DOUBLE),
                    CAST(place_of_performance AS VARCHAR)
             FROM {source}"
        );
        let count = self.conn.execute(&insert_sql, params![run_id])?;
        info!(run_id, count, path = %path.display(), "imported raw awards");
        Ok(count)
    }

    /// Every award of a run, ordered by award identifier.
    pub fn raw_awards(&self, run_id: &str) -> Result<Vec<RawAward>, StoreError> {
        let sql = format!("SELECT {AWARD_COLUMNS} FROM raw_awards WHERE run_id = ? ORDER BY award_id");
        let mut stmt = self.conn.prepare(&sql)?;
        let awards = stmt
            .query_map(params![run_id], award_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(awards)
    }

    /// Awards of a run joined to their resolved vendor, as `(vendor_id, award)`.
    ///
    /// Awards without a mapping are left out.
    pub fn mapped_awards(&self, run_id: &str) -> Result<Vec<(String, RawAward)>, StoreError> {
        let sql = "SELECT avm.vendor_id, ra.run_id, ra.award_id, ra.recipient_name,
                    ra.recipient_strong_id, ra.awarding_agency, ra.action_date,
                    ra.obligation_amount, ra.place_of_performance
             FROM raw_awards ra
             JOIN award_vendor_map avm ON ra.run_id = avm.run_id AND ra.award_id = avm.award_id
             WHERE ra.run_id = ?
             ORDER BY avm.vendor_id, ra.award_id";
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    RawAward {
                        run_id: row.get(1)?,
                        award_id: row.get(2)?,
                        recipient_name: row.get(3)?,
                        recipient_strong_id: row.get(4)?,
                        awarding_agency: row.get(5)?,
                        action_date: row.get(6)?,
                        obligation_amount: row.get(7)?,
                        place_of_performance: row.get(8)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Awards of a run resolved to one vendor.
    pub fn vendor_awards(&self, run_id: &str, vendor_id: &str) -> Result<Vec<RawAward>, StoreError> {
        let sql = "SELECT ra.run_id, ra.award_id, ra.recipient_name, ra.recipient_strong_id,
                    ra.awarding_agency, ra.action_date, ra.obligation_amount,
                    ra.place_of_performance
             FROM raw_awards ra
             JOIN award_vendor_map avm ON ra.run_id = avm.run_id AND ra.award_id = avm.award_id
             WHERE ra.run_id = ? AND avm.vendor_id = ?
             ORDER BY ra.award_id";
        let mut stmt = self.conn.prepare(sql)?;
        let awards = stmt
            .query_map(params![run_id, vendor_id], award_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(awards)
    }

    // ── Vendors ──

    /// All vendor entities, in creation order (vendor identifiers are
    /// sequential, so ordering by identifier is stable).
    pub fn vendors(&self) -> Result<Vec<VendorEntity>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT vendor_id, canonical_name, strong_id FROM vendor_entities ORDER BY vendor_id",
        )?;
        let vendors = stmt
            .query_map([], vendor_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(vendors)
    }

    /// One vendor by identifier.
    pub fn vendor(&self, vendor_id: &str) -> Result<Option<VendorEntity>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT vendor_id, canonical_name, strong_id FROM vendor_entities WHERE vendor_id = ?",
        )?;
        let mut rows = stmt.query_map(params![vendor_id], vendor_from_row)?;
        rows.next().transpose().map_err(StoreError::from)
    }

    /// The vendor first created for a strong identifier, in any run.
    pub fn vendor_by_strong_id(&self, strong_id: &str) -> Result<Option<VendorEntity>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT vendor_id, canonical_name, strong_id FROM vendor_entities
             WHERE strong_id = ? ORDER BY vendor_id LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![strong_id], vendor_from_row)?;
        rows.next().transpose().map_err(StoreError::from)
    }

    /// Insert a new vendor entity. An existing identifier is an error,
    /// never a silent reuse.
    pub fn create_vendor(&self, vendor: &VendorEntity) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO vendor_entities (vendor_id, canonical_name, strong_id) VALUES (?, ?, ?)",
            params![vendor.vendor_id, vendor.canonical_name, vendor.strong_id],
        )?;
        debug!(vendor_id = %vendor.vendor_id, name = %vendor.canonical_name, "vendor entity created");
        Ok(())
    }

    /// Insert a vendor entity unless its identifier already exists.
    pub fn insert_vendor(&self, vendor: &VendorEntity) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO vendor_entities (vendor_id, canonical_name, strong_id) VALUES (?, ?, ?)",
            params![vendor.vendor_id, vendor.canonical_name, vendor.strong_id],
        )?;
        debug!(vendor_id = %vendor.vendor_id, name = %vendor.canonical_name, "vendor entity stored");
        Ok(())
    }

    // ── Award → vendor mapping ──

    /// Link an award to a vendor; an existing link for the award is kept.
    pub fn insert_award_vendor(
        &self,
        run_id: &str,
        award_id: &str,
        vendor_id: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO award_vendor_map (run_id, award_id, vendor_id) VALUES (?, ?, ?)",
            params![run_id, award_id, vendor_id],
        )?;
        Ok(())
    }

    /// Existing links for a run, award identifier → vendor identifier.
    pub fn award_vendor_map(&self, run_id: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT award_id, vendor_id FROM award_vendor_map WHERE run_id = ?")?;
        let map = stmt
            .query_map(params![run_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(map)
    }

    /// Distinct vendors that awards of a run resolve to.
    pub fn run_vendor_count(&self, run_id: &str) -> Result<usize, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT count(DISTINCT vendor_id) FROM award_vendor_map WHERE run_id = ?",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    // ── Monthly aggregates ──

    /// Insert or replace monthly rows keyed by (run, vendor, month).
    pub fn upsert_monthly(&self, rows: &[MonthlyAggregate]) -> Result<usize, StoreError> {
        let mut stmt = self.conn.prepare(
            "INSERT OR REPLACE INTO monthly_vendor_spend (
                run_id, vendor_id, year_month, obligation_sum, award_count,
                avg_award_size, rolling_3m_mean, rolling_3m_mad
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for row in rows {
            stmt.execute(params![
                row.run_id,
                row.vendor_id,
                row.year_month.to_string(),
                row.obligation_sum,
                row.award_count as i64,
                row.avg_award_size,
                row.rolling_3m_mean,
                row.rolling_3m_mad,
            ])?;
        }
        debug!(rows = rows.len(), "monthly rows upserted");
        Ok(rows.len())
    }

    /// Monthly rows of a run with each vendor's canonical name, ordered by
    /// vendor then month. Rows whose vendor entity is missing are skipped.
    pub fn monthly_rows(&self, run_id: &str) -> Result<Vec<(MonthlyAggregate, String)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT mvs.run_id, mvs.vendor_id, mvs.year_month, mvs.obligation_sum,
                    mvs.award_count, mvs.avg_award_size, mvs.rolling_3m_mean,
                    mvs.rolling_3m_mad, ve.canonical_name
             FROM monthly_vendor_spend mvs
             JOIN vendor_entities ve ON mvs.vendor_id = ve.vendor_id
             WHERE mvs.run_id = ?
             ORDER BY mvs.vendor_id, mvs.year_month",
        )?;
        let raw = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(run_id, vendor_id, ym, sum, count, avg, mean3, mad3, name)| {
                let year_month = parse_month("monthly_vendor_spend", &ym)?;
                Ok((
                    MonthlyAggregate {
                        run_id,
                        vendor_id,
                        year_month,
                        obligation_sum: sum,
                        award_count: count.max(0) as u32,
                        avg_award_size: avg,
                        rolling_3m_mean: mean3,
                        rolling_3m_mad: mad3,
                    },
                    name,
                ))
            })
            .collect()
    }

    /// Summary of a vendor's monthly history within a run; `None` when the
    /// vendor has no monthly rows for the run.
    pub fn vendor_context(
        &self,
        run_id: &str,
        vendor_id: &str,
    ) -> Result<Option<VendorContext>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT ve.canonical_name,
                    count(DISTINCT mvs.year_month),
                    avg(mvs.obligation_sum),
                    min(mvs.obligation_sum),
                    max(mvs.obligation_sum),
                    sum(mvs.obligation_sum)
             FROM vendor_entities ve
             JOIN monthly_vendor_spend mvs ON ve.vendor_id = mvs.vendor_id
             WHERE ve.vendor_id = ? AND mvs.run_id = ?
             GROUP BY ve.canonical_name",
        )?;
        let mut rows = stmt.query_map(params![vendor_id, run_id], |row| {
            Ok(VendorContext {
                vendor_id: vendor_id.to_string(),
                name: row.get(0)?,
                months_active: row.get::<_, i64>(1)?.max(0) as u32,
                avg_monthly: row.get(2)?,
                min_monthly: row.get(3)?,
                max_monthly: row.get(4)?,
                total_spend: row.get(5)?,
            })
        })?;
        rows.next().transpose().map_err(StoreError::from)
    }

    // ── Anomalies ──

    /// Replace the anomalies one detector produced for a run.
    pub fn replace_anomalies(
        &self,
        run_id: &str,
        detector: DetectorKind,
        anomalies: &[Anomaly],
    ) -> Result<usize, StoreError> {
        self.conn.execute(
            "DELETE FROM anomalies WHERE run_id = ? AND detector = ?",
            params![run_id, detector.as_str()],
        )?;
        let mut stmt = self.conn.prepare(
            "INSERT INTO anomalies (run_id, vendor_id, year_month, detector, severity, score, value, award_count)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        let mut count = 0usize;
        for a in anomalies.iter().filter(|a| a.detector == detector) {
            count += stmt.execute(params![
                run_id,
                a.vendor_id,
                a.year_month.to_string(),
                detector.as_str(),
                a.severity.as_str(),
                a.score,
                a.value,
                a.award_count as i64,
            ])?;
        }
        info!(run_id, detector = detector.as_str(), count, "anomalies stored");
        Ok(count)
    }

    /// Stored anomalies for a run, most severe first.
    pub fn anomalies(&self, run_id: &str) -> Result<Vec<Anomaly>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT a.run_id, a.vendor_id, ve.canonical_name, a.year_month, a.detector,
                    a.severity, a.score, a.value, a.award_count
             FROM anomalies a
             LEFT JOIN vendor_entities ve ON a.vendor_id = ve.vendor_id
             WHERE a.run_id = ?
             ORDER BY a.vendor_id, a.year_month, a.detector",
        )?;
        let raw = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut anomalies = raw
            .into_iter()
            .map(|(run_id, vendor_id, name, ym, det, sev, score, value, count)| {
                let corrupt = |detail: String| StoreError::Corrupt {
                    table: "anomalies",
                    detail,
                };
                Ok(Anomaly {
                    run_id,
                    vendor_id,
                    vendor_name: name,
                    year_month: parse_month("anomalies", &ym)?,
                    detector: DetectorKind::parse(&det)
                        .ok_or_else(|| corrupt(format!("unknown detector {det:?}")))?,
                    severity: Severity::parse(&sev)
                        .ok_or_else(|| corrupt(format!("unknown severity {sev:?}")))?,
                    score,
                    value,
                    award_count: count.max(0) as u32,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        anomalies.sort_by(|a, b| b.severity.cmp(&a.severity));
        Ok(anomalies)
    }

    // ── Models ──

    /// Persist a trained model, replacing any earlier one for the run.
    pub fn save_model(&self, model: &StoredModel) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO ml_models (run_id, payload, sample_count, trained_at) VALUES (?, ?, ?, ?)",
            params![
                model.run_id,
                model.payload,
                model.sample_count as i64,
                model.trained_at
            ],
        )?;
        info!(run_id = %model.run_id, bytes = model.payload.len(), "model saved");
        Ok(())
    }

    /// Reload the model trained for a run, if any.
    pub fn load_model(&self, run_id: &str) -> Result<Option<StoredModel>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, payload, sample_count, trained_at FROM ml_models WHERE run_id = ?",
        )?;
        let mut rows = stmt.query_map(params![run_id], |row| {
            Ok(StoredModel {
                run_id: row.get(0)?,
                payload: row.get(1)?,
                sample_count: row.get::<_, i64>(2)?.max(0) as u64,
                trained_at: row.get(3)?,
            })
        })?;
        rows.next().transpose().map_err(StoreError::from)
    }

    // ── Export ──

    /// Write a run's anomalies to a CSV file (with header) through DuckDB's
    /// `COPY`. Returns the number of rows written.
    pub fn export_anomalies_csv(&self, run_id: &str, path: &Path) -> Result<usize, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT count(*) FROM anomalies WHERE run_id = ?",
            params![run_id],
            |row| row.get(0),
        )?;
        let sql = format!(
            "COPY (
                SELECT a.vendor_id, ve.canonical_name AS vendor_name, a.year_month,
                       a.detector, a.severity, a.score, a.value, a.award_count
                FROM anomalies a
                LEFT JOIN vendor_entities ve ON a.vendor_id = ve.vendor_id
                WHERE a.run_id = '{}'
                ORDER BY a.vendor_id, a.year_month, a.detector
            ) TO '{}' (HEADER, DELIMITER ',')",
            sql_literal(run_id),
            sql_literal(&path.display().to_string()),
        );
        self.conn.execute_batch(&sql)?;
        info!(run_id, rows = n, path = %path.display(), "exported anomalies");
        Ok(n as usize)
    }

    // ── Escape hatch ──

    /// Execute arbitrary SQL and return Arrow RecordBatches.
    pub fn query_arrow(&self, sql: &str) -> Result<Vec<RecordBatch>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let batches: Vec<RecordBatch> = stmt.query_arrow([])?.collect();
        Ok(batches)
    }

    /// Access the underlying DuckDB connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn award_from_row(row: &duckdb::Row<'_>) -> duckdb::Result<RawAward> {
    Ok(RawAward {
        run_id: row.get(0)?,
        award_id: row.get(1)?,
        recipient_name: row.get(2)?,
        recipient_strong_id: row.get(3)?,
        awarding_agency: row.get(4)?,
        action_date: row.get(5)?,
        obligation_amount: row.get(6)?,
        place_of_performance: row.get(7)?,
    })
}

fn vendor_from_row(row: &duckdb::Row<'_>) -> duckdb::Result<VendorEntity> {
    Ok(VendorEntity {
        vendor_id: row.get(0)?,
        canonical_name: row.get(1)?,
        strong_id: row.get(2)?,
    })
}

fn ensure_open(run: &Run) -> Result<(), StoreError> {
    if run.status.is_terminal() {
        return Err(StoreError::RunFinalized {
            run_id: run.run_id.clone(),
            status: run.status.as_str(),
        });
    }
    Ok(())
}

/// Escape a value for use inside a single-quoted SQL literal.
fn sql_literal(raw: &str) -> String {
    raw.replace('\'', "''")
}

fn parse_month(table: &'static str, raw: &str) -> Result<YearMonth, StoreError> {
    raw.parse().map_err(|e| StoreError::Corrupt {
        table,
        detail: format!("{e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn award(run_id: &str, award_id: &str, name: &str, amount: f64, date: &str) -> RawAward {
        RawAward {
            run_id: run_id.into(),
            award_id: award_id.into(),
            recipient_name: name.into(),
            recipient_strong_id: None,
            awarding_agency: Some("Department of Energy".into()),
            action_date: Some(date.into()),
            obligation_amount: amount,
            place_of_performance: Some("MN".into()),
        }
    }

    fn monthly(run_id: &str, vendor_id: &str, ym: &str, sum: f64) -> MonthlyAggregate {
        MonthlyAggregate {
            run_id: run_id.into(),
            vendor_id: vendor_id.into(),
            year_month: ym.parse().unwrap(),
            obligation_sum: sum,
            award_count: 1,
            avg_award_size: sum,
            rolling_3m_mean: sum,
            rolling_3m_mad: 0.0,
        }
    }

    fn vendor(id: &str, name: &str, strong: Option<&str>) -> VendorEntity {
        VendorEntity {
            vendor_id: id.into(),
            canonical_name: name.into(),
            strong_id: strong.map(String::from),
        }
    }

    #[test]
    fn open_in_memory_has_schema() {
        let store = DuckStore::open().unwrap();
        assert_eq!(store.vendor_count().unwrap(), 0);
        assert_eq!(store.raw_award_count("r1").unwrap(), 0);
        let batches = store.query_arrow("SELECT 1 AS x").unwrap();
        assert_eq!(batches[0].num_rows(), 1);
    }

    #[test]
    fn init_schema_is_idempotent() {
        let store = DuckStore::open().unwrap();
        store.init_schema().unwrap();
        store.init_schema().unwrap();
    }

    #[test]
    fn run_lifecycle() {
        let store = DuckStore::open().unwrap();
        let run = store.create_run("r1").unwrap();
        assert_eq!(run.status, RunStatus::Pending);

        store.set_run_status("r1", RunStatus::Running, None).unwrap();
        store
            .set_run_status("r1", RunStatus::Completed, Some(42))
            .unwrap();
        let run = store.run("r1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.row_count_raw, 42);

        assert!(store.run("missing").unwrap().is_none());
        assert!(matches!(
            store.set_run_status("missing", RunStatus::Failed, None),
            Err(StoreError::RunNotFound(_))
        ));
    }

    #[test]
    fn terminal_run_is_frozen() {
        let store = DuckStore::open().unwrap();
        store.create_run("r1").unwrap();
        store.insert_raw_award(&award("r1", "A1", "Acme", 10.0, "2024-01-05")).unwrap();
        store.set_run_status("r1", RunStatus::Completed, Some(1)).unwrap();

        for status in [RunStatus::Pending, RunStatus::Running, RunStatus::Failed] {
            assert!(matches!(
                store.set_run_status("r1", status, Some(99)),
                Err(StoreError::RunFinalized { status: "completed", .. })
            ));
        }
        assert!(matches!(
            store.insert_raw_award(&award("r1", "A2", "Acme", 10.0, "2024-01-06")),
            Err(StoreError::RunFinalized { .. })
        ));

        let tmp = tempfile::TempDir::new().unwrap();
        let csv = tmp.path().join("late.csv");
        std::fs::write(
            &csv,
            "award_id,recipient_name,recipient_strong_id,awarding_agency,action_date,obligation_amount,place_of_performance\n\
             A3,Acme,,,2024-01-07,5,MN\n",
        )
        .unwrap();
        assert!(matches!(
            store.import_raw_awards("r1", &csv),
            Err(StoreError::RunFinalized { .. })
        ));

        let run = store.run("r1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.row_count_raw, 1);
        assert_eq!(store.raw_award_count("r1").unwrap(), 1);
    }

    #[test]
    fn duplicate_award_rejected() {
        let store = DuckStore::open().unwrap();
        let a = award("r1", "A1", "Acme", 100.0, "2024-01-05");
        store.insert_raw_award(&a).unwrap();
        let err = store.insert_raw_award(&a).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateAward { .. }));

        // Same identifier in another run is a different award.
        store
            .insert_raw_award(&award("r2", "A1", "Acme", 100.0, "2024-01-05"))
            .unwrap();
        assert_eq!(store.raw_award_count("r1").unwrap(), 1);
        assert_eq!(store.raw_award_count("r2").unwrap(), 1);
    }

    #[test]
    fn negative_amounts_and_missing_fields_survive() {
        let store = DuckStore::open().unwrap();
        let mut a = award("r1", "A1", "Acme", -2500.5, "2024-01-05");
        a.action_date = None;
        a.awarding_agency = None;
        store.insert_raw_award(&a).unwrap();
        let back = store.raw_awards("r1").unwrap();
        assert_eq!(back, vec![a]);
    }

    #[test]
    fn vendors_by_id_and_strong_id() {
        let store = DuckStore::open().unwrap();
        store.insert_vendor(&vendor("V000001", "Acme Corp", Some("123"))).unwrap();
        store.insert_vendor(&vendor("V000002", "Globex", None)).unwrap();
        // Insert-if-absent: the first canonical name wins.
        store.insert_vendor(&vendor("V000001", "Other", None)).unwrap();

        assert_eq!(store.vendor_count().unwrap(), 2);
        assert_eq!(
            store.vendor("V000001").unwrap().unwrap().canonical_name,
            "Acme Corp"
        );
        assert_eq!(
            store.vendor_by_strong_id("123").unwrap().unwrap().vendor_id,
            "V000001"
        );
        assert!(store.vendor_by_strong_id("999").unwrap().is_none());
        let ids: Vec<String> = store.vendors().unwrap().into_iter().map(|v| v.vendor_id).collect();
        assert_eq!(ids, vec!["V000001", "V000002"]);
    }

    #[test]
    fn create_vendor_rejects_taken_id() {
        let store = DuckStore::open().unwrap();
        store.create_vendor(&vendor("V000001", "Acme", None)).unwrap();
        assert!(matches!(
            store.create_vendor(&vendor("V000001", "Globex", None)),
            Err(StoreError::DuckDb(_))
        ));
        assert_eq!(store.vendor("V000001").unwrap().unwrap().canonical_name, "Acme");
    }

    #[test]
    fn mapping_insert_is_idempotent() {
        let store = DuckStore::open().unwrap();
        store.insert_award_vendor("r1", "A1", "V000001").unwrap();
        store.insert_award_vendor("r1", "A1", "V000002").unwrap();
        assert_eq!(store.mapping_count("r1").unwrap(), 1);
        assert_eq!(store.award_vendor_map("r1").unwrap()["A1"], "V000001");
        assert_eq!(store.run_vendor_count("r1").unwrap(), 1);
    }

    #[test]
    fn mapped_and_vendor_awards_join() {
        let store = DuckStore::open().unwrap();
        store.insert_raw_award(&award("r1", "A1", "Acme", 10.0, "2024-01-05")).unwrap();
        store.insert_raw_award(&award("r1", "A2", "Globex", 20.0, "2024-01-06")).unwrap();
        store.insert_raw_award(&award("r1", "A3", "Unmapped", 30.0, "2024-01-07")).unwrap();
        store.insert_award_vendor("r1", "A1", "V000001").unwrap();
        store.insert_award_vendor("r1", "A2", "V000002").unwrap();

        let mapped = store.mapped_awards("r1").unwrap();
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[0].0, "V000001");
        assert_eq!(mapped[0].1.award_id, "A1");

        let acme = store.vendor_awards("r1", "V000001").unwrap();
        assert_eq!(acme.len(), 1);
        assert_eq!(acme[0].obligation_amount, 10.0);
    }

    #[test]
    fn monthly_upsert_replaces() {
        let store = DuckStore::open().unwrap();
        store.insert_vendor(&vendor("V000001", "Acme", None)).unwrap();
        store.upsert_monthly(&[monthly("r1", "V000001", "2024-01", 10.0)]).unwrap();
        store.upsert_monthly(&[monthly("r1", "V000001", "2024-01", 99.0)]).unwrap();
        store.upsert_monthly(&[monthly("r1", "V000001", "2024-02", 5.0)]).unwrap();

        assert_eq!(store.monthly_row_count("r1").unwrap(), 2);
        let rows = store.monthly_rows("r1").unwrap();
        assert_eq!(rows[0].0.obligation_sum, 99.0);
        assert_eq!(rows[0].1, "Acme");
        assert_eq!(rows[1].0.year_month.to_string(), "2024-02");
    }

    #[test]
    fn vendor_context_present_and_absent() {
        let store = DuckStore::open().unwrap();
        store.insert_vendor(&vendor("V000001", "Acme", None)).unwrap();
        store
            .upsert_monthly(&[
                monthly("r1", "V000001", "2024-01", 10.0),
                monthly("r1", "V000001", "2024-02", 30.0),
            ])
            .unwrap();

        let ctx = store.vendor_context("r1", "V000001").unwrap().unwrap();
        assert_eq!(ctx.name, "Acme");
        assert_eq!(ctx.months_active, 2);
        assert_eq!(ctx.avg_monthly, 20.0);
        assert_eq!(ctx.min_monthly, 10.0);
        assert_eq!(ctx.max_monthly, 30.0);
        assert_eq!(ctx.total_spend, 40.0);

        assert!(store.vendor_context("r2", "V000001").unwrap().is_none());
        assert!(store.vendor_context("r1", "V999999").unwrap().is_none());
    }

    #[test]
    fn anomalies_replace_per_detector() {
        let store = DuckStore::open().unwrap();
        store.insert_vendor(&vendor("V000001", "Acme", None)).unwrap();
        let mk = |detector, severity| Anomaly {
            run_id: "r1".into(),
            vendor_id: "V000001".into(),
            vendor_name: None,
            year_month: "2024-03".parse().unwrap(),
            detector,
            severity,
            score: 5.0,
            value: 100.0,
            award_count: 2,
        };
        store
            .replace_anomalies("r1", DetectorKind::Statistical, &[mk(DetectorKind::Statistical, Severity::High)])
            .unwrap();
        store
            .replace_anomalies("r1", DetectorKind::Ml, &[mk(DetectorKind::Ml, Severity::Critical)])
            .unwrap();
        store
            .replace_anomalies("r1", DetectorKind::Statistical, &[mk(DetectorKind::Statistical, Severity::Medium)])
            .unwrap();

        let stored = store.anomalies("r1").unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].severity, Severity::Critical);
        assert_eq!(stored[0].vendor_name.as_deref(), Some("Acme"));
        assert_eq!(stored[1].severity, Severity::Medium);
    }

    #[test]
    fn model_roundtrip() {
        let store = DuckStore::open().unwrap();
        assert!(store.load_model("r1").unwrap().is_none());
        let model = StoredModel {
            run_id: "r1".into(),
            payload: "{\"trees\":[]}".into(),
            sample_count: 12,
            trained_at: "2024-01-01T00:00:00+00:00".into(),
        };
        store.save_model(&model).unwrap();
        store.save_model(&model).unwrap();
        assert_eq!(store.load_model("r1").unwrap(), Some(model));
    }

    #[test]
    fn import_csv() {
        let tmp = tempfile::TempDir::new().unwrap();
        let csv = tmp.path().join("awards.csv");
        std::fs::write(
            &csv,
            "award_id,recipient_name,recipient_strong_id,awarding_agency,action_date,obligation_amount,place_of_performance\n\
             A1,Acme Corp,111,Department of Energy,2024-01-05,1000.50,MN\n\
             A2,Globex,,Department of Defense,2024-02-07,-200,MN\n",
        )
        .unwrap();

        let store = DuckStore::open().unwrap();
        assert_eq!(store.import_raw_awards("r1", &csv).unwrap(), 2);
        let awards = store.raw_awards("r1").unwrap();
        assert_eq!(awards[0].recipient_strong_id.as_deref(), Some("111"));
        assert_eq!(awards[1].obligation_amount, -200.0);

        // Re-importing the same file collides with the existing awards.
        assert!(matches!(
            store.import_raw_awards("r1", &csv),
            Err(StoreError::DuplicateAward { .. })
        ));
        assert_eq!(store.raw_award_count("r1").unwrap(), 2);
    }

    #[test]
    fn import_csv_keeps_identifiers_as_text() {
        let tmp = tempfile::TempDir::new().unwrap();
        let csv = tmp.path().join("digits.csv");
        std::fs::write(
            &csv,
            "award_id,recipient_name,recipient_strong_id,awarding_agency,action_date,obligation_amount,place_of_performance\n\
             007,Acme Corp,001234567,Department of Energy,2024-01-05,1000,MN\n\
             7,Globex,009876543,Department of Defense,2024-01-09,250.25,MN\n",
        )
        .unwrap();

        let store = DuckStore::open().unwrap();
        assert_eq!(store.import_raw_awards("r1", &csv).unwrap(), 2);

        let awards = store.raw_awards("r1").unwrap();
        let ids: Vec<&str> = awards.iter().map(|a| a.award_id.as_str()).collect();
        assert_eq!(ids, vec!["007", "7"]);
        assert_eq!(awards[0].recipient_strong_id.as_deref(), Some("001234567"));
        assert_eq!(awards[1].recipient_strong_id.as_deref(), Some("009876543"));
        assert_eq!(awards[0].action_date.as_deref(), Some("2024-01-05"));
        assert_eq!(awards[1].obligation_amount, 250.25);
    }

    #[test]
    fn replace_anomalies_counts_only_matching_detector() {
        let store = DuckStore::open().unwrap();
        let mk = |detector| Anomaly {
            run_id: "r1".into(),
            vendor_id: "V000001".into(),
            vendor_name: None,
            year_month: "2024-03".parse().unwrap(),
            detector,
            severity: Severity::High,
            score: 4.0,
            value: 100.0,
            award_count: 1,
        };
        let mixed = [mk(DetectorKind::Statistical), mk(DetectorKind::Ml), mk(DetectorKind::Ml)];
        assert_eq!(
            store.replace_anomalies("r1", DetectorKind::Statistical, &mixed).unwrap(),
            1
        );
        assert_eq!(store.replace_anomalies("r1", DetectorKind::Ml, &mixed).unwrap(), 2);
        assert_eq!(store.anomalies("r1").unwrap().len(), 3);
    }

    #[test]
    fn export_anomalies_to_csv() {
        let store = DuckStore::open().unwrap();
        store.insert_vendor(&vendor("V000001", "O'Brien Supply", None)).unwrap();
        let a = Anomaly {
            run_id: "r1".into(),
            vendor_id: "V000001".into(),
            vendor_name: None,
            year_month: "2024-03".parse().unwrap(),
            detector: DetectorKind::Statistical,
            severity: Severity::High,
            score: 3.8,
            value: 1200.0,
            award_count: 3,
        };
        store
            .replace_anomalies("r1", DetectorKind::Statistical, &[a])
            .unwrap();

        let tmp = tempfile::TempDir::new().unwrap();
        let out = tmp.path().join("anomalies.csv");
        assert_eq!(store.export_anomalies_csv("r1", &out).unwrap(), 1);

        let text = std::fs::read_to_string(&out).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("vendor_id,vendor_name,year_month"));
        assert!(lines.next().unwrap().contains("O'Brien Supply"));
    }

    #[test]
    fn import_missing_file_errors() {
        let store = DuckStore::open().unwrap();
        let result = store.import_raw_awards("r1", Path::new("/nonexistent/awards.csv"));
        assert!(matches!(result, Err(StoreError::FileNotFound(_))));
    }

    #[test]
    fn persistent_reopen_keeps_rows() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db_path = tmp.path().join("test.duckdb");

        let store = DuckStore::open_persistent(&db_path).unwrap();
        store.insert_raw_award(&award("r1", "A1", "Acme", 10.0, "2024-01-05")).unwrap();
        drop(store);

        let store = DuckStore::open_persistent(&db_path).unwrap();
        assert_eq!(store.raw_award_count("r1").unwrap(), 1);
    }
}
