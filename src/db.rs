//! Local SQLite persistence for the shop ledger.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings helpers,
//! and the [`LedgerStore`] implementation. Every multi-row write runs inside
//! `BEGIN IMMEDIATE`, which takes the database write lock up front, so two
//! processes committing the same day serialize on SQLite itself.
//!
//! Decimals are stored as canonical strings to keep quantities exact.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    AttemptStatus, CommitAttempt, Correction, InventoryRecord, LedgerEntry, LedgerField,
};
use crate::store::{Inventory, LedgerStore};

/// Database connection plus where it lives.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Initialize the database at `{data_dir}/ledger.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas, and
/// runs any pending migrations. A file that fails to open is reported, never
/// deleted: it holds sealed ledger history.
pub fn init(data_dir: &Path) -> LedgerResult<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| LedgerError::Store(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join("ledger.db");
    info!("Opening ledger database at {}", db_path.display());

    let conn = open_and_configure(&db_path).map_err(|e| {
        error!(path = %db_path.display(), error = %e, "Ledger database open failed");
        e
    })?;

    run_migrations(&conn)?;

    info!("Ledger database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open a private in-memory database with the full schema.
pub fn open_in_memory() -> LedgerResult<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> LedgerResult<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = FULL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> LedgerResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Ledger schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating ledger database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: settings, inventory, ledger entries and corrections.
fn migrate_v1(conn: &Connection) -> LedgerResult<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- inventory (one row per item-location pair)
        CREATE TABLE IF NOT EXISTS inventory (
            item_id TEXT NOT NULL,
            location_id TEXT NOT NULL,
            quantity_on_hand TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (item_id, location_id)
        );

        -- ledger_entries (at most one per business day, sealed on insert)
        CREATE TABLE IF NOT EXISTS ledger_entries (
            business_date TEXT PRIMARY KEY,
            grand_total TEXT NOT NULL,
            total_cash TEXT NOT NULL,
            total_upi TEXT NOT NULL,
            total_credit TEXT NOT NULL,
            total_mixed TEXT NOT NULL,
            orders_json TEXT NOT NULL DEFAULT '[]',
            deductions_json TEXT NOT NULL DEFAULT '[]',
            excluded_json TEXT NOT NULL DEFAULT '[]',
            is_committed INTEGER NOT NULL DEFAULT 1,
            is_corrected INTEGER NOT NULL DEFAULT 0,
            committed_at TEXT NOT NULL,
            committed_by TEXT
        );

        -- ledger_corrections (append-only)
        CREATE TABLE IF NOT EXISTS ledger_corrections (
            id TEXT PRIMARY KEY,
            business_date TEXT NOT NULL REFERENCES ledger_entries(business_date),
            seq INTEGER NOT NULL,
            field TEXT NOT NULL,
            original_value TEXT NOT NULL,
            corrected_value TEXT NOT NULL,
            reason TEXT NOT NULL,
            corrected_by TEXT NOT NULL,
            corrected_at TEXT NOT NULL,
            UNIQUE(business_date, seq)
        );

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        LedgerError::Store(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1 (settings, inventory, ledger)");
    Ok(())
}

/// Migration v2: commit attempt journal for crash detection.
fn migrate_v2(conn: &Connection) -> LedgerResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS eod_commit_attempts (
            id TEXT PRIMARY KEY,
            business_date TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'started',
            started_at TEXT NOT NULL,
            finished_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_eod_commit_attempts_status
            ON eod_commit_attempts(status);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        LedgerError::Store(format!("migration v2: {e}"))
    })?;

    info!("Applied migration v2 (eod_commit_attempts table)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn date_key(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date(raw: &str) -> LedgerResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|e| LedgerError::Store(format!("bad business_date {raw:?}: {e}")))
}

fn parse_decimal(raw: &str) -> LedgerResult<Decimal> {
    Decimal::from_str(raw).map_err(|e| LedgerError::Store(format!("bad decimal {raw:?}: {e}")))
}

fn parse_timestamp(raw: &str) -> LedgerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LedgerError::Store(format!("bad timestamp {raw:?}: {e}")))
}

/// Raw `ledger_entries` row before decoding.
struct EntryRow {
    business_date: String,
    grand_total: String,
    total_cash: String,
    total_upi: String,
    total_credit: String,
    total_mixed: String,
    orders_json: String,
    deductions_json: String,
    excluded_json: String,
    is_committed: bool,
    is_corrected: bool,
    committed_at: String,
    committed_by: Option<String>,
}

const ENTRY_COLUMNS: &str = "business_date, grand_total, total_cash, total_upi, total_credit,
    total_mixed, orders_json, deductions_json, excluded_json, is_committed, is_corrected,
    committed_at, committed_by";

fn map_entry_row(row: &rusqlite::Row) -> rusqlite::Result<EntryRow> {
    Ok(EntryRow {
        business_date: row.get(0)?,
        grand_total: row.get(1)?,
        total_cash: row.get(2)?,
        total_upi: row.get(3)?,
        total_credit: row.get(4)?,
        total_mixed: row.get(5)?,
        orders_json: row.get(6)?,
        deductions_json: row.get(7)?,
        excluded_json: row.get(8)?,
        is_committed: row.get::<_, i64>(9)? != 0,
        is_corrected: row.get::<_, i64>(10)? != 0,
        committed_at: row.get(11)?,
        committed_by: row.get(12)?,
    })
}

fn decode_entry(conn: &Connection, row: EntryRow) -> LedgerResult<LedgerEntry> {
    let date = parse_date(&row.business_date)?;
    Ok(LedgerEntry {
        date,
        grand_total: parse_decimal(&row.grand_total)?,
        total_cash: parse_decimal(&row.total_cash)?,
        total_upi: parse_decimal(&row.total_upi)?,
        total_credit: parse_decimal(&row.total_credit)?,
        total_mixed: parse_decimal(&row.total_mixed)?,
        orders: serde_json::from_str(&row.orders_json)?,
        deductions: serde_json::from_str(&row.deductions_json)?,
        excluded_orders: serde_json::from_str(&row.excluded_json)?,
        is_committed: row.is_committed,
        is_corrected: row.is_corrected,
        corrections: load_corrections(conn, &row.business_date)?,
        committed_at: Some(parse_timestamp(&row.committed_at)?),
        committed_by: row.committed_by,
    })
}

fn load_corrections(conn: &Connection, business_date: &str) -> LedgerResult<Vec<Correction>> {
    let mut stmt = conn.prepare(
        "SELECT id, field, original_value, corrected_value, reason, corrected_by, corrected_at
         FROM ledger_corrections WHERE business_date = ?1 ORDER BY seq ASC",
    )?;
    let rows = stmt
        .query_map(params![business_date], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(
            |(id, field, original_value, corrected_value, reason, corrected_by, corrected_at)| {
                Ok(Correction {
                    id,
                    field: LedgerField::from_str(&field).map_err(LedgerError::Store)?,
                    original_value,
                    corrected_value,
                    reason,
                    corrected_by,
                    corrected_at: parse_timestamp(&corrected_at)?,
                })
            },
        )
        .collect()
}

fn read_entry(conn: &Connection, date: NaiveDate) -> LedgerResult<Option<LedgerEntry>> {
    let row = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE business_date = ?1"),
            params![date_key(date)],
            map_entry_row,
        )
        .optional()?;
    row.map(|r| decode_entry(conn, r)).transpose()
}

fn read_quantity(conn: &Connection, item_id: &str, location_id: &str) -> LedgerResult<Option<Decimal>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT quantity_on_hand FROM inventory WHERE item_id = ?1 AND location_id = ?2",
            params![item_id, location_id],
            |row| row.get(0),
        )
        .optional()?;
    raw.as_deref().map(parse_decimal).transpose()
}

impl DbState {
    fn lock(&self) -> LedgerResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LedgerError::Store(format!("connection lock poisoned: {e}")))
    }
}

/// Run `body` inside `BEGIN IMMEDIATE`; commit on `Ok`, roll back on `Err`.
fn in_transaction<T>(
    conn: &Connection,
    body: impl FnOnce(&Connection) -> LedgerResult<T>,
) -> LedgerResult<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;

    match body(conn) {
        Ok(value) => {
            if let Err(e) = conn.execute_batch("COMMIT") {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e.into());
            }
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// LedgerStore implementation
// ---------------------------------------------------------------------------

impl Inventory for DbState {
    fn quantity_on_hand(&self, item_id: &str, location_id: &str) -> LedgerResult<Option<Decimal>> {
        let conn = self.lock()?;
        read_quantity(&conn, item_id, location_id)
    }
}

impl LedgerStore for DbState {
    fn committed_entry(&self, date: NaiveDate) -> LedgerResult<Option<LedgerEntry>> {
        let conn = self.lock()?;
        read_entry(&conn, date)
    }

    fn entries_between(&self, from: NaiveDate, to: NaiveDate) -> LedgerResult<Vec<LedgerEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries
             WHERE business_date BETWEEN ?1 AND ?2
             ORDER BY business_date ASC"
        ))?;
        let rows = stmt
            .query_map(params![date_key(from), date_key(to)], map_entry_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(|r| decode_entry(&conn, r)).collect()
    }

    fn inventory_snapshot(&self) -> LedgerResult<Vec<InventoryRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT item_id, location_id, quantity_on_hand FROM inventory
             ORDER BY item_id ASC, location_id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(item, loc, qty)| Ok(InventoryRecord::new(item, loc, parse_decimal(&qty)?)))
            .collect()
    }

    fn put_inventory(&self, record: &InventoryRecord) -> LedgerResult<()> {
        if record.quantity_on_hand < Decimal::ZERO {
            return Err(LedgerError::Store(format!(
                "negative stock for {}: {}",
                record.key(),
                record.quantity_on_hand
            )));
        }
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO inventory (item_id, location_id, quantity_on_hand, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(item_id, location_id) DO UPDATE SET
                quantity_on_hand = excluded.quantity_on_hand,
                updated_at = excluded.updated_at",
            params![
                record.item_id,
                record.location_id,
                record.quantity_on_hand.to_string()
            ],
        )?;
        Ok(())
    }

    fn commit_day(&self, entry: &LedgerEntry, attempt_id: &str) -> LedgerResult<()> {
        let conn = self.lock()?;
        let key = date_key(entry.date);
        let orders_json = serde_json::to_string(&entry.orders)?;
        let deductions_json = serde_json::to_string(&entry.deductions)?;
        let excluded_json = serde_json::to_string(&entry.excluded_orders)?;
        let committed_at = entry.committed_at.unwrap_or_else(Utc::now).to_rfc3339();

        in_transaction(&conn, |conn| {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM ledger_entries WHERE business_date = ?1",
                    params![key],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                return Err(LedgerError::AlreadyCommitted { date: entry.date });
            }

            for d in &entry.deductions {
                let on_hand =
                    read_quantity(conn, &d.item_id, &d.location_id)?.unwrap_or(Decimal::ZERO);
                let remaining = on_hand - d.quantity;
                if remaining < Decimal::ZERO {
                    error!(
                        date = %entry.date,
                        item_id = %d.item_id,
                        location_id = %d.location_id,
                        on_hand = %on_hand,
                        required = %d.quantity,
                        "Stock short inside commit transaction; rolling back"
                    );
                    return Err(LedgerError::Consistency(format!(
                        "{}@{} would go negative during commit (on hand {on_hand}, deducting {})",
                        d.item_id, d.location_id, d.quantity
                    )));
                }
                conn.execute(
                    "UPDATE inventory SET quantity_on_hand = ?1, updated_at = datetime('now')
                     WHERE item_id = ?2 AND location_id = ?3",
                    params![remaining.to_string(), d.item_id, d.location_id],
                )?;
            }

            conn.execute(
                "INSERT INTO ledger_entries (
                    business_date, grand_total, total_cash, total_upi, total_credit,
                    total_mixed, orders_json, deductions_json, excluded_json,
                    is_committed, is_corrected, committed_at, committed_by
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, 0, ?10, ?11)",
                params![
                    key,
                    entry.grand_total.to_string(),
                    entry.total_cash.to_string(),
                    entry.total_upi.to_string(),
                    entry.total_credit.to_string(),
                    entry.total_mixed.to_string(),
                    orders_json,
                    deductions_json,
                    excluded_json,
                    committed_at,
                    entry.committed_by,
                ],
            )?;

            conn.execute(
                "UPDATE eod_commit_attempts SET status = 'committed', finished_at = ?1
                 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), attempt_id],
            )?;

            Ok(())
        })
    }

    fn append_correction(&self, date: NaiveDate, correction: &Correction) -> LedgerResult<LedgerEntry> {
        let conn = self.lock()?;
        let key = date_key(date);

        in_transaction(&conn, |conn| {
            let current = match read_entry(conn, date)? {
                Some(entry) if entry.is_committed => entry,
                _ => {
                    return Err(LedgerError::InvalidCorrection(format!(
                        "no committed ledger entry for {date}"
                    )))
                }
            };
            let effective = current.effective_value(&correction.field);
            if effective.as_deref() != Some(correction.original_value.as_str()) {
                warn!(date = %date, field = %correction.field, expected = %correction.original_value,
                    "Correction based on a stale value; not appended");
                return Err(LedgerError::Consistency(format!(
                    "{} changed since the correction was drafted (now {})",
                    correction.field,
                    effective.unwrap_or_default()
                )));
            }

            let next_seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM ledger_corrections WHERE business_date = ?1",
                params![key],
                |row| row.get(0),
            )?;

            conn.execute(
                "INSERT INTO ledger_corrections (
                    id, business_date, seq, field, original_value, corrected_value,
                    reason, corrected_by, corrected_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    correction.id,
                    key,
                    next_seq,
                    correction.field.to_string(),
                    correction.original_value,
                    correction.corrected_value,
                    correction.reason,
                    correction.corrected_by,
                    correction.corrected_at.to_rfc3339(),
                ],
            )?;

            conn.execute(
                "UPDATE ledger_entries SET is_corrected = 1 WHERE business_date = ?1",
                params![key],
            )?;

            Ok(())
        })?;

        read_entry(&conn, date)?.ok_or_else(|| {
            LedgerError::Store(format!("ledger entry for {date} vanished after correction"))
        })
    }

    fn begin_commit_attempt(&self, date: NaiveDate) -> LedgerResult<CommitAttempt> {
        let attempt = CommitAttempt {
            id: Uuid::new_v4().to_string(),
            date,
            started_at: Utc::now(),
            status: AttemptStatus::Started,
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO eod_commit_attempts (id, business_date, status, started_at)
             VALUES (?1, ?2, 'started', ?3)",
            params![attempt.id, date_key(date), attempt.started_at.to_rfc3339()],
        )?;
        Ok(attempt)
    }

    fn finish_commit_attempt(&self, attempt_id: &str, status: AttemptStatus) -> LedgerResult<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE eod_commit_attempts SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), attempt_id],
        )?;
        if updated == 0 {
            warn!(attempt_id = %attempt_id, "Commit attempt not found when finishing");
            return Err(LedgerError::Store(format!(
                "commit attempt not found: {attempt_id}"
            )));
        }
        Ok(())
    }

    fn open_commit_attempts(&self) -> LedgerResult<Vec<CommitAttempt>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, business_date, status, started_at FROM eod_commit_attempts
             WHERE status = 'started' ORDER BY started_at ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, date, status, started_at)| {
                Ok(CommitAttempt {
                    id,
                    date: parse_date(&date)?,
                    started_at: parse_timestamp(&started_at)?,
                    status: AttemptStatus::from_str(&status).map_err(LedgerError::Store)?,
                })
            })
            .collect()
    }
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LedgerOrder, PaymentMethod, StockDeduction};
    use rust_decimal_macros::dec;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    /// Helper: list table names in the database.
    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    fn seeded() -> DbState {
        let db = open_in_memory().expect("open db");
        db.put_inventory(&InventoryRecord::new("A", "main", dec!(10))).unwrap();
        db.put_inventory(&InventoryRecord::new("B", "main", dec!(5))).unwrap();
        db
    }

    fn entry(deductions: Vec<StockDeduction>) -> LedgerEntry {
        LedgerEntry {
            date: day(),
            grand_total: dec!(700),
            total_cash: dec!(500),
            total_upi: dec!(200),
            total_credit: Decimal::ZERO,
            total_mixed: Decimal::ZERO,
            orders: vec![LedgerOrder {
                order_id: "ORD-1".into(),
                customer_name: Some("Ravi".into()),
                final_amount: dec!(500),
                payment_method: PaymentMethod::Cash,
                verified_by: Some("u-2".into()),
            }],
            deductions,
            excluded_orders: Vec::new(),
            is_committed: true,
            is_corrected: false,
            corrections: Vec::new(),
            committed_at: Some(Utc::now()),
            committed_by: Some("boss".into()),
        }
    }

    fn deduct(item: &str, qty: Decimal) -> StockDeduction {
        StockDeduction {
            item_id: item.into(),
            location_id: "main".into(),
            quantity: qty,
        }
    }

    fn correction(id: &str, original: &str, value: &str) -> Correction {
        Correction {
            id: id.into(),
            field: LedgerField::TotalCash,
            original_value: original.into(),
            corrected_value: value.into(),
            reason: "drawer recount".into(),
            corrected_by: "boss".into(),
            corrected_at: Utc::now(),
        }
    }

    // ------------------------------------------------------------------
    // Migration tests
    // ------------------------------------------------------------------

    #[test]
    fn test_migrations_v1_to_latest() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        for expected in [
            "local_settings",
            "inventory",
            "ledger_entries",
            "ledger_corrections",
            "eod_commit_attempts",
            "schema_version",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_settings_upsert() {
        let db = open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        assert_eq!(get_setting(&conn, "ledger", "x"), None);
        set_setting(&conn, "ledger", "x", "1").unwrap();
        set_setting(&conn, "ledger", "x", "2").unwrap();
        assert_eq!(get_setting(&conn, "ledger", "x").as_deref(), Some("2"));
    }

    #[test]
    fn test_init_creates_file() {
        let dir = std::env::temp_dir().join(format!("shop-ledger-init-{}", Uuid::new_v4()));
        let db = init(&dir).expect("init");
        assert!(db.db_path.exists());
        drop(db);
        // Reopen: migrations already applied
        let db = init(&dir).expect("reinit");
        assert!(db.inventory_snapshot().unwrap().is_empty());
        drop(db);
        let _ = fs::remove_dir_all(&dir);
    }

    // ------------------------------------------------------------------
    // Store tests
    // ------------------------------------------------------------------

    #[test]
    fn test_commit_round_trip() {
        let db = seeded();
        let attempt = db.begin_commit_attempt(day()).unwrap();
        let sealed = entry(vec![deduct("A", dec!(4)), deduct("B", dec!(2))]);
        db.commit_day(&sealed, &attempt.id).unwrap();

        assert_eq!(db.quantity_on_hand("A", "main").unwrap(), Some(dec!(6)));
        assert_eq!(db.quantity_on_hand("B", "main").unwrap(), Some(dec!(3)));

        let stored = db.committed_entry(day()).unwrap().expect("entry stored");
        assert_eq!(stored.grand_total, dec!(700));
        assert_eq!(stored.orders, sealed.orders);
        assert_eq!(stored.deductions, sealed.deductions);
        assert_eq!(stored.committed_by.as_deref(), Some("boss"));
        assert!(stored.is_committed);
        assert!(db.open_commit_attempts().unwrap().is_empty());
    }

    #[test]
    fn test_commit_duplicate_date_rejected() {
        let db = seeded();
        let attempt = db.begin_commit_attempt(day()).unwrap();
        db.commit_day(&entry(vec![deduct("A", dec!(4))]), &attempt.id).unwrap();

        let again = db.begin_commit_attempt(day()).unwrap();
        let err = db
            .commit_day(&entry(vec![deduct("A", dec!(4))]), &again.id)
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyCommitted { .. }));
        assert_eq!(db.quantity_on_hand("A", "main").unwrap(), Some(dec!(6)));
        // The losing attempt is still open until the engine finishes it
        assert_eq!(db.open_commit_attempts().unwrap().len(), 1);
    }

    #[test]
    fn test_commit_shortfall_rolls_back_everything() {
        let db = seeded();
        let attempt = db.begin_commit_attempt(day()).unwrap();
        // A is fine, B is short: A must not be decremented either
        let err = db
            .commit_day(&entry(vec![deduct("A", dec!(4)), deduct("B", dec!(9))]), &attempt.id)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Consistency(_)));
        assert_eq!(db.quantity_on_hand("A", "main").unwrap(), Some(dec!(10)));
        assert_eq!(db.quantity_on_hand("B", "main").unwrap(), Some(dec!(5)));
        assert!(db.committed_entry(day()).unwrap().is_none());

        // Connection is usable after rollback
        db.finish_commit_attempt(&attempt.id, AttemptStatus::Failed).unwrap();
        assert!(db.open_commit_attempts().unwrap().is_empty());
    }

    #[test]
    fn test_corrections_are_appended_in_order() {
        let db = seeded();
        let attempt = db.begin_commit_attempt(day()).unwrap();
        db.commit_day(&entry(Vec::new()), &attempt.id).unwrap();

        db.append_correction(day(), &correction("c1", "500", "480")).unwrap();
        let updated = db.append_correction(day(), &correction("c2", "480", "490")).unwrap();

        assert!(updated.is_corrected);
        let values: Vec<&str> = updated
            .corrections
            .iter()
            .map(|c| c.corrected_value.as_str())
            .collect();
        assert_eq!(values, vec!["480", "490"]);
        assert_eq!(updated.total_cash, dec!(500));
    }

    #[test]
    fn test_correction_on_missing_day_rejected() {
        let db = seeded();
        let err = db.append_correction(day(), &correction("c1", "500", "480")).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidCorrection(_)));
    }

    #[test]
    fn test_correction_from_stale_value_not_appended() {
        let db = seeded();
        let attempt = db.begin_commit_attempt(day()).unwrap();
        db.commit_day(&entry(Vec::new()), &attempt.id).unwrap();
        db.append_correction(day(), &correction("c1", "500", "480")).unwrap();

        // Drafted against the frozen 500 after 480 was already recorded
        let err = db
            .append_correction(day(), &correction("c2", "500", "470"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Consistency(_)));

        let stored = db.committed_entry(day()).unwrap().unwrap();
        assert_eq!(stored.corrections.len(), 1);
        assert_eq!(stored.corrections[0].id, "c1");
    }

    #[test]
    fn test_entries_between_and_snapshot() {
        let db = seeded();
        let attempt = db.begin_commit_attempt(day()).unwrap();
        db.commit_day(&entry(Vec::new()), &attempt.id).unwrap();

        let from = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        assert_eq!(db.entries_between(from, to).unwrap().len(), 1);
        assert!(db.entries_between(to, to).unwrap().is_empty());

        let snapshot = db.inventory_snapshot().unwrap();
        let keys: Vec<String> = snapshot.iter().map(|r| r.key().to_string()).collect();
        assert_eq!(keys, vec!["A@main", "B@main"]);
    }

    #[test]
    fn test_decimal_precision_preserved() {
        let db = open_in_memory().unwrap();
        db.put_inventory(&InventoryRecord::new("RICE", "main", dec!(12.375))).unwrap();
        let attempt = db.begin_commit_attempt(day()).unwrap();
        db.commit_day(&entry(vec![deduct("RICE", dec!(0.125))]), &attempt.id)
            .unwrap();
        assert_eq!(db.quantity_on_hand("RICE", "main").unwrap(), Some(dec!(12.250)));
    }

    #[test]
    fn test_finish_unknown_attempt_errors() {
        let db = open_in_memory().unwrap();
        assert!(db.finish_commit_attempt("nope", AttemptStatus::Failed).is_err());
    }
}
