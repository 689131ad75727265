use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension as _, Row, TransactionBehavior, params};
use rust_decimal::Decimal;

use super::{Direction, SwapPhase, SwapRecord};
use crate::chain::TxId;

/// Append-only record of swap attempts. Every phase transition is one
/// snapshot; the latest snapshot of a request is its current state.
pub trait TradeLedger: Send {
    /// Durably stores `record`. Returns only after the write is committed.
    fn append(&mut self, record: &SwapRecord) -> Result<()>;

    fn get_latest(&self, request_id: &str) -> Result<Option<SwapRecord>>;

    fn get_latest_completed(&self, direction: Direction) -> Result<Option<SwapRecord>>;

    /// The record in a non-terminal phase, if any.
    fn in_flight(&self) -> Result<Option<SwapRecord>>;

    fn has_in_flight(&self) -> Result<bool> {
        Ok(self.in_flight()?.is_some())
    }

    /// All snapshots of one request, oldest first.
    fn history(&self, request_id: &str) -> Result<Vec<SwapRecord>>;

    /// Latest snapshot of every request, oldest request first.
    fn list_latest(&self) -> Result<Vec<SwapRecord>>;
}

pub type SharedLedger = Arc<Mutex<dyn TradeLedger>>;

pub fn shared<L: TradeLedger + 'static>(ledger: L) -> SharedLedger {
    Arc::new(Mutex::new(ledger))
}

#[derive(Debug)]
pub struct SqliteTradeLedger {
    conn: Connection,
    path: PathBuf,
}

const SNAPSHOT_COLUMNS: &str = r#"
  request_id,
  direction,
  amount,
  phase,
  failure_reason,
  source_tx_id,
  sequence,
  attestation_json,
  dest_tx_id,
  result_amount,
  started_at,
  updated_at,
  error
"#;

impl SqliteTradeLedger {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create ledger dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn query_one(&self, sql: &str, key: &str) -> Result<Option<SwapRecord>> {
        self.conn
            .query_row(sql, params![key], snapshot_from_row)
            .optional()
            .context("query swap snapshot")
    }

    fn query_many(&self, sql: &str, key: Option<&str>) -> Result<Vec<SwapRecord>> {
        let mut stmt = self.conn.prepare(sql).context("prepare snapshot query")?;
        let rows = match key {
            Some(key) => stmt.query_map(params![key], snapshot_from_row),
            None => stmt.query_map([], snapshot_from_row),
        }
        .context("query swap snapshots")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read swap snapshot row")?);
        }
        Ok(out)
    }
}

impl TradeLedger for SqliteTradeLedger {
    fn append(&mut self, record: &SwapRecord) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin ledger transaction")?;

        let previous = tx
            .query_row(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM swap_snapshots WHERE request_id = ?1 ORDER BY id DESC LIMIT 1"
                ),
                params![&record.request_id],
                snapshot_from_row,
            )
            .optional()
            .with_context(|| format!("load previous snapshot {}", record.request_id))?;

        match &previous {
            Some(prev) => prev
                .check_successor(record)
                .with_context(|| format!("reject snapshot for {}", record.request_id))?,
            None => {
                anyhow::ensure!(
                    matches!(record.phase, SwapPhase::Initiated | SwapPhase::Failed(_)),
                    "first snapshot of {} must be initiated or failed, got {}",
                    record.request_id,
                    record.phase
                );
            }
        }

        let attestation_json = record
            .attestation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("encode attestation")?;
        let sequence = record
            .sequence
            .map(i64::try_from)
            .transpose()
            .context("sequence out of range")?;

        tx.execute(
            &format!(
                "INSERT INTO swap_snapshots ({SNAPSHOT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                &record.request_id,
                record.direction.as_str(),
                record.amount.to_string(),
                record.phase.as_str(),
                record.phase.failure_reason().map(|r| r.as_str()),
                record.source_tx_id.as_ref().map(TxId::as_str),
                sequence,
                attestation_json,
                record.dest_tx_id.as_ref().map(TxId::as_str),
                record.result_amount.map(|a| a.to_string()),
                record.started_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
                record.error.as_deref(),
            ],
        )
        .with_context(|| format!("insert snapshot {} {}", record.request_id, record.phase))?;

        tx.commit()
            .with_context(|| format!("commit snapshot {}", record.request_id))?;
        Ok(())
    }

    fn get_latest(&self, request_id: &str) -> Result<Option<SwapRecord>> {
        self.query_one(
            &format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM swap_snapshots WHERE request_id = ?1 ORDER BY id DESC LIMIT 1"
            ),
            request_id,
        )
        .with_context(|| format!("get swap {request_id}"))
    }

    fn get_latest_completed(&self, direction: Direction) -> Result<Option<SwapRecord>> {
        self.query_one(
            &format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM swap_snapshots WHERE direction = ?1 AND phase = 'completed' ORDER BY id DESC LIMIT 1"
            ),
            direction.as_str(),
        )
        .with_context(|| format!("get latest completed {direction}"))
    }

    fn in_flight(&self) -> Result<Option<SwapRecord>> {
        let live = self
            .query_many(
                &format!(
                    r#"
SELECT {SNAPSHOT_COLUMNS}
FROM swap_snapshots s
WHERE s.id = (SELECT MAX(id) FROM swap_snapshots WHERE request_id = s.request_id)
  AND s.phase NOT IN ('completed', 'failed')
ORDER BY s.id
"#
                ),
                None,
            )
            .context("list in-flight swaps")?;
        anyhow::ensure!(
            live.len() <= 1,
            "ledger holds {} in-flight swaps, expected at most one",
            live.len()
        );
        Ok(live.into_iter().next())
    }

    fn history(&self, request_id: &str) -> Result<Vec<SwapRecord>> {
        self.query_many(
            &format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM swap_snapshots WHERE request_id = ?1 ORDER BY id"
            ),
            Some(request_id),
        )
        .with_context(|| format!("get history {request_id}"))
    }

    fn list_latest(&self) -> Result<Vec<SwapRecord>> {
        self.query_many(
            &format!(
                r#"
SELECT {SNAPSHOT_COLUMNS}
FROM swap_snapshots s
WHERE s.id = (SELECT MAX(id) FROM swap_snapshots WHERE request_id = s.request_id)
ORDER BY (SELECT MIN(id) FROM swap_snapshots WHERE request_id = s.request_id)
"#
            ),
            None,
        )
        .context("list swaps")
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS swap_snapshots (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  request_id TEXT NOT NULL,
  direction TEXT NOT NULL,
  amount TEXT NOT NULL,
  phase TEXT NOT NULL,
  failure_reason TEXT,
  source_tx_id TEXT,
  sequence INTEGER,
  attestation_json TEXT,
  dest_tx_id TEXT,
  result_amount TEXT,
  started_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  error TEXT
);
CREATE INDEX IF NOT EXISTS swap_snapshots_request_idx ON swap_snapshots(request_id, id);
CREATE INDEX IF NOT EXISTS swap_snapshots_phase_idx ON swap_snapshots(phase, direction);
"#,
    )
    .context("create tables")?;
    Ok(())
}

fn conversion_error(
    col: usize,
    ty: rusqlite::types::Type,
    msg: impl std::fmt::Display,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, ty, msg.to_string().into())
}

fn decimal_at(row: &Row<'_>, col: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(col)?;
    raw.map(|s| {
        s.parse::<Decimal>().map_err(|e| {
            conversion_error(col, rusqlite::types::Type::Text, format!("invalid decimal {s}: {e}"))
        })
    })
    .transpose()
}

fn timestamp_at(row: &Row<'_>, col: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(col)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            conversion_error(col, rusqlite::types::Type::Text, format!("invalid timestamp {raw}: {e}"))
        })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<SwapRecord> {
    let direction_str: String = row.get(1)?;
    let direction = direction_str
        .parse::<Direction>()
        .map_err(|e| conversion_error(1, rusqlite::types::Type::Text, e))?;

    let amount = decimal_at(row, 2)?
        .ok_or_else(|| conversion_error(2, rusqlite::types::Type::Null, "missing amount"))?;

    let phase_str: String = row.get(3)?;
    let reason_str: Option<String> = row.get(4)?;
    let phase = SwapPhase::parse(&phase_str, reason_str.as_deref())
        .map_err(|e| conversion_error(3, rusqlite::types::Type::Text, e))?;

    let sequence: Option<i64> = row.get(6)?;
    let sequence = sequence
        .map(|s| {
            u64::try_from(s).map_err(|_| {
                conversion_error(6, rusqlite::types::Type::Integer, format!("invalid sequence {s}"))
            })
        })
        .transpose()?;

    let attestation_json: Option<String> = row.get(7)?;
    let attestation = attestation_json
        .map(|json| {
            serde_json::from_str(&json).map_err(|e| {
                conversion_error(7, rusqlite::types::Type::Text, format!("invalid attestation: {e}"))
            })
        })
        .transpose()?;

    Ok(SwapRecord {
        request_id: row.get(0)?,
        direction,
        amount,
        phase,
        source_tx_id: row.get::<_, Option<String>>(5)?.map(TxId::new),
        sequence,
        attestation,
        dest_tx_id: row.get::<_, Option<String>>(8)?.map(TxId::new),
        result_amount: decimal_at(row, 9)?,
        started_at: timestamp_at(row, 10)?,
        updated_at: timestamp_at(row, 11)?,
        error: row.get(12)?,
    })
}
