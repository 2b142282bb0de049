use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS snapshots (
  key TEXT PRIMARY KEY CHECK (length(trim(key)) > 0),
  value_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

const MIGRATION_002_CREATE_V2_TABLES_SQL: &str = r"
CREATE TABLE IF NOT EXISTS snapshots_v2 (
  key TEXT PRIMARY KEY CHECK (length(trim(key)) > 0),
  value_json TEXT NOT NULL,
  value_sha256 TEXT NOT NULL CHECK (value_sha256 LIKE 'sha256:%'),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshot_writes (
  write_id INTEGER PRIMARY KEY AUTOINCREMENT,
  key TEXT NOT NULL,
  value_sha256 TEXT NOT NULL CHECK (value_sha256 LIKE 'sha256:%'),
  written_at TEXT NOT NULL
);
";

const MIGRATION_002_REPLACE_TABLES_SQL: &str = r"
DROP TABLE snapshots;
ALTER TABLE snapshots_v2 RENAME TO snapshots;
CREATE INDEX IF NOT EXISTS idx_snapshot_writes_key ON snapshot_writes(key, write_id);
";

/// Key-addressed persistence of whole JSON collections.
///
/// `get` distinguishes a missing key (`Ok(None)`) from an unreachable backend (`Err`).
/// `put` replaces the entire value stored under the key.
pub trait SnapshotStore {
    /// # Errors
    /// Returns an error when the backend cannot be read.
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// # Errors
    /// Returns an error when the backend rejects or cannot persist the write.
    fn put(&mut self, key: &str, value: &Value) -> Result<()>;
}

/// `sha256:<hex>` digest of the compact JSON encoding of `value`.
///
/// # Errors
/// Returns an error when the value cannot be serialized.
pub fn value_digest(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value).context("failed to encode snapshot value")?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, Value>,
    writes: usize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a key without counting it as a write.
    #[must_use]
    pub fn with_entry(mut self, key: &str, value: Value) -> Self {
        self.entries.insert(key.to_string(), value);
        self
    }

    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes
    }
}

impl SnapshotStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &Value) -> Result<()> {
        self.entries.insert(key.to_string(), value.clone());
        self.writes += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotWrite {
    pub write_id: i64,
    pub key: String,
    pub value_sha256: String,
    pub written_at: String,
}

pub struct SqliteSnapshotStore {
    conn: Connection,
}

impl SqliteSnapshotStore {
    /// Open a SQLite-backed snapshot store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "snapshots")? {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        // Unrecorded database: infer its shape from the snapshots table.
        record_schema_version(&self.conn, 1)?;
        if table_has_column(&self.conn, "snapshots", "value_sha256")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }

        Ok(1)
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        if table_has_column(&self.conn, "snapshots", "value_sha256")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(());
        }

        let tx = self.conn.transaction().context("failed to start migration 002 transaction")?;
        tx.execute_batch(MIGRATION_002_CREATE_V2_TABLES_SQL)
            .context("failed to create v2 snapshot tables")?;

        for (key, value_json, updated_at) in load_v1_snapshots(&tx)? {
            let value: Value = serde_json::from_str(&value_json)
                .with_context(|| format!("snapshot {key} does not hold valid JSON"))?;
            let digest = value_digest(&value)?;
            tx.execute(
                "INSERT INTO snapshots_v2(key, value_json, value_sha256, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, value_json, digest, updated_at],
            )
            .with_context(|| format!("failed to copy snapshot {key} into v2 table"))?;
        }

        tx.execute_batch(MIGRATION_002_REPLACE_TABLES_SQL)
            .context("failed to replace v1 snapshot table")?;
        record_schema_version(&tx, 2)?;
        tx.commit().context("failed to commit migration 002")?;
        tracing::info!("applied snapshot store migration 002");
        Ok(())
    }

    /// Writes recorded for `key`, oldest first.
    ///
    /// # Errors
    /// Returns an error when the write log cannot be read.
    pub fn write_log(&self, key: &str) -> Result<Vec<SnapshotWrite>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT write_id, key, value_sha256, written_at
                 FROM snapshot_writes WHERE key = ?1 ORDER BY write_id",
            )
            .context("failed to prepare snapshot write log query")?;
        let rows = stmt.query_map(params![key], |row| {
            Ok(SnapshotWrite {
                write_id: row.get(0)?,
                key: row.get(1)?,
                value_sha256: row.get(2)?,
                written_at: row.get(3)?,
            })
        })?;

        let mut writes = Vec::new();
        for row in rows {
            writes.push(row?);
        }
        Ok(writes)
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let raw = self
            .conn
            .query_row("SELECT value_json FROM snapshots WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .with_context(|| format!("failed to read snapshot {key}"))?;

        raw.map(|value_json| {
            serde_json::from_str(&value_json)
                .with_context(|| format!("snapshot {key} does not hold valid JSON"))
        })
        .transpose()
    }

    fn put(&mut self, key: &str, value: &Value) -> Result<()> {
        let value_json = serde_json::to_string(value).context("failed to encode snapshot value")?;
        let digest = value_digest(value)?;
        let now = now_rfc3339()?;

        let tx = self.conn.transaction().context("failed to start snapshot transaction")?;
        tx.execute(
            "INSERT INTO snapshots(key, value_json, value_sha256, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
               value_json = excluded.value_json,
               value_sha256 = excluded.value_sha256,
               updated_at = excluded.updated_at",
            params![key, value_json, digest, now],
        )
        .with_context(|| format!("failed to write snapshot {key}"))?;
        tx.execute(
            "INSERT INTO snapshot_writes(key, value_sha256, written_at) VALUES (?1, ?2, ?3)",
            params![key, digest, now],
        )
        .with_context(|| format!("failed to log snapshot write for {key}"))?;
        tx.commit().with_context(|| format!("failed to commit snapshot {key}"))?;

        tracing::debug!(key, digest = %digest, "snapshot written");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct WorkerGetResponse {
    #[serde(default)]
    value: Option<Value>,
}

/// Client for the remote key-value worker.
///
/// The worker answers `GET <url>?key=<key>` with `{"value": "<json text>"}` and accepts
/// `POST <url>` with `{"key": ..., "value": "<json text>"}`.
pub struct WorkerKvStore {
    agent: ureq::Agent,
    base_url: String,
}

impl WorkerKvStore {
    /// # Errors
    /// Returns an error when `base_url` is blank.
    pub fn new(base_url: &str, timeout: Duration, user_agent: &str) -> Result<Self> {
        let base_url = base_url.trim();
        if base_url.is_empty() {
            return Err(anyhow!("worker url MUST be non-empty"));
        }

        let agent = ureq::AgentBuilder::new().timeout(timeout).user_agent(user_agent).build();
        Ok(Self { agent, base_url: base_url.to_string() })
    }
}

fn decode_worker_value(key: &str, raw: Option<Value>) -> Result<Option<Value>> {
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) if text == "null" => Ok(None),
        Some(Value::String(text)) => serde_json::from_str(&text)
            .map(Some)
            .with_context(|| format!("worker value for {key} is not valid JSON text")),
        Some(other) => Ok(Some(other)),
    }
}

impl SnapshotStore for WorkerKvStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let response = match self.agent.get(&self.base_url).query("key", key).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(err) => return Err(anyhow!(err).context(format!("failed to read {key} from worker"))),
        };

        let body: WorkerGetResponse = response
            .into_json()
            .with_context(|| format!("worker response for {key} is not JSON"))?;
        decode_worker_value(key, body.value)
    }

    fn put(&mut self, key: &str, value: &Value) -> Result<()> {
        let value_text = serde_json::to_string(value).context("failed to encode snapshot value")?;
        self.agent
            .post(&self.base_url)
            .send_json(serde_json::json!({ "key": key, "value": value_text }))
            .map_err(|err| anyhow!(err).context(format!("failed to write {key} to worker")))?;

        tracing::debug!(key, "snapshot written to worker");
        Ok(())
    }
}

fn load_v1_snapshots(conn: &Connection) -> Result<Vec<(String, String, String)>> {
    let mut stmt = conn
        .prepare("SELECT key, value_json, updated_at FROM snapshots ORDER BY key")
        .context("failed to prepare v1 snapshot query")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
    })?;

    let mut snapshots = Vec::new();
    for row in rows {
        snapshots.push(row.context("failed to read v1 snapshot row")?);
    }
    Ok(snapshots)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("failed to read current schema version")
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "snapshots")? {
        return Ok((0, false));
    }

    if table_has_column(conn, "snapshots", "value_sha256")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
