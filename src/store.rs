//! Descriptor store: persistent users and recognition logs.
//!
//! Two tables: `users` (one row per enrolled identity, descriptor stored as
//! a JSON array of 128 floats) and `recognition_logs` (append-only event
//! rows, best-effort). The store is the source of truth; the vector index
//! is derived state and can always be rebuilt from `list_active`.
//!
//! `SqliteStore` shells out to the `sqlite3` CLI with `-json` output — one
//! short-lived connection per statement, WAL journal, busy_timeout for
//! cross-process writers.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

use crate::error::RecognitionError;
use crate::metrics::Metrics;

/// One enrolled identity.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: u64,
    pub external_id: String,
    pub display_name: String,
    pub client_ref: String,
    pub descriptor: Vec<f32>,
    pub confidence: f32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_recognition_at: Option<DateTime<Utc>>,
    pub recognition_count: u64,
}

/// Fields needed to enroll a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub external_id: String,
    pub display_name: String,
    pub client_ref: String,
    pub descriptor: Vec<f32>,
    pub confidence: f32,
}

/// Append-only recognition event.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub event: &'static str,
    pub external_id: Option<String>,
    pub matched: bool,
    pub distance: Option<f32>,
    pub processing_ms: f64,
    pub backend: String,
}

pub trait DescriptorStore: Send + Sync {
    /// Enroll a user. Fails with `Duplicate` when the external id collides
    /// with an active row.
    fn create(&self, user: &NewUser) -> Result<u64, RecognitionError>;

    /// Active user by external id.
    fn find_by_external_id(&self, external_id: &str) -> Result<Option<UserRecord>, RecognitionError>;

    fn find_by_id(&self, user_id: u64) -> Result<Option<UserRecord>, RecognitionError>;

    /// All active users, descriptors included.
    fn list_active(&self) -> Result<Vec<UserRecord>, RecognitionError>;

    /// Replace a user's descriptor atomically.
    fn update_descriptor(
        &self,
        user_id: u64,
        descriptor: &[f32],
        confidence: f32,
        updated_at: DateTime<Utc>,
    ) -> Result<(), RecognitionError>;

    fn soft_delete(&self, user_id: u64) -> Result<(), RecognitionError>;

    fn count_active(&self) -> Result<u64, RecognitionError>;

    /// Bump recognition bookkeeping after a successful match.
    fn record_recognition(&self, user_id: u64, at: DateTime<Utc>) -> Result<(), RecognitionError>;

    fn append_log(&self, event: &LogEvent) -> Result<(), RecognitionError>;

    /// Fire-and-forget log append. Failure never reaches the caller.
    fn log_best_effort(&self, event: &LogEvent) {
        if let Err(e) = self.append_log(event) {
            warn!("recognition log append failed: {}", e);
        }
    }
}

pub struct SqliteStore {
    path: PathBuf,
    metrics: Arc<Metrics>,
}

impl SqliteStore {
    pub fn open(path: &Path, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self {
            path: path.to_path_buf(),
            metrics,
        };

        store.exec("PRAGMA journal_mode=WAL;")?;
        store.exec("PRAGMA synchronous=FULL;")?;
        store.exec("PRAGMA temp_store=MEMORY;")?;
        store.exec("PRAGMA busy_timeout=5000;")?;

        store.apply_migrations()?;
        Ok(store)
    }

    fn exec(&self, sql: &str) -> anyhow::Result<()> {
        let output = Command::new("sqlite3")
            .arg(&self.path)
            .arg(sql)
            .output()
            .with_context(|| format!("running sqlite3 exec against {:?}", self.path))?;

        if !output.status.success() {
            return Err(anyhow!(
                "sqlite exec failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        Ok(())
    }

    fn query_json(&self, sql: &str) -> anyhow::Result<Vec<Value>> {
        let output = Command::new("sqlite3")
            .arg("-json")
            .arg(&self.path)
            .arg(sql)
            .output()
            .with_context(|| format!("running sqlite3 query against {:?}", self.path))?;

        if !output.status.success() {
            return Err(anyhow!(
                "sqlite query failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }

        if output.stdout.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<Value> = serde_json::from_slice(&output.stdout).with_context(|| {
            format!(
                "parsing sqlite json output: {}",
                String::from_utf8_lossy(&output.stdout)
            )
        })?;
        Ok(rows)
    }

    fn apply_migrations(&self) -> anyhow::Result<()> {
        let migration_sql = [
            "CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY AUTOINCREMENT, external_id TEXT NOT NULL, display_name TEXT NOT NULL, client_ref TEXT NOT NULL, descriptor_json TEXT NOT NULL, confidence REAL NOT NULL, active INTEGER NOT NULL DEFAULT 1, created_at TEXT NOT NULL, updated_at TEXT NOT NULL, last_recognition_at TEXT, recognition_count INTEGER NOT NULL DEFAULT 0)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_external_id_active ON users(external_id) WHERE active = 1",
            "CREATE INDEX IF NOT EXISTS idx_users_active ON users(active)",
            "CREATE TABLE IF NOT EXISTS recognition_logs (id INTEGER PRIMARY KEY AUTOINCREMENT, event TEXT NOT NULL, external_id TEXT, matched INTEGER NOT NULL, distance REAL, processing_ms REAL NOT NULL, backend TEXT NOT NULL, created_at TEXT NOT NULL)",
        ];

        for sql in migration_sql {
            self.exec(sql)?;
        }
        Ok(())
    }

    fn timed<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce() -> anyhow::Result<T>,
    ) -> Result<T, RecognitionError> {
        let start = Instant::now();
        let result = f();
        self.metrics
            .db_query_duration
            .observe(operation, start.elapsed().as_secs_f64());
        result.map_err(RecognitionError::internal)
    }

    fn row_to_user(row: &Value) -> anyhow::Result<UserRecord> {
        let descriptor_json = row["descriptor_json"].as_str().unwrap_or("[]");
        let descriptor: Vec<f32> = serde_json::from_str(descriptor_json)
            .with_context(|| format!("parsing descriptor for user row {}", row["id"]))?;

        Ok(UserRecord {
            user_id: row["id"].as_i64().unwrap_or_default() as u64,
            external_id: row["external_id"].as_str().unwrap_or_default().to_string(),
            display_name: row["display_name"].as_str().unwrap_or_default().to_string(),
            client_ref: row["client_ref"].as_str().unwrap_or_default().to_string(),
            descriptor,
            confidence: row["confidence"].as_f64().unwrap_or_default() as f32,
            active: row["active"].as_i64().unwrap_or_default() != 0,
            created_at: parse_ts(row["created_at"].as_str())?,
            updated_at: parse_ts(row["updated_at"].as_str())?,
            last_recognition_at: match row["last_recognition_at"].as_str() {
                Some(s) if !s.is_empty() => Some(parse_ts(Some(s))?),
                _ => None,
            },
            recognition_count: row["recognition_count"].as_i64().unwrap_or_default() as u64,
        })
    }
}

const USER_COLUMNS: &str = "id, external_id, display_name, client_ref, descriptor_json, confidence, active, created_at, updated_at, last_recognition_at, recognition_count";

impl DescriptorStore for SqliteStore {
    fn create(&self, user: &NewUser) -> Result<u64, RecognitionError> {
        let descriptor_json =
            serde_json::to_string(&user.descriptor).map_err(RecognitionError::internal)?;
        let now = Utc::now().to_rfc3339();

        let start = Instant::now();
        let result = self.query_json(&format!(
            "INSERT INTO users(external_id, display_name, client_ref, descriptor_json, confidence, active, created_at, updated_at) VALUES ('{}', '{}', '{}', '{}', {}, 1, '{}', '{}') RETURNING id;",
            sql_quote(&user.external_id),
            sql_quote(&user.display_name),
            sql_quote(&user.client_ref),
            sql_quote(&descriptor_json),
            user.confidence,
            now,
            now,
        ));
        self.metrics
            .db_query_duration
            .observe("create_user", start.elapsed().as_secs_f64());

        match result {
            Ok(rows) => rows
                .first()
                .and_then(|r| r["id"].as_i64())
                .map(|id| id as u64)
                .ok_or_else(|| RecognitionError::internal("insert returned no id")),
            Err(e) => {
                let msg = e.to_string();
                if msg.to_ascii_lowercase().contains("unique constraint failed") {
                    Err(RecognitionError::Duplicate(user.external_id.clone()))
                } else {
                    Err(RecognitionError::internal(e))
                }
            }
        }
    }

    fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<UserRecord>, RecognitionError> {
        self.timed("find_by_external_id", || {
            let rows = self.query_json(&format!(
                "SELECT {} FROM users WHERE external_id='{}' AND active=1 LIMIT 1;",
                USER_COLUMNS,
                sql_quote(external_id)
            ))?;
            rows.first().map(Self::row_to_user).transpose()
        })
    }

    fn find_by_id(&self, user_id: u64) -> Result<Option<UserRecord>, RecognitionError> {
        self.timed("find_by_id", || {
            let rows = self.query_json(&format!(
                "SELECT {} FROM users WHERE id={} LIMIT 1;",
                USER_COLUMNS, user_id
            ))?;
            rows.first().map(Self::row_to_user).transpose()
        })
    }

    fn list_active(&self) -> Result<Vec<UserRecord>, RecognitionError> {
        self.timed("list_active", || {
            let rows = self.query_json(&format!(
                "SELECT {} FROM users WHERE active=1 ORDER BY id;",
                USER_COLUMNS
            ))?;
            rows.iter().map(Self::row_to_user).collect()
        })
    }

    fn update_descriptor(
        &self,
        user_id: u64,
        descriptor: &[f32],
        confidence: f32,
        updated_at: DateTime<Utc>,
    ) -> Result<(), RecognitionError> {
        let descriptor_json =
            serde_json::to_string(descriptor).map_err(RecognitionError::internal)?;
        self.timed("update_descriptor", || {
            self.exec(&format!(
                "UPDATE users SET descriptor_json='{}', confidence={}, updated_at='{}' WHERE id={};",
                sql_quote(&descriptor_json),
                confidence,
                updated_at.to_rfc3339(),
                user_id
            ))
        })
    }

    fn soft_delete(&self, user_id: u64) -> Result<(), RecognitionError> {
        self.timed("soft_delete", || {
            self.exec(&format!(
                "UPDATE users SET active=0, updated_at='{}' WHERE id={};",
                Utc::now().to_rfc3339(),
                user_id
            ))
        })
    }

    fn count_active(&self) -> Result<u64, RecognitionError> {
        self.timed("count_active", || {
            let rows = self.query_json("SELECT COUNT(*) AS n FROM users WHERE active=1;")?;
            Ok(rows
                .first()
                .and_then(|r| r["n"].as_i64())
                .unwrap_or_default() as u64)
        })
    }

    fn record_recognition(&self, user_id: u64, at: DateTime<Utc>) -> Result<(), RecognitionError> {
        self.timed("record_recognition", || {
            self.exec(&format!(
                "UPDATE users SET recognition_count = recognition_count + 1, last_recognition_at='{}' WHERE id={};",
                at.to_rfc3339(),
                user_id
            ))
        })
    }

    fn append_log(&self, event: &LogEvent) -> Result<(), RecognitionError> {
        self.timed("append_log", || {
            self.exec(&format!(
                "INSERT INTO recognition_logs(event, external_id, matched, distance, processing_ms, backend, created_at) VALUES ('{}', {}, {}, {}, {}, '{}', '{}');",
                sql_quote(event.event),
                event
                    .external_id
                    .as_ref()
                    .map(|v| format!("'{}'", sql_quote(v)))
                    .unwrap_or_else(|| "NULL".to_string()),
                event.matched as i64,
                event
                    .distance
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "NULL".to_string()),
                event.processing_ms,
                sql_quote(&event.backend),
                Utc::now().to_rfc3339(),
            ))
        })
    }
}

fn parse_ts(value: Option<&str>) -> anyhow::Result<DateTime<Utc>> {
    let s = value.ok_or_else(|| anyhow!("missing timestamp column"))?;
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("parsing timestamp '{}'", s))?
        .with_timezone(&Utc))
}

fn sql_quote(value: &str) -> String {
    value.replace('\'', "''")
}

/// In-memory store for tests and the linear-fallback snapshot path.
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<Vec<UserRecord>>,
    logs: RwLock<Vec<LogEvent>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(Vec::new()),
            logs: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn log_count(&self) -> usize {
        self.logs.read().len()
    }
}

impl DescriptorStore for MemoryStore {
    fn create(&self, user: &NewUser) -> Result<u64, RecognitionError> {
        let mut users = self.users.write();
        if users
            .iter()
            .any(|u| u.active && u.external_id == user.external_id)
        {
            return Err(RecognitionError::Duplicate(user.external_id.clone()));
        }

        let user_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        users.push(UserRecord {
            user_id,
            external_id: user.external_id.clone(),
            display_name: user.display_name.clone(),
            client_ref: user.client_ref.clone(),
            descriptor: user.descriptor.clone(),
            confidence: user.confidence,
            active: true,
            created_at: now,
            updated_at: now,
            last_recognition_at: None,
            recognition_count: 0,
        });
        Ok(user_id)
    }

    fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<UserRecord>, RecognitionError> {
        Ok(self
            .users
            .read()
            .iter()
            .find(|u| u.active && u.external_id == external_id)
            .cloned())
    }

    fn find_by_id(&self, user_id: u64) -> Result<Option<UserRecord>, RecognitionError> {
        Ok(self
            .users
            .read()
            .iter()
            .find(|u| u.user_id == user_id)
            .cloned())
    }

    fn list_active(&self) -> Result<Vec<UserRecord>, RecognitionError> {
        Ok(self
            .users
            .read()
            .iter()
            .filter(|u| u.active)
            .cloned()
            .collect())
    }

    fn update_descriptor(
        &self,
        user_id: u64,
        descriptor: &[f32],
        confidence: f32,
        updated_at: DateTime<Utc>,
    ) -> Result<(), RecognitionError> {
        let mut users = self.users.write();
        let user = users
            .iter_mut()
            .find(|u| u.user_id == user_id)
            .ok_or_else(|| RecognitionError::NotFound(user_id.to_string()))?;
        user.descriptor = descriptor.to_vec();
        user.confidence = confidence;
        user.updated_at = updated_at;
        Ok(())
    }

    fn soft_delete(&self, user_id: u64) -> Result<(), RecognitionError> {
        let mut users = self.users.write();
        let user = users
            .iter_mut()
            .find(|u| u.user_id == user_id)
            .ok_or_else(|| RecognitionError::NotFound(user_id.to_string()))?;
        user.active = false;
        user.updated_at = Utc::now();
        Ok(())
    }

    fn count_active(&self) -> Result<u64, RecognitionError> {
        Ok(self.users.read().iter().filter(|u| u.active).count() as u64)
    }

    fn record_recognition(&self, user_id: u64, at: DateTime<Utc>) -> Result<(), RecognitionError> {
        let mut users = self.users.write();
        if let Some(user) = users.iter_mut().find(|u| u.user_id == user_id) {
            user.recognition_count += 1;
            user.last_recognition_at = Some(at);
        }
        Ok(())
    }

    fn append_log(&self, event: &LogEvent) -> Result<(), RecognitionError> {
        self.logs.write().push(event.clone());
        Ok(())
    }
}
