//! SQLite storage implementation
//!
//! Writer and reader connections are held behind separate `Mutex`es so
//! `Storage` is `Send + Sync` and callers share it as `Arc<Storage>` rather
//! than `Arc<Mutex<Storage>>`. All methods take `&self`.

use chrono::{DateTime, NaiveDate, Utc};
use directories::ProjectDirs;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::model::{AccessMode, LifecycleState, Source};

/// Storage error type.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("memory not found: {0}")]
    NotFound(i64),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("initialization error: {0}")]
    Init(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Outcome of `insert_memory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// The active-uniqueness index (I1) rejected the insert: another
    /// writer already holds an active row with this (user_id, content_hash).
    Duplicate,
}

/// Arguments to `insert_memory`.
pub struct InsertMemoryInput<'a> {
    pub session_id: &'a str,
    pub user_id: &'a str,
    pub memory_date: NaiveDate,
    pub subject: &'a str,
    pub importance: i32,
    pub access_mode: AccessMode,
    pub state: LifecycleState,
    pub supersedes_memory_id: Option<i64>,
    pub confidence_score: f64,
    pub source: Source,
    pub content: &'a str,
}

/// An active memory as returned by `get_active_memories_by_subject`:
/// identity plus its latest content.
#[derive(Debug, Clone)]
pub struct ActiveMemory {
    pub id: i64,
    pub content: String,
    pub confidence_score: f64,
    pub source: Source,
    pub importance: i32,
}

/// A retrieved memory row, content joined from its latest version.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MemoryRecord {
    pub id: i64,
    pub user_id: String,
    pub subject: String,
    pub content: String,
    pub importance: i32,
    pub access_mode: String,
    pub state: String,
    pub confidence_score: f64,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// Parameters for `retrieve_memories`.
pub struct RetrieveQuery<'a> {
    pub user_id: &'a str,
    pub query_substring: &'a str,
    pub scope: &'a [String],
    pub state_filter: LifecycleState,
    pub limit: u32,
    /// Subjects the caller's allow-list admits for *other* users'
    /// `shared` rows (I5). `["*"]` admits any subject; empty admits none.
    /// This is independent of `scope`, which narrows the caller's own
    /// rows.
    pub shared_allowed_subjects: &'a [String],
}

pub struct Storage {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl Storage {
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 15000;",
        )?;
        Ok(())
    }

    /// Open (creating if necessary) the store at `db_path`, or at the
    /// platform default data directory when `None`.
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("dev", "memlock", "memlock").ok_or_else(|| {
                    StorageError::Init("could not determine project directories".to_string())
                })?;

                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let perms = std::fs::Permissions::from_mode(0o700);
                    let _ = std::fs::set_permissions(data_dir, perms);
                }
                data_dir.join("memlock.db")
            }
        };

        let writer_conn = Connection::open(&path)?;

        #[cfg(unix)]
        if path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&path, perms);
        }

        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
        })
    }

    /// Insert a new memory row and its version-1 content in a single
    /// transaction. Returns `Duplicate` when the active-uniqueness index
    /// (I1) rejects the insert.
    pub fn insert_memory(&self, input: InsertMemoryInput<'_>) -> Result<InsertOutcome> {
        let content_hash = content_hash(input.content);
        let now = Utc::now();

        let mut conn = self.writer.lock().expect("writer mutex poisoned");
        let tx = conn.transaction()?;

        let insert_result = tx.execute(
            "INSERT INTO memories (
                session_id, user_id, memory_date, subject, importance,
                access_mode, state, supersedes_memory_id, confidence_score,
                source, content_hash, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                input.session_id,
                input.user_id,
                input.memory_date.format("%Y-%m-%d").to_string(),
                input.subject,
                input.importance,
                input.access_mode.as_str(),
                input.state.as_str(),
                input.supersedes_memory_id,
                input.confidence_score,
                input.source.as_str(),
                content_hash,
                now.to_rfc3339(),
            ],
        );

        let memory_id = match insert_result {
            Ok(_) => tx.last_insert_rowid(),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                // Transaction already borrowed the lock; rolling back is
                // implicit on drop.
                return Ok(InsertOutcome::Duplicate);
            }
            Err(e) => return Err(e.into()),
        };

        tx.execute(
            "INSERT INTO memory_versions (memory_id, content, version, timestamp)
             VALUES (?1, ?2, 1, ?3)",
            params![memory_id, input.content, now.to_rfc3339()],
        )?;

        tx.commit()?;

        Ok(InsertOutcome::Inserted(memory_id))
    }

    /// Compare-and-set: transition `id` to `new_state` only if its current
    /// state differs. Returns true iff exactly one row changed. This is
    /// the OCC primitive the policy engine's supersede path relies on.
    pub fn set_memory_state(&self, id: i64, new_state: LifecycleState) -> Result<bool> {
        let conn = self.writer.lock().expect("writer mutex poisoned");
        let changed = conn.execute(
            "UPDATE memories SET state = ?1 WHERE id = ?2 AND state != ?1",
            params![new_state.as_str(), id],
        )?;
        Ok(changed > 0)
    }

    /// Active memories for (session, user, subject), joined to their
    /// latest content, in ascending id order. Scan order is a contract:
    /// the policy engine's conflict detection treats the first collision
    /// in this order as the conflict target.
    pub fn get_active_memories_by_subject(
        &self,
        session_id: &str,
        user_id: &str,
        subject: &str,
    ) -> Result<Vec<ActiveMemory>> {
        let conn = self.reader.lock().expect("reader mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT m.id, mv.content, m.confidence_score, m.source, m.importance
             FROM memories m
             JOIN memory_versions mv ON mv.memory_id = m.id
             WHERE m.session_id = ?1 AND m.user_id = ?2 AND m.subject = ?3
               AND m.state = 'active'
               AND mv.version = (SELECT MAX(version) FROM memory_versions WHERE memory_id = m.id)
             ORDER BY m.id ASC",
        )?;

        let rows = stmt.query_map(params![session_id, user_id, subject], |row| {
            let source_str: String = row.get(3)?;
            Ok(ActiveMemory {
                id: row.get(0)?,
                content: row.get(1)?,
                confidence_score: row.get(2)?,
                source: source_str.parse().unwrap_or(Source::Inferred),
                importance: row.get(4)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Deterministic, ranked retrieval (§4.4 ordering, extended per I5 with
    /// a shared-visibility clause: rows owned by another user are visible
    /// only when `access_mode='shared'` and their subject is admitted by
    /// the caller's allow-list).
    pub fn retrieve_memories(&self, query: RetrieveQuery<'_>) -> Result<Vec<MemoryRecord>> {
        let allow_all_scope = query.scope.iter().any(|s| s == "*");
        let allow_all_shared = query.shared_allowed_subjects.iter().any(|s| s == "*");

        let conn = self.reader.lock().expect("reader mutex poisoned");

        // Build the WHERE clause and its bound parameters together so
        // positional placeholders always line up, regardless of which
        // optional clauses are present.
        let mut next_idx = 3usize; // ?1 = user_id, ?2 = state_filter
        let mut param_values: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(query.user_id.to_string()),
            Box::new(query.state_filter.as_str().to_string()),
        ];

        let query_clause = if query.query_substring.is_empty() {
            String::new()
        } else {
            let idx = next_idx;
            next_idx += 1;
            param_values.push(Box::new(format!("%{}%", query.query_substring)));
            format!("AND mv.content LIKE ?{idx}")
        };

        let subject_placeholders = if allow_all_scope || query.scope.is_empty() {
            String::new()
        } else {
            let placeholders: Vec<String> = query
                .scope
                .iter()
                .map(|subject| {
                    let idx = next_idx;
                    next_idx += 1;
                    param_values.push(Box::new(subject.clone()));
                    format!("?{idx}")
                })
                .collect();
            format!("AND m.subject IN ({})", placeholders.join(", "))
        };

        // I5: a row owned by another user is visible only if it is
        // `shared` and its subject is in the caller's allow-list.
        let shared_clause = if query.shared_allowed_subjects.is_empty() {
            "m.user_id = ?1".to_string()
        } else if allow_all_shared {
            "(m.user_id = ?1 OR m.access_mode = 'shared')".to_string()
        } else {
            let placeholders: Vec<String> = query
                .shared_allowed_subjects
                .iter()
                .map(|subject| {
                    let idx = next_idx;
                    next_idx += 1;
                    param_values.push(Box::new(subject.clone()));
                    format!("?{idx}")
                })
                .collect();
            format!(
                "(m.user_id = ?1 OR (m.access_mode = 'shared' AND m.subject IN ({})))",
                placeholders.join(", ")
            )
        };

        let limit_idx = next_idx;
        param_values.push(Box::new(query.limit));

        let sql = format!(
            "SELECT m.id, m.user_id, m.subject, mv.content, m.importance,
                    m.access_mode, m.state, m.confidence_score, m.source, m.created_at
             FROM memories m
             JOIN memory_versions mv ON mv.memory_id = m.id
             WHERE {shared_clause} AND m.state = ?2
               AND mv.version = (SELECT MAX(version) FROM memory_versions WHERE memory_id = m.id)
               {query_clause}
               {subject_placeholders}
             ORDER BY
                CASE m.source WHEN 'manual' THEN 3 WHEN 'imported' THEN 2 WHEN 'inferred' THEN 1 ELSE 0 END DESC,
                m.confidence_score DESC,
                m.created_at DESC,
                m.id DESC
             LIMIT ?{limit_idx}"
        );

        let mut stmt = conn.prepare(&sql)?;

        let param_refs: Vec<&dyn rusqlite::ToSql> =
            param_values.iter().map(|b| b.as_ref()).collect();

        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let created_at_str: String = row.get(9)?;
            Ok(MemoryRecord {
                id: row.get(0)?,
                user_id: row.get(1)?,
                subject: row.get(2)?,
                content: row.get(3)?,
                importance: row.get(4)?,
                access_mode: row.get(5)?,
                state: row.get(6)?,
                confidence_score: row.get(7)?,
                source: row.get(8)?,
                created_at: DateTime::parse_from_rfc3339(&created_at_str)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Fixed-window rate limiter: atomic upsert-increment, returning
    /// whether the post-increment count is within `max_requests`.
    /// Prunes expired windows opportunistically in the same statement
    /// batch.
    pub fn check_rate_limit(
        &self,
        user_id: &str,
        endpoint: &str,
        max_requests: i64,
        window_seconds: i64,
    ) -> Result<bool> {
        let now = Utc::now().timestamp();
        let window_start = now - (now.rem_euclid(window_seconds));

        let conn = self.writer.lock().expect("writer mutex poisoned");

        conn.execute(
            "DELETE FROM rate_limits WHERE window_start < ?1",
            params![now - window_seconds],
        )?;

        let count: i64 = conn.query_row(
            "INSERT INTO rate_limits (user_id, endpoint, window_start, request_count)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(user_id, endpoint, window_start)
             DO UPDATE SET request_count = request_count + 1
             RETURNING request_count",
            params![user_id, endpoint, window_start],
            |row| row.get(0),
        )?;

        Ok(count <= max_requests)
    }

    pub fn get_all_overrides(&self) -> Result<std::collections::HashMap<String, String>> {
        let conn = self.reader.lock().expect("reader mutex poisoned");
        let mut stmt = conn.prepare("SELECT key, value FROM settings_overrides")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<_, _>>().map_err(Into::into)
    }

    pub fn set_setting_override(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.writer.lock().expect("writer mutex poisoned");
        conn.execute(
            "INSERT INTO settings_overrides (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Look up a single memory by id, regardless of state. Used by tests
    /// and administrative tooling; not part of the policy evaluation path.
    pub fn get_memory(&self, id: i64) -> Result<Option<(String, String)>> {
        let conn = self.reader.lock().expect("reader mutex poisoned");
        conn.query_row(
            "SELECT state, content_hash FROM memories WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(Into::into)
    }

    /// Aggregate counts for administrative reporting (the `memlock stats`
    /// CLI command). Not on the policy evaluation path.
    pub fn stats(&self) -> Result<StorageStats> {
        let conn = self.reader.lock().expect("reader mutex poisoned");
        let total_memories: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
        let distinct_users: i64 =
            conn.query_row("SELECT COUNT(DISTINCT user_id) FROM memories", [], |row| row.get(0))?;

        let mut by_state = std::collections::HashMap::new();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM memories GROUP BY state")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (state, count) = row?;
            by_state.insert(state, count);
        }

        Ok(StorageStats {
            total_memories,
            distinct_users,
            by_state,
        })
    }
}

/// Returned by [`Storage::stats`].
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub total_memories: i64,
    pub distinct_users: i64,
    pub by_state: std::collections::HashMap<String, i64>,
}

fn content_hash(content: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}
