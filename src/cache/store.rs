//! Async-safe SQLite store.
//!
//! `rusqlite::Connection` is not Sync, so the connection lives behind an
//! `Arc<Mutex<_>>` and every operation runs on the blocking pool. Writes
//! are serialized by the engine; readers proceed concurrently under WAL.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::spawn_blocking;
use tracing::{info, warn};

use crate::error::{Result, StoreError};

/// Schema for the selector cache, snapshot sub-cache, scenario library,
/// and enhanced keys. Stable identifiers; see the migration below for the
/// legacy single-table layout.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS selector_cache_v2 (
    id INTEGER PRIMARY KEY,
    selector_hash TEXT NOT NULL UNIQUE,
    selector TEXT NOT NULL,
    url TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0.5,
    created_at INTEGER NOT NULL,
    last_used INTEGER NOT NULL,
    use_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS input_mappings (
    id INTEGER PRIMARY KEY,
    selector_hash TEXT NOT NULL REFERENCES selector_cache_v2(selector_hash) ON DELETE CASCADE,
    raw_input TEXT NOT NULL,
    normalized_input TEXT NOT NULL,
    tokens TEXT NOT NULL DEFAULT '[]',
    url TEXT NOT NULL,
    success_count INTEGER NOT NULL DEFAULT 1,
    last_used INTEGER NOT NULL,
    confidence REAL NOT NULL DEFAULT 0.5,
    learned_from TEXT NOT NULL DEFAULT 'direct'
        CHECK (learned_from IN ('direct', 'inferred', 'pattern')),
    UNIQUE(selector_hash, normalized_input, url)
);

CREATE TABLE IF NOT EXISTS snapshot_cache (
    id INTEGER PRIMARY KEY,
    cache_key TEXT NOT NULL UNIQUE,
    url TEXT,
    dom_hash TEXT NOT NULL DEFAULT '',
    payload BLOB NOT NULL,
    viewport TEXT,
    profile TEXT,
    created_at INTEGER NOT NULL,
    last_used INTEGER NOT NULL,
    ttl INTEGER NOT NULL,
    hit_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS test_scenarios (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    steps TEXT NOT NULL,
    pattern_hash TEXT NOT NULL,
    url_pattern TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT '[]',
    profile TEXT,
    success_rate REAL NOT NULL DEFAULT 1.0,
    total_runs INTEGER NOT NULL DEFAULT 0,
    last_run INTEGER,
    last_adapted INTEGER,
    created_at INTEGER NOT NULL,
    confidence REAL NOT NULL DEFAULT 0.5
);

CREATE TABLE IF NOT EXISTS test_executions (
    id INTEGER PRIMARY KEY,
    scenario_id INTEGER NOT NULL REFERENCES test_scenarios(id) ON DELETE CASCADE,
    status TEXT NOT NULL CHECK (status IN ('success', 'failure', 'partial', 'adapted')),
    execution_time_ms INTEGER NOT NULL DEFAULT 0,
    selector_adaptations TEXT,
    error_details TEXT,
    snapshot_id TEXT,
    confidence_score REAL,
    profile TEXT,
    url TEXT NOT NULL DEFAULT '',
    timestamp INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS test_patterns (
    id INTEGER PRIMARY KEY,
    pattern_hash TEXT NOT NULL UNIQUE,
    interaction_type TEXT NOT NULL,
    element_patterns TEXT NOT NULL DEFAULT '[]',
    success_indicators TEXT NOT NULL DEFAULT '[]',
    adaptation_rules TEXT NOT NULL DEFAULT '[]',
    confidence REAL NOT NULL DEFAULT 0.5,
    success_count INTEGER NOT NULL DEFAULT 0,
    total_count INTEGER NOT NULL DEFAULT 0,
    learned_from TEXT,
    created_at INTEGER NOT NULL,
    last_used INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_keys_v2 (
    id INTEGER PRIMARY KEY,
    test_name_normalized TEXT NOT NULL,
    url_pattern TEXT NOT NULL,
    dom_signature TEXT NOT NULL DEFAULT '',
    steps_structure_hash TEXT NOT NULL,
    profile TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    scenario_id INTEGER REFERENCES test_scenarios(id) ON DELETE CASCADE,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mappings_hash ON input_mappings(selector_hash);
CREATE INDEX IF NOT EXISTS idx_mappings_normalized_url ON input_mappings(normalized_input, url);
CREATE INDEX IF NOT EXISTS idx_mappings_tokens ON input_mappings(tokens);
CREATE INDEX IF NOT EXISTS idx_mappings_url_hash ON input_mappings(url, selector_hash);
CREATE INDEX IF NOT EXISTS idx_selectors_created ON selector_cache_v2(created_at);
CREATE INDEX IF NOT EXISTS idx_snapshots_created ON snapshot_cache(created_at);
CREATE INDEX IF NOT EXISTS idx_executions_scenario ON test_executions(scenario_id);
CREATE INDEX IF NOT EXISTS idx_patterns_hash ON test_patterns(pattern_hash);
CREATE INDEX IF NOT EXISTS idx_cache_keys_scenario ON cache_keys_v2(scenario_id);
"#;

/// Async-safe handle over one SQLite database file.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open or create the database and apply the schema. An unwritable
    /// database file is fatal for the caller.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::NotWritable {
                path: path.to_path_buf(),
                cause: e.to_string(),
            })?;
        }
        let conn = Connection::open(path).map_err(|e| StoreError::NotWritable {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;
        Self::apply_pragmas(&conn, path)?;
        conn.execute_batch(SCHEMA).map_err(|e| StoreError::Sqlite {
            path: path.to_path_buf(),
            cause: format!("schema init failed: {e}"),
        })?;
        info!(path = %path.display(), "selector cache database ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    /// In-memory database for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self> {
        let path = PathBuf::from(":memory:");
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Sqlite {
            path: path.clone(),
            cause: e.to_string(),
        })?;
        Self::apply_pragmas(&conn, &path)?;
        conn.execute_batch(SCHEMA).map_err(|e| StoreError::Sqlite {
            path: path.clone(),
            cause: format!("schema init failed: {e}"),
        })?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    fn apply_pragmas(conn: &Connection, path: &Path) -> Result<()> {
        // WAL lets readers proceed while a write is in flight; foreign keys
        // enforce the mapping/selector and execution/scenario invariants.
        conn.pragma_update(None, "journal_mode", "WAL")
            .and_then(|_| conn.pragma_update(None, "foreign_keys", "ON"))
            .map_err(|e| StoreError::Sqlite {
                path: path.to_path_buf(),
                cause: format!("pragma setup failed: {e}"),
            })?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a read or standalone write on the blocking pool.
    pub async fn query<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let path = self.path.clone();

        spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poisoned| {
                warn!(path = %path.display(), "connection mutex poisoned, recovering");
                poisoned.into_inner()
            });
            f(&guard).map_err(|e| StoreError::Sqlite {
                path: path.clone(),
                cause: e.to_string(),
            })
        })
        .await
        .map_err(|e| StoreError::TaskJoin(e.to_string()))?
        .map_err(Into::into)
    }

    /// Run a closure inside one transaction. The closure either commits as
    /// a whole or rolls back; readers never observe a torn write.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let path = self.path.clone();

        spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| {
                warn!(path = %path.display(), "connection mutex poisoned, recovering");
                let inner = poisoned.into_inner();
                if !inner.is_autocommit() {
                    if let Err(e) = inner.execute_batch("ROLLBACK") {
                        warn!(path = %path.display(), error = %e, "rollback after poisoning failed");
                    }
                }
                inner
            });

            let tx = guard.transaction().map_err(|e| StoreError::Sqlite {
                path: path.clone(),
                cause: format!("transaction start failed: {e}"),
            })?;
            let result = f(&tx).map_err(|e| StoreError::Sqlite {
                path: path.clone(),
                cause: e.to_string(),
            })?;
            tx.commit().map_err(|e| StoreError::Sqlite {
                path: path.clone(),
                cause: format!("transaction commit failed: {e}"),
            })?;
            Ok::<T, StoreError>(result)
        })
        .await
        .map_err(|e| StoreError::TaskJoin(e.to_string()))?
        .map_err(Into::into)
    }

    /// Copy rows out of a legacy single-table cache layout, if present.
    ///
    /// Selector rows land in `selector_cache_v2` with confidence 0.5 and a
    /// hash taken from the first 32 chars of the legacy cache key; snapshot
    /// rows land in `snapshot_cache` with `dom_hash='migrated'`. A missing
    /// legacy table is tolerated silently.
    pub async fn migrate_legacy(&self) -> Result<LegacyMigration> {
        self.query(|conn| {
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='cache'",
                    [],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n > 0)?;
            if !exists {
                return Ok(LegacyMigration::default());
            }

            let now = chrono::Utc::now().timestamp();
            let selectors = conn.execute(
                "INSERT OR IGNORE INTO selector_cache_v2
                     (selector_hash, selector, url, confidence, created_at, last_used, use_count)
                 SELECT substr(cache_key, 1, 32), data, COALESCE(url, ''), 0.5,
                        COALESCE(created_at, ?1), COALESCE(accessed_at, ?1), 0
                 FROM cache WHERE cache_type = 'selector'",
                [now],
            )?;
            let snapshots = conn.execute(
                "INSERT OR IGNORE INTO snapshot_cache
                     (cache_key, url, dom_hash, payload, profile, created_at, last_used, ttl, hit_count)
                 SELECT cache_key, url, 'migrated', CAST(data AS BLOB), profile,
                        COALESCE(created_at, ?1), COALESCE(accessed_at, ?1),
                        COALESCE(ttl, 3600), 0
                 FROM cache WHERE cache_type = 'snapshot'",
                [now],
            )?;

            Ok(LegacyMigration {
                legacy_table_found: true,
                selectors_migrated: selectors,
                snapshots_migrated: snapshots,
            })
        })
        .await
    }
}

/// Outcome of a legacy migration pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyMigration {
    pub legacy_table_found: bool,
    pub selectors_migrated: usize,
    pub snapshots_migrated: usize,
}

/// Current unix time in seconds, as stored in every timestamp column.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
