// =============================================================================
// Database — embedded relational store shared by all services
// =============================================================================
//
// A single SQLite connection guarded by an async mutex; every operation takes
// the lock for one short, synchronous statement batch. The schema is applied
// at startup by the migration runner: embedded SQL files executed in lexical
// order, each recorded in `schema_migrations`, already-applied files skipped.
// A migration failure is fatal — callers must not start workers after an Err.
// =============================================================================

pub mod control;
pub mod market;
pub mod orders;

use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Embedded migrations, lexical order. File names are the identity recorded
/// in `schema_migrations` — never rename an applied migration.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_control_tables.sql",
        include_str!("../../migrations/0001_control_tables.sql"),
    ),
    (
        "0002_market_data.sql",
        include_str!("../../migrations/0002_market_data.sql"),
    ),
    (
        "0003_order_stream.sql",
        include_str!("../../migrations/0003_order_stream.sql"),
    ),
    (
        "0004_archival.sql",
        include_str!("../../migrations/0004_archival.sql"),
    ),
];

/// Handle to the embedded database. Cheap to clone; all clones share one
/// connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at `path` and bring the schema up to
    /// date. `:memory:` yields a private in-memory database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        run_migrations(&conn)?;

        info!(path, "database ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Fresh in-memory database for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Run `f` with the connection locked.
    pub(crate) async fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().await;
        f(&mut conn)
    }

    /// Names of applied migrations, in application order.
    pub async fn applied_migrations(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT name FROM schema_migrations ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            name       TEXT PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )
    .context("failed to create schema_migrations")?;

    // Lexical order is the execution order; the embedded list must already
    // be sorted so a stray entry is caught in tests rather than production.
    debug_assert!(MIGRATIONS.windows(2).all(|w| w[0].0 < w[1].0));

    for (name, sql) in MIGRATIONS {
        let applied: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE name = ?1)",
                [name],
                |row| row.get(0),
            )
            .context("failed to query schema_migrations")?;

        if applied {
            debug!(migration = name, "already applied — skipping");
            continue;
        }

        conn.execute_batch(&format!("BEGIN;\n{sql}\nCOMMIT;"))
            .with_context(|| format!("migration {name} failed"))?;
        conn.execute(
            "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, ?2)",
            rusqlite::params![name, chrono::Utc::now().timestamp_millis()],
        )
        .with_context(|| format!("failed to record migration {name}"))?;

        info!(migration = name, "migration applied");
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_apply_in_order_and_are_recorded() {
        let db = Database::open_in_memory().unwrap();
        let applied = db.applied_migrations().await.unwrap();
        let expected: Vec<String> = MIGRATIONS.iter().map(|(n, _)| n.to_string()).collect();
        assert_eq!(applied, expected);
    }

    #[tokio::test]
    async fn migrations_are_idempotent_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asv8.db");
        let path = path.to_str().unwrap();

        let before = {
            let db = Database::open(path).unwrap();
            db.applied_migrations().await.unwrap()
        };
        // Second open must skip every already-applied file.
        let db = Database::open(path).unwrap();
        let after = db.applied_migrations().await.unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn embedded_migrations_are_lexically_sorted() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].0 < pair[1].0, "{} >= {}", pair[0].0, pair[1].0);
        }
    }
}
