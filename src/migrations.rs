//! Schema upgrades for the history store.
//!
//! `MIGRATIONS` lists every SQL file under `migrations/`, oldest first. The
//! `schema_version` table records which ones a database file has seen.

use rusqlite::Connection;

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("migrations/001_baseline.sql"),
}];

fn current_version(conn: &Connection) -> Result<i32, String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("schema_version table: {}", e))?;

    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
        row.get(0)
    })
    .map_err(|e| format!("schema_version read: {}", e))
}

/// Copy a populated file to `<path>.pre-migration.bak` before touching its
/// schema. In-memory and brand-new databases have nothing to keep.
fn snapshot(conn: &Connection, from_version: i32) -> Result<(), String> {
    if from_version == 0 {
        return Ok(());
    }
    let path: String = conn
        .query_row("PRAGMA database_list", [], |row| row.get(2))
        .map_err(|e| format!("database path: {}", e))?;
    if path.is_empty() || path == ":memory:" {
        return Ok(());
    }

    let target = format!("{}.pre-migration.bak", path);
    let mut dest = Connection::open(&target).map_err(|e| format!("{}: {}", target, e))?;
    rusqlite::backup::Backup::new(conn, &mut dest)
        .and_then(|backup| backup.step(-1).map(|_| ()))
        .map_err(|e| format!("snapshot to {} failed: {}", target, e))?;

    log::info!("Migrations: snapshot written to {}", target);
    Ok(())
}

/// Bring the schema up to date. Returns how many migrations ran.
///
/// A file written by a newer build is left alone and reported as an error.
pub fn run_migrations(conn: &Connection) -> Result<usize, String> {
    let from = current_version(conn)?;
    let latest = MIGRATIONS.last().map_or(0, |m| m.version);
    if from > latest {
        return Err(format!(
            "history store is at schema v{} but this donorsync only knows up to v{}",
            from, latest
        ));
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > from).collect();
    if pending.is_empty() {
        return Ok(0);
    }
    snapshot(conn, from)?;

    for migration in &pending {
        conn.execute_batch(migration.sql)
            .and_then(|_| {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    [migration.version],
                )
            })
            .map_err(|e| format!("migration v{}: {}", migration.version, e))?;
        log::info!("Migrations: applied v{}", migration.version);
    }
    Ok(pending.len())
}
