//! Database migration system.
//!
//! Tracks applied migrations in a `_migrations` table and applies
//! pending ones in order. SQL templates carry `{uploads}`-style
//! placeholders that are substituted with the namespaced physical table
//! names at run time. ALTER TABLE ADD COLUMN migrations are handled
//! conditionally to support idempotent execution.

use rusqlite::Connection;

use super::error::DatabaseError;
use super::TableNames;

/// A single migration definition.
struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
    /// Whether this migration needs conditional handling
    /// (e.g. ADD COLUMN that may already exist).
    kind: MigrationKind,
}

enum MigrationKind {
    /// Execute the SQL directly.
    Standard,
    /// ALTER TABLE ADD COLUMN — skip if column already exists.
    /// `table` is the logical key resolved against [`TableNames`].
    AddColumn {
        table: &'static str,
        column: &'static str,
    },
}

/// All migrations in order. Each is applied at most once per namespace.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_uploads_table",
        sql: include_str!("sql/001_create_uploads.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 2,
        description: "create_records_table",
        sql: include_str!("sql/002_create_records.sql"),
        kind: MigrationKind::Standard,
    },
    Migration {
        version: 3,
        description: "add_file_kind_to_uploads",
        sql: include_str!("sql/003_add_file_kind.sql"),
        kind: MigrationKind::AddColumn {
            table: "uploads",
            column: "file_kind",
        },
    },
    Migration {
        version: 4,
        description: "create_period_stats_table",
        sql: include_str!("sql/004_create_period_stats.sql"),
        kind: MigrationKind::Standard,
    },
];

/// Substitutes the `{table}` placeholders in a SQL template.
fn render(sql: &str, tables: &TableNames) -> String {
    sql.replace("{uploads}", &tables.uploads)
        .replace("{records}", &tables.records)
        .replace("{period_stats}", &tables.period_stats)
}

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection, tables: &TableNames) -> Result<(), DatabaseError> {
    // Create the migrations tracking table.
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
        tables.migrations
    ))?;

    let current_version: u32 = conn.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {}", tables.migrations),
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        let should_run = match &migration.kind {
            MigrationKind::Standard => true,
            MigrationKind::AddColumn { table, column } => {
                let physical = tables.resolve(table).ok_or(DatabaseError::Migration {
                    version: migration.version,
                    reason: format!("Unknown table key: {}", table),
                })?;
                !column_exists(conn, physical, column)?
            }
        };

        if should_run {
            conn.execute_batch(&render(migration.sql, tables))
                .map_err(|e| DatabaseError::Migration {
                    version: migration.version,
                    reason: e.to_string(),
                })?;
        } else {
            log::info!(
                "Skipping migration v{} (condition not met)",
                migration.version
            );
        }

        conn.execute(
            &format!(
                "INSERT INTO {} (version, description) VALUES (?1, ?2)",
                tables.migrations
            ),
            rusqlite::params![migration.version, migration.description],
        )?;
    }

    Ok(())
}

/// Checks whether a column exists on a table using `PRAGMA table_info`.
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    // Validate identifier — only alphanumeric and underscores allowed.
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DatabaseError::Migration {
            version: 0,
            reason: format!("Invalid table name: {}", table),
        });
    }
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .any(|r| r.map(|name| name == column).unwrap_or(false));
    Ok(exists)
}
