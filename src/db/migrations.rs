use rusqlite::Connection;

use super::schema;

/// Forward-only migrations, each idempotent and run inside its own
/// transaction. Applied in order starting from the row currently in `meta`;
/// there is no down-migration path, matching the original's migration runner.
type Migration = fn(&Connection) -> rusqlite::Result<()>;

const MIGRATIONS: &[Migration] = &[migrate_initial_schema, migrate_pending_and_captchas];

/// Creates the `images`/`tags` tables.
fn migrate_initial_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(schema::CREATE_IMAGES)?;
    conn.execute_batch(schema::CREATE_TAGS)?;
    Ok(())
}

/// Adds the fetch-pipeline staging table and the captcha challenge table.
fn migrate_pending_and_captchas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS pending_images (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            md5 BLOB NOT NULL UNIQUE,
            rating INTEGER NOT NULL,
            url TEXT NOT NULL,
            target_tag TEXT NOT NULL,
            tags TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );",
    )?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS captchas (
            id BLOB PRIMARY KEY,
            tag TEXT NOT NULL,
            correct TEXT NOT NULL,
            status INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS captchas_created_at_idx ON captchas (created_at);
        CREATE INDEX IF NOT EXISTS captchas_status_idx ON captchas (status);",
    )?;
    Ok(())
}

/// Runs every migration whose index is >= the version stored in `meta`,
/// each wrapped in `BEGIN`/`COMMIT`, bumping `meta.version` as it goes.
/// Returns the resulting schema version.
pub fn run_migrations(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute_batch(schema::CREATE_META)?;

    let current: i64 = conn
        .query_row("SELECT version FROM meta LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    if current == 0 {
        conn.execute("INSERT INTO meta (version) VALUES (0)", [])?;
    }

    let mut version = current as usize;
    for migration in MIGRATIONS.iter().skip(version) {
        conn.execute_batch("BEGIN")?;
        match migration(conn) {
            Ok(()) => {
                version += 1;
                conn.execute("UPDATE meta SET version = ?1", [version as i64])?;
                conn.execute_batch("COMMIT")?;
            }
            Err(e) => {
                conn.execute_batch("ROLLBACK")?;
                return Err(e);
            }
        }
    }

    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent_and_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        let v1 = run_migrations(&conn).unwrap();
        assert_eq!(v1, MIGRATIONS.len());

        // Reapplying against the same connection is a no-op.
        let v2 = run_migrations(&conn).unwrap();
        assert_eq!(v2, MIGRATIONS.len());

        conn.execute("INSERT INTO images (md5, rating, source, target_tag) VALUES (?1, 0, 0, 'cirno')", [vec![0u8; 16]]).unwrap();
        conn.execute("INSERT INTO captchas (id, tag, correct, status, created_at) VALUES (?1, 'cirno', '[]', 0, 0)", [vec![0u8; 64]]).unwrap();
    }
}
