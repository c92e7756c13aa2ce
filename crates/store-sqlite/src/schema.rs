use rusqlite::Connection;
use tracing::info;

use crate::StoreError;

/// Highest schema version this build knows how to create.
pub const SCHEMA_VERSION: u32 = 2;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "snippets",
        sql: r#"
            CREATE TABLE IF NOT EXISTS snippets (
              id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              content TEXT NOT NULL,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snippets_created_at ON snippets(created_at);
        "#,
    },
    Migration {
        version: 2,
        name: "chat",
        sql: r#"
            CREATE TABLE IF NOT EXISTS chat_messages (
              scope_id TEXT NOT NULL,
              seq INTEGER NOT NULL,
              role TEXT NOT NULL,
              content TEXT NOT NULL,
              message_id TEXT,
              saved_at TEXT NOT NULL,
              PRIMARY KEY (scope_id, seq)
            );
            CREATE INDEX IF NOT EXISTS idx_chat_messages_scope ON chat_messages(scope_id);
            CREATE TABLE IF NOT EXISTS conversations (
              scope_id TEXT PRIMARY KEY,
              conversation_id TEXT NOT NULL
            );
        "#,
    },
];

pub(crate) fn current_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row("PRAGMA user_version", [], |r| r.get(0))
}

/// Brings the database up to `target`, creating whatever tables and indexes
/// are missing. Existing tables are left alone and versions never go down.
pub(crate) fn upgrade(conn: &mut Connection, target: u32) -> Result<(), StoreError> {
    let current = current_version(conn).map_err(|source| StoreError::Read {
        op: "read schema version",
        source,
    })?;
    if current > SCHEMA_VERSION || current > target {
        return Err(StoreError::UnsupportedSchemaVersion {
            found: current,
            supported: target,
        });
    }
    for migration in MIGRATIONS
        .iter()
        .filter(|m| m.version > current && m.version <= target)
    {
        apply(conn, migration).map_err(|source| StoreError::Write {
            op: "upgrade schema",
            source,
        })?;
        info!(
            from = current,
            to = migration.version,
            name = migration.name,
            "upgraded store schema"
        );
    }
    Ok(())
}

fn apply(conn: &mut Connection, migration: &Migration) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(migration.sql)?;
    tx.pragma_update(None, "user_version", migration.version)?;
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type IN ('table', 'index') ORDER BY name")
            .unwrap();
        stmt.query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<String>>>()
            .unwrap()
    }

    #[test]
    fn fresh_database_reaches_target() {
        let mut conn = Connection::open_in_memory().unwrap();
        upgrade(&mut conn, SCHEMA_VERSION).unwrap();
        assert_eq!(current_version(&conn).unwrap(), 2);
        let names = table_names(&conn);
        for expected in [
            "chat_messages",
            "conversations",
            "idx_chat_messages_scope",
            "idx_snippets_created_at",
            "snippets",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn v1_only_has_snippets() {
        let mut conn = Connection::open_in_memory().unwrap();
        upgrade(&mut conn, 1).unwrap();
        assert_eq!(current_version(&conn).unwrap(), 1);
        let names = table_names(&conn);
        assert!(names.iter().any(|n| n == "snippets"));
        assert!(!names.iter().any(|n| n == "chat_messages"));
    }

    #[test]
    fn upgrade_keeps_existing_rows() {
        let mut conn = Connection::open_in_memory().unwrap();
        upgrade(&mut conn, 1).unwrap();
        conn.execute(
            "INSERT INTO snippets (id, name, content, created_at, updated_at) VALUES ('1', 'a', '{}', 't', 't')",
            [],
        )
        .unwrap();
        upgrade(&mut conn, 2).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM snippets", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(current_version(&conn).unwrap(), 2);
    }

    #[test]
    fn upgrade_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        upgrade(&mut conn, 2).unwrap();
        upgrade(&mut conn, 2).unwrap();
        assert_eq!(current_version(&conn).unwrap(), 2);
    }

    #[test]
    fn newer_database_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 7).unwrap();
        let err = upgrade(&mut conn, SCHEMA_VERSION).unwrap_err();
        assert!(matches!(
            err,
            StoreError::UnsupportedSchemaVersion { found: 7, supported: 2 }
        ));
    }

    #[test]
    fn no_downgrade_to_older_target() {
        let mut conn = Connection::open_in_memory().unwrap();
        upgrade(&mut conn, 2).unwrap();
        let err = upgrade(&mut conn, 1).unwrap_err();
        assert!(matches!(
            err,
            StoreError::UnsupportedSchemaVersion { found: 2, supported: 1 }
        ));
    }
}
