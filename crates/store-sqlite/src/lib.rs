use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use core_model::{ChatMessage, ChatRole, Snippet, SnippetDraft};
use rusqlite::{Connection, OptionalExtension, Transaction, params, types::Type};
use tracing::{debug, warn};

mod error;
mod schema;

pub use error::{Loaded, StoreError};
pub use schema::SCHEMA_VERSION;

/// Handle to the on-disk store.
///
/// The handle only remembers where the database lives. Every operation opens
/// its own connection, upgrades the schema if needed, runs one transaction and
/// closes the connection again when it returns.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    version: u32,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self, StoreError> {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::open(base.join("jsonpad").join("jsonpad.db"))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_version(path, SCHEMA_VERSION)
    }

    /// Opens the store targeting a specific schema version, upgrading an
    /// older database in place.
    pub fn open_with_version(path: impl AsRef<Path>, version: u32) -> Result<Self, StoreError> {
        if version == 0 || version > SCHEMA_VERSION {
            return Err(StoreError::InvalidSchemaVersion(version));
        }
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let store = Self { path, version };
        // Upgrade eagerly so schema problems surface at startup.
        drop(store.connect()?);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let open_err = |source| StoreError::Open {
            path: self.path.clone(),
            source,
        };
        let mut conn = Connection::open(&self.path).map_err(open_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(open_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .map_err(open_err)?;
        schema::upgrade(&mut conn, self.version)?;
        Ok(conn)
    }

    fn write<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut conn = self
            .connect()
            .inspect_err(|err| warn!(op, error = %err, "store write failed"))?;
        let run = |conn: &mut Connection| -> rusqlite::Result<T> {
            let tx = conn.transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        };
        run(&mut conn).map_err(|source| {
            warn!(op, error = %source, "store write failed");
            StoreError::Write { op, source }
        })
    }

    fn read<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let conn = self.connect()?;
        f(&conn).map_err(|source| StoreError::Read { op, source })
    }

    pub fn schema_version(&self) -> Result<u32, StoreError> {
        self.read("read schema version", schema::current_version)
    }

    pub fn integrity_check(&self) -> Result<String, StoreError> {
        self.read("integrity check", |conn| {
            conn.query_row("PRAGMA integrity_check;", [], |r| r.get(0))
        })
    }

    pub fn create_snippet(&self, draft: SnippetDraft) -> Result<Snippet, StoreError> {
        let snippet = draft.into_snippet(Utc::now());
        self.write("create snippet", |tx| put_snippet(tx, &snippet))?;
        debug!(id = %snippet.id, "snippet created");
        Ok(snippet)
    }

    /// Shallow-merges `draft` over the stored snippet with the same id.
    pub fn update_snippet(&self, draft: SnippetDraft) -> Result<Snippet, StoreError> {
        let id = draft.id.clone();
        let updated = self.write("update snippet", |tx| {
            let Some(existing) = select_snippet(tx, &draft.id)? else {
                return Ok(None);
            };
            // Keep updated_at monotonic even if the clock moved backwards.
            let now = Utc::now().max(existing.updated_at);
            let merged = draft.merge_into(existing, now);
            put_snippet(tx, &merged)?;
            Ok(Some(merged))
        })?;
        updated.ok_or(StoreError::NotFound { id })
    }

    pub fn rename_snippet(&self, id: &str, name: &str) -> Result<Snippet, StoreError> {
        self.update_snippet(SnippetDraft::new(id).name(name.trim()))
    }

    pub fn save_snippet_content(&self, id: &str, content: &str) -> Result<Snippet, StoreError> {
        self.update_snippet(SnippetDraft::new(id).content(content))
    }

    /// Removing an id that does not exist is not an error.
    pub fn delete_snippet(&self, id: &str) -> Result<(), StoreError> {
        self.write("delete snippet", |tx| {
            tx.execute("DELETE FROM snippets WHERE id = ?1", params![id])
        })?;
        Ok(())
    }

    pub fn try_get_snippet(&self, id: &str) -> Result<Option<Snippet>, StoreError> {
        self.read("get snippet", |conn| select_snippet(conn, id))
    }

    /// Point lookup. An unreadable store degrades to `None`.
    pub fn get_snippet(&self, id: &str) -> Loaded<Option<Snippet>> {
        Loaded::or_empty("get snippet", self.try_get_snippet(id))
    }

    pub fn try_load_snippets(&self) -> Result<Vec<Snippet>, StoreError> {
        self.read("load snippets", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, content, created_at, updated_at FROM snippets ORDER BY created_at",
            )?;
            let rows = stmt.query_map([], snippet_from_row)?;
            rows.collect()
        })
    }

    /// All snippets in storage order. Failures degrade to an empty list.
    pub fn load_snippets(&self) -> Loaded<Vec<Snippet>> {
        Loaded::or_empty("load snippets", self.try_load_snippets())
    }

    /// Replaces the whole message sequence of `scope_id`. Messages get
    /// sequence numbers `0..n` in the order given; an empty slice clears the
    /// history. Does nothing for an empty scope id.
    pub fn save_chat_history(
        &self,
        scope_id: &str,
        messages: &[ChatMessage],
    ) -> Result<(), StoreError> {
        if scope_id.is_empty() {
            return Ok(());
        }
        self.write("save chat history", |tx| {
            delete_messages(tx, scope_id)?;
            insert_messages(tx, scope_id, messages)
        })?;
        debug!(scope_id, messages = messages.len(), "chat history saved");
        Ok(())
    }

    pub fn try_load_chat_history(&self, scope_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        if scope_id.is_empty() {
            return Ok(Vec::new());
        }
        self.read("load chat history", |conn| select_messages(conn, scope_id))
    }

    pub fn load_chat_history(&self, scope_id: &str) -> Loaded<Vec<ChatMessage>> {
        Loaded::or_empty("load chat history", self.try_load_chat_history(scope_id))
    }

    pub fn save_conversation_id(
        &self,
        scope_id: &str,
        conversation_id: &str,
    ) -> Result<(), StoreError> {
        if scope_id.is_empty() {
            return Ok(());
        }
        self.write("save conversation id", |tx| {
            upsert_conversation(tx, scope_id, conversation_id)
        })
    }

    pub fn try_load_conversation_id(&self, scope_id: &str) -> Result<String, StoreError> {
        if scope_id.is_empty() {
            return Ok(String::new());
        }
        self.read("load conversation id", |conn| {
            select_conversation(conn, scope_id).map(Option::unwrap_or_default)
        })
    }

    /// Stored conversation id, or an empty string when there is none.
    pub fn load_conversation_id(&self, scope_id: &str) -> Loaded<String> {
        Loaded::or_empty(
            "load conversation id",
            self.try_load_conversation_id(scope_id),
        )
    }

    /// Drops both the message sequence and the conversation id of a scope.
    pub fn clear_chat_data(&self, scope_id: &str) -> Result<(), StoreError> {
        if scope_id.is_empty() {
            return Ok(());
        }
        self.write("clear chat data", |tx| delete_scope(tx, scope_id))?;
        debug!(scope_id, "chat data cleared");
        Ok(())
    }

    /// Moves chat data from one scope to another: the message sequence (when
    /// there is one) replaces the target's, the conversation id (when there
    /// is one) overwrites the target's, and the source scope is cleared.
    /// Returns the number of messages moved.
    pub fn transfer_chat_scope(&self, from: &str, to: &str) -> Result<usize, StoreError> {
        if from.is_empty() || to.is_empty() || from == to {
            return Ok(0);
        }
        let moved = self.write("transfer chat scope", |tx| {
            let messages = select_messages(tx, from)?;
            if !messages.is_empty() {
                delete_messages(tx, to)?;
                insert_messages(tx, to, &messages)?;
            }
            if let Some(conversation_id) = select_conversation(tx, from)?
                && !conversation_id.is_empty()
            {
                upsert_conversation(tx, to, &conversation_id)?;
            }
            delete_scope(tx, from)?;
            Ok(messages.len())
        })?;
        debug!(from, to, messages = moved, "chat scope transferred");
        Ok(moved)
    }
}

fn put_snippet(conn: &Connection, s: &Snippet) -> rusqlite::Result<()> {
    conn.execute(
        r#"INSERT INTO snippets (id, name, content, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(id) DO UPDATE SET
          name=excluded.name,
          content=excluded.content,
          created_at=excluded.created_at,
          updated_at=excluded.updated_at"#,
        params![
            s.id,
            s.name,
            s.content,
            s.created_at.to_rfc3339(),
            s.updated_at.to_rfc3339()
        ],
    )?;
    Ok(())
}

fn select_snippet(conn: &Connection, id: &str) -> rusqlite::Result<Option<Snippet>> {
    conn.query_row(
        "SELECT id, name, content, created_at, updated_at FROM snippets WHERE id = ?1",
        params![id],
        snippet_from_row,
    )
    .optional()
}

fn snippet_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Snippet> {
    Ok(Snippet {
        id: r.get(0)?,
        name: r.get(1)?,
        content: r.get(2)?,
        created_at: parse_ts(r.get(3)?),
        updated_at: parse_ts(r.get(4)?),
    })
}

fn select_messages(conn: &Connection, scope_id: &str) -> rusqlite::Result<Vec<ChatMessage>> {
    let mut stmt = conn.prepare_cached(
        "SELECT role, content, message_id FROM chat_messages WHERE scope_id = ?1 ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map(params![scope_id], |r| {
        let role: String = r.get(0)?;
        let role: ChatRole = role
            .parse()
            .map_err(|e: anyhow::Error| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, e.into()))?;
        Ok(ChatMessage {
            role,
            content: r.get(1)?,
            id: r.get(2)?,
        })
    })?;
    rows.collect()
}

fn delete_messages(conn: &Connection, scope_id: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM chat_messages WHERE scope_id = ?1",
        params![scope_id],
    )
}

fn insert_messages(
    conn: &Connection,
    scope_id: &str,
    messages: &[ChatMessage],
) -> rusqlite::Result<()> {
    let saved_at = Utc::now().to_rfc3339();
    let mut stmt = conn.prepare_cached(
        r#"INSERT INTO chat_messages (scope_id, seq, role, content, message_id, saved_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
    )?;
    for (seq, m) in messages.iter().enumerate() {
        stmt.execute(params![
            scope_id,
            seq as i64,
            m.role.as_str(),
            m.content,
            m.id,
            saved_at
        ])?;
    }
    Ok(())
}

fn select_conversation(conn: &Connection, scope_id: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT conversation_id FROM conversations WHERE scope_id = ?1",
        params![scope_id],
        |r| r.get(0),
    )
    .optional()
}

fn upsert_conversation(
    conn: &Connection,
    scope_id: &str,
    conversation_id: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        r#"INSERT INTO conversations (scope_id, conversation_id) VALUES (?1, ?2)
        ON CONFLICT(scope_id) DO UPDATE SET conversation_id=excluded.conversation_id"#,
        params![scope_id, conversation_id],
    )?;
    Ok(())
}

fn delete_scope(conn: &Connection, scope_id: &str) -> rusqlite::Result<()> {
    delete_messages(conn, scope_id)?;
    conn.execute(
        "DELETE FROM conversations WHERE scope_id = ?1",
        params![scope_id],
    )?;
    Ok(())
}

fn parse_ts(ts: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&ts)
        .map(|v| v.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
