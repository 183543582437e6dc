use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::catalog::BuiltinModel;

/// Context window applied when a chat has no settings row and no stored
/// default, or when the stored value cannot be used.
pub const DEFAULT_CONTEXT_WINDOW: i64 = 6;

const DEFAULT_SETTINGS_KEY: &str = "default_chat_settings";
const ONBOARDING_KEY: &str = "onboarding_complete";

// ============================================
// Database Models
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelOrigin {
    Local,
    Remote,
    BuiltIn,
}

impl ModelOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelOrigin::Local => "local",
            ModelOrigin::Remote => "remote",
            ModelOrigin::BuiltIn => "built-in",
        }
    }

    /// Whether the model's resource files are managed by the fetcher
    /// (downloaded into app storage) rather than user-owned paths.
    pub fn has_fetched_files(&self) -> bool {
        !matches!(self, ModelOrigin::Local)
    }
}

impl ToSql for ModelOrigin {
    fn to_sql(&self) -> Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ModelOrigin {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "local" => Ok(ModelOrigin::Local),
            "remote" => Ok(ModelOrigin::Remote),
            "built-in" => Ok(ModelOrigin::BuiltIn),
            other => Err(FromSqlError::Other(
                format!("unknown model origin: {other}").into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    /// Synthetic user-visible notice (e.g. "source removed"). Never sent
    /// to the model.
    Event,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Event => "event",
        }
    }
}

impl ToSql for Role {
    fn to_sql(&self) -> Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "event" => Ok(Role::Event),
            other => Err(FromSqlError::Other(format!("unknown role: {other}").into())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: i64,
    pub name: String,
    pub origin: ModelOrigin,
    pub is_downloaded: bool,
    pub weights_uri: String,
    pub tokenizer_uri: String,
    pub tokenizer_config_uri: String,
    pub param_count: Option<i64>,
    pub size_bytes: Option<i64>,
    pub featured: bool,
    pub thinking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: i64,
    pub model_id: Option<i64>,
    /// Empty means "untitled" — the UI falls back to the model name.
    pub title: String,
    pub last_used: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub role: Role,
    pub content: String,
    pub model: Option<String>,
    pub tokens_per_second: f64,
    pub time_to_first_token: f64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    pub chat_id: i64,
    pub system_prompt: String,
    pub context_window: i64,
    /// Per-chat thinking-mode override. `None` defers to the model's
    /// declared capability.
    pub thinking_enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub file_type: String,
    pub size_bytes: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkResult {
    pub id: i64,
    pub model_id: Option<i64>,
    /// Denormalized so the result survives model deletion.
    pub model_name: String,
    pub total_time_ms: f64,
    pub time_to_first_token_ms: f64,
    pub tokens_generated: f64,
    pub tokens_per_second: f64,
    pub peak_memory_gb: f64,
    pub created_at: i64,
}

/// App-wide defaults seeded into every new chat's settings, held as a
/// JSON blob in the key-value settings table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultChatSettings {
    pub system_prompt: String,
    pub context_window: i64,
}

impl Default for DefaultChatSettings {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            context_window: DEFAULT_CONTEXT_WINDOW,
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================
// Database Manager
// ============================================

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// In-memory database, used by tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS models (
                id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                name                 TEXT NOT NULL UNIQUE,
                origin               TEXT NOT NULL CHECK (origin IN ('local', 'remote', 'built-in')),
                is_downloaded        INTEGER NOT NULL DEFAULT 0,
                weights_uri          TEXT NOT NULL,
                tokenizer_uri        TEXT NOT NULL,
                tokenizer_config_uri TEXT NOT NULL,
                param_count          INTEGER,
                size_bytes           INTEGER,
                featured             INTEGER NOT NULL DEFAULT 0,
                thinking             INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS chats (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                model_id        INTEGER REFERENCES models(id) ON DELETE SET NULL,
                title           TEXT NOT NULL DEFAULT '',
                last_used       INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id             INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                role                TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system', 'event')),
                content             TEXT NOT NULL,
                model               TEXT,
                tokens_per_second   REAL NOT NULL DEFAULT 0,
                time_to_first_token REAL NOT NULL DEFAULT 0,
                created_at          INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chat_settings (
                chat_id          INTEGER PRIMARY KEY REFERENCES chats(id) ON DELETE CASCADE,
                system_prompt    TEXT NOT NULL DEFAULT '',
                context_window   INTEGER NOT NULL DEFAULT 6,
                thinking_enabled INTEGER
            );

            CREATE TABLE IF NOT EXISTS sources (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                name            TEXT NOT NULL,
                file_type       TEXT NOT NULL,
                size_bytes      INTEGER,
                created_at      INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chat_sources (
                chat_id         INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                source_id       INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
                PRIMARY KEY (chat_id, source_id)
            );

            CREATE TABLE IF NOT EXISTS benchmarks (
                id                     INTEGER PRIMARY KEY AUTOINCREMENT,
                model_id               INTEGER,
                model_name             TEXT NOT NULL,
                total_time_ms          REAL NOT NULL,
                time_to_first_token_ms REAL NOT NULL,
                tokens_generated       REAL NOT NULL,
                tokens_per_second      REAL NOT NULL,
                peak_memory_gb         REAL NOT NULL,
                created_at             INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                key             TEXT PRIMARY KEY,
                value           TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_chat_id
                ON messages(chat_id, id);

            CREATE INDEX IF NOT EXISTS idx_chats_last_used
                ON chats(last_used DESC);

            CREATE INDEX IF NOT EXISTS idx_chat_sources_source_id
                ON chat_sources(source_id);
        ",
        )?;

        Ok(())
    }

    // ============================================
    // Model CRUD
    // ============================================

    /// Reconcile the built-in model rows against the shipped catalog.
    /// Runs in one transaction on every app start: rows whose name left the
    /// catalog are deleted, missing entries are inserted (ignore-on-conflict
    /// keeps this idempotent), and catalog flags are re-applied to survivors.
    pub fn sync_builtin_models(&self, catalog: &[BuiltinModel]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        {
            let names: Vec<&str> = catalog.iter().map(|m| m.name).collect();
            let placeholders = vec!["?"; names.len().max(1)].join(", ");
            let sql = format!(
                "DELETE FROM models WHERE origin = 'built-in' AND name NOT IN ({placeholders})"
            );
            let mut stmt = tx.prepare(&sql)?;
            stmt.execute(rusqlite::params_from_iter(names.iter()))?;

            for entry in catalog {
                tx.execute(
                    "INSERT OR IGNORE INTO models
                        (name, origin, weights_uri, tokenizer_uri, tokenizer_config_uri,
                         param_count, size_bytes, featured, thinking)
                     VALUES (?1, 'built-in', ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        entry.name,
                        entry.weights_uri,
                        entry.tokenizer_uri,
                        entry.tokenizer_config_uri,
                        entry.param_count,
                        entry.size_bytes,
                        entry.featured as i64,
                        entry.thinking as i64,
                    ],
                )?;
                tx.execute(
                    "UPDATE models
                     SET weights_uri = ?1, tokenizer_uri = ?2, tokenizer_config_uri = ?3,
                         param_count = ?4, size_bytes = ?5, featured = ?6, thinking = ?7
                     WHERE origin = 'built-in' AND name = ?8",
                    params![
                        entry.weights_uri,
                        entry.tokenizer_uri,
                        entry.tokenizer_config_uri,
                        entry.param_count,
                        entry.size_bytes,
                        entry.featured as i64,
                        entry.thinking as i64,
                        entry.name,
                    ],
                )?;
            }
        }

        tx.commit()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_model(
        &self,
        name: &str,
        origin: ModelOrigin,
        is_downloaded: bool,
        weights_uri: &str,
        tokenizer_uri: &str,
        tokenizer_config_uri: &str,
        param_count: Option<i64>,
        size_bytes: Option<i64>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO models
                (name, origin, is_downloaded, weights_uri, tokenizer_uri, tokenizer_config_uri,
                 param_count, size_bytes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                name,
                origin,
                is_downloaded as i64,
                weights_uri,
                tokenizer_uri,
                tokenizer_config_uri,
                param_count,
                size_bytes,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_models(&self) -> Result<Vec<Model>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, origin, is_downloaded, weights_uri, tokenizer_uri,
                    tokenizer_config_uri, param_count, size_bytes, featured, thinking
             FROM models ORDER BY name",
        )?;
        let rows = stmt.query_map([], map_model_row)?;
        rows.collect()
    }

    pub fn get_model(&self, id: i64) -> Result<Model> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, origin, is_downloaded, weights_uri, tokenizer_uri,
                    tokenizer_config_uri, param_count, size_bytes, featured, thinking
             FROM models WHERE id = ?1",
            params![id],
            map_model_row,
        )
    }

    pub fn set_model_downloaded(&self, id: i64, downloaded: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE models SET is_downloaded = ?1 WHERE id = ?2",
            params![downloaded as i64, id],
        )?;
        Ok(())
    }

    pub fn update_model_resources(
        &self,
        id: i64,
        tokenizer_uri: &str,
        tokenizer_config_uri: &str,
        name: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE models SET tokenizer_uri = ?1, tokenizer_config_uri = ?2, name = ?3
             WHERE id = ?4",
            params![tokenizer_uri, tokenizer_config_uri, name, id],
        )?;
        Ok(())
    }

    pub fn delete_model(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM models WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ============================================
    // Chat CRUD
    // ============================================

    /// Create a chat row and, when a default-settings blob is stored, seed
    /// the new chat's settings from it.
    pub fn create_chat(&self, model_id: Option<i64>, title: &str) -> Result<Chat> {
        let defaults = self.stored_default_chat_settings()?;
        let conn = self.conn.lock().unwrap();
        let now = now_ms();

        conn.execute(
            "INSERT INTO chats (model_id, title, last_used) VALUES (?1, ?2, ?3)",
            params![model_id, title, now],
        )?;
        let id = conn.last_insert_rowid();

        if let Some(defaults) = defaults {
            conn.execute(
                "INSERT INTO chat_settings (chat_id, system_prompt, context_window)
                 VALUES (?1, ?2, ?3)",
                params![id, defaults.system_prompt, defaults.context_window],
            )?;
        }

        Ok(Chat {
            id,
            model_id,
            title: title.to_string(),
            last_used: now,
        })
    }

    pub fn list_chats(&self) -> Result<Vec<Chat>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, model_id, title, last_used FROM chats ORDER BY last_used DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Chat {
                id: row.get(0)?,
                model_id: row.get(1)?,
                title: row.get(2)?,
                last_used: row.get(3)?,
            })
        })?;
        rows.collect()
    }

    pub fn get_chat(&self, id: i64) -> Result<Chat> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, model_id, title, last_used FROM chats WHERE id = ?1",
            params![id],
            |row| {
                Ok(Chat {
                    id: row.get(0)?,
                    model_id: row.get(1)?,
                    title: row.get(2)?,
                    last_used: row.get(3)?,
                })
            },
        )
    }

    pub fn rename_chat(&self, id: i64, title: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE chats SET title = ?1 WHERE id = ?2",
            params![title, id],
        )?;
        Ok(())
    }

    pub fn set_chat_model(&self, id: i64, model_id: Option<i64>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE chats SET model_id = ?1 WHERE id = ?2",
            params![model_id, id],
        )?;
        Ok(())
    }

    /// Deleting a chat cascades to its messages, settings row, and source
    /// links.
    pub fn delete_chat(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM chats WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ============================================
    // Chat settings
    // ============================================

    pub fn get_chat_settings(&self, chat_id: i64) -> Result<Option<ChatSettings>> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT chat_id, system_prompt, context_window, thinking_enabled
             FROM chat_settings WHERE chat_id = ?1",
            params![chat_id],
            |row| {
                Ok(ChatSettings {
                    chat_id: row.get(0)?,
                    system_prompt: row.get(1)?,
                    context_window: row.get(2)?,
                    thinking_enabled: row.get::<_, Option<i64>>(3)?.map(|v| v != 0),
                })
            },
        );
        match result {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn save_chat_settings(&self, settings: &ChatSettings) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO chat_settings
                (chat_id, system_prompt, context_window, thinking_enabled)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                settings.chat_id,
                settings.system_prompt,
                settings.context_window,
                settings.thinking_enabled.map(|v| v as i64),
            ],
        )?;
        Ok(())
    }

    /// Settings used for a generation call: the chat's own row when present,
    /// otherwise the stored defaults. The context window is clamped to a
    /// positive value, falling back to 6.
    pub fn effective_chat_settings(&self, chat_id: i64) -> Result<ChatSettings> {
        if let Some(mut settings) = self.get_chat_settings(chat_id)? {
            if settings.context_window <= 0 {
                settings.context_window = DEFAULT_CONTEXT_WINDOW;
            }
            return Ok(settings);
        }
        let defaults = self.default_chat_settings()?;
        Ok(ChatSettings {
            chat_id,
            system_prompt: defaults.system_prompt,
            context_window: defaults.context_window,
            thinking_enabled: None,
        })
    }

    // ============================================
    // Message CRUD
    // ============================================

    /// Insert a message, normalizing missing performance metrics to zero,
    /// and touch the owning chat's `last_used`.
    pub fn persist_message(
        &self,
        chat_id: i64,
        role: Role,
        content: &str,
        model: Option<&str>,
        tokens_per_second: Option<f64>,
        time_to_first_token: Option<f64>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let now = now_ms();

        conn.execute(
            "INSERT INTO messages
                (chat_id, role, content, model, tokens_per_second, time_to_first_token, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                chat_id,
                role,
                content,
                model,
                tokens_per_second.unwrap_or(0.0),
                time_to_first_token.unwrap_or(0.0),
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();

        conn.execute(
            "UPDATE chats SET last_used = ?1 WHERE id = ?2",
            params![now, chat_id],
        )?;

        Ok(id)
    }

    /// Messages in ascending id order, which is also chronological order.
    pub fn get_messages(&self, chat_id: i64) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, role, content, model, tokens_per_second,
                    time_to_first_token, created_at
             FROM messages
             WHERE chat_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![chat_id], |row| {
            Ok(Message {
                id: row.get(0)?,
                chat_id: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                model: row.get(4)?,
                tokens_per_second: row.get(5)?,
                time_to_first_token: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?;
        rows.collect()
    }

    // ============================================
    // Source CRUD + chat links
    // ============================================

    pub fn insert_source(
        &self,
        name: &str,
        file_type: &str,
        size_bytes: Option<i64>,
    ) -> Result<Source> {
        let conn = self.conn.lock().unwrap();
        let now = now_ms();
        conn.execute(
            "INSERT INTO sources (name, file_type, size_bytes, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![name, file_type, size_bytes, now],
        )?;
        Ok(Source {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            file_type: file_type.to_string(),
            size_bytes,
            created_at: now,
        })
    }

    pub fn list_sources(&self) -> Result<Vec<Source>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, file_type, size_bytes, created_at
             FROM sources ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Source {
                id: row.get(0)?,
                name: row.get(1)?,
                file_type: row.get(2)?,
                size_bytes: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        rows.collect()
    }

    pub fn rename_source(&self, id: i64, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sources SET name = ?1 WHERE id = ?2",
            params![name, id],
        )?;
        Ok(())
    }

    pub fn delete_source(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sources WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn link_source(&self, chat_id: i64, source_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO chat_sources (chat_id, source_id) VALUES (?1, ?2)",
            params![chat_id, source_id],
        )?;
        Ok(())
    }

    pub fn unlink_source(&self, chat_id: i64, source_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM chat_sources WHERE chat_id = ?1 AND source_id = ?2",
            params![chat_id, source_id],
        )?;
        Ok(())
    }

    pub fn is_source_linked(&self, chat_id: i64, source_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chat_sources WHERE chat_id = ?1 AND source_id = ?2",
            params![chat_id, source_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn source_ids_for_chat(&self, chat_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT source_id FROM chat_sources WHERE chat_id = ?1")?;
        let rows = stmt.query_map(params![chat_id], |row| row.get(0))?;
        rows.collect()
    }

    pub fn chats_linked_to_source(&self, source_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT chat_id FROM chat_sources WHERE source_id = ?1")?;
        let rows = stmt.query_map(params![source_id], |row| row.get(0))?;
        rows.collect()
    }

    /// Announce a source's removal to every chat that had it enabled, then
    /// drop all links for the source. The event message must be inserted
    /// while the link still exists, so the lookup happens first.
    pub fn delete_source_from_chats(&self, source_id: i64, source_name: &str) -> Result<()> {
        let chat_ids = self.chats_linked_to_source(source_id)?;
        let notice = format!(
            "Source \"{source_name}\" was removed and is no longer available in this chat."
        );
        for chat_id in chat_ids {
            self.persist_message(chat_id, Role::Event, &notice, None, None, None)?;
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM chat_sources WHERE source_id = ?1",
            params![source_id],
        )?;
        Ok(())
    }

    // ============================================
    // Benchmark CRUD
    // ============================================

    pub fn insert_benchmark(&self, result: &BenchmarkResult) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO benchmarks
                (model_id, model_name, total_time_ms, time_to_first_token_ms,
                 tokens_generated, tokens_per_second, peak_memory_gb, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                result.model_id,
                result.model_name,
                result.total_time_ms,
                result.time_to_first_token_ms,
                result.tokens_generated,
                result.tokens_per_second,
                result.peak_memory_gb,
                result.created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_benchmarks(&self) -> Result<Vec<BenchmarkResult>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, model_id, model_name, total_time_ms, time_to_first_token_ms,
                    tokens_generated, tokens_per_second, peak_memory_gb, created_at
             FROM benchmarks ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BenchmarkResult {
                id: row.get(0)?,
                model_id: row.get(1)?,
                model_name: row.get(2)?,
                total_time_ms: row.get(3)?,
                time_to_first_token_ms: row.get(4)?,
                tokens_generated: row.get(5)?,
                tokens_per_second: row.get(6)?,
                peak_memory_gb: row.get(7)?,
                created_at: row.get(8)?,
            })
        })?;
        rows.collect()
    }

    pub fn delete_benchmark(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM benchmarks WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ============================================
    // Key-value settings
    // ============================================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        );
        match result {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// The stored default-settings blob, if any. A malformed blob reads as
    /// absent; a non-positive context window falls back to 6.
    fn stored_default_chat_settings(&self) -> Result<Option<DefaultChatSettings>> {
        let Some(raw) = self.get_setting(DEFAULT_SETTINGS_KEY)? else {
            return Ok(None);
        };
        let mut defaults: DefaultChatSettings = match serde_json::from_str(&raw) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("ignoring malformed default chat settings: {e}");
                return Ok(None);
            }
        };
        if defaults.context_window <= 0 {
            defaults.context_window = DEFAULT_CONTEXT_WINDOW;
        }
        Ok(Some(defaults))
    }

    pub fn default_chat_settings(&self) -> Result<DefaultChatSettings> {
        Ok(self.stored_default_chat_settings()?.unwrap_or_default())
    }

    pub fn set_default_chat_settings(&self, defaults: &DefaultChatSettings) -> Result<()> {
        let raw = serde_json::to_string(defaults)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.set_setting(DEFAULT_SETTINGS_KEY, &raw)
    }

    pub fn is_onboarding_complete(&self) -> Result<bool> {
        Ok(self.get_setting(ONBOARDING_KEY)?.as_deref() == Some("true"))
    }

    pub fn set_onboarding_complete(&self, complete: bool) -> Result<()> {
        self.set_setting(ONBOARDING_KEY, if complete { "true" } else { "false" })
    }
}

fn map_model_row(row: &rusqlite::Row<'_>) -> Result<Model> {
    Ok(Model {
        id: row.get(0)?,
        name: row.get(1)?,
        origin: row.get(2)?,
        is_downloaded: row.get::<_, i64>(3)? != 0,
        weights_uri: row.get(4)?,
        tokenizer_uri: row.get(5)?,
        tokenizer_config_uri: row.get(6)?,
        param_count: row.get(7)?,
        size_bytes: row.get(8)?,
        featured: row.get::<_, i64>(9)? != 0,
        thinking: row.get::<_, i64>(10)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;

    fn db() -> Database {
        let _ = env_logger::builder().is_test(true).try_init();
        Database::in_memory().unwrap()
    }

    #[test]
    fn messages_come_back_in_ascending_id_and_time_order() {
        let db = db();
        let chat = db.create_chat(None, "ordering").unwrap();
        for content in ["one", "two", "three"] {
            db.persist_message(chat.id, Role::User, content, None, None, None)
                .unwrap();
        }

        let messages = db.get_messages(chat.id).unwrap();
        assert_eq!(messages.len(), 3);
        for pair in messages.windows(2) {
            assert!(pair[0].id < pair[1].id);
            assert!(pair[0].created_at <= pair[1].created_at);
        }
        assert_eq!(messages[0].content, "one");
        assert_eq!(messages[2].content, "three");
    }

    #[test]
    fn persist_message_normalizes_metrics_and_touches_chat() {
        let db = db();
        let chat = db.create_chat(None, "").unwrap();
        let before = db.get_chat(chat.id).unwrap().last_used;

        db.persist_message(chat.id, Role::Assistant, "hi", Some("m"), None, None)
            .unwrap();

        let messages = db.get_messages(chat.id).unwrap();
        assert_eq!(messages[0].tokens_per_second, 0.0);
        assert_eq!(messages[0].time_to_first_token, 0.0);
        assert!(db.get_chat(chat.id).unwrap().last_used >= before);
    }

    #[test]
    fn deleting_chat_cascades_to_messages_settings_and_links() {
        let db = db();
        let chat = db.create_chat(None, "doomed").unwrap();
        db.persist_message(chat.id, Role::User, "hello", None, None, None)
            .unwrap();
        db.save_chat_settings(&ChatSettings {
            chat_id: chat.id,
            system_prompt: "S".into(),
            context_window: 4,
            thinking_enabled: None,
        })
        .unwrap();
        let source = db.insert_source("doc.pdf", "pdf", Some(10)).unwrap();
        db.link_source(chat.id, source.id).unwrap();

        db.delete_chat(chat.id).unwrap();

        assert!(db.get_messages(chat.id).unwrap().is_empty());
        assert!(db.get_chat_settings(chat.id).unwrap().is_none());
        assert!(db.chats_linked_to_source(source.id).unwrap().is_empty());
    }

    #[test]
    fn source_removal_announces_before_unlinking() {
        let db = db();
        let chat_a = db.create_chat(None, "a").unwrap();
        let chat_b = db.create_chat(None, "b").unwrap();
        let source = db.insert_source("notes.md", "md", None).unwrap();
        db.link_source(chat_a.id, source.id).unwrap();
        db.link_source(chat_b.id, source.id).unwrap();

        db.delete_source_from_chats(source.id, &source.name).unwrap();

        for chat_id in [chat_a.id, chat_b.id] {
            let messages = db.get_messages(chat_id).unwrap();
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].role, Role::Event);
            assert!(messages[0].content.contains("notes.md"));
        }
        assert!(db.chats_linked_to_source(source.id).unwrap().is_empty());
    }

    #[test]
    fn builtin_sync_removes_stale_rows_and_reapplies_flags() {
        let db = db();
        // A built-in that left the catalog, plus a user model that must survive.
        db.insert_model(
            "old-builtin",
            ModelOrigin::BuiltIn,
            false,
            "w",
            "t",
            "c",
            None,
            None,
        )
        .unwrap();
        db.insert_model(
            "user-model",
            ModelOrigin::Remote,
            false,
            "w",
            "t",
            "c",
            None,
            None,
        )
        .unwrap();

        db.sync_builtin_models(catalog::BUILTIN_MODELS).unwrap();
        // Running twice must be idempotent.
        db.sync_builtin_models(catalog::BUILTIN_MODELS).unwrap();

        let models = db.list_models().unwrap();
        assert!(models.iter().all(|m| m.name != "old-builtin"));
        assert!(models.iter().any(|m| m.name == "user-model"));
        let builtins: Vec<_> = models
            .iter()
            .filter(|m| m.origin == ModelOrigin::BuiltIn)
            .collect();
        assert_eq!(builtins.len(), catalog::BUILTIN_MODELS.len());
        for entry in catalog::BUILTIN_MODELS {
            let row = builtins.iter().find(|m| m.name == entry.name).unwrap();
            assert_eq!(row.thinking, entry.thinking);
            assert_eq!(row.featured, entry.featured);
        }
    }

    #[test]
    fn new_chats_are_seeded_from_stored_defaults() {
        let db = db();
        db.set_default_chat_settings(&DefaultChatSettings {
            system_prompt: "Be terse.".into(),
            context_window: 9,
        })
        .unwrap();

        let chat = db.create_chat(None, "seeded").unwrap();
        let settings = db.get_chat_settings(chat.id).unwrap().unwrap();
        assert_eq!(settings.system_prompt, "Be terse.");
        assert_eq!(settings.context_window, 9);
    }

    #[test]
    fn context_window_falls_back_to_six() {
        let db = db();
        // Malformed blob: defaults apply, no settings row is seeded.
        db.set_setting("default_chat_settings", "not json").unwrap();
        let chat = db.create_chat(None, "fallback").unwrap();
        assert!(db.get_chat_settings(chat.id).unwrap().is_none());
        let effective = db.effective_chat_settings(chat.id).unwrap();
        assert_eq!(effective.context_window, DEFAULT_CONTEXT_WINDOW);

        // Non-positive stored window also falls back.
        db.save_chat_settings(&ChatSettings {
            chat_id: chat.id,
            system_prompt: String::new(),
            context_window: 0,
            thinking_enabled: None,
        })
        .unwrap();
        let effective = db.effective_chat_settings(chat.id).unwrap();
        assert_eq!(effective.context_window, DEFAULT_CONTEXT_WINDOW);
    }

    #[test]
    fn onboarding_flag_round_trips() {
        let db = db();
        assert!(!db.is_onboarding_complete().unwrap());
        db.set_onboarding_complete(true).unwrap();
        assert!(db.is_onboarding_complete().unwrap());
    }
}
