use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use oraculo_core::{
    Attachment, Category, CategoryId, CategoryQuery, Conversation, ConversationId,
    ConversationPatch, ConversationQuery, DomainError, FieldValue, FilterField, Message,
    MessageId, MessageQuery, MessageRole, NewConversation, NewMessage, Procedure, ProcedureDraft,
    ProcedureId, ProcedureQuery, ProcedureStatus, Profile, ProfileFilter, ProfileId, ProfileQuery,
    Query, Role, SortField, SourceCitation,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, DatabaseName, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
);
";

// Timestamps are stored as UTC unix nanoseconds so ORDER BY matches chronology.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS conversations (
  id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  user_email TEXT NOT NULL,
  last_message_at INTEGER NOT NULL,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
  id TEXT PRIMARY KEY,
  conversation_id TEXT NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('user','assistant')),
  content TEXT NOT NULL,
  sources_json TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  FOREIGN KEY (conversation_id) REFERENCES conversations(id)
);

CREATE TABLE IF NOT EXISTS procedures (
  id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  category_id TEXT,
  status TEXT NOT NULL CHECK (status IN ('active','draft','archived')),
  content_md TEXT NOT NULL,
  summary TEXT NOT NULL,
  tags_json TEXT NOT NULL,
  attachments_json TEXT NOT NULL,
  version INTEGER NOT NULL CHECK (version >= 1),
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS categories (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS profiles (
  id TEXT PRIMARY KEY,
  email TEXT NOT NULL UNIQUE,
  full_name TEXT NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('admin','user')),
  password_hash TEXT NOT NULL,
  created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_procedures_status ON procedures(status);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
  token_hash TEXT PRIMARY KEY,
  profile_id TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  FOREIGN KEY (profile_id) REFERENCES profiles(id)
);

CREATE INDEX IF NOT EXISTS idx_sessions_profile ON sessions(profile_id);
CREATE INDEX IF NOT EXISTS idx_conversations_user_email ON conversations(user_email);
CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
  ON messages(conversation_id, created_at);
";

const CONVERSATION_COLUMNS: &str = "id, title, user_email, last_message_at, created_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, sources_json, created_at";
const PROCEDURE_COLUMNS: &str = "id, title, category_id, status, content_md, summary, \
     tags_json, attachments_json, version, created_at, updated_at";
const CATEGORY_COLUMNS: &str = "id, name, created_at";
const PROFILE_COLUMNS: &str = "id, email, full_name, role, created_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Profile row as written by sign-up; the password hash never leaves the store
/// except through [`SqliteStore::profile_credentials`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProfile {
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub password_hash: String,
}

impl SqliteStore {
    /// Open a SQLite-backed row store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than this build.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL)?;
        }
        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration {version}"))?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, unix_nanos(OffsetDateTime::now_utc())?],
        )
        .with_context(|| format!("failed to record migration version {version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration {version}"))?;
        Ok(())
    }

    /// Insert one conversation and return the stored row.
    ///
    /// # Errors
    /// Returns an error when the insert or the read-back fails.
    pub fn insert_conversation(&mut self, input: &NewConversation) -> Result<Conversation> {
        let id = ConversationId::new();
        self.conn
            .execute(
                "INSERT INTO conversations(id, title, user_email, last_message_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.to_string(),
                    input.title,
                    input.user_email,
                    unix_nanos(input.last_message_at)?,
                    unix_nanos(OffsetDateTime::now_utc())?,
                ],
            )
            .context("failed to insert conversation")?;
        self.get_conversation(id)?
            .ok_or_else(|| anyhow!("conversation missing after insert: {id}"))
    }

    /// Apply the non-empty fields of `patch` and return the updated row.
    ///
    /// # Errors
    /// Returns an error when the conversation does not exist or the update fails.
    pub fn update_conversation(
        &mut self,
        id: ConversationId,
        patch: &ConversationPatch,
    ) -> Result<Conversation> {
        let last_message_at = patch.last_message_at.map(unix_nanos).transpose()?;
        let changed = self
            .conn
            .execute(
                "UPDATE conversations
                 SET title = COALESCE(?2, title),
                     last_message_at = COALESCE(?3, last_message_at)
                 WHERE id = ?1",
                params![id.to_string(), patch.title, last_message_at],
            )
            .context("failed to update conversation")?;
        if changed == 0 {
            return Err(DomainError::not_found("conversation", id).into());
        }
        self.get_conversation(id)?.ok_or_else(|| DomainError::not_found("conversation", id).into())
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        self.fetch_by_id("conversations", CONVERSATION_COLUMNS, &id.to_string(), conversation_from_row)
    }

    /// # Errors
    /// Returns an error when the select or row decoding fails.
    pub fn select_conversations(&self, query: &ConversationQuery) -> Result<Vec<Conversation>> {
        self.select_rows("conversations", CONVERSATION_COLUMNS, query, conversation_from_row)
    }

    /// Append one immutable message to an existing conversation.
    ///
    /// # Errors
    /// Returns an error when the conversation does not exist (foreign key) or the insert fails.
    pub fn insert_message(&mut self, input: &NewMessage) -> Result<Message> {
        let id = MessageId::new();
        self.conn
            .execute(
                "INSERT INTO messages(id, conversation_id, role, content, sources_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    input.conversation_id.to_string(),
                    input.role.as_str(),
                    input.content,
                    serde_json::to_string(&input.sources)
                        .context("failed to serialize message sources")?,
                    unix_nanos(OffsetDateTime::now_utc())?,
                ],
            )
            .context("failed to insert message")?;
        self.fetch_by_id("messages", MESSAGE_COLUMNS, &id.to_string(), message_from_row)?
            .ok_or_else(|| anyhow!("message missing after insert: {id}"))
    }

    /// # Errors
    /// Returns an error when the select or row decoding fails.
    pub fn select_messages(&self, query: &MessageQuery) -> Result<Vec<Message>> {
        self.select_rows("messages", MESSAGE_COLUMNS, query, message_from_row)
    }

    /// Validate and insert one procedure, returning the stored row.
    ///
    /// # Errors
    /// Returns an error when validation, serialization, or the insert fails.
    pub fn insert_procedure(&mut self, draft: &ProcedureDraft) -> Result<Procedure> {
        draft.validate().context("procedure validation failed")?;

        let id = ProcedureId::new();
        let now = unix_nanos(OffsetDateTime::now_utc())?;
        self.conn
            .execute(
                "INSERT INTO procedures(
                    id, title, category_id, status, content_md, summary,
                    tags_json, attachments_json, version, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    id.to_string(),
                    draft.title,
                    draft.category_id.map(|category| category.to_string()),
                    draft.status.as_str(),
                    draft.content_md,
                    draft.summary,
                    serde_json::to_string(&draft.tags).context("failed to serialize tags")?,
                    serde_json::to_string(&draft.attachments)
                        .context("failed to serialize attachments")?,
                    i64::from(draft.version),
                    now,
                    now,
                ],
            )
            .context("failed to insert procedure")?;
        self.get_procedure(id)?.ok_or_else(|| anyhow!("procedure missing after insert: {id}"))
    }

    /// Replace every editable field of a procedure and bump `updated_at`.
    ///
    /// The version is written exactly as supplied.
    ///
    /// # Errors
    /// Returns an error when validation fails, the procedure does not exist, or the update fails.
    pub fn update_procedure(&mut self, id: ProcedureId, draft: &ProcedureDraft) -> Result<Procedure> {
        draft.validate().context("procedure validation failed")?;

        let changed = self
            .conn
            .execute(
                "UPDATE procedures
                 SET title = ?2, category_id = ?3, status = ?4, content_md = ?5, summary = ?6,
                     tags_json = ?7, attachments_json = ?8, version = ?9, updated_at = ?10
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    draft.title,
                    draft.category_id.map(|category| category.to_string()),
                    draft.status.as_str(),
                    draft.content_md,
                    draft.summary,
                    serde_json::to_string(&draft.tags).context("failed to serialize tags")?,
                    serde_json::to_string(&draft.attachments)
                        .context("failed to serialize attachments")?,
                    i64::from(draft.version),
                    unix_nanos(OffsetDateTime::now_utc())?,
                ],
            )
            .context("failed to update procedure")?;
        if changed == 0 {
            return Err(DomainError::not_found("procedure", id).into());
        }
        self.get_procedure(id)?.ok_or_else(|| DomainError::not_found("procedure", id).into())
    }

    /// # Errors
    /// Returns an error when the procedure does not exist or the delete fails.
    pub fn delete_procedure(&mut self, id: ProcedureId) -> Result<()> {
        let changed = self
            .conn
            .execute("DELETE FROM procedures WHERE id = ?1", params![id.to_string()])
            .context("failed to delete procedure")?;
        if changed == 0 {
            return Err(DomainError::not_found("procedure", id).into());
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_procedure(&self, id: ProcedureId) -> Result<Option<Procedure>> {
        self.fetch_by_id("procedures", PROCEDURE_COLUMNS, &id.to_string(), procedure_from_row)
    }

    /// # Errors
    /// Returns an error when the select or row decoding fails.
    pub fn select_procedures(&self, query: &ProcedureQuery) -> Result<Vec<Procedure>> {
        self.select_rows("procedures", PROCEDURE_COLUMNS, query, procedure_from_row)
    }

    /// # Errors
    /// Returns an error when the name is blank or the insert fails.
    pub fn insert_category(&mut self, name: &str) -> Result<Category> {
        let name = required_name(name)?;
        let id = CategoryId::new();
        self.conn
            .execute(
                "INSERT INTO categories(id, name, created_at) VALUES (?1, ?2, ?3)",
                params![id.to_string(), name, unix_nanos(OffsetDateTime::now_utc())?],
            )
            .context("failed to insert category")?;
        self.get_category(id)?.ok_or_else(|| anyhow!("category missing after insert: {id}"))
    }

    /// # Errors
    /// Returns an error when the name is blank, the category does not exist, or the update fails.
    pub fn update_category(&mut self, id: CategoryId, name: &str) -> Result<Category> {
        let name = required_name(name)?;
        let changed = self
            .conn
            .execute("UPDATE categories SET name = ?2 WHERE id = ?1", params![id.to_string(), name])
            .context("failed to update category")?;
        if changed == 0 {
            return Err(DomainError::not_found("category", id).into());
        }
        self.get_category(id)?.ok_or_else(|| DomainError::not_found("category", id).into())
    }

    /// Delete a category. Procedures keep their (now dangling) weak reference.
    ///
    /// # Errors
    /// Returns an error when the category does not exist or the delete fails.
    pub fn delete_category(&mut self, id: CategoryId) -> Result<()> {
        let changed = self
            .conn
            .execute("DELETE FROM categories WHERE id = ?1", params![id.to_string()])
            .context("failed to delete category")?;
        if changed == 0 {
            return Err(DomainError::not_found("category", id).into());
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_category(&self, id: CategoryId) -> Result<Option<Category>> {
        self.fetch_by_id("categories", CATEGORY_COLUMNS, &id.to_string(), category_from_row)
    }

    /// # Errors
    /// Returns an error when the select or row decoding fails.
    pub fn select_categories(&self, query: &CategoryQuery) -> Result<Vec<Category>> {
        self.select_rows("categories", CATEGORY_COLUMNS, query, category_from_row)
    }

    /// # Errors
    /// Returns an error when the email is already registered or the insert fails.
    pub fn insert_profile(&mut self, input: &NewProfile) -> Result<Profile> {
        let id = ProfileId::new();
        self.conn
            .execute(
                "INSERT INTO profiles(id, email, full_name, role, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    input.email,
                    input.full_name,
                    input.role.as_str(),
                    input.password_hash,
                    unix_nanos(OffsetDateTime::now_utc())?,
                ],
            )
            .context("failed to insert profile")?;
        self.get_profile(id)?.ok_or_else(|| anyhow!("profile missing after insert: {id}"))
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_profile(&self, id: ProfileId) -> Result<Option<Profile>> {
        self.fetch_by_id("profiles", PROFILE_COLUMNS, &id.to_string(), profile_from_row)
    }

    /// # Errors
    /// Returns an error when the select or row decoding fails.
    pub fn select_profiles(&self, query: &ProfileQuery) -> Result<Vec<Profile>> {
        self.select_rows("profiles", PROFILE_COLUMNS, query, profile_from_row)
    }

    /// Load a profile together with its stored password hash.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn profile_credentials(&self, email: &str) -> Result<Option<(Profile, String)>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROFILE_COLUMNS}, password_hash FROM profiles WHERE email = ?1"
        ))?;
        let mut rows = stmt.query(params![email])?;
        match rows.next()? {
            Some(row) => Ok(Some((profile_from_row(row)?, row.get(5)?))),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns an error when no profile has `email` or the update fails.
    pub fn update_profile_role(&mut self, email: &str, role: Role) -> Result<Profile> {
        let changed = self
            .conn
            .execute("UPDATE profiles SET role = ?2 WHERE email = ?1", params![email, role.as_str()])
            .context("failed to update profile role")?;
        if changed == 0 {
            return Err(DomainError::not_found("profile", email).into());
        }
        let mut profiles = self.select_profiles(
            &ProfileQuery::all().filter(ProfileFilter::Email(email.to_string())),
        )?;
        profiles.pop().ok_or_else(|| DomainError::not_found("profile", email).into())
    }

    /// # Errors
    /// Returns an error when the profile does not exist or the insert fails.
    pub fn insert_session(&mut self, token_hash: &str, profile_id: ProfileId) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sessions(token_hash, profile_id, created_at) VALUES (?1, ?2, ?3)",
                params![token_hash, profile_id.to_string(), unix_nanos(OffsetDateTime::now_utc())?],
            )
            .context("failed to insert session")?;
        Ok(())
    }

    /// Resolve the profile that owns a session token hash.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn session_profile(&self, token_hash: &str) -> Result<Option<Profile>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.id, p.email, p.full_name, p.role, p.created_at
             FROM sessions s
             JOIN profiles p ON p.id = s.profile_id
             WHERE s.token_hash = ?1",
        )?;
        let mut rows = stmt.query(params![token_hash])?;
        match rows.next()? {
            Some(row) => Ok(Some(profile_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Returns `true` when a session was removed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_session(&mut self, token_hash: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM sessions WHERE token_hash = ?1", params![token_hash])
            .context("failed to delete session")?;
        Ok(changed > 0)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    fn fetch_by_id<T>(
        &self,
        table: &str,
        columns: &str,
        id: &str,
        decode: fn(&Row<'_>) -> Result<T>,
    ) -> Result<Option<T>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {columns} FROM {table} WHERE id = ?1"))
            .with_context(|| format!("failed to prepare lookup on {table}"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(decode(row)?)),
            None => Ok(None),
        }
    }

    fn select_rows<F, S, T>(
        &self,
        table: &str,
        columns: &str,
        query: &Query<F, S>,
        decode: fn(&Row<'_>) -> Result<T>,
    ) -> Result<Vec<T>>
    where
        F: FilterField,
        S: SortField,
    {
        let (sql, values) = build_select_sql(table, columns, query);
        let mut stmt =
            self.conn.prepare(&sql).with_context(|| format!("failed to prepare select on {table}"))?;
        let mut rows = stmt.query(params_from_iter(values.iter()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(decode(row)?);
        }
        Ok(out)
    }
}

/// Build `SELECT ... WHERE a = ?1 AND b = ?2 ORDER BY col DIR`.
///
/// Column names come from closed enums, never from caller text. Insertion
/// order (`rowid`) is the final tie-breaker so equal sort keys stay stable.
fn build_select_sql<F, S>(table: &str, columns: &str, query: &Query<F, S>) -> (String, Vec<Value>)
where
    F: FilterField,
    S: SortField,
{
    let mut sql = format!("SELECT {columns} FROM {table}");
    let mut values = Vec::with_capacity(query.filters.len());
    for (index, filter) in query.filters.iter().enumerate() {
        let joiner = if index == 0 { " WHERE " } else { " AND " };
        sql.push_str(joiner);
        sql.push_str(filter.column());
        sql.push_str(&format!(" = ?{}", index + 1));
        values.push(match filter.value() {
            FieldValue::Text(text) => Value::Text(text),
            FieldValue::Integer(number) => Value::Integer(number),
        });
    }
    match query.order {
        Some(order) => sql.push_str(&format!(
            " ORDER BY {} {}, rowid ASC",
            order.field.column(),
            order.direction.as_sql()
        )),
        None => sql.push_str(" ORDER BY rowid ASC"),
    }
    (sql, values)
}

fn conversation_from_row(row: &Row<'_>) -> Result<Conversation> {
    Ok(Conversation {
        id: ConversationId::parse(&row.get::<_, String>(0)?)?,
        title: row.get(1)?,
        user_email: row.get(2)?,
        last_message_at: from_unix_nanos(row.get(3)?)?,
        created_at: from_unix_nanos(row.get(4)?)?,
    })
}

fn message_from_row(row: &Row<'_>) -> Result<Message> {
    let role_raw: String = row.get(2)?;
    let sources_json: String = row.get(4)?;
    Ok(Message {
        id: MessageId::parse(&row.get::<_, String>(0)?)?,
        conversation_id: ConversationId::parse(&row.get::<_, String>(1)?)?,
        role: MessageRole::parse(&role_raw)
            .ok_or_else(|| anyhow!("unknown message role: {role_raw}"))?,
        content: row.get(3)?,
        sources: serde_json::from_str::<Vec<SourceCitation>>(&sources_json)
            .context("failed to deserialize message sources")?,
        created_at: from_unix_nanos(row.get(5)?)?,
    })
}

fn procedure_from_row(row: &Row<'_>) -> Result<Procedure> {
    let category_raw: Option<String> = row.get(2)?;
    let status_raw: String = row.get(3)?;
    let tags_json: String = row.get(6)?;
    let attachments_json: String = row.get(7)?;
    Ok(Procedure {
        id: ProcedureId::parse(&row.get::<_, String>(0)?)?,
        title: row.get(1)?,
        category_id: category_raw.as_deref().map(CategoryId::parse).transpose()?,
        status: ProcedureStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown procedure status: {status_raw}"))?,
        content_md: row.get(4)?,
        summary: row.get(5)?,
        tags: serde_json::from_str(&tags_json).context("failed to deserialize tags")?,
        attachments: serde_json::from_str::<Vec<Attachment>>(&attachments_json)
            .context("failed to deserialize attachments")?,
        version: row.get::<_, u32>(8)?,
        created_at: from_unix_nanos(row.get(9)?)?,
        updated_at: from_unix_nanos(row.get(10)?)?,
    })
}

fn category_from_row(row: &Row<'_>) -> Result<Category> {
    Ok(Category {
        id: CategoryId::parse(&row.get::<_, String>(0)?)?,
        name: row.get(1)?,
        created_at: from_unix_nanos(row.get(2)?)?,
    })
}

fn profile_from_row(row: &Row<'_>) -> Result<Profile> {
    let role_raw: String = row.get(3)?;
    Ok(Profile {
        id: ProfileId::parse(&row.get::<_, String>(0)?)?,
        email: row.get(1)?,
        full_name: row.get(2)?,
        role: Role::parse(&role_raw).ok_or_else(|| anyhow!("unknown profile role: {role_raw}"))?,
        created_at: from_unix_nanos(row.get(4)?)?,
    })
}

fn required_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(
            DomainError::Validation("category name MUST be provided".to_string()).into()
        );
    }
    Ok(trimmed)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn unix_nanos(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos())
        .with_context(|| format!("timestamp out of storable range: {value}"))
}

fn from_unix_nanos(value: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value))
        .with_context(|| format!("invalid stored timestamp: {value}"))
}
