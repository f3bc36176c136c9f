use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use oraculo_core::{
    Category, CategoryId, CategoryQuery, CategorySort, Conversation, ConversationId,
    ConversationPatch, ConversationQuery, Message, MessageQuery, NewConversation, NewMessage,
    Order, Procedure, ProcedureDraft, ProcedureFilter, ProcedureId, ProcedureQuery,
    ProcedureSort, ProcedureStatus, Profile, ProfileQuery, ProfileSort, Role,
};
use oraculo_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

pub mod auth;
pub mod config;
pub mod llm;
pub mod storage;
pub mod turn;

pub use auth::{AuthError, Session, MIN_PASSWORD_CHARS};
pub use config::{ConfigError, LlmConfig, OraculoConfig, StorageConfig};
pub use llm::{HttpLlmClient, LlmClient, UnconfiguredLlm};
pub use storage::{mime_for_object, FsObjectStorage, ObjectStorage, UploadedFile};
pub use turn::{AskRequest, TurnAnswer, TurnFailure, TurnStage};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Typed data-access façade over the row store, object storage, and LLM.
///
/// Every call opens its own connection and re-queries; there is no cache.
/// Store errors are surfaced unchanged.
#[derive(Clone)]
pub struct OraculoApi {
    db_path: PathBuf,
    llm: Arc<dyn LlmClient>,
    storage: Arc<dyn ObjectStorage>,
}

impl std::fmt::Debug for OraculoApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OraculoApi").field("db_path", &self.db_path).finish_non_exhaustive()
    }
}

impl OraculoApi {
    #[must_use]
    pub fn new(
        db_path: PathBuf,
        llm: Arc<dyn LlmClient>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        Self { db_path, llm, storage }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// # Errors
    /// Returns an error when the backup file cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        self.open_store()?.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the select fails.
    pub fn list_conversations(&self, query: &ConversationQuery) -> Result<Vec<Conversation>> {
        self.store()?.select_conversations(query)
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn create_conversation(&self, input: &NewConversation) -> Result<Conversation> {
        self.store()?.insert_conversation(input)
    }

    /// # Errors
    /// Returns an error when the conversation does not exist or the update fails.
    pub fn update_conversation(
        &self,
        id: ConversationId,
        patch: &ConversationPatch,
    ) -> Result<Conversation> {
        self.store()?.update_conversation(id, patch)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        self.store()?.get_conversation(id)
    }

    /// # Errors
    /// Returns an error when the select fails.
    pub fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>> {
        self.store()?.select_messages(query)
    }

    /// # Errors
    /// Returns an error when the owning conversation does not exist or the insert fails.
    pub fn create_message(&self, input: &NewMessage) -> Result<Message> {
        self.store()?.insert_message(input)
    }

    /// # Errors
    /// Returns an error when the select fails.
    pub fn list_procedures(&self, query: &ProcedureQuery) -> Result<Vec<Procedure>> {
        self.store()?.select_procedures(query)
    }

    /// Validate, normalize tags, and insert a procedure.
    ///
    /// # Errors
    /// Returns an error when validation or the insert fails.
    pub fn create_procedure(&self, draft: ProcedureDraft) -> Result<Procedure> {
        let draft = draft.normalized();
        draft.validate()?;
        self.store()?.insert_procedure(&draft)
    }

    /// Replace the editable fields of a procedure. The version is stored as supplied.
    ///
    /// # Errors
    /// Returns an error when validation fails, the procedure is missing, or the update fails.
    pub fn update_procedure(&self, id: ProcedureId, draft: ProcedureDraft) -> Result<Procedure> {
        let draft = draft.normalized();
        draft.validate()?;
        self.store()?.update_procedure(id, &draft)
    }

    /// # Errors
    /// Returns an error when the procedure is missing or the delete fails.
    pub fn delete_procedure(&self, id: ProcedureId) -> Result<()> {
        self.store()?.delete_procedure(id)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_procedure(&self, id: ProcedureId) -> Result<Option<Procedure>> {
        self.store()?.get_procedure(id)
    }

    /// Case-insensitive title/summary search, optionally restricted to one status.
    ///
    /// Results are ordered by most recent update first.
    ///
    /// # Errors
    /// Returns an error when the select fails.
    pub fn search_procedures(
        &self,
        term: &str,
        status: Option<ProcedureStatus>,
        order: Option<Order<ProcedureSort>>,
    ) -> Result<Vec<Procedure>> {
        let mut query = ProcedureQuery::all().order_by(
            order.unwrap_or_else(|| Order::desc(ProcedureSort::UpdatedAt)),
        );
        if let Some(status) = status {
            query = query.filter(ProcedureFilter::Status(status));
        }
        let needle = term.trim().to_lowercase();
        let procedures = self.list_procedures(&query)?;
        if needle.is_empty() {
            return Ok(procedures);
        }
        Ok(procedures
            .into_iter()
            .filter(|procedure| {
                procedure.title.to_lowercase().contains(&needle)
                    || procedure.summary.to_lowercase().contains(&needle)
            })
            .collect())
    }

    /// # Errors
    /// Returns an error when the select fails.
    pub fn count_active_procedures(&self) -> Result<usize> {
        let active = self.list_procedures(
            &ProcedureQuery::all().filter(ProcedureFilter::Status(ProcedureStatus::Active)),
        )?;
        Ok(active.len())
    }

    /// Categories ordered by name.
    ///
    /// # Errors
    /// Returns an error when the select fails.
    pub fn list_categories(&self) -> Result<Vec<Category>> {
        self.store()?.select_categories(&CategoryQuery::all().order_by(Order::asc(CategorySort::Name)))
    }

    /// # Errors
    /// Returns an error when the name is blank or the insert fails.
    pub fn create_category(&self, name: &str) -> Result<Category> {
        self.store()?.insert_category(name)
    }

    /// # Errors
    /// Returns an error when the name is blank, the category is missing, or the update fails.
    pub fn rename_category(&self, id: CategoryId, name: &str) -> Result<Category> {
        self.store()?.update_category(id, name)
    }

    /// # Errors
    /// Returns an error when the category is missing or the delete fails.
    pub fn delete_category(&self, id: CategoryId) -> Result<()> {
        self.store()?.delete_category(id)
    }

    /// Users matching `query`, ordered by full name unless another order is given.
    ///
    /// # Errors
    /// Returns an error when the select fails.
    pub fn list_users(&self, query: ProfileQuery) -> Result<Vec<Profile>> {
        let query = match query.order {
            Some(_) => query,
            None => query.order_by(Order::asc(ProfileSort::FullName)),
        };
        self.store()?.select_profiles(&query)
    }

    /// Case-insensitive match on full name or email.
    ///
    /// # Errors
    /// Returns an error when the select fails.
    pub fn search_users(&self, term: &str) -> Result<Vec<Profile>> {
        let needle = term.trim().to_lowercase();
        let users = self.list_users(ProfileQuery::all())?;
        Ok(users
            .into_iter()
            .filter(|user| {
                needle.is_empty()
                    || user.full_name.to_lowercase().contains(&needle)
                    || user.email.to_lowercase().contains(&needle)
            })
            .collect())
    }

    /// # Errors
    /// Returns an error when no user has `email` or the update fails.
    pub fn set_user_role(&self, email: &str, role: Role) -> Result<Profile> {
        self.store()?.update_profile_role(&email.trim().to_lowercase(), role)
    }

    /// # Errors
    /// Returns an error when the object storage rejects or fails the write.
    pub fn upload_file(&self, file_name: &str, mime_type: &str, bytes: &[u8]) -> Result<UploadedFile> {
        self.storage.put(file_name, mime_type, bytes)
    }

    /// # Errors
    /// Returns an error when the object name is malformed or the read fails.
    pub fn read_file(&self, object_name: &str) -> Result<Option<Vec<u8>>> {
        self.storage.get(object_name)
    }

    /// Forward a composed prompt to the LLM collaborator.
    ///
    /// # Errors
    /// Returns an error when the model call fails or returns a blank answer.
    pub fn invoke_llm(&self, prompt: &str) -> Result<String> {
        let answer = self.llm.generate(prompt)?;
        if answer.trim().is_empty() {
            return Err(anyhow!("llm returned an empty response"));
        }
        Ok(answer)
    }
}
