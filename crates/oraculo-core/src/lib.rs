use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub mod prompt;
pub mod query;
pub mod scoring;

pub use prompt::{
    build_grounding_context, citations_for, compose_grounded_prompt, CITATION_LIMIT,
    CITATION_RELEVANCE_LABEL, NO_MATCH_RESPONSE, UNCATEGORIZED_LABEL,
};
pub use query::{
    CategoryFilter, CategoryQuery, CategorySort, ConversationFilter, ConversationQuery,
    ConversationSort, Direction, FieldValue, FilterField, MessageFilter, MessageQuery, MessageSort,
    Order, ProcedureFilter, ProcedureQuery, ProcedureSort, ProfileFilter, ProfileQuery,
    ProfileSort, Query, SortField,
};
pub use scoring::{score_procedures, ScoredProcedure, RELEVANCE_LIMIT};

/// Maximum number of characters of the first question kept in a conversation title.
pub const CONVERSATION_TITLE_CHARS: usize = 50;
pub const CONVERSATION_TITLE_ELLIPSIS: &str = "...";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DomainError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("query error: {0}")]
    Query(String),
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
}

impl DomainError {
    #[must_use]
    pub fn not_found(entity: &'static str, key: impl Display) -> Self {
        Self::NotFound { entity, key: key.to_string() }
    }
}

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parse the canonical ULID text form.
            ///
            /// # Errors
            /// Returns [`DomainError::Validation`] when `raw` is not a valid ULID.
            pub fn parse(raw: &str) -> Result<Self, DomainError> {
                Ulid::from_string(raw)
                    .map(Self)
                    .map_err(|err| DomainError::Validation(format!("invalid ULID {raw}: {err}")))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(ConversationId);
ulid_id!(MessageId);
ulid_id!(ProcedureId);
ulid_id!(CategoryId);
ulid_id!(ProfileId);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureStatus {
    #[default]
    Active,
    Draft,
    Archived,
}

impl ProcedureStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Draft => "draft",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "draft" => Some(Self::Draft),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    #[default]
    User,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub user_email: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_message_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewConversation {
    pub title: String,
    pub user_email: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_message_at: OffsetDateTime,
}

impl NewConversation {
    /// Conversation opened by the first question of a turn.
    #[must_use]
    pub fn for_question(question: &str, user_email: &str, now: OffsetDateTime) -> Self {
        Self {
            title: conversation_title(question),
            user_email: user_email.to_string(),
            last_message_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationPatch {
    pub title: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
}

/// Denormalized snapshot of a procedure cited by an assistant answer.
///
/// Citations are never re-validated: they keep the title the procedure had
/// when the answer was produced, even if it was later edited or removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceCitation {
    pub procedure_id: ProcedureId,
    pub title: String,
    pub relevance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<SourceCitation>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<SourceCitation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub file_url: String,
    pub file_name: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Procedure {
    pub id: ProcedureId,
    pub title: String,
    pub category_id: Option<CategoryId>,
    pub status: ProcedureStatus,
    pub content_md: String,
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub version: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Editable procedure fields, used for both create and full update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcedureDraft {
    pub title: String,
    #[serde(default)]
    pub category_id: Option<CategoryId>,
    #[serde(default)]
    pub status: ProcedureStatus,
    pub content_md: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl ProcedureDraft {
    /// Validate the input boundary before any store round-trip.
    ///
    /// # Errors
    /// Returns [`DomainError::Validation`] when the title or markdown body is blank,
    /// or when the caller-supplied version is zero.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.title.trim().is_empty() {
            return Err(DomainError::Validation("procedure title MUST be provided".to_string()));
        }
        if self.content_md.trim().is_empty() {
            return Err(DomainError::Validation(
                "procedure content_md MUST be provided".to_string(),
            ));
        }
        if self.version == 0 {
            return Err(DomainError::Validation("procedure version MUST be >= 1".to_string()));
        }
        for attachment in &self.attachments {
            if attachment.file_url.trim().is_empty() {
                return Err(DomainError::Validation(
                    "attachment file_url MUST be provided".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Trim every tag and drop blanks and repeats, keeping first-seen order.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let raw = std::mem::take(&mut self.tags);
        for tag in raw {
            add_tag(&mut self.tags, &tag);
        }
        self
    }
}

impl From<Procedure> for ProcedureDraft {
    fn from(procedure: Procedure) -> Self {
        Self {
            title: procedure.title,
            category_id: procedure.category_id,
            status: procedure.status,
            content_md: procedure.content_md,
            summary: procedure.summary,
            tags: procedure.tags,
            attachments: procedure.attachments,
            version: procedure.version,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub id: ProfileId,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// The authenticated caller, passed explicitly into every façade call that needs it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionUser {
    pub id: ProfileId,
    pub email: String,
    pub full_name: String,
    pub role: Role,
}

impl SessionUser {
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl From<Profile> for SessionUser {
    fn from(profile: Profile) -> Self {
        Self {
            id: profile.id,
            email: profile.email,
            full_name: profile.full_name,
            role: profile.role,
        }
    }
}

/// Derive a conversation title from the first question: the first 50 characters,
/// followed by `...` when anything was cut.
#[must_use]
pub fn conversation_title(question: &str) -> String {
    let mut title = question.chars().take(CONVERSATION_TITLE_CHARS).collect::<String>();
    if question.chars().count() > CONVERSATION_TITLE_CHARS {
        title.push_str(CONVERSATION_TITLE_ELLIPSIS);
    }
    title
}

/// Append a trimmed tag unless it is blank or already present.
///
/// Returns `true` when the tag was added.
pub fn add_tag(tags: &mut Vec<String>, raw: &str) -> bool {
    let tag = raw.trim();
    if tag.is_empty() || tags.iter().any(|existing| existing == tag) {
        return false;
    }
    tags.push(tag.to_string());
    true
}

/// Remove every occurrence of `tag`. Returns `true` when something was removed.
pub fn remove_tag(tags: &mut Vec<String>, tag: &str) -> bool {
    let before = tags.len();
    tags.retain(|existing| existing != tag);
    tags.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_draft(title: &str, content_md: &str) -> ProcedureDraft {
        ProcedureDraft {
            title: title.to_string(),
            category_id: None,
            status: ProcedureStatus::Active,
            content_md: content_md.to_string(),
            summary: String::new(),
            tags: Vec::new(),
            attachments: Vec::new(),
            version: 1,
        }
    }

    #[test]
    fn short_question_becomes_title_unchanged() {
        assert_eq!(conversation_title("Como pedir reembolso?"), "Como pedir reembolso?");
    }

    #[test]
    fn long_question_is_truncated_to_fifty_chars_with_marker() {
        let question = "a".repeat(51);
        let title = conversation_title(&question);
        assert_eq!(title, format!("{}...", "a".repeat(50)));
    }

    #[test]
    fn exactly_fifty_chars_has_no_marker() {
        let question = "b".repeat(50);
        assert_eq!(conversation_title(&question), question);
    }

    #[test]
    fn title_truncation_counts_characters_not_bytes() {
        let question = "ç".repeat(60);
        let title = conversation_title(&question);
        assert_eq!(title.chars().count(), 53);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn validate_rejects_blank_title() {
        let err = mk_draft("   ", "corpo").validate();
        assert!(matches!(err, Err(DomainError::Validation(message)) if message.contains("title")));
    }

    #[test]
    fn validate_rejects_blank_content() {
        let err = mk_draft("Reembolso", "\n").validate();
        assert!(
            matches!(err, Err(DomainError::Validation(message)) if message.contains("content_md"))
        );
    }

    #[test]
    fn validate_rejects_zero_version() {
        let mut draft = mk_draft("Reembolso", "corpo");
        draft.version = 0;
        assert!(draft.validate().is_err());
    }

    #[test]
    fn add_tag_trims_and_skips_duplicates() {
        let mut tags = Vec::new();
        assert!(add_tag(&mut tags, " financeiro "));
        assert!(!add_tag(&mut tags, "financeiro"));
        assert!(!add_tag(&mut tags, "   "));
        assert!(add_tag(&mut tags, "rh"));
        assert_eq!(tags, vec!["financeiro".to_string(), "rh".to_string()]);
        assert!(remove_tag(&mut tags, "financeiro"));
        assert_eq!(tags, vec!["rh".to_string()]);
    }

    #[test]
    fn normalized_draft_deduplicates_tags_in_order() {
        let mut draft = mk_draft("Reembolso", "corpo");
        draft.tags = vec!["b".to_string(), " a".to_string(), "b ".to_string(), String::new()];
        let draft = draft.normalized();
        assert_eq!(draft.tags, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn enums_round_trip_through_text_form() {
        for status in [ProcedureStatus::Active, ProcedureStatus::Draft, ProcedureStatus::Archived] {
            assert_eq!(ProcedureStatus::parse(status.as_str()), Some(status));
        }
        for role in [Role::Admin, Role::User] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(MessageRole::parse("assistant"), Some(MessageRole::Assistant));
        assert_eq!(MessageRole::parse("system"), None);
    }

    #[test]
    fn ids_parse_their_display_form() {
        let id = ProcedureId::new();
        assert_eq!(ProcedureId::parse(&id.to_string()), Ok(id));
        assert!(CategoryId::parse("not-a-ulid").is_err());
    }

    #[test]
    fn draft_defaults_apply_when_fields_are_omitted() {
        let draft: ProcedureDraft = match serde_json::from_value(serde_json::json!({
            "title": "Férias",
            "content_md": "Solicitar com 30 dias"
        })) {
            Ok(draft) => draft,
            Err(err) => panic!("draft should deserialize: {err}"),
        };
        assert_eq!(draft.status, ProcedureStatus::Active);
        assert_eq!(draft.version, 1);
        assert!(draft.tags.is_empty());
    }
}
