//! Typed query descriptors for the row store.
//!
//! Every entity has a closed filter enum (field plus typed value, equality only)
//! and a closed sort-field enum. Filters combine with AND.

use serde::{Deserialize, Serialize};

use crate::{CategoryId, ConversationId, DomainError, MessageRole, ProcedureStatus, Role};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

impl Direction {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
}

pub trait FilterField {
    fn column(&self) -> &'static str;
    fn value(&self) -> FieldValue;
}

pub trait SortField: Copy + Sized {
    fn column(self) -> &'static str;
    fn parse(name: &str) -> Option<Self>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Order<S> {
    pub field: S,
    pub direction: Direction,
}

impl<S: SortField> Order<S> {
    #[must_use]
    pub fn asc(field: S) -> Self {
        Self { field, direction: Direction::Ascending }
    }

    #[must_use]
    pub fn desc(field: S) -> Self {
        Self { field, direction: Direction::Descending }
    }

    /// Parse the sign-prefixed form: `field` ascending, `-field` descending.
    ///
    /// # Errors
    /// Returns [`DomainError::Query`] when the field is not sortable for this entity.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let raw = raw.trim();
        let (name, direction) = match raw.strip_prefix('-') {
            Some(name) => (name, Direction::Descending),
            None => (raw, Direction::Ascending),
        };
        let field = S::parse(name)
            .ok_or_else(|| DomainError::Query(format!("unsupported order field: {name}")))?;
        Ok(Self { field, direction })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query<F, S> {
    pub filters: Vec<F>,
    pub order: Option<Order<S>>,
}

impl<F, S> Default for Query<F, S> {
    fn default() -> Self {
        Self { filters: Vec::new(), order: None }
    }
}

impl<F, S> Query<F, S> {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn filter(mut self, filter: F) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn order_by(mut self, order: Order<S>) -> Self {
        self.order = Some(order);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationFilter {
    Id(ConversationId),
    UserEmail(String),
}

impl FilterField for ConversationFilter {
    fn column(&self) -> &'static str {
        match self {
            Self::Id(_) => "id",
            Self::UserEmail(_) => "user_email",
        }
    }

    fn value(&self) -> FieldValue {
        match self {
            Self::Id(id) => FieldValue::Text(id.to_string()),
            Self::UserEmail(email) => FieldValue::Text(email.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationSort {
    Title,
    LastMessageAt,
    CreatedAt,
}

impl SortField for ConversationSort {
    fn column(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::LastMessageAt => "last_message_at",
            Self::CreatedAt => "created_at",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "title" => Some(Self::Title),
            "last_message_at" => Some(Self::LastMessageAt),
            "created_at" => Some(Self::CreatedAt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageFilter {
    ConversationId(ConversationId),
    Role(MessageRole),
}

impl FilterField for MessageFilter {
    fn column(&self) -> &'static str {
        match self {
            Self::ConversationId(_) => "conversation_id",
            Self::Role(_) => "role",
        }
    }

    fn value(&self) -> FieldValue {
        match self {
            Self::ConversationId(id) => FieldValue::Text(id.to_string()),
            Self::Role(role) => FieldValue::Text(role.as_str().to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSort {
    CreatedAt,
}

impl SortField for MessageSort {
    fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "created_at" => Some(Self::CreatedAt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcedureFilter {
    Status(ProcedureStatus),
    CategoryId(CategoryId),
    Version(u32),
}

impl FilterField for ProcedureFilter {
    fn column(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::CategoryId(_) => "category_id",
            Self::Version(_) => "version",
        }
    }

    fn value(&self) -> FieldValue {
        match self {
            Self::Status(status) => FieldValue::Text(status.as_str().to_string()),
            Self::CategoryId(id) => FieldValue::Text(id.to_string()),
            Self::Version(version) => FieldValue::Integer(i64::from(*version)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureSort {
    Title,
    Version,
    CreatedAt,
    UpdatedAt,
}

impl SortField for ProcedureSort {
    fn column(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Version => "version",
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "title" => Some(Self::Title),
            "version" => Some(Self::Version),
            "created_at" => Some(Self::CreatedAt),
            "updated_at" => Some(Self::UpdatedAt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategoryFilter {
    Name(String),
}

impl FilterField for CategoryFilter {
    fn column(&self) -> &'static str {
        match self {
            Self::Name(_) => "name",
        }
    }

    fn value(&self) -> FieldValue {
        match self {
            Self::Name(name) => FieldValue::Text(name.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategorySort {
    Name,
    CreatedAt,
}

impl SortField for CategorySort {
    fn column(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::CreatedAt => "created_at",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "name" => Some(Self::Name),
            "created_at" => Some(Self::CreatedAt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileFilter {
    Email(String),
    Role(Role),
}

impl FilterField for ProfileFilter {
    fn column(&self) -> &'static str {
        match self {
            Self::Email(_) => "email",
            Self::Role(_) => "role",
        }
    }

    fn value(&self) -> FieldValue {
        match self {
            Self::Email(email) => FieldValue::Text(email.clone()),
            Self::Role(role) => FieldValue::Text(role.as_str().to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSort {
    FullName,
    Email,
    CreatedAt,
}

impl SortField for ProfileSort {
    fn column(self) -> &'static str {
        match self {
            Self::FullName => "full_name",
            Self::Email => "email",
            Self::CreatedAt => "created_at",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "full_name" => Some(Self::FullName),
            "email" => Some(Self::Email),
            "created_at" => Some(Self::CreatedAt),
            _ => None,
        }
    }
}

pub type ConversationQuery = Query<ConversationFilter, ConversationSort>;
pub type MessageQuery = Query<MessageFilter, MessageSort>;
pub type ProcedureQuery = Query<ProcedureFilter, ProcedureSort>;
pub type CategoryQuery = Query<CategoryFilter, CategorySort>;
pub type ProfileQuery = Query<ProfileFilter, ProfileSort>;
