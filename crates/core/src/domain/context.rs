use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel in `SystemGuide::applicable_roles` matching every role.
pub const ALL_ROLES: &str = "ALL";

pub const DEFAULT_MAX_ROWS: u32 = 100;
pub const DEFAULT_MAX_JOINS: u32 = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleContext {
    pub role_code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub common_queries: Vec<String>,
    #[serde(default)]
    pub workflows: Vec<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default = "active")]
    pub is_active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemGuide {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub applicable_roles: Vec<String>,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "active")]
    pub is_active: bool,
}

impl SystemGuide {
    pub fn applies_to(&self, role_code: &str) -> bool {
        self.applicable_roles.iter().any(|role| role == role_code || role == ALL_ROLES)
    }
}

/// Orders guides highest priority first, then alphabetically by title.
pub fn sort_guides(guides: &mut [SystemGuide]) {
    guides.sort_by(|left, right| {
        right.priority.cmp(&left.priority).then_with(|| left.title.cmp(&right.title))
    });
}

/// Keyed base instruction block (`system`, `assistant`, `limitations`, ...).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBaseEntry {
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "active")]
    pub is_active: bool,
}

/// Suggested question shown to a role, listed by ascending `order`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickHelpItem {
    pub id: i64,
    pub role_code: String,
    pub question: String,
    pub order: u32,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "active")]
    pub is_active: bool,
}

/// Replacement question set for one role. Questions are numbered from 1 in the given order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickHelpSet {
    pub role_code: String,
    pub questions: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Whether an upsert inserted a new record or replaced an existing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertAction {
    Created,
    Updated,
}

impl UpsertAction {
    pub fn from_existing(existed: bool) -> Self {
        if existed {
            Self::Updated
        } else {
            Self::Created
        }
    }

    /// Spanish past participle used in operator-facing confirmations.
    pub fn participle(self) -> &'static str {
        match self {
            Self::Created => "creado",
            Self::Updated => "actualizado",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryLimits {
    #[serde(default = "default_max_rows")]
    pub max_rows: u32,
    #[serde(default = "default_max_joins")]
    pub max_joins: u32,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self { max_rows: DEFAULT_MAX_ROWS, max_joins: DEFAULT_MAX_JOINS, timeout_seconds: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseAccessPolicy {
    pub role_code: String,
    #[serde(default)]
    pub allowed_tables: Vec<String>,
    /// DDL handed verbatim to the completion service as grounding.
    #[serde(default)]
    pub schema_description: String,
    #[serde(default)]
    pub restricted_columns: Vec<String>,
    #[serde(default = "default_operations")]
    pub allowed_operations: Vec<String>,
    #[serde(default)]
    pub query_limits: QueryLimits,
    #[serde(default = "active")]
    pub is_active: bool,
}

impl DatabaseAccessPolicy {
    pub fn new(role_code: impl Into<String>, schema_description: impl Into<String>) -> Self {
        Self {
            role_code: role_code.into(),
            allowed_tables: Vec::new(),
            schema_description: schema_description.into(),
            restricted_columns: Vec::new(),
            allowed_operations: default_operations(),
            query_limits: QueryLimits::default(),
            is_active: true,
        }
    }

    pub fn effective_operations(&self) -> Vec<String> {
        if self.allowed_operations.is_empty() {
            default_operations()
        } else {
            self.allowed_operations.clone()
        }
    }
}

fn active() -> bool {
    true
}

fn default_max_rows() -> u32 {
    DEFAULT_MAX_ROWS
}

fn default_max_joins() -> u32 {
    DEFAULT_MAX_JOINS
}

fn default_operations() -> Vec<String> {
    vec!["SELECT".to_string()]
}
