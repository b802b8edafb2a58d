//! SQL statements observed in sessions, with content-addressed identity.
//!
//! A statement's id is the SHA-256 of its normalized text, so the same SQL
//! seen on different nodes or in different sampling cycles always maps to
//! one logical statement. The statement type is classified lazily and never
//! fails: unparsable SQL falls back to keyword tables and finally to
//! [`StatementType::Other`].

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlparser::ast::Statement as Ast;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::credentials::ANONYMOUS_USER;

/// Number of leading characters inspected by the keyword tables.
const KEYWORD_WINDOW: usize = 200;

/// Classified kind of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatementType {
    /// Not classified
    Unknown,
    /// CREATE
    Create,
    /// ALTER
    Alter,
    /// DROP
    Drop,
    /// TRUNCATE
    Truncate,
    /// RENAME
    Rename,
    /// SELECT and other queries
    Select,
    /// INSERT
    Insert,
    /// DELETE
    Delete,
    /// UPDATE
    Update,
    /// MERGE
    Merge,
    /// CALL
    Call,
    /// Bulk load (COPY, LOAD DATA)
    Load,
    /// SET
    Set,
    /// Table maintenance
    Optimize,
    /// LOCK
    Lock,
    /// Recognized as SQL but none of the above
    Other,
}

impl StatementType {
    const KEYWORDS: [Self; 15] = [
        Self::Create,
        Self::Alter,
        Self::Drop,
        Self::Truncate,
        Self::Rename,
        Self::Select,
        Self::Insert,
        Self::Delete,
        Self::Update,
        Self::Merge,
        Self::Call,
        Self::Load,
        Self::Set,
        Self::Optimize,
        Self::Lock,
    ];

    /// Lower-case keyword of the type
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Create => "create",
            Self::Alter => "alter",
            Self::Drop => "drop",
            Self::Truncate => "truncate",
            Self::Rename => "rename",
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Delete => "delete",
            Self::Update => "update",
            Self::Merge => "merge",
            Self::Call => "call",
            Self::Load => "load",
            Self::Set => "set",
            Self::Optimize => "optimize",
            Self::Lock => "lock",
            Self::Other => "other",
        }
    }

    /// Returns true for statements that modify data or schema
    pub const fn is_write(self) -> bool {
        !matches!(self, Self::Select | Self::Set | Self::Unknown | Self::Other)
    }
}

impl std::fmt::Display for StatementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.keyword().to_ascii_uppercase())
    }
}

/// Vendor forms that win over the grammar parser. `callable` entries are
/// also recognized as `SELECT <function>(...)`.
struct Override {
    token: &'static str,
    kind: StatementType,
    callable: bool,
}

const OVERRIDES: [Override; 5] = [
    Override {
        token: "drop_partition",
        kind: StatementType::Drop,
        callable: true,
    },
    Override {
        token: "drop_partitions",
        kind: StatementType::Drop,
        callable: true,
    },
    Override {
        token: "do_tm_task",
        kind: StatementType::Optimize,
        callable: true,
    },
    Override {
        token: "copy",
        kind: StatementType::Load,
        callable: false,
    },
    Override {
        token: "optimize",
        kind: StatementType::Optimize,
        callable: false,
    },
];

/// Classifies a SQL text. Never fails.
///
/// ```rust
/// use dbsentinel_core::statement::{classify, StatementType};
///
/// assert_eq!(classify("select * from t"), StatementType::Select);
/// assert_eq!(classify("optimize table t"), StatementType::Optimize);
/// assert_eq!(classify("frobnicate all the things"), StatementType::Other);
/// ```
pub fn classify(sql: &str) -> StatementType {
    let tokens = leading_tokens(sql);
    if let Some(kind) = override_type(&tokens) {
        return kind;
    }
    if let Some(kind) = parsed_type(sql) {
        return kind;
    }
    tokens
        .first()
        .and_then(|token| {
            StatementType::KEYWORDS
                .iter()
                .copied()
                .find(|kind| kind.keyword() == token.as_str())
        })
        .unwrap_or(StatementType::Other)
}

fn leading_tokens(sql: &str) -> Vec<String> {
    let window: String = sql.chars().take(KEYWORD_WINDOW).collect();
    window
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '(' || c == ')')
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn override_type(tokens: &[String]) -> Option<StatementType> {
    let first = tokens.first()?;
    if let Some(entry) = OVERRIDES.iter().find(|entry| entry.token == first.as_str()) {
        return Some(entry.kind);
    }
    if first == "select" {
        let second = tokens.get(1)?;
        return OVERRIDES
            .iter()
            .find(|entry| entry.callable && entry.token == second.as_str())
            .map(|entry| entry.kind);
    }
    None
}

fn parsed_type(sql: &str) -> Option<StatementType> {
    let statements = match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) => statements,
        Err(e) => {
            tracing::trace!("SQL not parsed, using keyword tables: {}", e);
            return None;
        }
    };
    let kind = match statements.first()? {
        Ast::Query(_) => StatementType::Select,
        Ast::Insert { .. } => StatementType::Insert,
        Ast::Update { .. } => StatementType::Update,
        Ast::Delete { .. } => StatementType::Delete,
        Ast::Merge { .. } => StatementType::Merge,
        Ast::CreateTable { .. }
        | Ast::CreateView { .. }
        | Ast::CreateIndex { .. }
        | Ast::CreateSchema { .. }
        | Ast::CreateDatabase { .. } => StatementType::Create,
        Ast::AlterTable { .. } | Ast::AlterView { .. } | Ast::AlterIndex { .. } => {
            StatementType::Alter
        }
        Ast::Drop { .. } => StatementType::Drop,
        Ast::Truncate { .. } => StatementType::Truncate,
        Ast::SetVariable { .. } => StatementType::Set,
        Ast::Call { .. } => StatementType::Call,
        Ast::Copy { .. } => StatementType::Load,
        // Everything else goes through the keyword table.
        _ => return None,
    };
    Some(kind)
}

#[allow(clippy::expect_used)]
fn leading_comments() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(?:/\*(?:[^*]|\*+[^*/])*\*+/\s*|--[^\n]*(?:\n\s*|$))+")
            .expect("valid leading comment pattern")
    })
}

#[allow(clippy::expect_used)]
fn trailing_comment() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"/\*(?:[^*]|\*+[^*/])*\*+/\s*$").expect("valid trailing comment pattern")
    })
}

/// Strips leading comments and a trailing block comment, then trims.
pub fn normalize(sql: &str) -> String {
    let without_leading = leading_comments().replace(sql, "");
    let without_trailing = trailing_comment().replace(&without_leading, "");
    without_trailing.trim().to_string()
}

/// Content hash of normalized SQL text.
pub fn statement_id(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Aggregated execution statistics of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementStatistics {
    /// Number of executions
    pub count: u64,
    /// Sum of execution times
    pub total: Duration,
    /// Fastest execution
    pub min: Duration,
    /// Slowest execution
    pub max: Duration,
}

impl StatementStatistics {
    /// Mean execution time, zero when nothing was executed
    pub fn average(&self) -> Duration {
        u32::try_from(self.count)
            .ok()
            .and_then(|count| self.total.checked_div(count))
            .unwrap_or_default()
    }
}

/// A SQL statement identified by its content.
///
/// ```rust
/// use dbsentinel_core::Statement;
///
/// let a = Statement::new("/* app:42 */ select 1", "app").unwrap();
/// let b = Statement::new("select 1  ", "batch").unwrap();
/// assert_eq!(a.id(), b.id());
/// assert_eq!(a.content(), "select 1");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    id: String,
    content: String,
    user_name: String,
    node_id: Option<String>,
    execution_time: Option<DateTime<Utc>>,
    statistics: Option<StatementStatistics>,
    #[serde(skip)]
    kind: OnceLock<StatementType>,
}

impl Statement {
    /// Creates a statement from raw SQL text.
    ///
    /// Returns `None` when nothing is left after normalization. A blank user
    /// name becomes `anonymous`.
    pub fn new(sql: &str, user_name: &str) -> Option<Self> {
        let content = normalize(sql);
        if content.is_empty() {
            return None;
        }
        let user_name = if user_name.trim().is_empty() {
            ANONYMOUS_USER.to_string()
        } else {
            user_name.trim().to_string()
        };
        Some(Self {
            id: statement_id(&content),
            content,
            user_name,
            node_id: None,
            execution_time: None,
            statistics: None,
            kind: OnceLock::new(),
        })
    }

    /// Content hash
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Normalized SQL text
    pub fn content(&self) -> &str {
        &self.content
    }

    /// User that ran the statement
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Node the statement was first seen on
    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    /// Last execution time, when known
    pub const fn execution_time(&self) -> Option<DateTime<Utc>> {
        self.execution_time
    }

    /// Aggregated statistics, when known
    pub const fn statistics(&self) -> Option<&StatementStatistics> {
        self.statistics.as_ref()
    }

    /// Classified type, computed on first use.
    pub fn statement_type(&self) -> StatementType {
        *self.kind.get_or_init(|| classify(&self.content))
    }

    /// SQL text cut to `max` characters for log lines.
    pub fn abbreviated(&self, max: usize) -> String {
        let flat = self.content.split_whitespace().collect::<Vec<_>>().join(" ");
        if flat.chars().count() <= max {
            return flat;
        }
        let mut cut: String = flat.chars().take(max.saturating_sub(3)).collect();
        cut.push_str("...");
        cut
    }

    /// Returns a copy attributed to a node.
    #[must_use]
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Returns a copy with an execution time.
    #[must_use]
    pub const fn with_execution_time(mut self, time: DateTime<Utc>) -> Self {
        self.execution_time = Some(time);
        self
    }

    /// Returns a copy with statistics.
    #[must_use]
    pub const fn with_statistics(mut self, statistics: StatementStatistics) -> Self {
        self.statistics = Some(statistics);
        self
    }
}

impl PartialEq for Statement {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Statement {}

impl std::hash::Hash for Statement {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
