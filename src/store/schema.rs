//! Store schema and the domain types that map onto it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization. Re-run on every open; every statement is
/// `IF NOT EXISTS` so this is safe to execute against an already-migrated
/// database.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    project_key TEXT,
    git_branch TEXT,
    last_active_at TEXT NOT NULL,
    current_session_id TEXT,
    created_at TEXT NOT NULL,
    inbox_topic_id INTEGER REFERENCES topics(id)
);

CREATE INDEX IF NOT EXISTS idx_agents_project_key ON agents(project_key);

CREATE TABLE IF NOT EXISTS project_defaults (
    project_key TEXT PRIMARY KEY,
    agent_id INTEGER NOT NULL REFERENCES agents(id)
);

CREATE TABLE IF NOT EXISTS session_identities (
    session_id TEXT PRIMARY KEY,
    agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
    project_key TEXT,
    git_branch TEXT,
    created_at TEXT NOT NULL,
    last_active_at TEXT NOT NULL,
    consumer_offsets TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_session_identities_project ON session_identities(project_key);

CREATE TABLE IF NOT EXISTS topics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    topic_type TEXT NOT NULL DEFAULT 'broadcast',
    retention_seconds INTEGER,
    created_at TEXT NOT NULL,
    next_offset INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS subscriptions (
    agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
    topic_id INTEGER NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
    subscribed_at TEXT NOT NULL,
    PRIMARY KEY (agent_id, topic_id)
);

CREATE TABLE IF NOT EXISTS consumer_offsets (
    agent_id INTEGER NOT NULL,
    topic_id INTEGER NOT NULL,
    last_offset INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (agent_id, topic_id)
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_id TEXT NOT NULL,
    topic_id INTEGER REFERENCES topics(id),
    sender_id INTEGER NOT NULL REFERENCES agents(id),
    subject TEXT NOT NULL,
    body TEXT NOT NULL DEFAULT '',
    priority TEXT NOT NULL DEFAULT 'normal',
    deadline TEXT,
    attachments TEXT,
    created_at TEXT NOT NULL,
    sender_deleted INTEGER NOT NULL DEFAULT 0,
    idempotency_key TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_idempotency_key
    ON messages(idempotency_key) WHERE idempotency_key IS NOT NULL;

CREATE TABLE IF NOT EXISTS recipients (
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
    topic_id INTEGER NOT NULL REFERENCES topics(id),
    delivery_offset INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT 'unread',
    snoozed_until TEXT,
    read_at TEXT,
    acked_at TEXT,
    PRIMARY KEY (message_id, agent_id)
);

CREATE INDEX IF NOT EXISTS idx_recipients_agent_state ON recipients(agent_id, state);
CREATE INDEX IF NOT EXISTS idx_recipients_topic_offset ON recipients(topic_id, delivery_offset);

CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    subject,
    body,
    content = 'messages',
    content_rowid = 'id'
);

CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, subject, body) VALUES (new.id, new.subject, new.body);
END;

CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, subject, body)
    VALUES ('delete', old.id, old.subject, old.body);
END;

CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, subject, body)
    VALUES ('delete', old.id, old.subject, old.body);
    INSERT INTO messages_fts(rowid, subject, body) VALUES (new.id, new.subject, new.body);
END;

CREATE TABLE IF NOT EXISTS reviews (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    title TEXT NOT NULL,
    summary TEXT NOT NULL DEFAULT '',
    state TEXT NOT NULL DEFAULT 'pending',
    reviewer_id INTEGER REFERENCES agents(id),
    requester_id INTEGER NOT NULL REFERENCES agents(id),
    thread_id TEXT NOT NULL,
    iteration INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS review_iterations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    review_id INTEGER NOT NULL REFERENCES reviews(id) ON DELETE CASCADE,
    iteration_number INTEGER NOT NULL,
    note TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS review_issues (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    review_id INTEGER NOT NULL REFERENCES reviews(id) ON DELETE CASCADE,
    severity TEXT NOT NULL,
    description TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_review_issues_review ON review_issues(review_id);
"#;

/// Additive migration: index used by `FetchInbox`'s sender-name-prefix scope.
/// Kept separate from `SCHEMA` (rather than folded in) so it can be extended
/// over time without editing the base table definitions.
pub const MIGRATION_AGENT_NAME_PREFIX_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_agents_name ON agents(name);
"#;

/// Best-effort `ALTER TABLE` for a database created before the
/// idempotency key column existed — `run_migrations` ignores the error
/// this throws when the column is already present, same as the teacher's
/// `local_id` migration.
pub const MIGRATION_ADD_MESSAGE_IDEMPOTENCY_KEY: &str =
    "ALTER TABLE messages ADD COLUMN idempotency_key TEXT";

pub const MIGRATION_MESSAGE_IDEMPOTENCY_KEY_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_idempotency_key
    ON messages(idempotency_key) WHERE idempotency_key IS NOT NULL;
"#;

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

pub fn row_datetime(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    Ok(parse_datetime(&s))
}

pub fn row_datetime_opt(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    Ok(s.map(|s| parse_datetime(&s)))
}

/// Message priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::Urgent => "urgent",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Priority {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" | "" => Ok(Priority::Normal),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Per-(message, agent) lifecycle label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientState {
    Unread,
    Read,
    Starred,
    Snoozed,
    Archived,
    Trash,
}

impl fmt::Display for RecipientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecipientState::Unread => "unread",
            RecipientState::Read => "read",
            RecipientState::Starred => "starred",
            RecipientState::Snoozed => "snoozed",
            RecipientState::Archived => "archived",
            RecipientState::Trash => "trash",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RecipientState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unread" => Ok(RecipientState::Unread),
            "read" => Ok(RecipientState::Read),
            "starred" => Ok(RecipientState::Starred),
            "snoozed" => Ok(RecipientState::Snoozed),
            "archived" => Ok(RecipientState::Archived),
            "trash" => Ok(RecipientState::Trash),
            other => Err(format!("unknown recipient state '{other}'")),
        }
    }
}

/// Agent — a named participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub name: String,
    pub project_key: Option<String>,
    pub git_branch: Option<String>,
    pub last_active_at: DateTime<Utc>,
    pub current_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub inbox_topic_id: Option<i64>,
}

/// SessionIdentity — mapping from a session string to an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub session_id: String,
    pub agent_id: i64,
    pub project_key: Option<String>,
    pub git_branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub consumer_offsets: std::collections::HashMap<String, i64>,
}

/// Topic — a named fan-out channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: i64,
    pub name: String,
    pub topic_type: String,
    pub retention_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub next_offset: i64,
}

/// An immutable record of a send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub thread_id: String,
    pub topic_id: Option<i64>,
    pub sender_id: i64,
    pub subject: String,
    pub body: String,
    pub priority: Priority,
    pub deadline: Option<DateTime<Utc>>,
    /// Opaque base64 attachment sidecar, as received over the wire.
    pub attachments: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sender_deleted: bool,
}

/// The per-addressee delivery and state row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub message_id: i64,
    pub agent_id: i64,
    pub topic_id: i64,
    pub delivery_offset: i64,
    pub state: RecipientState,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
}

/// A message joined with the calling agent's recipient state — what
/// `FetchInbox`/`ReadThread`/`Search` return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxEntry {
    pub message: Message,
    pub state: RecipientState,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
}

impl InboxEntry {
    /// Effective state applying the snooze-wake rule: a snoozed row whose
    /// `snoozed_until` has passed reads as `unread` (spec.md §4.4).
    pub fn effective_state(&self) -> RecipientState {
        if self.state == RecipientState::Snoozed {
            if let Some(until) = self.snoozed_until {
                if until <= Utc::now() {
                    return RecipientState::Unread;
                }
            }
        }
        self.state
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKind {
    Plan,
    Code,
}

impl fmt::Display for ReviewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", match self {
            ReviewKind::Plan => "plan",
            ReviewKind::Code => "code",
        })
    }
}

impl std::str::FromStr for ReviewKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(ReviewKind::Plan),
            "code" => Ok(ReviewKind::Code),
            other => Err(format!("unknown review kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    Pending,
    Approved,
    Rejected,
    ChangesRequested,
    Cancelled,
}

impl fmt::Display for ReviewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", match self {
            ReviewState::Pending => "pending",
            ReviewState::Approved => "approved",
            ReviewState::Rejected => "rejected",
            ReviewState::ChangesRequested => "changes_requested",
            ReviewState::Cancelled => "cancelled",
        })
    }
}

impl std::str::FromStr for ReviewState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReviewState::Pending),
            "approved" => Ok(ReviewState::Approved),
            "rejected" => Ok(ReviewState::Rejected),
            "changes_requested" => Ok(ReviewState::ChangesRequested),
            "cancelled" => Ok(ReviewState::Cancelled),
            other => Err(format!("unknown review state '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub id: i64,
    pub kind: ReviewKind,
    pub title: String,
    pub summary: String,
    pub state: ReviewState,
    pub reviewer_id: Option<i64>,
    pub requester_id: i64,
    pub thread_id: String,
    pub iteration: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Info,
    Minor,
    Major,
    Blocking,
}

impl fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", match self {
            IssueSeverity::Info => "info",
            IssueSeverity::Minor => "minor",
            IssueSeverity::Major => "major",
            IssueSeverity::Blocking => "blocking",
        })
    }
}

impl std::str::FromStr for IssueSeverity {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(IssueSeverity::Info),
            "minor" => Ok(IssueSeverity::Minor),
            "major" => Ok(IssueSeverity::Major),
            "blocking" => Ok(IssueSeverity::Blocking),
            other => Err(format!("unknown issue severity '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", match self {
            IssueStatus::Open => "open",
            IssueStatus::Acknowledged => "acknowledged",
            IssueStatus::Resolved => "resolved",
        })
    }
}

impl std::str::FromStr for IssueStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(IssueStatus::Open),
            "acknowledged" => Ok(IssueStatus::Acknowledged),
            "resolved" => Ok(IssueStatus::Resolved),
            other => Err(format!("unknown issue status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub id: i64,
    pub review_id: i64,
    pub severity: IssueSeverity,
    pub description: String,
    pub status: IssueStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
