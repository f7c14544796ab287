//! Store — durable transactional state in a single embedded SQLite database
//!
//! Owns every persisted row. Other components hold transient references
//! via ids; they never reach around this module to touch `rusqlite`
//! directly. Every write runs inside an explicit transaction so a failure
//! never leaves partial state visible to a subsequent read.

mod schema;

pub use schema::*;

use crate::error::{CoreError, CoreResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const USER_AGENT_NAME: &str = "User";

/// Thread-safe handle onto the database. Cheap to clone (an `Arc` around
/// one connection guarded by a mutex) — matches the single-writer model
/// spec.md §5 requires (the Store is the only mutator of durable state,
/// reads and the one writer share the same connection/lock here for
/// simplicity, since SQLite itself serializes writers regardless).
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> CoreResult<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        store.ensure_user_agent()?;
        Ok(store)
    }

    fn run_migrations(&self) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        conn.execute_batch(MIGRATION_AGENT_NAME_PREFIX_INDEX)?;
        // Try to add the idempotency key column — ignore error if it
        // already exists (fresh databases get it from SCHEMA above).
        let _ = conn.execute(MIGRATION_ADD_MESSAGE_IDEMPOTENCY_KEY, []);
        conn.execute_batch(MIGRATION_MESSAGE_IDEMPOTENCY_KEY_INDEX)?;
        Ok(())
    }

    /// Create the synthetic "User" agent (and its inbox topic) if it is
    /// not already present. Runs outside `run_migrations` because it needs
    /// the higher-level `create_agent` helper (topic + subscription +
    /// agent all in one transaction).
    fn ensure_user_agent(&self) -> CoreResult<()> {
        let exists = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM agents WHERE name = ?1)",
                params![USER_AGENT_NAME],
                |row| row.get::<_, bool>(0),
            )?
        };
        if !exists {
            self.create_agent(USER_AGENT_NAME, None, None)?;
        }
        Ok(())
    }

    // ==================== Agent Operations ====================

    /// Create an agent plus its `agent/<name>/inbox` topic and
    /// self-subscription, all in one transaction (spec.md §3).
    pub fn create_agent(
        &self,
        name: &str,
        project_key: Option<&str>,
        git_branch: Option<&str>,
    ) -> CoreResult<Agent> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT INTO agents (name, project_key, git_branch, last_active_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![name, project_key, git_branch, now],
        )?;
        let agent_id = tx.last_insert_rowid();

        let inbox_name = format!("agent/{name}/inbox");
        tx.execute(
            "INSERT INTO topics (name, topic_type, created_at) VALUES (?1, 'direct', ?2)",
            params![inbox_name, now],
        )?;
        let topic_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE agents SET inbox_topic_id = ?1 WHERE id = ?2",
            params![topic_id, agent_id],
        )?;
        tx.execute(
            "INSERT INTO subscriptions (agent_id, topic_id, subscribed_at) VALUES (?1, ?2, ?3)",
            params![agent_id, topic_id, now],
        )?;
        tx.commit()?;

        self.get_agent(agent_id)
    }

    pub fn get_agent(&self, id: i64) -> CoreResult<Agent> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, project_key, git_branch, last_active_at, current_session_id,
                    created_at, inbox_topic_id
             FROM agents WHERE id = ?1",
            params![id],
            parse_agent_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                CoreError::NotFound(format!("agent {id}"))
            }
            other => other.into(),
        })
    }

    pub fn get_agent_by_name(&self, name: &str) -> CoreResult<Agent> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, project_key, git_branch, last_active_at, current_session_id,
                    created_at, inbox_topic_id
             FROM agents WHERE name = ?1",
            params![name],
            parse_agent_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                CoreError::NotFound(format!("agent '{name}'"))
            }
            other => other.into(),
        })
    }

    pub fn list_agents(&self) -> CoreResult<Vec<Agent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, project_key, git_branch, last_active_at, current_session_id,
                    created_at, inbox_topic_id
             FROM agents ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], parse_agent_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Agents whose name starts with `prefix` (case-sensitive, used by
    /// `FetchInbox`'s sender-name-prefix scope).
    pub fn list_agents_by_name_prefix(&self, prefix: &str) -> CoreResult<Vec<Agent>> {
        let conn = self.conn.lock().unwrap();
        let like = format!("{prefix}%");
        let mut stmt = conn.prepare(
            "SELECT id, name, project_key, git_branch, last_active_at, current_session_id,
                    created_at, inbox_topic_id
             FROM agents WHERE name LIKE ?1 ORDER BY name ASC",
        )?;
        let rows = stmt.query_map(params![like], parse_agent_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Deletes an agent. The synthetic "User" agent cannot be deleted
    /// (spec.md §3 invariant).
    pub fn delete_agent(&self, id: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let name: String = conn
            .query_row("SELECT name FROM agents WHERE id = ?1", params![id], |r| r.get(0))
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => CoreError::NotFound(format!("agent {id}")),
                other => other.into(),
            })?;
        if name == USER_AGENT_NAME {
            return Err(CoreError::invalid("agentId", "cannot delete the 'User' agent"));
        }
        conn.execute("DELETE FROM agents WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn record_heartbeat(&self, agent_id: i64, session_id: Option<&str>) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE agents SET last_active_at = ?1, current_session_id = COALESCE(?2, current_session_id)
             WHERE id = ?3",
            params![now, session_id, agent_id],
        )?;
        if updated == 0 {
            return Err(CoreError::not_found(format!("agent {agent_id}")));
        }
        Ok(())
    }

    // ==================== Identity Operations ====================

    pub fn get_identity(&self, session_id: &str) -> CoreResult<SessionIdentity> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT session_id, agent_id, project_key, git_branch, created_at, last_active_at,
                    consumer_offsets
             FROM session_identities WHERE session_id = ?1",
            params![session_id],
            parse_identity_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                CoreError::NotFound(format!("session '{session_id}'"))
            }
            other => other.into(),
        })
    }

    pub fn insert_identity(
        &self,
        session_id: &str,
        agent_id: i64,
        project_key: Option<&str>,
        git_branch: Option<&str>,
    ) -> CoreResult<SessionIdentity> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO session_identities
                (session_id, agent_id, project_key, git_branch, created_at, last_active_at, consumer_offsets)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, '{}')",
            params![session_id, agent_id, project_key, git_branch, now],
        )?;
        drop(conn);
        self.get_identity(session_id)
    }

    pub fn touch_identity(&self, session_id: &str, git_branch: Option<&str>) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let updated = if let Some(branch) = git_branch.filter(|b| !b.is_empty()) {
            conn.execute(
                "UPDATE session_identities SET last_active_at = ?1, git_branch = ?2 WHERE session_id = ?3",
                params![now, branch, session_id],
            )?
        } else {
            conn.execute(
                "UPDATE session_identities SET last_active_at = ?1 WHERE session_id = ?2",
                params![now, session_id],
            )?
        };
        if updated == 0 {
            return Err(CoreError::not_found(format!("session '{session_id}'")));
        }
        Ok(())
    }

    pub fn save_identity_offsets(
        &self,
        session_id: &str,
        offsets: &HashMap<String, i64>,
    ) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let json = serde_json::to_string(offsets)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        let updated = conn.execute(
            "UPDATE session_identities SET consumer_offsets = ?1 WHERE session_id = ?2",
            params![json, session_id],
        )?;
        if updated == 0 {
            return Err(CoreError::not_found(format!("session '{session_id}'")));
        }
        Ok(())
    }

    pub fn find_identity_by_project(&self, project_key: &str) -> CoreResult<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT agent_id FROM session_identities WHERE project_key = ?1 LIMIT 1",
            params![project_key],
            |row| row.get(0),
        )
        .optional()
        .map_err(CoreError::from)
    }

    pub fn list_identities(&self) -> CoreResult<Vec<SessionIdentity>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, agent_id, project_key, git_branch, created_at, last_active_at,
                    consumer_offsets
             FROM session_identities ORDER BY last_active_at DESC",
        )?;
        let rows = stmt.query_map([], parse_identity_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_project_default(&self, project_key: &str) -> CoreResult<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT agent_id FROM project_defaults WHERE project_key = ?1",
            params![project_key],
            |row| row.get(0),
        )
        .optional()
        .map_err(CoreError::from)
    }

    pub fn set_project_default(&self, project_key: &str, agent_id: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO project_defaults (project_key, agent_id) VALUES (?1, ?2)
             ON CONFLICT(project_key) DO UPDATE SET agent_id = excluded.agent_id",
            params![project_key, agent_id],
        )?;
        Ok(())
    }

    // ==================== Topic / Subscription Operations ====================

    pub fn get_or_create_topic(&self, name: &str, topic_type: &str) -> CoreResult<Topic> {
        if let Some(topic) = self.find_topic(name)? {
            return Ok(topic);
        }
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let inserted = conn.execute(
            "INSERT INTO topics (name, topic_type, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO NOTHING",
            params![name, topic_type, now],
        )?;
        drop(conn);
        if inserted == 0 {
            // Lost the race to create it; the winner's row is authoritative.
            return self
                .find_topic(name)?
                .ok_or_else(|| CoreError::Internal(format!("topic '{name}' vanished")));
        }
        self.find_topic(name)?
            .ok_or_else(|| CoreError::Internal(format!("topic '{name}' missing after insert")))
    }

    pub fn find_topic(&self, name: &str) -> CoreResult<Option<Topic>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, topic_type, retention_seconds, created_at, next_offset
             FROM topics WHERE name = ?1",
            params![name],
            parse_topic_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    pub fn get_topic(&self, id: i64) -> CoreResult<Topic> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, topic_type, retention_seconds, created_at, next_offset
             FROM topics WHERE id = ?1",
            params![id],
            parse_topic_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => CoreError::NotFound(format!("topic {id}")),
            other => other.into(),
        })
    }

    pub fn list_topics(&self) -> CoreResult<Vec<Topic>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, name, topic_type, retention_seconds, created_at, next_offset FROM topics ORDER BY name")?;
        let rows = stmt.query_map([], parse_topic_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn subscribe(&self, agent_id: i64, topic_id: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO subscriptions (agent_id, topic_id, subscribed_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(agent_id, topic_id) DO NOTHING",
            params![agent_id, topic_id, now],
        )?;
        Ok(())
    }

    pub fn unsubscribe(&self, agent_id: i64, topic_id: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM subscriptions WHERE agent_id = ?1 AND topic_id = ?2",
            params![agent_id, topic_id],
        )?;
        Ok(())
    }

    pub fn list_subscribers(&self, topic_id: i64) -> CoreResult<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT agent_id FROM subscriptions WHERE topic_id = ?1")?;
        let rows = stmt.query_map(params![topic_id], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_subscriptions(&self, agent_id: i64) -> CoreResult<Vec<Topic>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT t.id, t.name, t.topic_type, t.retention_seconds, t.created_at, t.next_offset
             FROM topics t JOIN subscriptions s ON s.topic_id = t.id
             WHERE s.agent_id = ?1",
        )?;
        let rows = stmt.query_map(params![agent_id], parse_topic_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ==================== Consumer Offset Operations ====================

    pub fn get_consumer_offset(&self, agent_id: i64, topic_id: i64) -> CoreResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT last_offset FROM consumer_offsets WHERE agent_id = ?1 AND topic_id = ?2",
            params![agent_id, topic_id],
            |row| row.get(0),
        )
        .optional()
        .map(|v| v.unwrap_or(0))
        .map_err(CoreError::from)
    }

    pub fn set_consumer_offset(&self, agent_id: i64, topic_id: i64, offset: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO consumer_offsets (agent_id, topic_id, last_offset) VALUES (?1, ?2, ?3)
             ON CONFLICT(agent_id, topic_id) DO UPDATE SET
                last_offset = MAX(consumer_offsets.last_offset, excluded.last_offset)",
            params![agent_id, topic_id, offset],
        )?;
        Ok(())
    }

    // ==================== Message / Recipient Operations ====================

    /// Insert a message and one recipient row per distinct addressee, each
    /// delivered against `topic_id` (the named topic for `Publish`, or the
    /// recipient's own inbox topic for direct mail) with a freshly
    /// incremented `delivery_offset`. Runs in one transaction.
    ///
    /// When `idempotency_key` is `Some` and a message with that key already
    /// exists, the insert is skipped entirely and the original message and
    /// its recipients are returned instead — a repeated key from a retried
    /// offline-queue drain never creates a second message (§4.6). The
    /// trailing `bool` is `true` only when this call actually inserted a
    /// new message, so callers can skip re-notifying subscribers on a
    /// deduped replay.
    pub fn insert_message(
        &self,
        thread_id: &str,
        topic_id_for_message: Option<i64>,
        sender_id: i64,
        subject: &str,
        body: &str,
        priority: Priority,
        deadline: Option<chrono::DateTime<Utc>>,
        attachments: Option<&str>,
        recipients: &[(i64, i64)], // (agent_id, delivery_topic_id)
        idempotency_key: Option<&str>,
    ) -> CoreResult<(Message, Vec<Recipient>, bool)> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        if let Some(key) = idempotency_key {
            let existing_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM messages WHERE idempotency_key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(message_id) = existing_id {
                let message = tx.query_row(
                    "SELECT id, thread_id, topic_id, sender_id, subject, body, priority, deadline,
                            attachments, created_at, sender_deleted
                     FROM messages WHERE id = ?1",
                    params![message_id],
                    parse_message_row,
                )?;
                let mut stmt = tx.prepare(
                    "SELECT message_id, agent_id, topic_id, delivery_offset, state, snoozed_until,
                            read_at, acked_at
                     FROM recipients WHERE message_id = ?1",
                )?;
                let recipient_rows = stmt
                    .query_map(params![message_id], parse_recipient_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                drop(stmt);
                tx.commit()?;
                return Ok((message, recipient_rows, false));
            }
        }

        let now = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT INTO messages
                (thread_id, topic_id, sender_id, subject, body, priority, deadline, attachments,
                 created_at, idempotency_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                thread_id,
                topic_id_for_message,
                sender_id,
                subject,
                body,
                priority.to_string(),
                deadline.map(|d| d.to_rfc3339()),
                attachments,
                now,
                idempotency_key,
            ],
        )?;
        let message_id = tx.last_insert_rowid();

        let mut recipient_rows = Vec::with_capacity(recipients.len());
        for &(agent_id, delivery_topic_id) in recipients {
            let offset: i64 = tx.query_row(
                "UPDATE topics SET next_offset = next_offset + 1 WHERE id = ?1 RETURNING next_offset",
                params![delivery_topic_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO recipients (message_id, agent_id, topic_id, delivery_offset, state)
                 VALUES (?1, ?2, ?3, ?4, 'unread')",
                params![message_id, agent_id, delivery_topic_id, offset],
            )?;
            recipient_rows.push(Recipient {
                message_id,
                agent_id,
                topic_id: delivery_topic_id,
                delivery_offset: offset,
                state: RecipientState::Unread,
                snoozed_until: None,
                read_at: None,
                acked_at: None,
            });
        }
        tx.commit()?;

        let message = self.get_message(message_id)?;
        Ok((message, recipient_rows, true))
    }

    pub fn get_message(&self, id: i64) -> CoreResult<Message> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, thread_id, topic_id, sender_id, subject, body, priority, deadline,
                    attachments, created_at, sender_deleted
             FROM messages WHERE id = ?1",
            params![id],
            parse_message_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => CoreError::NotFound(format!("message {id}")),
            other => other.into(),
        })
    }

    pub fn get_messages_by_thread(&self, thread_id: &str) -> CoreResult<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, thread_id, topic_id, sender_id, subject, body, priority, deadline,
                    attachments, created_at, sender_deleted
             FROM messages WHERE thread_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![thread_id], parse_message_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_recipient(&self, message_id: i64, agent_id: i64) -> CoreResult<Recipient> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT message_id, agent_id, topic_id, delivery_offset, state, snoozed_until,
                    read_at, acked_at
             FROM recipients WHERE message_id = ?1 AND agent_id = ?2",
            params![message_id, agent_id],
            parse_recipient_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => CoreError::NotFound(format!(
                "recipient (message {message_id}, agent {agent_id})"
            )),
            other => other.into(),
        })
    }

    /// All recipients of a message (used to identify "the one recipient"
    /// for aggregate-view mutations, spec.md §4.4).
    pub fn list_recipients(&self, message_id: i64) -> CoreResult<Vec<Recipient>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT message_id, agent_id, topic_id, delivery_offset, state, snoozed_until,
                    read_at, acked_at
             FROM recipients WHERE message_id = ?1",
        )?;
        let rows = stmt.query_map(params![message_id], parse_recipient_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn set_recipient_state(
        &self,
        message_id: i64,
        agent_id: i64,
        state: RecipientState,
        snoozed_until: Option<chrono::DateTime<Utc>>,
    ) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE recipients SET state = ?1, snoozed_until = ?2 WHERE message_id = ?3 AND agent_id = ?4",
            params![
                state.to_string(),
                snoozed_until.map(|d| d.to_rfc3339()),
                message_id,
                agent_id
            ],
        )?;
        if updated == 0 {
            return Err(CoreError::not_found(format!(
                "recipient (message {message_id}, agent {agent_id})"
            )));
        }
        Ok(())
    }

    /// Flags the message as hidden from its sender's own Sent view,
    /// independent of any recipient's state (spec.md §3's "sender-deletion
    /// flag").
    pub fn mark_sender_deleted(&self, message_id: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE messages SET sender_deleted = 1 WHERE id = ?1",
            params![message_id],
        )?;
        if updated == 0 {
            return Err(CoreError::not_found(format!("message {message_id}")));
        }
        Ok(())
    }

    pub fn mark_read(&self, message_id: i64, agent_id: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE recipients SET state = 'read', read_at = ?1
             WHERE message_id = ?2 AND agent_id = ?3 AND state = 'unread'",
            params![now, message_id, agent_id],
        )?;
        Ok(())
    }

    pub fn ack(&self, message_id: i64, agent_id: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE recipients SET acked_at = ?1 WHERE message_id = ?2 AND agent_id = ?3",
            params![now, message_id, agent_id],
        )?;
        if updated == 0 {
            return Err(CoreError::not_found(format!(
                "recipient (message {message_id}, agent {agent_id})"
            )));
        }
        Ok(())
    }

    /// Has agent `agent_id` acknowledged every message sent by `sender_id`
    /// in the status/broadcast topic? Used by `HasUnackedStatusTo` (§6).
    pub fn has_unacked_from(&self, agent_id: i64, sender_id: i64) -> CoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM recipients r
             JOIN messages m ON m.id = r.message_id
             WHERE r.agent_id = ?1 AND m.sender_id = ?2 AND r.acked_at IS NULL",
            params![agent_id, sender_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn fetch_inbox(
        &self,
        agent_id: i64,
        limit: i64,
        unread_only: bool,
        state_filter: Option<RecipientState>,
        sent_only: bool,
        sender_name_prefix: Option<&str>,
    ) -> CoreResult<Vec<InboxEntry>> {
        let conn = self.conn.lock().unwrap();

        if let Some(prefix) = sender_name_prefix {
            let like = format!("{prefix}%");
            let mut stmt = conn.prepare(
                "SELECT m.id, m.thread_id, m.topic_id, m.sender_id, m.subject, m.body, m.priority,
                        m.deadline, m.attachments, m.created_at, m.sender_deleted
                 FROM messages m JOIN agents a ON a.id = m.sender_id
                 WHERE a.name LIKE ?1
                 ORDER BY m.created_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![like, limit], parse_message_row)?;
            return rows
                .map(|r| {
                    r.map_err(CoreError::from).map(|message| InboxEntry {
                        message,
                        state: RecipientState::Read,
                        snoozed_until: None,
                        read_at: None,
                        acked_at: None,
                    })
                })
                .collect();
        }

        // A `snoozed` row whose `snoozed_until` has passed wakes on read:
        // it is excluded from FetchInbox while still in the future, and
        // once past, is presented as effective state `unread` without any
        // row mutation (§4.4 "snoozed ... auto (wake when snoozedUntil <=
        // now)").
        let now = Utc::now().to_rfc3339();
        let still_snoozed = "(r.state = 'snoozed' AND r.snoozed_until > ?3)";
        let effectively_unread = "(r.state = 'unread' OR (r.state = 'snoozed' AND r.snoozed_until <= ?3))";
        let mut sql = format!(
            "SELECT m.id, m.thread_id, m.topic_id, m.sender_id, m.subject, m.body, m.priority,
                    m.deadline, m.attachments, m.created_at, m.sender_deleted,
                    r.state, r.snoozed_until, r.read_at, r.acked_at
             FROM recipients r JOIN messages m ON m.id = r.message_id
             WHERE r.agent_id = ?1 AND r.state NOT IN ('archived', 'trash') AND NOT {still_snoozed}",
        );
        if unread_only {
            sql.push_str(&format!(" AND {effectively_unread}"));
        }
        if let Some(state) = state_filter {
            if state == RecipientState::Unread {
                sql.push_str(&format!(" AND {effectively_unread}"));
            } else {
                sql.push_str(&format!(" AND r.state = '{state}'"));
            }
        }
        if sent_only {
            sql.push_str(" AND m.sender_id = ?1");
        }
        sql.push_str(" ORDER BY m.created_at DESC LIMIT ?2");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![agent_id, limit, now], parse_inbox_row)?;
        rows.map(|r| {
            r.map_err(CoreError::from).map(|mut entry| {
                entry.state = entry.effective_state();
                entry
            })
        })
        .collect()
    }

    /// Messages delivered to `agent_id` on `topic_id` with
    /// `delivery_offset > since_offset`, in delivery order, regardless of
    /// recipient state — PollChanges must surface archived/trashed
    /// deliveries too since it tracks offsets, not inbox visibility
    /// (spec.md §4.4's FetchInbox-only archived/trash exclusion does not
    /// apply here).
    pub fn poll_topic(
        &self,
        agent_id: i64,
        topic_id: i64,
        since_offset: i64,
        limit: i64,
    ) -> CoreResult<Vec<InboxEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT m.id, m.thread_id, m.topic_id, m.sender_id, m.subject, m.body, m.priority,
                    m.deadline, m.attachments, m.created_at, m.sender_deleted,
                    r.state, r.snoozed_until, r.read_at, r.acked_at
             FROM recipients r JOIN messages m ON m.id = r.message_id
             WHERE r.agent_id = ?1 AND r.topic_id = ?2 AND r.delivery_offset > ?3
             ORDER BY r.delivery_offset ASC LIMIT ?4",
        )?;
        let rows = stmt.query_map(params![agent_id, topic_id, since_offset, limit], parse_inbox_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn search_for_agent(
        &self,
        query: &str,
        agent_id: i64,
        topic_id: Option<i64>,
        limit: i64,
    ) -> CoreResult<Vec<Message>> {
        let conn = self.conn.lock().unwrap();

        if agent_id == 0 && topic_id.is_none() {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.thread_id, m.topic_id, m.sender_id, m.subject, m.body, m.priority,
                        m.deadline, m.attachments, m.created_at, m.sender_deleted
                 FROM messages_fts f JOIN messages m ON m.id = f.rowid
                 WHERE messages_fts MATCH ?1
                 ORDER BY bm25(messages_fts) LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![query, limit], parse_message_row)?;
            return Ok(rows.collect::<Result<Vec<_>, _>>()?);
        }

        let mut sql = String::from(
            "SELECT m.id, m.thread_id, m.topic_id, m.sender_id, m.subject, m.body, m.priority,
                    m.deadline, m.attachments, m.created_at, m.sender_deleted
             FROM messages_fts f
             JOIN messages m ON m.id = f.rowid
             JOIN recipients r ON r.message_id = m.id
             WHERE messages_fts MATCH ?1",
        );
        if agent_id != 0 {
            sql.push_str(" AND r.agent_id = ?3");
        }
        if let Some(topic) = topic_id {
            sql.push_str(&format!(" AND r.topic_id = {topic}"));
        }
        sql.push_str(" ORDER BY bm25(messages_fts) LIMIT ?2");

        let mut stmt = conn.prepare(&sql)?;
        let rows = if agent_id != 0 {
            stmt.query_map(params![query, limit, agent_id], parse_message_row)?
                .collect::<Result<Vec<_>, _>>()?
        } else {
            stmt.query_map(params![query, limit], parse_message_row)?
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(rows)
    }

    // ==================== Review Operations ====================

    #[allow(clippy::too_many_arguments)]
    pub fn create_review(
        &self,
        kind: ReviewKind,
        title: &str,
        summary: &str,
        reviewer_id: Option<i64>,
        requester_id: i64,
        thread_id: &str,
    ) -> CoreResult<Review> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO reviews (kind, title, summary, state, reviewer_id, requester_id, thread_id, iteration, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, 1, ?7, ?7)",
            params![kind.to_string(), title, summary, reviewer_id, requester_id, thread_id, now],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_review(id)
    }

    pub fn get_review(&self, id: i64) -> CoreResult<Review> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, kind, title, summary, state, reviewer_id, requester_id, thread_id,
                    iteration, created_at, updated_at
             FROM reviews WHERE id = ?1",
            params![id],
            parse_review_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => CoreError::NotFound(format!("review {id}")),
            other => other.into(),
        })
    }

    pub fn list_reviews(&self, reviewer_id: Option<i64>) -> CoreResult<Vec<Review>> {
        let conn = self.conn.lock().unwrap();
        if let Some(reviewer) = reviewer_id {
            let mut stmt = conn.prepare(
                "SELECT id, kind, title, summary, state, reviewer_id, requester_id, thread_id,
                        iteration, created_at, updated_at
                 FROM reviews WHERE reviewer_id = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![reviewer], parse_review_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, kind, title, summary, state, reviewer_id, requester_id, thread_id,
                        iteration, created_at, updated_at
                 FROM reviews ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map([], parse_review_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        }
    }

    pub fn update_review_state(&self, id: i64, state: ReviewState) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE reviews SET state = ?1, updated_at = ?2 WHERE id = ?3",
            params![state.to_string(), now, id],
        )?;
        if updated == 0 {
            return Err(CoreError::not_found(format!("review {id}")));
        }
        Ok(())
    }

    pub fn resubmit_review(&self, id: i64, note: Option<&str>) -> CoreResult<Review> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let iteration: i64 = tx.query_row(
            "UPDATE reviews SET state = 'pending', iteration = iteration + 1, updated_at = ?1
             WHERE id = ?2 RETURNING iteration",
            params![now, id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO review_iterations (review_id, iteration_number, note, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, iteration, note, now],
        )?;
        tx.commit()?;
        self.get_review(id)
    }

    pub fn delete_review(&self, id: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM reviews WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(CoreError::not_found(format!("review {id}")));
        }
        Ok(())
    }

    pub fn add_issue(
        &self,
        review_id: i64,
        severity: IssueSeverity,
        description: &str,
    ) -> CoreResult<ReviewIssue> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO review_issues (review_id, severity, description, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'open', ?4, ?4)",
            params![review_id, severity.to_string(), description, now],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_issue(id)
    }

    pub fn get_issue(&self, id: i64) -> CoreResult<ReviewIssue> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, review_id, severity, description, status, created_at, updated_at
             FROM review_issues WHERE id = ?1",
            params![id],
            parse_issue_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => CoreError::NotFound(format!("issue {id}")),
            other => other.into(),
        })
    }

    pub fn list_issues(&self, review_id: i64) -> CoreResult<Vec<ReviewIssue>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, review_id, severity, description, status, created_at, updated_at
             FROM review_issues WHERE review_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![review_id], parse_issue_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update_issue_status(&self, id: i64, status: IssueStatus) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE review_issues SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.to_string(), now, id],
        )?;
        if updated == 0 {
            return Err(CoreError::not_found(format!("issue {id}")));
        }
        Ok(())
    }
}

fn parse_agent_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        project_key: row.get(2)?,
        git_branch: row.get(3)?,
        last_active_at: schema::row_datetime(row, 4)?,
        current_session_id: row.get(5)?,
        created_at: schema::row_datetime(row, 6)?,
        inbox_topic_id: row.get(7)?,
    })
}

fn parse_identity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionIdentity> {
    let offsets_json: String = row.get(6)?;
    let consumer_offsets = serde_json::from_str(&offsets_json).unwrap_or_default();
    Ok(SessionIdentity {
        session_id: row.get(0)?,
        agent_id: row.get(1)?,
        project_key: row.get(2)?,
        git_branch: row.get(3)?,
        created_at: schema::row_datetime(row, 4)?,
        last_active_at: schema::row_datetime(row, 5)?,
        consumer_offsets,
    })
}

fn parse_topic_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Topic> {
    Ok(Topic {
        id: row.get(0)?,
        name: row.get(1)?,
        topic_type: row.get(2)?,
        retention_seconds: row.get(3)?,
        created_at: schema::row_datetime(row, 4)?,
        next_offset: row.get(5)?,
    })
}

fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let priority_str: String = row.get(6)?;
    Ok(Message {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        topic_id: row.get(2)?,
        sender_id: row.get(3)?,
        subject: row.get(4)?,
        body: row.get(5)?,
        priority: priority_str.parse().unwrap_or_default(),
        deadline: schema::row_datetime_opt(row, 7)?,
        attachments: row.get(8)?,
        created_at: schema::row_datetime(row, 9)?,
        sender_deleted: row.get(10)?,
    })
}

fn parse_recipient_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Recipient> {
    let state_str: String = row.get(4)?;
    Ok(Recipient {
        message_id: row.get(0)?,
        agent_id: row.get(1)?,
        topic_id: row.get(2)?,
        delivery_offset: row.get(3)?,
        state: state_str.parse().unwrap_or(RecipientState::Unread),
        snoozed_until: schema::row_datetime_opt(row, 5)?,
        read_at: schema::row_datetime_opt(row, 6)?,
        acked_at: schema::row_datetime_opt(row, 7)?,
    })
}

fn parse_inbox_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InboxEntry> {
    let message = parse_message_row(row)?;
    let state_str: String = row.get(11)?;
    Ok(InboxEntry {
        message,
        state: state_str.parse().unwrap_or(RecipientState::Unread),
        snoozed_until: schema::row_datetime_opt(row, 12)?,
        read_at: schema::row_datetime_opt(row, 13)?,
        acked_at: schema::row_datetime_opt(row, 14)?,
    })
}

fn parse_review_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Review> {
    let kind_str: String = row.get(1)?;
    let state_str: String = row.get(4)?;
    Ok(Review {
        id: row.get(0)?,
        kind: kind_str.parse().unwrap_or(ReviewKind::Plan),
        title: row.get(2)?,
        summary: row.get(3)?,
        state: state_str.parse().unwrap_or(ReviewState::Pending),
        reviewer_id: row.get(5)?,
        requester_id: row.get(6)?,
        thread_id: row.get(7)?,
        iteration: row.get(8)?,
        created_at: schema::row_datetime(row, 9)?,
        updated_at: schema::row_datetime(row, 10)?,
    })
}

fn parse_issue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReviewIssue> {
    let severity_str: String = row.get(2)?;
    let status_str: String = row.get(4)?;
    Ok(ReviewIssue {
        id: row.get(0)?,
        review_id: row.get(1)?,
        severity: severity_str.parse().unwrap_or(IssueSeverity::Info),
        description: row.get(3)?,
        status: status_str.parse().unwrap_or(IssueStatus::Open),
        created_at: schema::row_datetime(row, 5)?,
        updated_at: schema::row_datetime(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstraps_user_agent() {
        let store = Store::open_in_memory().unwrap();
        let user = store.get_agent_by_name(USER_AGENT_NAME).unwrap();
        assert_eq!(user.name, "User");
        assert!(user.inbox_topic_id.is_some());
    }

    #[test]
    fn user_agent_cannot_be_deleted() {
        let store = Store::open_in_memory().unwrap();
        let user = store.get_agent_by_name(USER_AGENT_NAME).unwrap();
        let err = store.delete_agent(user.id).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument { .. }));
    }

    #[test]
    fn create_agent_creates_inbox_topic_and_subscription() {
        let store = Store::open_in_memory().unwrap();
        let agent = store.create_agent("BlueFalcon", None, None).unwrap();
        let topic_id = agent.inbox_topic_id.unwrap();
        let subscribers = store.list_subscribers(topic_id).unwrap();
        assert_eq!(subscribers, vec![agent.id]);
    }

    #[test]
    fn agent_name_must_be_unique() {
        let store = Store::open_in_memory().unwrap();
        store.create_agent("BlueFalcon", None, None).unwrap();
        let err = store.create_agent("BlueFalcon", None, None).unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[test]
    fn send_assigns_monotonic_offsets_per_topic() {
        let store = Store::open_in_memory().unwrap();
        let alice = store.create_agent("Alice", None, None).unwrap();
        let bob = store.create_agent("Bob", None, None).unwrap();
        let bob_inbox = bob.inbox_topic_id.unwrap();

        let (_, recipients1, _) = store
            .insert_message(
                "t1", None, alice.id, "Hi", "one", Priority::Normal, None, None,
                &[(bob.id, bob_inbox)],
                None,
            )
            .unwrap();
        let (_, recipients2, _) = store
            .insert_message(
                "t1", None, alice.id, "Re: Hi", "two", Priority::Normal, None, None,
                &[(bob.id, bob_inbox)],
                None,
            )
            .unwrap();

        assert_eq!(recipients1[0].delivery_offset, 1);
        assert_eq!(recipients2[0].delivery_offset, 2);
    }

    #[test]
    fn insert_message_dedupes_on_idempotency_key() {
        let store = Store::open_in_memory().unwrap();
        let alice = store.create_agent("Alice", None, None).unwrap();
        let bob = store.create_agent("Bob", None, None).unwrap();
        let bob_inbox = bob.inbox_topic_id.unwrap();

        let (first, _, was_new1) = store
            .insert_message(
                "t1", None, alice.id, "Hi", "one", Priority::Normal, None, None,
                &[(bob.id, bob_inbox)],
                Some("send:k1"),
            )
            .unwrap();
        assert!(was_new1);

        let (second, _, was_new2) = store
            .insert_message(
                "t1", None, alice.id, "Hi", "one", Priority::Normal, None, None,
                &[(bob.id, bob_inbox)],
                Some("send:k1"),
            )
            .unwrap();
        assert!(!was_new2);
        assert_eq!(first.id, second.id);

        let inbox = store.fetch_inbox(bob.id, 50, false, None, false, None).unwrap();
        assert_eq!(inbox.len(), 1);
    }

    #[test]
    fn fetch_inbox_excludes_archived_and_trash() {
        let store = Store::open_in_memory().unwrap();
        let alice = store.create_agent("Alice", None, None).unwrap();
        let bob = store.create_agent("Bob", None, None).unwrap();
        let bob_inbox = bob.inbox_topic_id.unwrap();

        let (message, _, _) = store
            .insert_message(
                "t1", None, alice.id, "Hi", "body", Priority::Normal, None, None,
                &[(bob.id, bob_inbox)],
                None,
            )
            .unwrap();

        store
            .set_recipient_state(message.id, bob.id, RecipientState::Archived, None)
            .unwrap();
        let inbox = store.fetch_inbox(bob.id, 50, false, None, false, None).unwrap();
        assert!(inbox.is_empty());

        store
            .set_recipient_state(message.id, bob.id, RecipientState::Unread, None)
            .unwrap();
        let inbox = store.fetch_inbox(bob.id, 50, false, None, false, None).unwrap();
        assert_eq!(inbox.len(), 1);
    }

    #[test]
    fn fetch_inbox_excludes_snoozed_until_wake() {
        let store = Store::open_in_memory().unwrap();
        let alice = store.create_agent("Alice", None, None).unwrap();
        let bob = store.create_agent("Bob", None, None).unwrap();
        let bob_inbox = bob.inbox_topic_id.unwrap();

        let (message, _, _) = store
            .insert_message(
                "t1", None, alice.id, "Hi", "body", Priority::Normal, None, None,
                &[(bob.id, bob_inbox)],
                None,
            )
            .unwrap();

        let future = Utc::now() + chrono::Duration::seconds(1);
        store
            .set_recipient_state(message.id, bob.id, RecipientState::Snoozed, Some(future))
            .unwrap();
        assert!(store.fetch_inbox(bob.id, 50, false, None, false, None).unwrap().is_empty());

        // Backdate the snooze deadline in place of sleeping in a unit test.
        store
            .set_recipient_state(
                message.id,
                bob.id,
                RecipientState::Snoozed,
                Some(Utc::now() - chrono::Duration::seconds(1)),
            )
            .unwrap();
        let inbox = store.fetch_inbox(bob.id, 50, false, None, false, None).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].state, RecipientState::Unread);
    }

    #[test]
    fn read_is_idempotent_and_preserves_starred() {
        let store = Store::open_in_memory().unwrap();
        let alice = store.create_agent("Alice", None, None).unwrap();
        let bob = store.create_agent("Bob", None, None).unwrap();
        let bob_inbox = bob.inbox_topic_id.unwrap();
        let (message, _, _) = store
            .insert_message(
                "t1", None, alice.id, "Hi", "body", Priority::Normal, None, None,
                &[(bob.id, bob_inbox)],
                None,
            )
            .unwrap();

        store.mark_read(message.id, bob.id).unwrap();
        let r = store.get_recipient(message.id, bob.id).unwrap();
        assert_eq!(r.state, RecipientState::Read);
        assert!(r.read_at.is_some());

        store
            .set_recipient_state(message.id, bob.id, RecipientState::Starred, None)
            .unwrap();
        store.mark_read(message.id, bob.id).unwrap(); // no-op: state != unread
        let r = store.get_recipient(message.id, bob.id).unwrap();
        assert_eq!(r.state, RecipientState::Starred);
    }

    #[test]
    fn search_finds_message_by_subject_and_body() {
        let store = Store::open_in_memory().unwrap();
        let alice = store.create_agent("Alice", None, None).unwrap();
        let bob = store.create_agent("Bob", None, None).unwrap();
        let bob_inbox = bob.inbox_topic_id.unwrap();
        store
            .insert_message(
                "t1", None, alice.id, "Deployment plan", "roll out canary", Priority::Normal,
                None, None, &[(bob.id, bob_inbox)], None,
            )
            .unwrap();

        let hits = store.search_for_agent("canary", bob.id, None, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].subject, "Deployment plan");

        let none = store.search_for_agent("canary", alice.id, None, 10).unwrap();
        assert!(none.is_empty());
    }
}

#[cfg(test)]
mod proptests;
