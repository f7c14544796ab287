//! Offline Queue — per-project durable store-and-forward
//!
//! Lives in its own SQLite file distinct from the main Store (typically
//! `<project>/.subtrate/queue.db`) so it works even when the daemon's
//! database is unreachable. `Drain` replays queued operations into a
//! [`crate::mail::MailService`] using the idempotency key so a repeated
//! drain never double-delivers.

use crate::error::CoreResult;
use crate::mail::{MailService, SendRequest};
use crate::store::Priority;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pending_operations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    idempotency_key TEXT NOT NULL UNIQUE,
    op_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    agent_name TEXT NOT NULL,
    session_id TEXT,
    created_at TEXT NOT NULL,
    expires_at TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    delivered INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_pending_operations_delivered ON pending_operations(delivered, created_at);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Send,
    Publish,
    StatusUpdate,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationType::Send => "send",
            OperationType::Publish => "publish",
            OperationType::StatusUpdate => "status-update",
        };
        write!(f, "{s}")
    }
}

/// The fields that go into the idempotency hash for a `send`: operation
/// type, sender, recipients, subject, body, priority. A reply-with-diff
/// additionally hashes `diff:<len>:<sender>:<len>:<recipient>:<len>:<patch>`
/// — length-prefixing each field so embedded `:` characters can't make two
/// distinct inputs collide (§4.6).
pub struct SendPayload {
    pub sender_name: String,
    pub recipient_names: Vec<String>,
    pub subject: String,
    pub body: String,
    pub priority: Priority,
}

pub fn idempotency_key_for_send(payload: &SendPayload) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"send");
    hasher.update(payload.sender_name.as_bytes());
    let mut recipients = payload.recipient_names.clone();
    recipients.sort();
    for name in &recipients {
        hasher.update(name.as_bytes());
    }
    hasher.update(payload.subject.as_bytes());
    hasher.update(payload.body.as_bytes());
    hasher.update(payload.priority.to_string().as_bytes());
    format!("send:{}", hex_digest(hasher))
}

pub fn idempotency_key_for_diff(sender: &str, recipient: &str, patch: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("diff:{}:{sender}:{}:{recipient}:{}:{patch}", sender.len(), recipient.len(), patch.len()).as_bytes());
    format!("diff:{}", hex_digest(hasher))
}

fn hex_digest(hasher: Sha256) -> String {
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

pub struct EnqueueRequest {
    pub idempotency_key: String,
    pub op_type: OperationType,
    pub payload: String,
    pub agent_name: String,
    pub session_id: Option<String>,
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub id: i64,
    pub idempotency_key: String,
    pub op_type: String,
    pub payload: String,
    pub agent_name: String,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub delivered: bool,
}

#[derive(Debug, Default)]
pub struct DrainStats {
    pub delivered: u64,
    pub failed: u64,
    pub expired: u64,
}

#[derive(Clone)]
pub struct OfflineQueue {
    conn: Arc<Mutex<Connection>>,
}

impl OfflineQueue {
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> CoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// No-op if `idempotency_key` already exists, per §4.6.
    pub fn enqueue(&self, req: EnqueueRequest) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let expires_at = req.ttl_seconds.map(|s| now + chrono::Duration::seconds(s));
        conn.execute(
            "INSERT INTO pending_operations
                (idempotency_key, op_type, payload, agent_name, session_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(idempotency_key) DO NOTHING",
            params![
                req.idempotency_key,
                req.op_type.to_string(),
                req.payload,
                req.agent_name,
                req.session_id,
                now.to_rfc3339(),
                expires_at.map(|d| d.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn purge_expired(&self) -> CoreResult<u64> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let removed = conn.execute(
            "DELETE FROM pending_operations WHERE delivered = 0 AND expires_at IS NOT NULL AND expires_at < ?1",
            params![now],
        )?;
        Ok(removed as u64)
    }

    fn pending(&self) -> CoreResult<Vec<PendingOperation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, idempotency_key, op_type, payload, agent_name, session_id, created_at,
                    expires_at, attempts, last_error, delivered
             FROM pending_operations WHERE delivered = 0 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], parse_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn mark_delivered(&self, id: i64) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE pending_operations SET delivered = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn record_failure(&self, id: i64, error: &str) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE pending_operations SET attempts = attempts + 1, last_error = ?1 WHERE id = ?2",
            params![error, id],
        )?;
        Ok(())
    }

    /// Purges expired rows, then delivers pending rows FIFO into `mail`,
    /// carrying each row's idempotency key through to `send`/`publish`. A
    /// replay that lands on a key already applied to the `messages` table
    /// is deduped transactionally by the Store and returns the original
    /// outcome rather than a second message, satisfying §4.6's
    /// exactly-once-over-retries guarantee even across a crash between a
    /// committed send and this queue's own `mark_delivered`.
    pub fn drain(&self, mail: &MailService, resolve_agent_id: impl Fn(&str) -> Option<i64>) -> CoreResult<DrainStats> {
        let mut stats = DrainStats::default();
        stats.expired = self.purge_expired()?;

        for op in self.pending()? {
            let Some(sender_id) = resolve_agent_id(&op.agent_name) else {
                self.record_failure(op.id, "unknown agent")?;
                stats.failed += 1;
                continue;
            };

            let outcome: CoreResult<()> = (|| {
                match op.op_type.as_str() {
                    "send" => {
                        let payload: SendEnvelope = serde_json::from_str(&op.payload)
                            .map_err(|e| crate::error::CoreError::Internal(e.to_string()))?;
                        mail.send(SendRequest {
                            sender_id,
                            recipient_names: &payload.recipient_names,
                            thread_id: payload.thread_id,
                            subject: &payload.subject,
                            body: &payload.body,
                            priority: payload.priority,
                            deadline: None,
                            attachments: None,
                            idempotency_key: Some(&op.idempotency_key),
                        })?;
                        Ok(())
                    }
                    "publish" => {
                        let payload: PublishEnvelope = serde_json::from_str(&op.payload)
                            .map_err(|e| crate::error::CoreError::Internal(e.to_string()))?;
                        mail.publish(
                            sender_id,
                            &payload.topic_name,
                            &payload.subject,
                            &payload.body,
                            payload.priority,
                            Some(&op.idempotency_key),
                        )?;
                        Ok(())
                    }
                    other => Err(crate::error::CoreError::Internal(format!("unknown op_type '{other}'"))),
                }
            })();

            match outcome {
                Ok(()) => {
                    self.mark_delivered(op.id)?;
                    stats.delivered += 1;
                }
                Err(crate::error::CoreError::Conflict(_)) => {
                    // Already applied under this idempotency key.
                    self.mark_delivered(op.id)?;
                    stats.delivered += 1;
                }
                Err(e) => {
                    self.record_failure(op.id, &e.to_string())?;
                    stats.failed += 1;
                }
            }
        }

        Ok(stats)
    }

    pub fn list(&self) -> CoreResult<Vec<PendingOperation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, idempotency_key, op_type, payload, agent_name, session_id, created_at,
                    expires_at, attempts, last_error, delivered
             FROM pending_operations ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], parse_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn stats(&self) -> CoreResult<(u64, u64)> {
        let conn = self.conn.lock().unwrap();
        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pending_operations WHERE delivered = 0",
            [],
            |row| row.get(0),
        )?;
        let delivered: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pending_operations WHERE delivered = 1",
            [],
            |row| row.get(0),
        )?;
        Ok((pending as u64, delivered as u64))
    }

    pub fn clear(&self) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM pending_operations", [])?;
        Ok(())
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SendEnvelope {
    recipient_names: Vec<String>,
    thread_id: Option<String>,
    subject: String,
    body: String,
    priority: Priority,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PublishEnvelope {
    topic_name: String,
    subject: String,
    body: String,
    priority: Priority,
}

fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingOperation> {
    let created_at: String = row.get(6)?;
    let expires_at: Option<String> = row.get(7)?;
    Ok(PendingOperation {
        id: row.get(0)?,
        idempotency_key: row.get(1)?,
        op_type: row.get(2)?,
        payload: row.get(3)?,
        agent_name: row.get(4)?,
        session_id: row.get(5)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        expires_at: expires_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        attempts: row.get(8)?,
        last_error: row.get(9)?,
        delivered: row.get::<_, i64>(10)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::NotificationHub;
    use crate::store::Store;

    #[test]
    fn duplicate_enqueue_is_a_no_op() {
        let queue = OfflineQueue::open_in_memory().unwrap();
        let req = || EnqueueRequest {
            idempotency_key: "send:abc".to_string(),
            op_type: OperationType::Send,
            payload: "{}".to_string(),
            agent_name: "Alice".to_string(),
            session_id: None,
            ttl_seconds: None,
        };
        queue.enqueue(req()).unwrap();
        queue.enqueue(req()).unwrap();
        assert_eq!(queue.list().unwrap().len(), 1);
    }

    #[test]
    fn idempotency_key_is_deterministic_and_prefixed() {
        let payload = SendPayload {
            sender_name: "Alice".to_string(),
            recipient_names: vec!["Bob".to_string()],
            subject: "Hi".to_string(),
            body: "one".to_string(),
            priority: Priority::Normal,
        };
        let key1 = idempotency_key_for_send(&payload);
        let key2 = idempotency_key_for_send(&payload);
        assert_eq!(key1, key2);
        assert!(key1.starts_with("send:"));
    }

    #[test]
    fn diff_key_length_prefixing_avoids_delimiter_collision() {
        // Without length-prefixing, ("a:b", "c", "patch") and ("a", "b:c", "patch")
        // would hash identically once concatenated with ':'.
        let key1 = idempotency_key_for_diff("a:b", "c", "patch");
        let key2 = idempotency_key_for_diff("a", "b:c", "patch");
        assert_ne!(key1, key2);
        assert!(key1.starts_with("diff:"));
    }

    #[test]
    fn drain_delivers_fifo_and_is_idempotent_on_second_run() {
        let store = Store::open_in_memory().unwrap();
        let alice = store.create_agent("Alice", None, None).unwrap();
        let bob = store.create_agent("Bob", None, None).unwrap();
        let mail = MailService::new(store.clone(), NotificationHub::new());
        let queue = OfflineQueue::open_in_memory().unwrap();

        let payload = SendEnvelope {
            recipient_names: vec![bob.name.clone()],
            thread_id: None,
            subject: "Hi".to_string(),
            body: "one".to_string(),
            priority: Priority::Normal,
        };
        queue
            .enqueue(EnqueueRequest {
                idempotency_key: "send:k1".to_string(),
                op_type: OperationType::Send,
                payload: serde_json::to_string(&payload).unwrap(),
                agent_name: alice.name.clone(),
                session_id: None,
                ttl_seconds: None,
            })
            .unwrap();

        let resolve = |name: &str| store.get_agent_by_name(name).ok().map(|a| a.id);
        let stats = queue.drain(&mail, resolve).unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.failed, 0);

        let inbox = mail.fetch_inbox(bob.id, None, false, None, false, None).unwrap();
        assert_eq!(inbox.len(), 1);

        let second = queue.drain(&mail, resolve).unwrap();
        assert_eq!(second.delivered, 0);
        assert_eq!(second.failed, 0);
    }

    #[test]
    fn replaying_a_send_after_a_crash_before_mark_delivered_is_not_duplicated() {
        // Simulates the daemon crashing after `mail.send` commits but before
        // `mark_delivered` runs: the pending row is still undelivered, so the
        // next drain replays the same payload under the same idempotency key.
        let store = Store::open_in_memory().unwrap();
        let alice = store.create_agent("Alice", None, None).unwrap();
        let bob = store.create_agent("Bob", None, None).unwrap();
        let mail = MailService::new(store.clone(), NotificationHub::new());

        let req = || SendRequest {
            sender_id: alice.id,
            recipient_names: &[bob.name.clone()],
            thread_id: None,
            subject: "Hi",
            body: "one",
            priority: Priority::Normal,
            deadline: None,
            attachments: None,
            idempotency_key: Some("send:crash-replay"),
        };
        mail.send(req()).unwrap();
        mail.send(req()).unwrap();

        let inbox = mail.fetch_inbox(bob.id, None, false, None, false, None).unwrap();
        assert_eq!(inbox.len(), 1);
    }
}

#[cfg(test)]
mod proptests;
