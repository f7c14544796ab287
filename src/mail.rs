//! Mail Service — send/publish/fetch/read/state-transition/ack/poll/search
//!
//! Every mutation here follows the same shape: resolve names to ids,
//! commit through the Store in one transaction, then hand the freshly
//! committed deliveries to the Notification Hub. The Hub call happens
//! strictly after the commit returns — a notification failure must never
//! unwind a successful send (§4.5, §7 propagation policy).

use crate::error::{CoreError, CoreResult};
use crate::hub::NotificationHub;
use crate::store::{
    InboxEntry, Message, Priority, Recipient, RecipientState, Store, USER_AGENT_NAME,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

pub const DEFAULT_FETCH_LIMIT: i64 = 50;
pub const MAX_POLL_MESSAGES: i64 = 200;

#[derive(Clone)]
pub struct MailService {
    store: Store,
    hub: NotificationHub,
}

pub struct SendRequest<'a> {
    pub sender_id: i64,
    pub recipient_names: &'a [String],
    pub thread_id: Option<String>,
    pub subject: &'a str,
    pub body: &'a str,
    pub priority: Priority,
    pub deadline: Option<DateTime<Utc>>,
    pub attachments: Option<&'a str>,
    /// Deduplication key from the offline queue's drain path (§4.6). A
    /// repeated key returns the original message/thread instead of
    /// creating a second one — see [`Store::insert_message`].
    pub idempotency_key: Option<&'a str>,
}

pub struct SendResult {
    pub message_id: i64,
    pub thread_id: String,
}

/// Strip already-invalid UTF-8 byte sequences from text that arrived over
/// the wire as raw bytes (attachments sidecar) before persistence, so the
/// Store never holds anything the wire can't losslessly echo back (§9
/// "Unicode hygiene"). A Rust `&str` is always valid UTF-8 already; this
/// only matters for the base64-free-form sidecar text.
fn sanitize(text: &str) -> String {
    String::from_utf8_lossy(text.as_bytes()).into_owned()
}

impl MailService {
    pub fn new(store: Store, hub: NotificationHub) -> Self {
        Self { store, hub }
    }

    fn resolve_recipient_ids(&self, names: &[String]) -> CoreResult<Vec<i64>> {
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let agent = self.store.get_agent_by_name(name)?;
            if !ids.contains(&agent.id) {
                ids.push(agent.id);
            }
        }
        Ok(ids)
    }

    pub fn send(&self, req: SendRequest<'_>) -> CoreResult<SendResult> {
        if req.subject.trim().is_empty() {
            return Err(CoreError::invalid("subject", "must be non-empty"));
        }
        if req.recipient_names.is_empty() {
            return Err(CoreError::invalid("recipientNames", "must name at least one recipient"));
        }

        let recipient_ids = self.resolve_recipient_ids(req.recipient_names)?;
        let thread_id = req.thread_id.unwrap_or_else(new_thread_id);
        let subject = sanitize(req.subject);
        let body = sanitize(req.body);
        let attachments = req.attachments.map(sanitize);

        let mut deliveries = Vec::with_capacity(recipient_ids.len());
        for &agent_id in &recipient_ids {
            let agent = self.store.get_agent(agent_id)?;
            let inbox_topic_id = agent
                .inbox_topic_id
                .ok_or_else(|| CoreError::Internal(format!("agent {agent_id} has no inbox topic")))?;
            deliveries.push((agent_id, inbox_topic_id));
        }

        let (message, recipients, was_new) = self.store.insert_message(
            &thread_id,
            None,
            req.sender_id,
            &subject,
            &body,
            req.priority,
            req.deadline,
            attachments.as_deref(),
            &deliveries,
            req.idempotency_key,
        )?;

        if was_new {
            self.emit_deliveries(&message, &recipients);
        }

        Ok(SendResult {
            message_id: message.id,
            thread_id: message.thread_id,
        })
    }

    pub fn publish(
        &self,
        sender_id: i64,
        topic_name: &str,
        subject: &str,
        body: &str,
        priority: Priority,
        idempotency_key: Option<&str>,
    ) -> CoreResult<(i64, usize)> {
        if subject.trim().is_empty() {
            return Err(CoreError::invalid("subject", "must be non-empty"));
        }
        let topic = self
            .store
            .find_topic(topic_name)?
            .ok_or_else(|| CoreError::not_found(format!("topic '{topic_name}'")))?;

        let subscriber_ids = self.store.list_subscribers(topic.id)?;
        let thread_id = new_thread_id();
        let deliveries: Vec<(i64, i64)> = subscriber_ids.iter().map(|&id| (id, topic.id)).collect();

        let (message, recipients, was_new) = self.store.insert_message(
            &thread_id,
            Some(topic.id),
            sender_id,
            &sanitize(subject),
            &sanitize(body),
            priority,
            None,
            None,
            &deliveries,
            idempotency_key,
        )?;

        if was_new {
            self.emit_deliveries(&message, &recipients);
        }

        Ok((message.id, recipients.len()))
    }

    fn emit_deliveries(&self, message: &Message, recipients: &[Recipient]) {
        for recipient in recipients {
            let entry = InboxEntry {
                message: message.clone(),
                state: recipient.state,
                snoozed_until: recipient.snoozed_until,
                read_at: recipient.read_at,
                acked_at: recipient.acked_at,
            };
            self.hub.publish(recipient.agent_id, &entry);
        }
    }

    pub fn fetch_inbox(
        &self,
        agent_id: i64,
        limit: Option<i64>,
        unread_only: bool,
        state_filter: Option<RecipientState>,
        sent_only: bool,
        sender_name_prefix: Option<&str>,
    ) -> CoreResult<Vec<InboxEntry>> {
        let limit = limit.unwrap_or(DEFAULT_FETCH_LIMIT).clamp(1, 1000);
        let resolved_agent = self.resolve_aggregate_agent(agent_id)?;
        self.store.fetch_inbox(
            resolved_agent,
            limit,
            unread_only,
            state_filter,
            sent_only,
            sender_name_prefix,
        )
    }

    /// `agentId == 0` refers to the aggregate "User" view in read paths.
    fn resolve_aggregate_agent(&self, agent_id: i64) -> CoreResult<i64> {
        if agent_id == 0 {
            let user = self.store.get_agent_by_name(USER_AGENT_NAME)?;
            Ok(user.id)
        } else {
            Ok(agent_id)
        }
    }

    pub fn read_message(&self, message_id: i64, agent_id: i64) -> CoreResult<Message> {
        let resolved = self.resolve_aggregate_agent(agent_id)?;
        self.store.mark_read(message_id, resolved)?;
        self.store.get_message(message_id)
    }

    pub fn read_thread(&self, thread_id: &str) -> CoreResult<Vec<Message>> {
        self.store.get_messages_by_thread(thread_id)
    }

    /// Applies the Recipient state machine. For the aggregate view
    /// (`agentId == 0`) a concrete recipient is identified when it is
    /// unambiguous — exactly one recipient row on the message, or (via
    /// `sender_deletion`) the row belonging to the message's own sender —
    /// rather than silently defaulting to the "User" agent, per §4.4/§9's
    /// resolved Open Question. When `sender_deletion` is set and the
    /// calling agent is the message's sender, `messages.sender_deleted`
    /// is also flipped, recording that the sender hid the message from
    /// their own Sent view independent of any recipient's state.
    pub fn update_state(
        &self,
        message_id: i64,
        agent_id: i64,
        new_state: RecipientState,
        snoozed_until: Option<DateTime<Utc>>,
        sender_deletion: bool,
    ) -> CoreResult<()> {
        if new_state == RecipientState::Snoozed {
            let until = snoozed_until
                .ok_or_else(|| CoreError::invalid("snoozedUntil", "required when state is snoozed"))?;
            if until <= Utc::now() {
                return Err(CoreError::invalid("snoozedUntil", "must be in the future"));
            }
        }

        if sender_deletion {
            self.apply_sender_deletion_flag(message_id, agent_id)?;
        }

        let resolved = self.resolve_mutation_target(message_id, agent_id, sender_deletion)?;
        self.store.set_recipient_state(message_id, resolved, new_state, snoozed_until)
    }

    /// Sets `messages.sender_deleted` when the caller is the message's
    /// sender (directly, or via the aggregate "User" view).
    fn apply_sender_deletion_flag(&self, message_id: i64, agent_id: i64) -> CoreResult<()> {
        let message = self.store.get_message(message_id)?;
        if agent_id == 0 || agent_id == message.sender_id {
            self.store.mark_sender_deleted(message_id)?;
        }
        Ok(())
    }

    fn resolve_mutation_target(&self, message_id: i64, agent_id: i64, sender_deletion: bool) -> CoreResult<i64> {
        if agent_id != 0 {
            return Ok(agent_id);
        }
        let recipients = self.store.list_recipients(message_id)?;
        if sender_deletion {
            let message = self.store.get_message(message_id)?;
            if let Some(sender_row) = recipients.iter().find(|r| r.agent_id == message.sender_id) {
                return Ok(sender_row.agent_id);
            }
        }
        match recipients.as_slice() {
            [only] => Ok(only.agent_id),
            _ => {
                let user = self.store.get_agent_by_name(USER_AGENT_NAME)?;
                Ok(user.id)
            }
        }
    }

    pub fn ack(&self, message_id: i64, agent_id: i64) -> CoreResult<()> {
        let resolved = self.resolve_aggregate_agent(agent_id)?;
        self.store.ack(message_id, resolved)
    }

    pub fn has_unacked_status_to(&self, agent_id: i64, sender_id: i64) -> CoreResult<bool> {
        self.store.has_unacked_from(agent_id, sender_id)
    }

    /// Returns messages newer than the caller's provided per-topic
    /// offsets across every topic `agent_id` subscribes to, along with
    /// the updated offsets. Falls back to the Store's persisted
    /// consumer offset when the caller omits a topic entirely, so a
    /// restarted caller that lost its local bookmark still resumes from
    /// its last acknowledged position instead of offset 0.
    pub fn poll_changes(
        &self,
        agent_id: i64,
        since_offsets: &HashMap<i64, i64>,
    ) -> CoreResult<(Vec<InboxEntry>, HashMap<i64, i64>)> {
        let topics = self.store.list_subscriptions(agent_id)?;
        let mut updated_offsets = HashMap::new();
        let mut all_entries = Vec::new();

        for topic in topics {
            let since = match since_offsets.get(&topic.id) {
                Some(&offset) => offset,
                None => self.store.get_consumer_offset(agent_id, topic.id)?,
            };

            let entries = self.store.poll_topic(agent_id, topic.id, since, MAX_POLL_MESSAGES)?;
            let topic_max = entries
                .last()
                .map(|e| self.store.get_recipient(e.message.id, agent_id))
                .transpose()?
                .map_or(since, |r| r.delivery_offset);
            all_entries.extend(entries);
            self.store.set_consumer_offset(agent_id, topic.id, topic_max)?;
            updated_offsets.insert(topic.id, topic_max);
        }

        all_entries.sort_by(|a, b| a.message.created_at.cmp(&b.message.created_at));
        all_entries.truncate(MAX_POLL_MESSAGES as usize);
        Ok((all_entries, updated_offsets))
    }

    pub fn search(
        &self,
        query: &str,
        agent_id: i64,
        topic_id: Option<i64>,
        limit: Option<i64>,
    ) -> CoreResult<Vec<Message>> {
        let limit = limit.unwrap_or(DEFAULT_FETCH_LIMIT).clamp(1, 1000);
        self.store.search_for_agent(query, agent_id, topic_id, limit)
    }

    pub fn subscribe(&self, agent_id: i64, topic_name: &str) -> CoreResult<()> {
        let topic = self.store.get_or_create_topic(topic_name, "broadcast")?;
        self.store.subscribe(agent_id, topic.id)
    }

    pub fn unsubscribe(&self, agent_id: i64, topic_name: &str) -> CoreResult<()> {
        let topic = self
            .store
            .find_topic(topic_name)?
            .ok_or_else(|| CoreError::not_found(format!("topic '{topic_name}'")))?;
        self.store.unsubscribe(agent_id, topic.id)
    }

    pub fn list_topics(&self) -> CoreResult<Vec<crate::store::Topic>> {
        self.store.list_topics()
    }

    pub fn reply_to_thread(
        &self,
        sender_id: i64,
        thread_id: &str,
        recipient_names: &[String],
        subject: &str,
        body: &str,
        priority: Priority,
    ) -> CoreResult<SendResult> {
        self.send(SendRequest {
            sender_id,
            recipient_names,
            thread_id: Some(thread_id.to_string()),
            subject,
            body,
            priority,
            deadline: None,
            attachments: None,
            idempotency_key: None,
        })
    }

    pub fn archive_thread(&self, thread_id: &str, agent_id: i64) -> CoreResult<()> {
        self.set_state_for_thread(thread_id, agent_id, RecipientState::Archived)
    }

    pub fn delete_thread(&self, thread_id: &str, agent_id: i64) -> CoreResult<()> {
        self.set_state_for_thread(thread_id, agent_id, RecipientState::Trash)
    }

    pub fn mark_thread_unread(&self, thread_id: &str, agent_id: i64) -> CoreResult<()> {
        self.set_state_for_thread(thread_id, agent_id, RecipientState::Unread)
    }

    fn set_state_for_thread(
        &self,
        thread_id: &str,
        agent_id: i64,
        state: RecipientState,
    ) -> CoreResult<()> {
        let resolved = self.resolve_aggregate_agent(agent_id)?;
        for message in self.store.get_messages_by_thread(thread_id)? {
            if self.store.get_recipient(message.id, resolved).is_ok() {
                self.store.set_recipient_state(message.id, resolved, state, None)?;
            }
        }
        Ok(())
    }

    pub fn delete_message(&self, message_id: i64, agent_id: i64, sender_deletion: bool) -> CoreResult<()> {
        if sender_deletion {
            self.apply_sender_deletion_flag(message_id, agent_id)?;
        }
        let resolved = self.resolve_mutation_target(message_id, agent_id, sender_deletion)?;
        self.store.set_recipient_state(message_id, resolved, RecipientState::Trash, None)
    }
}

fn new_thread_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (MailService, Store) {
        let store = Store::open_in_memory().unwrap();
        let hub = NotificationHub::new();
        (MailService::new(store.clone(), hub), store)
    }

    #[test]
    fn send_then_fetch_inbox_returns_unread() {
        let (mail, store) = service();
        let alice = store.create_agent("Alice", None, None).unwrap();
        let bob = store.create_agent("Bob", None, None).unwrap();

        let result = mail
            .send(SendRequest {
                sender_id: alice.id,
                recipient_names: &[bob.name.clone()],
                thread_id: None,
                subject: "Hi",
                body: "one",
                priority: Priority::Normal,
                deadline: None,
                attachments: None,
                idempotency_key: None,
            })
            .unwrap();

        let inbox = mail.fetch_inbox(bob.id, None, false, None, false, None).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].message.id, result.message_id);
        assert_eq!(inbox[0].state, RecipientState::Unread);
    }

    #[test]
    fn thread_reply_ordering() {
        let (mail, store) = service();
        let alice = store.create_agent("Alice", None, None).unwrap();
        let bob = store.create_agent("Bob", None, None).unwrap();

        let sent = mail
            .send(SendRequest {
                sender_id: alice.id,
                recipient_names: &[bob.name.clone()],
                thread_id: None,
                subject: "Hi",
                body: "one",
                priority: Priority::Normal,
                deadline: None,
                attachments: None,
                idempotency_key: None,
            })
            .unwrap();

        mail.reply_to_thread(bob.id, &sent.thread_id, &[alice.name.clone()], "Re: Hi", "two", Priority::Normal)
            .unwrap();

        let thread = mail.read_thread(&sent.thread_id).unwrap();
        let bodies: Vec<&str> = thread.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["one", "two"]);
    }

    #[test]
    fn publish_fans_out_to_all_subscribers() {
        let (mail, store) = service();
        let sender = store.create_agent("Sender", None, None).unwrap();
        let sub1 = store.create_agent("Sub1", None, None).unwrap();
        let sub2 = store.create_agent("Sub2", None, None).unwrap();
        let sub3 = store.create_agent("Sub3", None, None).unwrap();

        for agent in [&sub1, &sub2, &sub3] {
            mail.subscribe(agent.id, "ops").unwrap();
        }

        let (_, count) = mail
            .publish(sender.id, "ops", "Broadcast", "body", Priority::Normal, None)
            .unwrap();
        assert_eq!(count, 3);

        for agent in [&sub1, &sub2, &sub3] {
            let inbox = mail.fetch_inbox(agent.id, None, false, None, false, None).unwrap();
            assert_eq!(inbox.len(), 1);
            assert_eq!(inbox[0].message.subject, "Broadcast");
        }
    }

    #[test]
    fn archive_then_restore_via_update_state() {
        let (mail, store) = service();
        let alice = store.create_agent("Alice", None, None).unwrap();
        let bob = store.create_agent("Bob", None, None).unwrap();

        let sent = mail
            .send(SendRequest {
                sender_id: alice.id,
                recipient_names: &[bob.name.clone()],
                thread_id: None,
                subject: "Hi",
                body: "",
                priority: Priority::Normal,
                deadline: None,
                attachments: None,
                idempotency_key: None,
            })
            .unwrap();

        mail.update_state(sent.message_id, bob.id, RecipientState::Archived, None, false).unwrap();
        assert!(mail.fetch_inbox(bob.id, None, false, None, false, None).unwrap().is_empty());

        mail.update_state(sent.message_id, bob.id, RecipientState::Unread, None, false).unwrap();
        assert_eq!(mail.fetch_inbox(bob.id, None, false, None, false, None).unwrap().len(), 1);
    }

    #[test]
    fn aggregate_view_mutation_targets_the_sole_recipient() {
        let (mail, store) = service();
        let sender = store.create_agent("Sender", None, None).unwrap();
        let azure_haven = store.create_agent("AzureHaven", None, None).unwrap();

        let sent = mail
            .send(SendRequest {
                sender_id: sender.id,
                recipient_names: &[azure_haven.name.clone()],
                thread_id: None,
                subject: "Review needed",
                body: "",
                priority: Priority::Normal,
                deadline: None,
                attachments: None,
                idempotency_key: None,
            })
            .unwrap();

        mail.update_state(sent.message_id, 0, RecipientState::Read, None, false).unwrap();

        let recipient = store.get_recipient(sent.message_id, azure_haven.id).unwrap();
        assert_eq!(recipient.state, RecipientState::Read);

        let user = store.get_agent_by_name(USER_AGENT_NAME).unwrap();
        assert!(store.get_recipient(sent.message_id, user.id).is_err());
    }

    #[test]
    fn aggregate_view_sender_deletion_targets_the_sender_among_many_recipients() {
        let (mail, store) = service();
        let sender = store.create_agent("Sender", None, None).unwrap();
        let sub1 = store.create_agent("Sub1", None, None).unwrap();
        let sub2 = store.create_agent("Sub2", None, None).unwrap();
        mail.subscribe(sender.id, "ops").unwrap();
        mail.subscribe(sub1.id, "ops").unwrap();
        mail.subscribe(sub2.id, "ops").unwrap();

        let (message_id, count) = mail
            .publish(sender.id, "ops", "Broadcast", "body", Priority::Normal, None)
            .unwrap();
        assert_eq!(count, 3);

        mail.update_state(message_id, 0, RecipientState::Trash, None, true).unwrap();

        let sender_recipient = store.get_recipient(message_id, sender.id).unwrap();
        assert_eq!(sender_recipient.state, RecipientState::Trash);
        let sub1_recipient = store.get_recipient(message_id, sub1.id).unwrap();
        assert_eq!(sub1_recipient.state, RecipientState::Unread);

        let message = store.get_message(message_id).unwrap();
        assert!(message.sender_deleted);
    }

    #[test]
    fn sender_deletion_flag_is_ignored_from_a_non_sender_agent() {
        let (mail, store) = service();
        let sender = store.create_agent("Sender", None, None).unwrap();
        let bob = store.create_agent("Bob", None, None).unwrap();
        let sent = mail
            .send(SendRequest {
                sender_id: sender.id,
                recipient_names: &[bob.name.clone()],
                thread_id: None,
                subject: "Hi",
                body: "",
                priority: Priority::Normal,
                deadline: None,
                attachments: None,
                idempotency_key: None,
            })
            .unwrap();

        mail.update_state(sent.message_id, bob.id, RecipientState::Read, None, true)
            .unwrap();

        let message = store.get_message(sent.message_id).unwrap();
        assert!(!message.sender_deleted);
    }

    #[test]
    fn snooze_requires_future_timestamp() {
        let (mail, store) = service();
        let alice = store.create_agent("Alice", None, None).unwrap();
        let bob = store.create_agent("Bob", None, None).unwrap();
        let sent = mail
            .send(SendRequest {
                sender_id: alice.id,
                recipient_names: &[bob.name.clone()],
                thread_id: None,
                subject: "Hi",
                body: "",
                priority: Priority::Normal,
                deadline: None,
                attachments: None,
                idempotency_key: None,
            })
            .unwrap();

        let past = Utc::now() - chrono::Duration::seconds(5);
        let err = mail
            .update_state(sent.message_id, bob.id, RecipientState::Snoozed, Some(past), false)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument { .. }));
    }

    #[test]
    fn read_message_is_idempotent_and_preserves_starred() {
        let (mail, store) = service();
        let alice = store.create_agent("Alice", None, None).unwrap();
        let bob = store.create_agent("Bob", None, None).unwrap();
        let sent = mail
            .send(SendRequest {
                sender_id: alice.id,
                recipient_names: &[bob.name.clone()],
                thread_id: None,
                subject: "Hi",
                body: "",
                priority: Priority::Normal,
                deadline: None,
                attachments: None,
                idempotency_key: None,
            })
            .unwrap();

        mail.read_message(sent.message_id, bob.id).unwrap();
        mail.update_state(sent.message_id, bob.id, RecipientState::Starred, None, false).unwrap();
        mail.read_message(sent.message_id, bob.id).unwrap();

        let recipient = store.get_recipient(sent.message_id, bob.id).unwrap();
        assert_eq!(recipient.state, RecipientState::Starred);
    }

    #[test]
    fn search_scopes_by_recipient() {
        let (mail, store) = service();
        let alice = store.create_agent("Alice", None, None).unwrap();
        let bob = store.create_agent("Bob", None, None).unwrap();
        mail.send(SendRequest {
            sender_id: alice.id,
            recipient_names: &[bob.name.clone()],
            thread_id: None,
            subject: "Deployment plan",
            body: "roll out canary",
            priority: Priority::Normal,
            deadline: None,
            attachments: None,
            idempotency_key: None,
        })
        .unwrap();

        assert_eq!(mail.search("canary", bob.id, None, None).unwrap().len(), 1);
        assert_eq!(mail.search("canary", alice.id, None, None).unwrap().len(), 0);
    }
}
