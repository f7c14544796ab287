//! Property-based tests for the recipient state machine (§4.4).
//!
//! `set_recipient_state` is total — every state accepts every other state
//! as a target — so these generate arbitrary (from, to) pairs rather than
//! walking a transition table. The one non-identity rule, snooze-wake, is
//! checked directly against [`InboxEntry::effective_state`].

use super::*;
use chrono::Duration;
use proptest::prelude::*;

fn arb_state() -> impl Strategy<Value = RecipientState> {
    prop_oneof![
        Just(RecipientState::Unread),
        Just(RecipientState::Read),
        Just(RecipientState::Starred),
        Just(RecipientState::Snoozed),
        Just(RecipientState::Archived),
        Just(RecipientState::Trash),
    ]
}

proptest! {
    #[test]
    fn every_state_pair_is_a_legal_transition(from in arb_state(), to in arb_state()) {
        let store = Store::open_in_memory().unwrap();
        let alice = store.create_agent("Alice", None, None).unwrap();
        let bob = store.create_agent("Bob", None, None).unwrap();
        let bob_inbox = bob.inbox_topic_id.unwrap();
        let (message, _, _) = store
            .insert_message("t1", None, alice.id, "subj", "body", Priority::Normal, None, None, &[(bob.id, bob_inbox)], None)
            .unwrap();

        let snoozed_until = (to == RecipientState::Snoozed).then(|| Utc::now() + Duration::hours(1));
        store.set_recipient_state(message.id, bob.id, from, None).unwrap();
        store.set_recipient_state(message.id, bob.id, to, snoozed_until).unwrap();

        let recipient = store.get_recipient(message.id, bob.id).unwrap();
        prop_assert_eq!(recipient.state, to);
    }

    #[test]
    fn snooze_wake_resolves_to_unread_only_after_expiry(past in any::<bool>()) {
        let entry = InboxEntry {
            message: Message {
                id: 1,
                thread_id: "t1".to_string(),
                topic_id: None,
                sender_id: 1,
                subject: "s".to_string(),
                body: String::new(),
                priority: Priority::Normal,
                deadline: None,
                attachments: None,
                created_at: Utc::now(),
                sender_deleted: false,
            },
            state: RecipientState::Snoozed,
            snoozed_until: Some(if past {
                Utc::now() - Duration::hours(1)
            } else {
                Utc::now() + Duration::hours(1)
            }),
            read_at: None,
            acked_at: None,
        };

        if past {
            prop_assert_eq!(entry.effective_state(), RecipientState::Unread);
        } else {
            prop_assert_eq!(entry.effective_state(), RecipientState::Snoozed);
        }
    }
}
