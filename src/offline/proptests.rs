//! Property-based tests for idempotency-key hashing.
//!
//! These cover the collision-avoidance invariant in §4.6/§8: distinct
//! inputs must not hash to the same key, and length-prefixing must keep
//! fields from being confused with each other across a delimiter.

use super::*;
use proptest::prelude::*;

proptest! {
    #[test]
    fn distinct_senders_never_collide(
        sender in "[A-Za-z]{1,8}",
        recipient in "[A-Za-z]{1,8}",
        subject in "[A-Za-z0-9 ]{0,16}",
    ) {
        let a = SendPayload {
            sender_name: sender.clone(),
            recipient_names: vec![recipient.clone()],
            subject: subject.clone(),
            body: "body".to_string(),
            priority: Priority::Normal,
        };
        let b = SendPayload {
            sender_name: format!("{sender}-other"),
            recipient_names: vec![recipient],
            subject,
            body: "body".to_string(),
            priority: Priority::Normal,
        };
        prop_assert_ne!(idempotency_key_for_send(&a), idempotency_key_for_send(&b));
    }

    #[test]
    fn reordering_recipients_does_not_change_the_key(
        sender in "[A-Za-z]{1,8}",
        r1 in "[A-Za-z]{1,8}",
        r2 in "[A-Za-z]{1,8}",
    ) {
        prop_assume!(r1 != r2);
        let forward = SendPayload {
            sender_name: sender.clone(),
            recipient_names: vec![r1.clone(), r2.clone()],
            subject: "hi".to_string(),
            body: "body".to_string(),
            priority: Priority::Normal,
        };
        let reversed = SendPayload {
            sender_name: sender,
            recipient_names: vec![r2, r1],
            subject: "hi".to_string(),
            body: "body".to_string(),
            priority: Priority::Normal,
        };
        prop_assert_eq!(idempotency_key_for_send(&forward), idempotency_key_for_send(&reversed));
    }

    #[test]
    fn diff_key_never_collides_across_a_field_boundary_shift(
        a in "[A-Za-z]{1,6}",
        b in "[A-Za-z]{1,6}",
        c in "[A-Za-z]{0,6}",
    ) {
        // Without length-prefixing, sender="a:b" recipient="c" would hash
        // identically to sender="a" recipient="b:c" once concatenated.
        let shifted_left = idempotency_key_for_diff(&format!("{a}:{b}"), &c, "patch");
        let shifted_right = idempotency_key_for_diff(&a, &format!("{b}:{c}"), "patch");
        prop_assert_ne!(shifted_left, shifted_right);
    }
}
