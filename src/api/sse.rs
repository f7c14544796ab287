//! Server-Sent Events support for `SubscribeInbox` (§10)
//!
//! One SSE `event: message` per delivered [`InboxEntry`], plus axum's
//! built-in keep-alive comment ping. Cleanup on disconnect is handled by
//! [`crate::hub::Subscription`]'s `Drop` impl, not by this module — once
//! the stream this function returns is dropped, the subscription drops
//! with it and the hub forgets the subscriber.

use crate::hub::Subscription;
use crate::store::InboxEntry;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;

pub fn inbox_sse_stream(subscription: Subscription) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = stream::unfold(subscription, |sub| async move {
        let entry = sub.recv().await;
        Some((Ok(entry_to_event(&entry)), sub))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn entry_to_event(entry: &InboxEntry) -> Event {
    let data = json!({
        "message": entry.message,
        "state": entry.state,
        "snoozed_until": entry.snoozed_until,
        "read_at": entry.read_at,
        "acked_at": entry.acked_at,
    });
    Event::default().event("message").data(data.to_string())
}
