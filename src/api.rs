//! RPC Facade — HTTP+JSON surface over the mail engine components
//!
//! Every handler is a thin translation layer: parse/validate the request,
//! call exactly one core-component method, map the `Result` into a
//! response. Mirrors the teacher's `AppState`/`create_router` shape.

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;

use crate::heartbeat::HeartbeatTracker;
use crate::hub::NotificationHub;
use crate::identity::IdentityManager;
use crate::mail::MailService;
use crate::review::ReviewService;
use crate::store::Store;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub identity: IdentityManager,
    pub heartbeat: HeartbeatTracker,
    pub mail: MailService,
    pub hub: NotificationHub,
    pub reviews: ReviewService,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        let hub = NotificationHub::new();
        let mail = MailService::new(store.clone(), hub.clone());
        let reviews = ReviewService::new(store.clone(), mail.clone());
        Self {
            identity: IdentityManager::new(store.clone()),
            heartbeat: HeartbeatTracker::new(store.clone()),
            mail,
            hub,
            reviews,
            store,
        }
    }
}
