//! Heartbeat & Status — liveness tracking and status classification
//!
//! The session-presence map is process-local and intentionally not
//! durable (§4.3: "loss on restart is tolerated"); `last_active_at` lives
//! in the Store and is the only part of liveness that survives a restart.

use crate::error::CoreResult;
use crate::store::{Agent, Store};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
    Busy,
    Idle,
    Offline,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Active => "active",
            Status::Busy => "busy",
            Status::Idle => "idle",
            Status::Offline => "offline",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent: Agent,
    pub status: Status,
}

/// Boundary rule per §4.3: evaluated with "≥". Offline at 30 minutes,
/// idle at 5 minutes, busy below 5 minutes with a live session, else
/// active.
pub fn compute_status(elapsed: Duration, has_session: bool) -> Status {
    if elapsed >= Duration::minutes(30) {
        Status::Offline
    } else if elapsed >= Duration::minutes(5) {
        Status::Idle
    } else if has_session {
        Status::Busy
    } else {
        Status::Active
    }
}

#[derive(Clone)]
pub struct HeartbeatTracker {
    store: Store,
    sessions: std::sync::Arc<Mutex<HashMap<i64, String>>>,
}

impl HeartbeatTracker {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            sessions: std::sync::Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn record_heartbeat(&self, agent_id: i64, session_id: Option<&str>) -> CoreResult<()> {
        if let Some(session_id) = session_id {
            self.sessions
                .lock()
                .unwrap()
                .insert(agent_id, session_id.to_string());
        }
        self.store.record_heartbeat(agent_id, session_id)
    }

    pub fn start_session(&self, agent_id: i64, session_id: &str) {
        self.sessions
            .lock()
            .unwrap()
            .insert(agent_id, session_id.to_string());
    }

    pub fn end_session(&self, agent_id: i64) {
        self.sessions.lock().unwrap().remove(&agent_id);
    }

    pub fn has_session(&self, agent_id: i64) -> bool {
        self.sessions.lock().unwrap().contains_key(&agent_id)
    }

    fn status_for(&self, agent: &Agent, now: DateTime<Utc>) -> Status {
        let elapsed = now - agent.last_active_at;
        compute_status(elapsed, self.has_session(agent.id))
    }

    pub fn get_agent_status(&self, agent_id: i64) -> CoreResult<AgentStatus> {
        let agent = self.store.get_agent(agent_id)?;
        let status = self.status_for(&agent, Utc::now());
        Ok(AgentStatus { agent, status })
    }

    pub fn get_agents_status(&self) -> CoreResult<Vec<AgentStatus>> {
        let now = Utc::now();
        let agents = self.store.list_agents()?;
        Ok(agents
            .into_iter()
            .map(|agent| {
                let status = self.status_for(&agent, now);
                AgentStatus { agent, status }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_boundaries_match_the_rule_table() {
        assert_eq!(compute_status(Duration::minutes(30), false), Status::Offline);
        assert_eq!(compute_status(Duration::minutes(29), false), Status::Idle);
        assert_eq!(compute_status(Duration::minutes(5), true), Status::Idle);
        assert_eq!(compute_status(Duration::minutes(4), true), Status::Busy);
        assert_eq!(compute_status(Duration::minutes(4), false), Status::Active);
        assert_eq!(compute_status(Duration::seconds(0), false), Status::Active);
    }

    #[test]
    fn session_presence_survives_heartbeat_without_session_arg() {
        let store = Store::open_in_memory().unwrap();
        let agent = store.create_agent("Tester", None, None).unwrap();
        let tracker = HeartbeatTracker::new(store);

        tracker.start_session(agent.id, "sess-1");
        assert!(tracker.has_session(agent.id));

        tracker.record_heartbeat(agent.id, None).unwrap();
        assert!(tracker.has_session(agent.id));

        tracker.end_session(agent.id);
        assert!(!tracker.has_session(agent.id));
    }

    #[test]
    fn get_agents_status_reflects_session_and_elapsed() {
        let store = Store::open_in_memory().unwrap();
        let agent = store.create_agent("Tester", None, None).unwrap();
        let tracker = HeartbeatTracker::new(store);
        tracker.record_heartbeat(agent.id, Some("sess-1")).unwrap();

        let statuses = tracker.get_agents_status().unwrap();
        let tester = statuses.iter().find(|s| s.agent.id == agent.id).unwrap();
        assert_eq!(tester.status, Status::Busy);
    }
}
