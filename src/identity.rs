//! Identity Manager — resolves `(session, project, branch) -> agent`
//!
//! Every RPC that carries a session id goes through [`IdentityManager`]
//! first; it is the only component allowed to create an agent implicitly.

use crate::error::{CoreError, CoreResult};
use crate::names::generate_unique_name;
use crate::store::{Agent, SessionIdentity, Store};
use std::collections::HashMap;

#[derive(Clone)]
pub struct IdentityManager {
    store: Store,
}

/// How many times to retry agent-name generation on a unique-constraint
/// conflict before giving up (§5: "bounded by a small constant").
const NAME_GENERATION_ATTEMPTS: u32 = 5;

impl IdentityManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Normalize a project directory the way every lookup in this module
    /// expects it: absolute, no trailing slash. The identity resolution
    /// order (§4.2/§9) only holds if the same logical project always
    /// hashes to the same key.
    fn normalize_project_dir(project_dir: &str) -> String {
        project_dir.trim_end_matches('/').to_string()
    }

    pub fn ensure_identity(
        &self,
        session_id: &str,
        project_dir: Option<&str>,
        git_branch: Option<&str>,
    ) -> CoreResult<SessionIdentity> {
        let project_key = project_dir.map(Self::normalize_project_dir);

        if let Ok(existing) = self.store.get_identity(session_id) {
            self.store
                .touch_identity(session_id, git_branch)?;
            return self.store.get_identity(session_id);
        }

        let agent_id = self.resolve_agent_for_project(project_key.as_deref())?;
        self.store
            .insert_identity(session_id, agent_id, project_key.as_deref(), git_branch)
    }

    /// Project-default beats project-sharing beats creation, exactly the
    /// order in §4.2/§9.
    fn resolve_agent_for_project(&self, project_key: Option<&str>) -> CoreResult<i64> {
        if let Some(key) = project_key {
            if let Some(agent_id) = self.store.get_project_default(key)? {
                return Ok(agent_id);
            }
            if let Some(agent_id) = self.store.find_identity_by_project(key)? {
                return Ok(agent_id);
            }
        }

        let store = self.store.clone();
        let name = generate_unique_name(NAME_GENERATION_ATTEMPTS, |candidate| {
            store.get_agent_by_name(candidate).is_err()
        })?;
        let agent = self.store.create_agent(&name, project_key, None)?;
        Ok(agent.id)
    }

    pub fn restore_identity(&self, session_id: &str) -> CoreResult<SessionIdentity> {
        self.store.get_identity(session_id)
    }

    pub fn save_identity(
        &self,
        session_id: &str,
        consumer_offsets: &HashMap<String, i64>,
    ) -> CoreResult<()> {
        self.store.save_identity_offsets(session_id, consumer_offsets)
    }

    pub fn set_project_default(&self, project_dir: &str, agent_name: &str) -> CoreResult<()> {
        let agent = self.store.get_agent_by_name(agent_name)?;
        let project_key = Self::normalize_project_dir(project_dir);
        self.store.set_project_default(&project_key, agent.id)
    }

    pub fn get_agent(&self, id: i64) -> CoreResult<Agent> {
        self.store.get_agent(id)
    }

    pub fn list_agents(&self) -> CoreResult<Vec<Agent>> {
        self.store.list_agents()
    }

    pub fn delete_agent(&self, id: i64) -> CoreResult<()> {
        self.store.delete_agent(id)
    }

    pub fn register(&self, name: &str, project_dir: Option<&str>) -> CoreResult<Agent> {
        let project_key = project_dir.map(Self::normalize_project_dir);
        if self.store.get_agent_by_name(name).is_ok() {
            return Err(CoreError::conflict(format!("agent '{name}' already exists")));
        }
        self.store.create_agent(name, project_key.as_deref(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn manager() -> IdentityManager {
        IdentityManager::new(Store::open_in_memory().unwrap())
    }

    #[test]
    fn ensure_identity_creates_new_agent_for_new_session() {
        let mgr = manager();
        let identity = mgr.ensure_identity("sess-1", Some("/repo/a"), Some("main")).unwrap();
        assert_eq!(identity.session_id, "sess-1");
        let agent = mgr.get_agent(identity.agent_id).unwrap();
        assert_ne!(agent.name, "User");
    }

    #[test]
    fn ensure_identity_is_idempotent_for_same_session() {
        let mgr = manager();
        let first = mgr.ensure_identity("sess-1", Some("/repo/a"), Some("main")).unwrap();
        let second = mgr.ensure_identity("sess-1", Some("/repo/a"), Some("main")).unwrap();
        assert_eq!(first.agent_id, second.agent_id);
    }

    #[test]
    fn two_sessions_same_project_share_one_agent() {
        let mgr = manager();
        let first = mgr.ensure_identity("sess-1", Some("/repo/a"), None).unwrap();
        let second = mgr.ensure_identity("sess-2", Some("/repo/a"), None).unwrap();
        assert_eq!(first.agent_id, second.agent_id);
    }

    #[test]
    fn project_default_beats_project_sharing() {
        let mgr = manager();
        // sess-1 establishes an agent for /repo/a through sharing.
        let shared = mgr.ensure_identity("sess-1", Some("/repo/a"), None).unwrap();
        let shared_agent = mgr.get_agent(shared.agent_id).unwrap();

        // A different agent is registered and set as the project default.
        let explicit = mgr.register("ExplicitAgent", None).unwrap();
        mgr.set_project_default("/repo/a", &explicit.name).unwrap();

        let third = mgr.ensure_identity("sess-3", Some("/repo/a"), None).unwrap();
        assert_eq!(third.agent_id, explicit.id);
        assert_ne!(third.agent_id, shared_agent.id);
    }

    #[test]
    fn trailing_slash_normalizes_to_same_project_key() {
        let mgr = manager();
        let first = mgr.ensure_identity("sess-1", Some("/repo/a/"), None).unwrap();
        let second = mgr.ensure_identity("sess-2", Some("/repo/a"), None).unwrap();
        assert_eq!(first.agent_id, second.agent_id);
    }

    #[test]
    fn restore_identity_fails_for_unknown_session() {
        let mgr = manager();
        let err = mgr.restore_identity("nope").unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn save_identity_persists_consumer_offsets() {
        let mgr = manager();
        mgr.ensure_identity("sess-1", Some("/repo/a"), None).unwrap();
        let mut offsets = HashMap::new();
        offsets.insert("ops".to_string(), 5);
        mgr.save_identity("sess-1", &offsets).unwrap();
        let restored = mgr.restore_identity("sess-1").unwrap();
        assert_eq!(restored.consumer_offsets.get("ops"), Some(&5));
    }
}
