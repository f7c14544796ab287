//! RPC Facade request/response DTOs
//!
//! Plain serde structs, one per §6 envelope. Handlers parse one of these,
//! validate it, and call exactly one core-component method — mirroring the
//! teacher's `types.rs` (request/response structs, no logic).

use crate::heartbeat::AgentStatus;
use crate::store::{
    Agent, InboxEntry, IssueSeverity, IssueStatus, Message, Priority, RecipientState, Review,
    ReviewIssue, ReviewKind, ReviewState, SessionIdentity, Topic,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ==================== Mail ====================

#[derive(Debug, Deserialize)]
pub struct SendMailRequest {
    pub sender_id: i64,
    #[serde(default)]
    pub recipient_names: Vec<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachments: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SendMailResponse {
    pub message_id: i64,
    pub thread_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub sender_id: i64,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub priority: Option<Priority>,
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub message_id: i64,
    pub recipients_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct FetchInboxQuery {
    pub limit: Option<i64>,
    #[serde(default)]
    pub unread_only: bool,
    pub state: Option<RecipientState>,
    #[serde(default)]
    pub sent_only: bool,
    pub sender_prefix: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FetchInboxResponse {
    pub messages: Vec<InboxEntry>,
}

#[derive(Debug, Deserialize)]
pub struct AgentIdQuery {
    pub agent_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct DeleteMessageQuery {
    pub agent_id: i64,
    /// §4.4: on the aggregate view, disambiguates toward the recipient row
    /// belonging to the message's own sender, and flags the message as
    /// hidden from the sender's Sent view.
    #[serde(default)]
    pub sender_deletion: bool,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: Message,
}

#[derive(Debug, Serialize)]
pub struct ThreadResponse {
    pub messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStateRequest {
    pub agent_id: i64,
    pub state: RecipientState,
    #[serde(default)]
    pub snoozed_until: Option<DateTime<Utc>>,
    /// §4.4: see [`DeleteMessageQuery::sender_deletion`].
    #[serde(default)]
    pub sender_deletion: bool,
}

#[derive(Debug, Deserialize)]
pub struct ThreadAgentRequest {
    pub agent_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ReplyRequest {
    pub sender_id: i64,
    pub recipient_names: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub priority: Option<Priority>,
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub agent_id: i64,
    /// How long to wait for new data before returning an empty batch,
    /// capped at an internal maximum. Default 0 (return immediately).
    pub wait_ms: Option<u64>,
    /// JSON-encoded `{topicId: lastOffset}` map — GET requests have no
    /// body, so the offsets map travels as a query-string-encoded JSON
    /// value instead (§10).
    pub since: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub messages: Vec<InboxEntry>,
    pub offsets: HashMap<i64, i64>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub agent_id: i64,
    pub topic_id: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
pub struct TopicsResponse {
    pub topics: Vec<Topic>,
}

#[derive(Debug, Serialize)]
pub struct HasUnackedResponse {
    pub has_unacked: bool,
}

// ==================== Agent ====================

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    #[serde(default)]
    pub project_dir: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AgentResponse {
    pub agent: Agent,
}

#[derive(Debug, Serialize)]
pub struct AgentsResponse {
    pub agents: Vec<Agent>,
}

#[derive(Debug, Deserialize)]
pub struct EnsureIdentityRequest {
    pub session_id: String,
    #[serde(default)]
    pub project_dir: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IdentityResponse {
    pub identity: SessionIdentity,
}

#[derive(Debug, Serialize)]
pub struct IdentitiesResponse {
    pub identities: Vec<SessionIdentity>,
}

#[derive(Debug, Deserialize)]
pub struct SaveIdentityRequest {
    #[serde(default)]
    pub consumer_offsets: HashMap<String, i64>,
}

#[derive(Debug, Deserialize)]
pub struct SetProjectDefaultRequest {
    pub project_dir: String,
    pub agent_name: String,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AgentStatusResponse {
    #[serde(flatten)]
    pub status: AgentStatus,
}

#[derive(Debug, Serialize)]
pub struct AgentsStatusResponse {
    pub statuses: Vec<AgentStatus>,
}

// ==================== Session ====================

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub agent_id: i64,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CompleteSessionRequest {
    pub agent_id: i64,
}

// ==================== Review ====================

#[derive(Debug, Deserialize)]
pub struct CreateReviewRequest {
    pub kind: ReviewKind,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    pub requester_id: i64,
    #[serde(default)]
    pub reviewer_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReviewResponse {
    pub review: Review,
}

#[derive(Debug, Serialize)]
pub struct ReviewsResponse {
    pub reviews: Vec<Review>,
}

#[derive(Debug, Deserialize)]
pub struct ListReviewsQuery {
    pub reviewer_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateReviewStateRequest {
    pub state: ReviewState,
}

#[derive(Debug, Deserialize)]
pub struct ResubmitRequest {
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddIssueRequest {
    pub severity: IssueSeverity,
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct IssueResponse {
    pub issue: ReviewIssue,
}

#[derive(Debug, Serialize)]
pub struct IssuesResponse {
    pub issues: Vec<ReviewIssue>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateIssueStatusRequest {
    pub status: IssueStatus,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}
