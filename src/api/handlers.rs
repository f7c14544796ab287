//! RPC Facade handlers
//!
//! One function per §6 envelope. Validation helpers centralize the
//! required-field/bounds checks so every handler produces the same
//! `InvalidArgument{field, constraint}` shape (§17).

use super::sse::inbox_sse_stream;
use super::types::*;
use super::AppState;
use crate::error::{CoreError, CoreResult};
use crate::mail::SendRequest;
use crate::store::Priority;

use axum::{
    extract::{Path, Query, State},
    routing::{delete, get, post},
    Json, Router,
};
use std::collections::HashMap;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Mail
        .route("/v1/mail/send", post(send_mail))
        .route("/v1/mail/:id/read", post(read_message))
        .route("/v1/mail/:id/state", post(update_state))
        .route("/v1/mail/:id/ack", post(ack_message))
        .route("/v1/mail/:id", delete(delete_message))
        .route("/v1/mail/thread/:thread_id", get(read_thread))
        .route("/v1/mail/thread/:thread_id/reply", post(reply_to_thread))
        .route("/v1/mail/thread/:thread_id/archive", post(archive_thread))
        .route("/v1/mail/thread/:thread_id/delete", post(delete_thread))
        .route("/v1/mail/thread/:thread_id/mark-unread", post(mark_thread_unread))
        .route("/v1/search", get(search))
        .route("/v1/topics", get(list_topics))
        .route("/v1/topics/:topic/publish", post(publish))
        .route("/v1/topics/:topic/subscribe", post(subscribe))
        .route("/v1/topics/:topic/subscribe", delete(unsubscribe))
        // Agent-scoped mail views
        .route("/v1/agents/:agent_id/inbox", get(fetch_inbox))
        .route("/v1/agents/:agent_id/inbox/poll", get(poll_changes))
        .route("/v1/agents/:agent_id/inbox/stream", get(subscribe_inbox))
        .route(
            "/v1/agents/:agent_id/unacked/:sender_id",
            get(has_unacked_status_to),
        )
        // Agent
        .route("/v1/agents", get(list_agents).post(register_agent))
        .route("/v1/agents/status", get(get_agents_status))
        .route("/v1/agents/:id", get(get_agent).delete(delete_agent))
        .route("/v1/agents/:id/heartbeat", post(heartbeat))
        .route("/v1/agents/:id/status", get(get_agent_status))
        .route("/v1/identity/ensure", post(ensure_identity))
        .route("/v1/identity/:session_id", get(restore_identity))
        .route("/v1/identity/:session_id/save", post(save_identity))
        .route("/v1/identity/project-default", post(set_project_default))
        // Session
        .route("/v1/sessions", get(list_sessions))
        .route("/v1/sessions/:session_id", get(get_session))
        .route("/v1/sessions/start", post(start_session))
        .route("/v1/sessions/complete", post(complete_session))
        // Review / PlanReview
        .route("/v1/reviews", get(list_reviews).post(create_review))
        .route("/v1/reviews/:id", get(get_review).delete(delete_review))
        .route("/v1/reviews/:id/state", post(update_review_state))
        .route("/v1/reviews/:id/resubmit", post(resubmit_review))
        .route("/v1/reviews/:id/cancel", post(cancel_review))
        .route(
            "/v1/reviews/:id/issues",
            get(list_issues).post(add_issue),
        )
        .route("/v1/reviews/issues/:issue_id/status", post(update_issue_status))
        .with_state(state)
}

fn require_priority(priority: Option<Priority>) -> Priority {
    priority.unwrap_or_default()
}

// ==================== Mail ====================

async fn send_mail(
    State(state): State<AppState>,
    Json(req): Json<SendMailRequest>,
) -> CoreResult<Json<SendMailResponse>> {
    let result = state.mail.send(SendRequest {
        sender_id: req.sender_id,
        recipient_names: &req.recipient_names,
        thread_id: req.thread_id,
        subject: &req.subject,
        body: &req.body,
        priority: require_priority(req.priority),
        deadline: req.deadline,
        attachments: req.attachments.as_deref(),
        idempotency_key: None,
    })?;
    Ok(Json(SendMailResponse {
        message_id: result.message_id,
        thread_id: result.thread_id,
    }))
}

async fn publish(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Json(req): Json<PublishRequest>,
) -> CoreResult<Json<PublishResponse>> {
    let (message_id, recipients_count) = state.mail.publish(
        req.sender_id,
        &topic,
        &req.subject,
        &req.body,
        require_priority(req.priority),
        None,
    )?;
    Ok(Json(PublishResponse {
        message_id,
        recipients_count,
    }))
}

async fn fetch_inbox(
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
    Query(q): Query<FetchInboxQuery>,
) -> CoreResult<Json<FetchInboxResponse>> {
    let messages = state.mail.fetch_inbox(
        agent_id,
        q.limit,
        q.unread_only,
        q.state,
        q.sent_only,
        q.sender_prefix.as_deref(),
    )?;
    Ok(Json(FetchInboxResponse { messages }))
}

async fn read_message(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<AgentIdQuery>,
) -> CoreResult<Json<MessageResponse>> {
    let message = state.mail.read_message(id, req.agent_id)?;
    Ok(Json(MessageResponse { message }))
}

async fn read_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> CoreResult<Json<ThreadResponse>> {
    let messages = state.mail.read_thread(&thread_id)?;
    Ok(Json(ThreadResponse { messages }))
}

async fn update_state(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateStateRequest>,
) -> CoreResult<Json<SuccessResponse>> {
    state.mail.update_state(
        id,
        req.agent_id,
        req.state,
        req.snoozed_until,
        req.sender_deletion,
    )?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn ack_message(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<AgentIdQuery>,
) -> CoreResult<Json<SuccessResponse>> {
    state.mail.ack(id, req.agent_id)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn delete_message(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<DeleteMessageQuery>,
) -> CoreResult<Json<SuccessResponse>> {
    state
        .mail
        .delete_message(id, q.agent_id, q.sender_deletion)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn reply_to_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(req): Json<ReplyRequest>,
) -> CoreResult<Json<SendMailResponse>> {
    let result = state.mail.reply_to_thread(
        req.sender_id,
        &thread_id,
        &req.recipient_names,
        &req.subject,
        &req.body,
        require_priority(req.priority),
    )?;
    Ok(Json(SendMailResponse {
        message_id: result.message_id,
        thread_id: result.thread_id,
    }))
}

async fn archive_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(req): Json<ThreadAgentRequest>,
) -> CoreResult<Json<SuccessResponse>> {
    state.mail.archive_thread(&thread_id, req.agent_id)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(req): Json<ThreadAgentRequest>,
) -> CoreResult<Json<SuccessResponse>> {
    state.mail.delete_thread(&thread_id, req.agent_id)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn mark_thread_unread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(req): Json<ThreadAgentRequest>,
) -> CoreResult<Json<SuccessResponse>> {
    state.mail.mark_thread_unread(&thread_id, req.agent_id)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn search(
    State(state): State<AppState>,
    Query(q): Query<SearchQuery>,
) -> CoreResult<Json<SearchResponse>> {
    if q.query.trim().is_empty() {
        return Err(CoreError::invalid("query", "must be non-empty"));
    }
    let messages = state.mail.search(&q.query, q.agent_id, q.topic_id, q.limit)?;
    Ok(Json(SearchResponse { messages }))
}

async fn list_topics(State(state): State<AppState>) -> CoreResult<Json<TopicsResponse>> {
    Ok(Json(TopicsResponse {
        topics: state.mail.list_topics()?,
    }))
}

async fn subscribe(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Json(req): Json<AgentIdQuery>,
) -> CoreResult<Json<SuccessResponse>> {
    state.mail.subscribe(req.agent_id, &topic)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn unsubscribe(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Query(q): Query<AgentIdQuery>,
) -> CoreResult<Json<SuccessResponse>> {
    state.mail.unsubscribe(q.agent_id, &topic)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn has_unacked_status_to(
    State(state): State<AppState>,
    Path((agent_id, sender_id)): Path<(i64, i64)>,
) -> CoreResult<Json<HasUnackedResponse>> {
    let has_unacked = state.mail.has_unacked_status_to(agent_id, sender_id)?;
    Ok(Json(HasUnackedResponse { has_unacked }))
}

/// Long-poll: re-checks every 500ms for newly-exceeded offsets, bounded by
/// the caller's `wait_ms` (default 0 = return immediately), per §10. The
/// 5-second cancellation-check granularity in §5 bounds the outer loop for
/// waits longer than a few seconds; this tick is an internal implementation
/// detail, not a wire contract.
async fn poll_changes(
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
    Query(q): Query<PollQuery>,
) -> CoreResult<Json<PollResponse>> {
    let since_offsets: HashMap<i64, i64> = match &q.since {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|_| CoreError::invalid("since", "must be a JSON object of topicId -> offset"))?,
        None => HashMap::new(),
    };

    let wait_ms = q.wait_ms.unwrap_or(0).min(30_000);
    let tick = tokio::time::Duration::from_millis(500);
    let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_millis(wait_ms);

    loop {
        let (messages, offsets) = state.mail.poll_changes(agent_id, &since_offsets)?;
        if !messages.is_empty() || tokio::time::Instant::now() >= deadline {
            return Ok(Json(PollResponse { messages, offsets }));
        }
        tokio::time::sleep(tick.min(deadline.saturating_duration_since(tokio::time::Instant::now()))).await;
    }
}

async fn subscribe_inbox(
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
) -> impl axum::response::IntoResponse {
    let subscriber_id = uuid::Uuid::new_v4().to_string();
    let subscription = state.hub.subscribe(agent_id, &subscriber_id, 64);
    inbox_sse_stream(subscription)
}

// ==================== Agent ====================

async fn register_agent(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> CoreResult<Json<AgentResponse>> {
    if req.name.trim().is_empty() {
        return Err(CoreError::invalid("name", "must be non-empty"));
    }
    let agent = state.identity.register(&req.name, req.project_dir.as_deref())?;
    Ok(Json(AgentResponse { agent }))
}

async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> CoreResult<Json<AgentResponse>> {
    Ok(Json(AgentResponse {
        agent: state.identity.get_agent(id)?,
    }))
}

async fn list_agents(State(state): State<AppState>) -> CoreResult<Json<AgentsResponse>> {
    Ok(Json(AgentsResponse {
        agents: state.identity.list_agents()?,
    }))
}

async fn delete_agent(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> CoreResult<Json<SuccessResponse>> {
    state.identity.delete_agent(id)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn ensure_identity(
    State(state): State<AppState>,
    Json(req): Json<EnsureIdentityRequest>,
) -> CoreResult<Json<IdentityResponse>> {
    if req.session_id.trim().is_empty() {
        return Err(CoreError::invalid("sessionId", "must be non-empty"));
    }
    let identity = state.identity.ensure_identity(
        &req.session_id,
        req.project_dir.as_deref(),
        req.git_branch.as_deref(),
    )?;
    Ok(Json(IdentityResponse { identity }))
}

async fn restore_identity(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> CoreResult<Json<IdentityResponse>> {
    Ok(Json(IdentityResponse {
        identity: state.identity.restore_identity(&session_id)?,
    }))
}

async fn save_identity(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<SaveIdentityRequest>,
) -> CoreResult<Json<SuccessResponse>> {
    state.identity.save_identity(&session_id, &req.consumer_offsets)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn set_project_default(
    State(state): State<AppState>,
    Json(req): Json<SetProjectDefaultRequest>,
) -> CoreResult<Json<SuccessResponse>> {
    state.identity.set_project_default(&req.project_dir, &req.agent_name)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<HeartbeatRequest>,
) -> CoreResult<Json<SuccessResponse>> {
    state.heartbeat.record_heartbeat(id, req.session_id.as_deref())?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn get_agent_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> CoreResult<Json<AgentStatusResponse>> {
    Ok(Json(AgentStatusResponse {
        status: state.heartbeat.get_agent_status(id)?,
    }))
}

async fn get_agents_status(State(state): State<AppState>) -> CoreResult<Json<AgentsStatusResponse>> {
    Ok(Json(AgentsStatusResponse {
        statuses: state.heartbeat.get_agents_status()?,
    }))
}

// ==================== Session ====================

async fn list_sessions(State(state): State<AppState>) -> CoreResult<Json<IdentitiesResponse>> {
    Ok(Json(IdentitiesResponse {
        identities: state.store.list_identities()?,
    }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> CoreResult<Json<IdentityResponse>> {
    Ok(Json(IdentityResponse {
        identity: state.store.get_identity(&session_id)?,
    }))
}

async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartSessionRequest>,
) -> CoreResult<Json<SuccessResponse>> {
    state.heartbeat.start_session(req.agent_id, &req.session_id);
    Ok(Json(SuccessResponse { success: true }))
}

async fn complete_session(
    State(state): State<AppState>,
    Json(req): Json<CompleteSessionRequest>,
) -> CoreResult<Json<SuccessResponse>> {
    state.heartbeat.end_session(req.agent_id);
    Ok(Json(SuccessResponse { success: true }))
}

// ==================== Review / PlanReview ====================

async fn create_review(
    State(state): State<AppState>,
    Json(req): Json<CreateReviewRequest>,
) -> CoreResult<Json<ReviewResponse>> {
    let review = state.reviews.create(
        req.kind,
        &req.title,
        &req.summary,
        req.requester_id,
        req.reviewer_name.as_deref(),
    )?;
    Ok(Json(ReviewResponse { review }))
}

async fn get_review(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> CoreResult<Json<ReviewResponse>> {
    Ok(Json(ReviewResponse {
        review: state.reviews.get(id)?,
    }))
}

async fn list_reviews(
    State(state): State<AppState>,
    Query(q): Query<ListReviewsQuery>,
) -> CoreResult<Json<ReviewsResponse>> {
    Ok(Json(ReviewsResponse {
        reviews: state.reviews.list(q.reviewer_id)?,
    }))
}

async fn update_review_state(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateReviewStateRequest>,
) -> CoreResult<Json<SuccessResponse>> {
    state.reviews.update_state(id, req.state)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn resubmit_review(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ResubmitRequest>,
) -> CoreResult<Json<ReviewResponse>> {
    let review = state.reviews.resubmit(id, req.note.as_deref())?;
    Ok(Json(ReviewResponse { review }))
}

async fn cancel_review(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> CoreResult<Json<SuccessResponse>> {
    state.reviews.cancel(id)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn delete_review(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> CoreResult<Json<SuccessResponse>> {
    state.reviews.delete(id)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn list_issues(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> CoreResult<Json<IssuesResponse>> {
    Ok(Json(IssuesResponse {
        issues: state.reviews.list_issues(id)?,
    }))
}

async fn add_issue(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<AddIssueRequest>,
) -> CoreResult<Json<IssueResponse>> {
    let issue = state.reviews.add_issue(id, req.severity, &req.description)?;
    Ok(Json(IssueResponse { issue }))
}

async fn update_issue_status(
    State(state): State<AppState>,
    Path(issue_id): Path<i64>,
    Json(req): Json<UpdateIssueStatusRequest>,
) -> CoreResult<Json<SuccessResponse>> {
    state.reviews.update_issue_status(issue_id, req.status)?;
    Ok(Json(SuccessResponse { success: true }))
}
