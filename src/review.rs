//! Plan/Review adjuncts — plan-review and code-review aggregates
//!
//! Layered directly on top of the Mail Service rather than building a
//! second notification path: creating a review sends the request as an
//! ordinary mail message to the reviewer, so review-state-change
//! awareness flows through the one Notification Hub (§18).

use crate::error::{CoreError, CoreResult};
use crate::mail::{MailService, SendRequest};
use crate::store::{
    IssueSeverity, IssueStatus, Priority, Review, ReviewIssue, ReviewKind, ReviewState, Store,
};

#[derive(Clone)]
pub struct ReviewService {
    store: Store,
    mail: MailService,
}

/// Signal words scanned in an incoming review-request body to suggest a
/// state transition the reviewer still confirms explicitly — a pure
/// string match, not a model call (AI summarization is a separate,
/// out-of-scope, best-effort collaborator).
pub fn detect_suggested_state(body: &str) -> Option<ReviewState> {
    let lower = body.to_lowercase();
    if lower.contains("lgtm") || lower.contains("approved") {
        Some(ReviewState::Approved)
    } else if lower.contains("blocking") {
        Some(ReviewState::ChangesRequested)
    } else if lower.contains("changes requested") {
        Some(ReviewState::ChangesRequested)
    } else {
        None
    }
}

impl ReviewService {
    pub fn new(store: Store, mail: MailService) -> Self {
        Self { store, mail }
    }

    pub fn create(
        &self,
        kind: ReviewKind,
        title: &str,
        summary: &str,
        requester_id: i64,
        reviewer_name: Option<&str>,
    ) -> CoreResult<Review> {
        if title.trim().is_empty() {
            return Err(CoreError::invalid("title", "must be non-empty"));
        }

        let reviewer_id = match reviewer_name {
            Some(name) => Some(self.store.get_agent_by_name(name)?.id),
            None => None,
        };

        let kind_label = match kind {
            ReviewKind::Plan => "Plan review",
            ReviewKind::Code => "Code review",
        };
        let thread_id = if let Some(name) = reviewer_name {
            let sent = self.mail.send(SendRequest {
                sender_id: requester_id,
                recipient_names: std::slice::from_ref(&name.to_string()),
                thread_id: None,
                subject: &format!("{kind_label} requested: {title}"),
                body: summary,
                priority: Priority::Normal,
                deadline: None,
                attachments: None,
                idempotency_key: None,
            })?;
            sent.thread_id
        } else {
            uuid::Uuid::new_v4().simple().to_string()
        };

        self.store.create_review(kind, title, summary, reviewer_id, requester_id, &thread_id)
    }

    pub fn get(&self, id: i64) -> CoreResult<Review> {
        self.store.get_review(id)
    }

    pub fn list(&self, reviewer_id: Option<i64>) -> CoreResult<Vec<Review>> {
        self.store.list_reviews(reviewer_id)
    }

    /// Legal targets from any state per §18: approved, rejected,
    /// changes_requested, cancelled; `pending` is the only state that
    /// re-entry (`Resubmit`) restores, so it's not a direct target here.
    pub fn update_state(&self, id: i64, new_state: ReviewState) -> CoreResult<()> {
        let review = self.store.get_review(id)?;
        if review.state == ReviewState::Cancelled {
            return Err(CoreError::conflict("cancelled reviews cannot change state"));
        }
        self.store.update_review_state(id, new_state)
    }

    pub fn resubmit(&self, id: i64, note: Option<&str>) -> CoreResult<Review> {
        let review = self.store.get_review(id)?;
        if review.state != ReviewState::ChangesRequested {
            return Err(CoreError::conflict(format!(
                "cannot resubmit a review in state '{}'; expected changes_requested",
                review.state
            )));
        }
        self.store.resubmit_review(id, note)
    }

    pub fn cancel(&self, id: i64) -> CoreResult<()> {
        self.store.update_review_state(id, ReviewState::Cancelled)
    }

    pub fn delete(&self, id: i64) -> CoreResult<()> {
        self.store.delete_review(id)
    }

    pub fn add_issue(&self, review_id: i64, severity: IssueSeverity, description: &str) -> CoreResult<ReviewIssue> {
        if description.trim().is_empty() {
            return Err(CoreError::invalid("description", "must be non-empty"));
        }
        self.store.add_issue(review_id, severity, description)
    }

    pub fn list_issues(&self, review_id: i64) -> CoreResult<Vec<ReviewIssue>> {
        self.store.list_issues(review_id)
    }

    pub fn update_issue_status(&self, id: i64, status: IssueStatus) -> CoreResult<()> {
        self.store.update_issue_status(id, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::NotificationHub;

    fn service() -> (ReviewService, Store) {
        let store = Store::open_in_memory().unwrap();
        let mail = MailService::new(store.clone(), NotificationHub::new());
        (ReviewService::new(store.clone(), mail), store)
    }

    #[test]
    fn create_review_sends_mail_to_reviewer() {
        let (reviews, store) = service();
        let requester = store.create_agent("Requester", None, None).unwrap();
        let reviewer = store.create_agent("Reviewer", None, None).unwrap();

        let review = reviews
            .create(ReviewKind::Code, "Add caching", "please review", requester.id, Some(&reviewer.name))
            .unwrap();

        assert_eq!(review.state, ReviewState::Pending);
        let thread = reviews.mail.read_thread(&review.thread_id).unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].subject, "Code review requested: Add caching");
    }

    #[test]
    fn resubmit_requires_changes_requested_state() {
        let (reviews, store) = service();
        let requester = store.create_agent("Requester", None, None).unwrap();
        let review = reviews
            .create(ReviewKind::Plan, "Rollout plan", "", requester.id, None)
            .unwrap();

        let err = reviews.resubmit(review.id, None).unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        reviews.update_state(review.id, ReviewState::ChangesRequested).unwrap();
        let resubmitted = reviews.resubmit(review.id, Some("addressed feedback")).unwrap();
        assert_eq!(resubmitted.state, ReviewState::Pending);
        assert_eq!(resubmitted.iteration, 2);
    }

    #[test]
    fn cancelled_review_is_terminal() {
        let (reviews, store) = service();
        let requester = store.create_agent("Requester", None, None).unwrap();
        let review = reviews.create(ReviewKind::Plan, "Rollout plan", "", requester.id, None).unwrap();
        reviews.cancel(review.id).unwrap();

        let err = reviews.update_state(review.id, ReviewState::Approved).unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[test]
    fn keyword_detection_suggests_state_without_mutating() {
        assert_eq!(detect_suggested_state("LGTM, ship it"), Some(ReviewState::Approved));
        assert_eq!(detect_suggested_state("this is blocking release"), Some(ReviewState::ChangesRequested));
        assert_eq!(detect_suggested_state("looks fine so far"), None);
    }

    #[test]
    fn issues_carry_severity_and_status() {
        let (reviews, store) = service();
        let requester = store.create_agent("Requester", None, None).unwrap();
        let review = reviews.create(ReviewKind::Code, "Add caching", "", requester.id, None).unwrap();

        let issue = reviews.add_issue(review.id, IssueSeverity::Blocking, "missing null check").unwrap();
        assert_eq!(issue.status, IssueStatus::Open);

        reviews.update_issue_status(issue.id, IssueStatus::Resolved).unwrap();
        let issues = reviews.list_issues(review.id).unwrap();
        assert_eq!(issues[0].status, IssueStatus::Resolved);
    }
}
