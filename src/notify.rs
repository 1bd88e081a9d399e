//! Outbound notification events
//!
//! Rendering and delivery live outside this engine. We emit structured
//! events onto the queue, fire-and-forget: an emit failure is logged and
//! swallowed so it can never fail the operation that triggered it.

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::queue::{JobQueue, QueueName};
use crate::store::{PayoutStatus, PayoutTransition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    WinnerSelected,
    BountyCancelled,
    PayoutCompleted,
    PayoutFailed,
    PayoutCancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: NotificationKind,
    pub candidate_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounty_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout_id: Option<Uuid>,
}

/// Notification for a payout transition, if it deserves one. Only terminal
/// transitions notify; the store already dedupes transitions, so redelivered
/// webhooks can never produce a second event here.
pub fn payout_event(transition: &PayoutTransition) -> Option<NotificationEvent> {
    let kind = match transition.status {
        PayoutStatus::Completed => NotificationKind::PayoutCompleted,
        PayoutStatus::Failed => NotificationKind::PayoutFailed,
        PayoutStatus::Cancelled => NotificationKind::PayoutCancelled,
        PayoutStatus::Pending | PayoutStatus::Processing => return None,
    };

    Some(NotificationEvent {
        kind,
        candidate_id: transition.candidate_id,
        bounty_id: None,
        payout_id: Some(transition.payout_id),
    })
}

/// Enqueue a notification event. Never propagates failure.
pub async fn emit(queue: &JobQueue, event: NotificationEvent) {
    let payload = match serde_json::to_value(&event) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Failed to serialize notification event: {}", e);
            return;
        }
    };

    if let Err(e) = queue.enqueue(QueueName::SendNotification, payload).await {
        warn!("Failed to enqueue {:?} notification: {}", event.kind, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(status: PayoutStatus) -> PayoutTransition {
        PayoutTransition {
            payout_id: Uuid::nil(),
            candidate_id: Uuid::nil(),
            status,
        }
    }

    #[test]
    fn test_only_terminal_transitions_notify() {
        assert!(payout_event(&transition(PayoutStatus::Pending)).is_none());
        assert!(payout_event(&transition(PayoutStatus::Processing)).is_none());

        assert_eq!(
            payout_event(&transition(PayoutStatus::Completed)).unwrap().kind,
            NotificationKind::PayoutCompleted
        );
        assert_eq!(
            payout_event(&transition(PayoutStatus::Failed)).unwrap().kind,
            NotificationKind::PayoutFailed
        );
        assert_eq!(
            payout_event(&transition(PayoutStatus::Cancelled)).unwrap().kind,
            NotificationKind::PayoutCancelled
        );
    }
}
