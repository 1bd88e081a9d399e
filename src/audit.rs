//! Audit trail
//!
//! Structured entries for money-moving operations, written to the log sink.

use serde_json::Value;
use tracing::info;

#[derive(Debug, Clone, Copy)]
pub enum AuditAction {
    BountyFunded,
    BountyClaimed,
    BountyCancelled,
    CircleWithdrawRequested,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::BountyFunded => "bounty.funded",
            AuditAction::BountyClaimed => "bounty.claimed",
            AuditAction::BountyCancelled => "bounty.cancelled",
            AuditAction::CircleWithdrawRequested => "circle.withdraw.requested",
        }
    }
}

pub fn write_audit(action: AuditAction, payload: Value) {
    info!(target: "audit", action = action.as_str(), payload = %payload, "audit entry");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names() {
        assert_eq!(AuditAction::BountyFunded.as_str(), "bounty.funded");
        assert_eq!(
            AuditAction::CircleWithdrawRequested.as_str(),
            "circle.withdraw.requested"
        );
    }
}
