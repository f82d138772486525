//! The order aggregate-root as a pure data value. No behavior lives here —
//! mutation happens in `sync_engine::order` through the event-sourced
//! command/apply cycle; this module only describes the shape and the
//! legal status transitions (spec.md §3, §4.3).

use crate::financial::{FinancialBreakdown, OrderItem};
use crate::ids::{ExecutionId, OrderId};
use crate::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle states of an order (spec.md §3). `Cancelled` is terminal for
/// shipping; `Synced` is terminal for ERP posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Shipped,
    Cancelled,
    Synced,
    Failed,
}

impl OrderStatus {
    /// Whether `self -> next` is a permitted transition (spec.md §3):
    /// `Pending->Shipped`, `Pending->Cancelled`, `{Pending,Shipped}->Synced`,
    /// any->`Failed`.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Shipped) | (Pending, Cancelled) | (Pending, Synced) | (Shipped, Synced) | (_, Failed)
        )
    }
}

/// The order aggregate's current materialized state — what you get back
/// from replaying (or loading a snapshot of) its event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub purchase_date: DateTime<Utc>,
    pub buyer_email: Option<String>,
    pub items: Vec<OrderItem>,
    pub order_total: Money,
    pub status: OrderStatus,
    pub execution_id: ExecutionId,
    pub marketplace: String,
    pub error_message: Option<String>,
    pub financial_breakdown: Option<FinancialBreakdown>,
    /// Sequence number of the last event applied; drives optimistic
    /// concurrency on the next append (spec.md §4.4).
    pub version: u64,
}

impl Order {
    pub fn new(
        order_id: OrderId,
        purchase_date: DateTime<Utc>,
        buyer_email: Option<String>,
        items: Vec<OrderItem>,
        order_total: Money,
        execution_id: ExecutionId,
        marketplace: String,
    ) -> Self {
        Self {
            order_id,
            purchase_date,
            buyer_email,
            items,
            order_total,
            status: OrderStatus::Pending,
            execution_id,
            marketplace,
            error_message: None,
            financial_breakdown: None,
            version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_match_the_permitted_set() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Shipped));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Pending.can_transition_to(Synced));
        assert!(Shipped.can_transition_to(Synced));
        assert!(Cancelled.can_transition_to(Failed));
        assert!(!Shipped.can_transition_to(Cancelled));
        assert!(!Synced.can_transition_to(Pending));
    }
}
