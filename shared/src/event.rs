//! Domain events - immutable facts appended to an aggregate's event stream.
//!
//! Grounded on the teacher's `OrderEvent`/`OrderEventType`/`EventPayload`
//! envelope (`shared::order::event`): a flat envelope carrying ordering and
//! audit fields, wrapping a tagged payload enum. Two aggregate kinds share
//! this envelope here — individual orders (`order_id` as aggregate id) and
//! whole sync runs (the synthetic `sync-<execution_id>` aggregate id, see
//! `ExecutionId::sync_aggregate_id`) — spec.md §3 "Domain Event".

use crate::financial::FinancialBreakdown;
use crate::ids::{ExecutionId, OrderId};
use crate::order::OrderStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which consistency boundary an event belongs to — an individual order,
/// or a whole sync run (the synthetic `sync-<execution_id>` aggregate).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Order,
    SyncRun,
}

/// Schema version of `payload`'s shape, incremented when a payload variant's
/// fields change — lets the reader evolve without breaking old rows.
pub const CURRENT_EVENT_VERSION: u32 = 1;

/// Immutable fact recorded after a command is processed against an aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Event unique id.
    pub event_id: Uuid,
    /// Per-aggregate sequence number — the authoritative ordering mechanism
    /// for replay and the value optimistic concurrency checks against.
    pub sequence: u64,
    /// Aggregate this event belongs to: an `OrderId` string, or a
    /// `sync-<uuid>` run id for run-scoped events.
    pub aggregate_id: String,
    pub aggregate_type: AggregateType,
    pub event_type: DomainEventType,
    pub event_version: u32,
    /// Server timestamp — authoritative for state evolution.
    pub occurred_at: DateTime<Utc>,
    /// Correlation id threaded through the whole sync run this event was
    /// produced by (spec.md §6 "Execution id").
    pub execution_id: ExecutionId,
    pub payload: EventPayload,
}

impl DomainEvent {
    pub fn new(
        sequence: u64,
        aggregate_id: String,
        aggregate_type: AggregateType,
        execution_id: ExecutionId,
        event_type: DomainEventType,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            sequence,
            aggregate_id,
            aggregate_type,
            event_type,
            event_version: CURRENT_EVENT_VERSION,
            occurred_at: Utc::now(),
            execution_id,
            payload,
        }
    }
}

/// Discriminant mirrored by `EventPayload`'s tag — kept as its own field so
/// the event store can index/filter by kind without deserializing payloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainEventType {
    OrderCreated,
    OrderUpdated,
    OrderStatusChanged,
    FinancialsExtracted,
    OrderValidated,
    OrderSaved,
    InvoiceCreated,
    OrderSynced,
    OrderFailed,
    NotificationSent,
    SyncStarted,
    SyncCompleted,
}

impl std::fmt::Display for DomainEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OrderCreated => "ORDER_CREATED",
            Self::OrderUpdated => "ORDER_UPDATED",
            Self::OrderStatusChanged => "ORDER_STATUS_CHANGED",
            Self::FinancialsExtracted => "FINANCIALS_EXTRACTED",
            Self::OrderValidated => "ORDER_VALIDATED",
            Self::OrderSaved => "ORDER_SAVED",
            Self::InvoiceCreated => "INVOICE_CREATED",
            Self::OrderSynced => "ORDER_SYNCED",
            Self::OrderFailed => "ORDER_FAILED",
            Self::NotificationSent => "NOTIFICATION_SENT",
            Self::SyncStarted => "SYNC_STARTED",
            Self::SyncCompleted => "SYNC_COMPLETED",
        };
        f.write_str(s)
    }
}

/// Event payload variants, one per `DomainEventType` (spec.md §4 per-module
/// event lists).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    OrderCreated {
        order_id: OrderId,
        marketplace_order_date: DateTime<Utc>,
        item_count: usize,
    },
    OrderUpdated {
        order_id: OrderId,
    },
    OrderStatusChanged {
        from: OrderStatus,
        to: OrderStatus,
    },
    FinancialsExtracted {
        breakdown: FinancialBreakdown,
    },
    OrderValidated {
        balance_diff: String,
    },
    OrderSaved {
        #[serde(skip_serializing_if = "Option::is_none")]
        snapshot_sequence: Option<u64>,
    },
    InvoiceCreated {
        erp_invoice_id: u64,
    },
    OrderSynced,
    OrderFailed {
        reason: String,
        retryable: bool,
    },
    NotificationSent {
        channel: String,
        severity: String,
    },
    SyncStarted {
        batch_size: usize,
    },
    SyncCompleted {
        succeeded: usize,
        failed: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderStatus;

    #[test]
    fn event_sequence_and_aggregate_id_round_trip_through_json() {
        let execution_id = ExecutionId::new();
        let order_id = OrderId::new("123-4567890-1234567").unwrap();
        let event = DomainEvent::new(
            1,
            order_id.to_string(),
            AggregateType::Order,
            execution_id,
            DomainEventType::OrderStatusChanged,
            EventPayload::OrderStatusChanged { from: OrderStatus::Pending, to: OrderStatus::Shipped },
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sequence, 1);
        assert_eq!(back.aggregate_id, order_id.to_string());
    }

    #[test]
    fn sync_scoped_events_use_synthetic_aggregate_id() {
        let execution_id = ExecutionId::new();
        let event = DomainEvent::new(
            0,
            execution_id.sync_aggregate_id(),
            AggregateType::SyncRun,
            execution_id,
            DomainEventType::SyncStarted,
            EventPayload::SyncStarted { batch_size: 25 },
        );
        assert!(event.aggregate_id.starts_with("sync-"));
    }
}
