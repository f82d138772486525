//! The order aggregate's command/apply cycle (spec.md §4.3).
//!
//! Commands validate invariants and return pending `DomainEvent`s; they
//! never mutate state directly. `apply` is the reducer that folds events
//! into an `Order`, mirroring the teacher's command → event → reducer
//! split (`orders/reducer.rs::apply_event`).

use rust_decimal::Decimal;
use shared::event::{AggregateType, DomainEvent, DomainEventType, EventPayload};
use shared::financial::{FinancialBreakdown, OrderItem};
use shared::order::{Order, OrderStatus};

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("cannot transition order {order_id} from {from:?} to {to:?}")]
    IllegalTransition { order_id: String, from: OrderStatus, to: OrderStatus },
    #[error("order {0} total does not match the sum of its item totals")]
    TotalMismatch(String),
    #[error("mark_synced on order {0} requires a financial breakdown to already be attached")]
    MissingFinancials(String),
    #[error("cannot add items to order {0} after it left Pending")]
    NotPending(String),
}

/// Create a new order (`OrderCreated`). The caller supplies a consistent
/// `order_total` — validated elsewhere via `OrderItem::new`'s own
/// unit_price × quantity invariant; this command only checks the items'
/// totals sum to `order_total`.
pub fn create(order: &Order, sequence: u64) -> Result<Vec<DomainEvent>, OrderError> {
    let sum: Decimal = order.items.iter().map(|i| i.total.amount()).sum();
    if sum != order.order_total.amount() {
        return Err(OrderError::TotalMismatch(order.order_id.to_string()));
    }
    Ok(vec![DomainEvent::new(
        sequence,
        order.order_id.to_string(),
        AggregateType::Order,
        order.execution_id,
        DomainEventType::OrderCreated,
        EventPayload::OrderCreated {
            order_id: order.order_id.clone(),
            marketplace_order_date: order.purchase_date,
            item_count: order.items.len(),
        },
    )])
}

/// Add an item to a still-`Pending` order (`OrderUpdated`).
pub fn add_item(order: &Order, sequence: u64, _item: OrderItem) -> Result<Vec<DomainEvent>, OrderError> {
    if order.status != OrderStatus::Pending {
        return Err(OrderError::NotPending(order.order_id.to_string()));
    }
    Ok(vec![DomainEvent::new(
        sequence,
        order.order_id.to_string(),
        AggregateType::Order,
        order.execution_id,
        DomainEventType::OrderUpdated,
        EventPayload::OrderUpdated { order_id: order.order_id.clone() },
    )])
}

/// Record the outcome of the Balance-invariant check (`OrderValidated`,
/// audit-only — `apply` does not mutate state for it).
pub fn validate(order: &Order, sequence: u64, balance_diff: Decimal) -> Result<Vec<DomainEvent>, OrderError> {
    Ok(vec![DomainEvent::new(
        sequence,
        order.order_id.to_string(),
        AggregateType::Order,
        order.execution_id,
        DomainEventType::OrderValidated,
        EventPayload::OrderValidated { balance_diff: balance_diff.to_string() },
    )])
}

/// Record that the order's pending events were durably appended and, when
/// a snapshot was written as part of the same step, at which sequence
/// (`OrderSaved`, audit-only).
pub fn save(order: &Order, sequence: u64, snapshot_sequence: Option<u64>) -> Result<Vec<DomainEvent>, OrderError> {
    Ok(vec![DomainEvent::new(
        sequence,
        order.order_id.to_string(),
        AggregateType::Order,
        order.execution_id,
        DomainEventType::OrderSaved,
        EventPayload::OrderSaved { snapshot_sequence },
    )])
}

/// Attach a financial breakdown (`FinancialsExtracted`).
pub fn record_financials(
    order: &Order,
    sequence: u64,
    breakdown: FinancialBreakdown,
) -> Result<Vec<DomainEvent>, OrderError> {
    Ok(vec![DomainEvent::new(
        sequence,
        order.order_id.to_string(),
        AggregateType::Order,
        order.execution_id,
        DomainEventType::FinancialsExtracted,
        EventPayload::FinancialsExtracted { breakdown },
    )])
}

/// Transition `Pending -> Shipped` (`OrderStatusChanged`).
pub fn mark_shipped(order: &Order, sequence: u64) -> Result<Vec<DomainEvent>, OrderError> {
    transition(order, sequence, OrderStatus::Shipped)
}

/// Transition `{Pending,Shipped} -> Synced` (`OrderSynced`, terminal).
/// Requires a financial breakdown.
pub fn mark_synced(order: &Order, sequence: u64) -> Result<Vec<DomainEvent>, OrderError> {
    if order.financial_breakdown.is_none() {
        return Err(OrderError::MissingFinancials(order.order_id.to_string()));
    }
    if !order.status.can_transition_to(OrderStatus::Synced) {
        return Err(OrderError::IllegalTransition { order_id: order.order_id.to_string(), from: order.status, to: OrderStatus::Synced });
    }
    Ok(vec![DomainEvent::new(
        sequence,
        order.order_id.to_string(),
        AggregateType::Order,
        order.execution_id,
        DomainEventType::OrderSynced,
        EventPayload::OrderSynced,
    )])
}

/// Record the ERP invoice posted for this order (`InvoiceCreated`,
/// audit-only — the invoice id is not carried on the aggregate itself).
pub fn invoice_created(order: &Order, sequence: u64, erp_invoice_id: u64) -> Result<Vec<DomainEvent>, OrderError> {
    Ok(vec![DomainEvent::new(
        sequence,
        order.order_id.to_string(),
        AggregateType::Order,
        order.execution_id,
        DomainEventType::InvoiceCreated,
        EventPayload::InvoiceCreated { erp_invoice_id },
    )])
}

/// Transition any status `-> Failed` (`OrderFailed`).
pub fn mark_failed(order: &Order, sequence: u64, reason: String, retryable: bool) -> Result<Vec<DomainEvent>, OrderError> {
    Ok(vec![DomainEvent::new(
        sequence,
        order.order_id.to_string(),
        AggregateType::Order,
        order.execution_id,
        DomainEventType::OrderFailed,
        EventPayload::OrderFailed { reason, retryable },
    )])
}

fn transition(order: &Order, sequence: u64, to: OrderStatus) -> Result<Vec<DomainEvent>, OrderError> {
    if !order.status.can_transition_to(to) {
        return Err(OrderError::IllegalTransition { order_id: order.order_id.to_string(), from: order.status, to });
    }
    Ok(vec![DomainEvent::new(
        sequence,
        order.order_id.to_string(),
        AggregateType::Order,
        order.execution_id,
        DomainEventType::OrderStatusChanged,
        EventPayload::OrderStatusChanged { from: order.status, to },
    )])
}

/// Fold one event into the aggregate (spec.md §4.3 "Rehydration").
/// `OrderCreated` establishes identity (callers must seed the struct before
/// the first apply — see `rehydrate`); `OrderStatusChanged` updates status
/// and clears/sets `error_message`; `FinancialsExtracted` attaches the
/// breakdown; all other event kinds are pure projections recorded for
/// audit but do not mutate state.
pub fn apply(order: &mut Order, event: &DomainEvent) {
    match &event.payload {
        EventPayload::OrderStatusChanged { to, .. } => {
            order.status = *to;
            if *to != OrderStatus::Failed {
                order.error_message = None;
            }
        }
        EventPayload::FinancialsExtracted { breakdown } => {
            order.financial_breakdown = Some(breakdown.clone());
        }
        EventPayload::OrderFailed { reason, .. } => {
            order.status = OrderStatus::Failed;
            order.error_message = Some(reason.clone());
        }
        EventPayload::OrderSynced => {
            order.status = OrderStatus::Synced;
            order.error_message = None;
        }
        EventPayload::InvoiceCreated { .. }
        | EventPayload::OrderCreated { .. }
        | EventPayload::OrderUpdated { .. }
        | EventPayload::OrderValidated { .. }
        | EventPayload::OrderSaved { .. }
        | EventPayload::NotificationSent { .. }
        | EventPayload::SyncStarted { .. }
        | EventPayload::SyncCompleted { .. } => {}
    }
    order.version = event.sequence;
}

/// Rehydrate an aggregate from an ordered event list, optionally seeded
/// from a snapshot state. An empty event list with no seed yields no
/// aggregate (spec.md §4.3).
pub fn rehydrate(seed: Option<Order>, events: &[DomainEvent]) -> Option<Order> {
    let mut state = seed;
    for event in events {
        match &mut state {
            Some(order) => apply(order, event),
            None => {
                if let EventPayload::OrderCreated { order_id, marketplace_order_date, .. } = &event.payload {
                    let mut order = Order::new(
                        order_id.clone(),
                        *marketplace_order_date,
                        None,
                        Vec::new(),
                        shared::money::Money::zero(shared::money::Currency::new("USD").unwrap()),
                        event.execution_id,
                        "amazon".to_string(),
                    );
                    order.version = event.sequence;
                    state = Some(order);
                }
            }
        }
    }
    state.map(|mut o| {
        o.version = events.last().map(|e| e.sequence).unwrap_or(o.version);
        o
    })
}
