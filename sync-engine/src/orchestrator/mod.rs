//! Single-order workflow: decompose → validate → persist events → hand-off
//! → notify (spec.md §4.6).

use crate::decomposer::{self, DecomposerError, RawFinancialEvents};
use crate::eventlog::{EventLogError, EventStore};
use crate::notifier::{Notifier, Severity};
use crate::order::{self, rehydrate, OrderError};
use crate::snapshot::{SnapshotError, SnapshotStore, SnapshotStrategy};
use crate::stream::{HandoffStream, ParityVerified, StreamError};
use chrono::Utc;
use rust_decimal::Decimal;
use shared::event::{AggregateType, DomainEvent, DomainEventType, EventPayload};
use shared::fee::FeeTable;
use shared::financial::OrderItem;
use shared::ids::{ExecutionId, OrderId};
use shared::money::Money;
use shared::order::Order;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Decomposer(#[from] DecomposerError),
    #[error(transparent)]
    Order(#[from] OrderError),
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("sync for order {0} was cancelled")]
    Cancelled(String),
}

impl SyncError {
    /// `step` name used in the `OrderFailed` event (spec.md §4.6 step 2).
    fn step(&self) -> &'static str {
        match self {
            SyncError::Decomposer(_) => "extract",
            SyncError::Order(_) => "aggregate",
            SyncError::EventLog(_) => "persist",
            SyncError::Snapshot(_) => "snapshot",
            SyncError::Stream(_) => "handoff",
            SyncError::Cancelled(_) => "cancelled",
        }
    }

    /// Optimistic-concurrency conflicts are the one retryable case named in
    /// spec.md §7.
    fn retryable(&self) -> bool {
        matches!(self, SyncError::EventLog(EventLogError::ConcurrencyConflict { .. }))
    }
}

#[derive(Debug, Clone)]
pub struct SyncResult {
    pub execution_id: ExecutionId,
    pub success: bool,
    pub principal: Option<Decimal>,
    pub net_proceeds: Option<Decimal>,
    /// Always `None` from this call — ERP posting happens asynchronously
    /// in the projector once the hand-off stream delivers the
    /// `ParityVerified` message this step publishes (spec.md §4.7).
    pub invoice_id: Option<i64>,
    pub duration: Duration,
    pub error: Option<String>,
}

pub struct SyncOrchestrator<E, H, N> {
    event_store: Arc<E>,
    snapshot_store: Arc<SnapshotStore>,
    snapshot_strategy: Arc<dyn SnapshotStrategy>,
    stream: Arc<H>,
    notifier: Arc<N>,
    fee_table: Arc<FeeTable>,
    money_tolerance: Decimal,
}

impl<E, H, N> SyncOrchestrator<E, H, N>
where
    E: EventStore,
    H: HandoffStream,
    N: Notifier,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_store: Arc<E>,
        snapshot_store: Arc<SnapshotStore>,
        snapshot_strategy: Arc<dyn SnapshotStrategy>,
        stream: Arc<H>,
        notifier: Arc<N>,
        fee_table: Arc<FeeTable>,
        money_tolerance: Decimal,
    ) -> Self {
        Self { event_store, snapshot_store, snapshot_strategy, stream, notifier, fee_table, money_tolerance }
    }

    pub async fn sync(
        &self,
        order_id: OrderId,
        raw: &RawFinancialEvents,
        buyer_email: Option<String>,
        dry_run: bool,
        cancellation: CancellationToken,
    ) -> SyncResult {
        let (execution_id, span) = crate::tracing_ctx::new_execution_span("sync");
        let started = Instant::now();

        self.run(order_id.clone(), raw, buyer_email, dry_run, execution_id, &cancellation)
            .instrument(span)
            .await
            .unwrap_or_else(|e| self.failure_result(execution_id, started, &e))
    }

    fn failure_result(&self, execution_id: ExecutionId, started: Instant, error: &SyncError) -> SyncResult {
        tracing::error!(%execution_id, step = error.step(), "sync failed: {error}");
        SyncResult {
            execution_id,
            success: false,
            principal: None,
            net_proceeds: None,
            invoice_id: None,
            duration: started.elapsed(),
            error: Some(error.to_string()),
        }
    }

    async fn run(
        &self,
        order_id: OrderId,
        raw: &RawFinancialEvents,
        buyer_email: Option<String>,
        dry_run: bool,
        execution_id: ExecutionId,
        cancellation: &CancellationToken,
    ) -> Result<SyncResult, SyncError> {
        let started = Instant::now();

        // Step 1: SyncStarted, scoped to the synthetic per-run aggregate.
        let sync_aggregate_id = execution_id.sync_aggregate_id();
        self.event_store
            .append(
                DomainEvent::new(
                    0,
                    sync_aggregate_id.clone(),
                    AggregateType::SyncRun,
                    execution_id,
                    DomainEventType::SyncStarted,
                    EventPayload::SyncStarted { batch_size: 1 },
                ),
                None,
            )
            .await?;

        // Step 2: decompose. Failures here are `extract` step failures.
        let breakdown = match decomposer::decompose(&order_id, raw, &self.fee_table, self.money_tolerance, None) {
            Ok(b) => b,
            Err(e) => return self.fail_order(&order_id, execution_id, e.into()).await,
        };

        if cancellation.is_cancelled() {
            return Err(SyncError::Cancelled(order_id.to_string()));
        }

        // Step 3: build or rehydrate, attach breakdown, transition to Shipped.
        let existing_events = self.event_store.events_for(order_id.as_str(), None, None).await?;
        let mut sequence = existing_events.last().map(|e| e.sequence).unwrap_or(0);
        let mut pending = Vec::new();

        let mut order = match rehydrate(None, &existing_events) {
            Some(order) => order,
            None => {
                let items = items_from_breakdown(&breakdown);
                let order = Order::new(
                    order_id.clone(),
                    breakdown.posted_date,
                    buyer_email,
                    items,
                    breakdown.principal,
                    execution_id,
                    "amazon".to_string(),
                );
                sequence += 1;
                pending.extend(order::create(&order, sequence)?);
                order
            }
        };

        let total_lines: Decimal = breakdown.lines.iter().map(|l| l.amount.amount()).sum();
        let balance_diff = (breakdown.principal.amount() + total_lines - breakdown.net_proceeds.amount()).abs();

        sequence += 1;
        pending.extend(order::record_financials(&order, sequence, breakdown.clone())?);
        order.financial_breakdown = Some(breakdown.clone());

        sequence += 1;
        pending.extend(order::validate(&order, sequence, balance_diff)?);

        if order.status == shared::order::OrderStatus::Pending {
            sequence += 1;
            pending.extend(order::mark_shipped(&order, sequence)?);
            order.status = shared::order::OrderStatus::Shipped;
        }

        if cancellation.is_cancelled() {
            return Err(SyncError::Cancelled(order_id.to_string()));
        }

        // Append the pending events, each against its own expected sequence
        // so a concurrent writer to the same aggregate surfaces a conflict
        // rather than silently interleaving.
        let mut expected = existing_events.last().map(|e| e.sequence).unwrap_or(0);
        for mut event in pending {
            expected += 1;
            event.sequence = expected;
            self.event_store.append(event, Some(expected)).await?;
        }
        order.version = expected;

        if dry_run {
            let result = self.complete(&order_id, execution_id, &order, started, None);
            self.emit_sync_completed(&sync_aggregate_id, execution_id, 1, 0).await?;
            return Ok(result);
        }

        if cancellation.is_cancelled() {
            // Per spec.md §5 "Cancellation": in-flight writes complete, but a
            // stream publish after this point is skipped — the event log
            // already holds the durable truth and a later run recovers it.
            return Err(SyncError::Cancelled(order_id.to_string()));
        }

        // Step 5: snapshot strategy, then hand-off.
        let should_snapshot =
            self.snapshot_strategy.should_snapshot(order_id.as_str(), order.version, &self.snapshot_store).await;
        let mut snapshot_sequence = None;
        if should_snapshot {
            let state_json = serde_json::to_string(&order).map_err(EventLogError::Serialization)?;
            self.snapshot_store
                .save(order_id.as_str(), AggregateType::Order, &state_json, order.version, 1)
                .await?;
            snapshot_sequence = Some(order.version);
        }

        for (sku, sku_breakdown) in &order.financial_breakdown.as_ref().expect("just attached above").per_sku {
            // Account routing is resolved later from the fee table, by the
            // projector, when it builds the actual invoice lines — the
            // hand-off message only carries what's needed to trigger and
            // deduplicate projection (spec.md §4.7).
            self.stream
                .publish(&ParityVerified {
                    order_id: order_id.clone(),
                    sku: sku.clone(),
                    net_proceeds: sku_breakdown.net.amount(),
                    account_id: 0,
                    timestamp: Utc::now(),
                    execution_id,
                })
                .await?;
        }

        expected += 1;
        self.event_store.append(order::save(&order, expected, snapshot_sequence)?.remove(0), Some(expected)).await?;
        order.version = expected;

        // Step 6: notify.
        let severity = if should_snapshot { Severity::WARN } else { Severity::INFO };
        self.notifier.notify(&format!("order {order_id} synced, awaiting ERP projection"), severity).await;

        let result = self.complete(&order_id, execution_id, &order, started, None);
        self.emit_sync_completed(&sync_aggregate_id, execution_id, 1, 0).await?;
        Ok(result)
    }

    async fn fail_order(
        &self,
        order_id: &OrderId,
        execution_id: ExecutionId,
        error: SyncError,
    ) -> Result<SyncResult, SyncError> {
        let reason = error.to_string();
        let retryable = error.retryable();
        let event = DomainEvent::new(
            0,
            order_id.to_string(),
            AggregateType::Order,
            execution_id,
            DomainEventType::OrderFailed,
            EventPayload::OrderFailed { reason: reason.clone(), retryable },
        );
        if let Err(e) = self.event_store.append(event, None).await {
            tracing::warn!(%order_id, error = %e, "failed to persist OrderFailed event");
        }
        self.notifier.notify_error(order_id.as_str(), &reason).await;
        Err(error)
    }

    fn complete(
        &self,
        order_id: &OrderId,
        execution_id: ExecutionId,
        order: &Order,
        started: Instant,
        invoice_id: Option<i64>,
    ) -> SyncResult {
        let breakdown = order.financial_breakdown.as_ref();
        tracing::info!(%order_id, %execution_id, "sync completed");
        SyncResult {
            execution_id,
            success: true,
            principal: breakdown.map(|b| b.principal.amount()),
            net_proceeds: breakdown.map(|b| b.net_proceeds.amount()),
            invoice_id,
            duration: started.elapsed(),
            error: None,
        }
    }

    async fn emit_sync_completed(
        &self,
        sync_aggregate_id: &str,
        execution_id: ExecutionId,
        succeeded: usize,
        failed: usize,
    ) -> Result<(), SyncError> {
        self.event_store
            .append(
                DomainEvent::new(
                    0,
                    sync_aggregate_id.to_string(),
                    AggregateType::SyncRun,
                    execution_id,
                    DomainEventType::SyncCompleted,
                    EventPayload::SyncCompleted { succeeded, failed },
                ),
                None,
            )
            .await?;
        Ok(())
    }
}

/// Builds a provisional item list from the per-SKU breakdown for a
/// newly-seen order — the marketplace financial-events payload carries no
/// product titles, so the SKU stands in for one. `unit_price` is derived
/// from `principal / quantity` and then multiplied back to build `total`,
/// so `OrderItem::new`'s consistency invariant always holds by
/// construction (see DESIGN.md).
fn items_from_breakdown(breakdown: &shared::financial::FinancialBreakdown) -> Vec<OrderItem> {
    breakdown
        .per_sku
        .iter()
        .filter_map(|(sku, sku_breakdown)| {
            let quantity = sku_breakdown.quantity.max(1);
            let currency = sku_breakdown.principal.currency();
            // Round to 2 dp, then multiply back for `total`, so
            // `OrderItem::new`'s unit_price*quantity==total invariant holds
            // by construction rather than by coincidence.
            let unit_price_amount = (sku_breakdown.principal.amount() / Decimal::from(quantity)).round_dp(2);
            let total_amount = unit_price_amount * Decimal::from(quantity);
            let unit_price = Money::new(unit_price_amount, currency).ok()?;
            let total = Money::new(total_amount, currency).ok()?;
            OrderItem::new(sku.clone(), sku.to_string(), quantity, unit_price, total).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::InMemoryEventStore;
    use crate::marketplace::FixtureMarketplaceAdapter;
    use crate::notifier::LogNotifier;
    use crate::snapshot::EventCountStrategy;
    use crate::stream::InMemoryHandoffStream;
    use rust_decimal_macros::dec;
    use shared::fee::{AccountMapping, FeeKind};
    use std::collections::HashMap;

    fn test_fee_table() -> FeeTable {
        let mut mappings = HashMap::new();
        mappings.insert(FeeKind::Fulfillment, AccountMapping::new(6221, None).unwrap());
        mappings.insert(FeeKind::Commission, AccountMapping::new(1133, None).unwrap());
        mappings.insert(FeeKind::RefundCommission, AccountMapping::new(1134, None).unwrap());
        mappings.insert(FeeKind::ShippingCharge, AccountMapping::new(4001, None).unwrap());
        mappings.insert(FeeKind::PromoRebate, AccountMapping::new(4002, None).unwrap());
        mappings.insert(FeeKind::Storage, AccountMapping::new(6222, None).unwrap());
        mappings.insert(FeeKind::PaymentMethodFee, AccountMapping::new(4000, None).unwrap());
        FeeTable::new(mappings)
    }

    async fn test_orchestrator() -> (
        SyncOrchestrator<InMemoryEventStore, InMemoryHandoffStream, LogNotifier>,
        Arc<InMemoryHandoffStream>,
    ) {
        let event_store = Arc::new(InMemoryEventStore::new());
        let snapshot_store = Arc::new(SnapshotStore::connect("sqlite::memory:").await.unwrap());
        let strategy: Arc<dyn SnapshotStrategy> = Arc::new(EventCountStrategy::new(10));
        let stream = Arc::new(InMemoryHandoffStream::new());
        let notifier = Arc::new(LogNotifier::default());
        let fee_table = Arc::new(test_fee_table());

        let orchestrator = SyncOrchestrator::new(
            event_store,
            snapshot_store,
            strategy,
            stream.clone(),
            notifier,
            fee_table,
            dec!(0.01),
        );
        (orchestrator, stream)
    }

    #[tokio::test]
    async fn successful_sync_publishes_one_message_per_sku() {
        let (orchestrator, stream) = test_orchestrator().await;
        let (order_id, events) = FixtureMarketplaceAdapter::scenario_a();

        let result = orchestrator.sync(order_id, &events, Some("buyer@example.com".into()), false, CancellationToken::new()).await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.principal, Some(dec!(198.83)));
        assert_eq!(result.net_proceeds, Some(dec!(149.96)));

        let delivered = stream.read_batch(10, Duration::from_millis(0)).await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].message.sku.as_str(), "JR-ZS283");
    }

    #[tokio::test]
    async fn dry_run_does_not_publish_to_the_handoff_stream() {
        let (orchestrator, stream) = test_orchestrator().await;
        let (order_id, events) = FixtureMarketplaceAdapter::scenario_a();

        let result = orchestrator.sync(order_id, &events, None, true, CancellationToken::new()).await;

        assert!(result.success);
        let delivered = stream.read_batch(10, Duration::from_millis(0)).await.unwrap();
        assert!(delivered.is_empty());
    }

    #[tokio::test]
    async fn decomposer_failure_surfaces_as_unsuccessful_result() {
        let (orchestrator, _stream) = test_orchestrator().await;
        let order_id = OrderId::new("999-9999999-9999999").unwrap();
        let empty = RawFinancialEvents { shipment_event_list: vec![] };

        let result = orchestrator.sync(order_id, &empty, None, false, CancellationToken::new()).await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn already_cancelled_token_stops_before_handoff() {
        let (orchestrator, stream) = test_orchestrator().await;
        let (order_id, events) = FixtureMarketplaceAdapter::scenario_a();
        let token = CancellationToken::new();
        token.cancel();

        let result = orchestrator.sync(order_id, &events, None, false, token).await;
        assert!(!result.success);
        let delivered = stream.read_batch(10, Duration::from_millis(0)).await.unwrap();
        assert!(delivered.is_empty());
    }
}
