//! Batch runner: syncs every order posted within a date window, then drains
//! the hand-off stream once so invoice outcomes land in the same report
//! (spec.md §6 "Exit semantics (batch runner)").

use crate::eventlog::EventStore;
use crate::marketplace::{DateWindow, MarketplaceAdapter};
use crate::notifier::Notifier;
use crate::orchestrator::SyncOrchestrator;
use crate::projector::{ErpAdapter, Projector};
use crate::stream::HandoffStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

/// Aggregate counters for one batch run (spec.md §6). `failed > 0` drives
/// the CLI driver's non-zero exit code.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub invoices_created: usize,
    pub invoices_failed: usize,
}

impl BatchSummary {
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            1
        } else {
            0
        }
    }
}

/// Runs `SyncOrchestrator::sync` over every order id the marketplace
/// adapter lists in `window`, then drains the projector once so the report
/// reflects invoices posted during this run.
pub async fn run_batch<M, E, H, N, A>(
    marketplace: &M,
    orchestrator: &SyncOrchestrator<E, H, N>,
    projector: &Projector<H, E, A>,
    window: DateWindow,
    dry_run: bool,
    shutdown: CancellationToken,
) -> BatchSummary
where
    M: MarketplaceAdapter,
    E: EventStore + 'static,
    H: HandoffStream + 'static,
    N: Notifier,
    A: ErpAdapter + 'static,
{
    let mut summary = BatchSummary::default();
    let mut order_ids = marketplace.list_order_ids(window);

    while let Some(result) = order_ids.next().await {
        if shutdown.is_cancelled() {
            tracing::info!("batch runner cancelled, stopping before further orders");
            break;
        }

        let order_id = match result {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list an order id, counting as a failure");
                summary.total += 1;
                summary.failed += 1;
                continue;
            }
        };

        summary.total += 1;
        let raw = match marketplace.fetch_financial_events(&order_id).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(%order_id, error = %e, "failed to fetch financial events");
                summary.failed += 1;
                continue;
            }
        };

        let result = orchestrator.sync(order_id.clone(), &raw, None, dry_run, shutdown.clone()).await;
        if result.success {
            summary.succeeded += 1;
        } else {
            summary.failed += 1;
            tracing::warn!(%order_id, error = ?result.error, "order sync failed");
        }
    }

    if !dry_run {
        let (posted, failed) = projector.drain_once().await;
        summary.invoices_created = posted;
        summary.invoices_failed = failed;
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::InMemoryEventStore;
    use crate::marketplace::FixtureMarketplaceAdapter;
    use crate::notifier::{LogNotifier, Severity};
    use crate::projector::{MockErpAdapter, ProjectorConfig};
    use crate::snapshot::{EventCountStrategy, SnapshotStore};
    use crate::stream::InMemoryHandoffStream;
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;
    use shared::fee::{AccountMapping, FeeKind, FeeTable};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn test_fee_table() -> FeeTable {
        let mut mappings = HashMap::new();
        mappings.insert(FeeKind::Fulfillment, AccountMapping::new(6221, None).unwrap());
        mappings.insert(FeeKind::Commission, AccountMapping::new(6222, None).unwrap());
        FeeTable::new(mappings)
    }

    #[tokio::test]
    async fn batch_run_reports_one_order_succeeded_and_one_invoice_created() {
        let (order_id, events) = FixtureMarketplaceAdapter::scenario_a();
        let marketplace = FixtureMarketplaceAdapter::new().with_recording(order_id.clone(), events);

        let event_store = Arc::new(InMemoryEventStore::new());
        let snapshot_store = Arc::new(SnapshotStore::connect("sqlite::memory:").await.unwrap());
        let stream = Arc::new(InMemoryHandoffStream::new());
        let erp = Arc::new(MockErpAdapter::new());
        erp.seed_product("JR-ZS283", 501).await;

        let orchestrator = SyncOrchestrator::new(
            event_store.clone(),
            snapshot_store,
            Arc::new(EventCountStrategy::new(10)),
            stream.clone(),
            Arc::new(LogNotifier::new(Severity::new(0))),
            Arc::new(test_fee_table()),
            dec!(0.01),
        );

        let projector = Projector::new(
            stream,
            event_store,
            erp,
            ProjectorConfig { journal_id: 1, warehouse_id: 1, generic_partner_name: "Marketplace Generic Buyer".into(), workers: 1 },
        );

        let window = DateWindow::new(Utc::now() - ChronoDuration::hours(1), Utc::now()).unwrap();
        let summary = run_batch(&marketplace, &orchestrator, &projector, window, false, CancellationToken::new()).await;

        assert_eq!(summary.total, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.invoices_created, 1);
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test]
    async fn a_failed_order_is_reflected_in_a_nonzero_exit_code() {
        let marketplace = FixtureMarketplaceAdapter::new()
            .with_recording(shared::ids::OrderId::new("999-9999999-9999999").unwrap(), crate::decomposer::RawFinancialEvents { shipment_event_list: vec![] });

        let event_store = Arc::new(InMemoryEventStore::new());
        let snapshot_store = Arc::new(SnapshotStore::connect("sqlite::memory:").await.unwrap());
        let stream = Arc::new(InMemoryHandoffStream::new());
        let erp = Arc::new(MockErpAdapter::new());

        let orchestrator = SyncOrchestrator::new(
            event_store.clone(),
            snapshot_store,
            Arc::new(EventCountStrategy::new(10)),
            stream.clone(),
            Arc::new(LogNotifier::new(Severity::new(0))),
            Arc::new(test_fee_table()),
            dec!(0.01),
        );
        let projector = Projector::new(
            stream,
            event_store,
            erp,
            ProjectorConfig { journal_id: 1, warehouse_id: 1, generic_partner_name: "Marketplace Generic Buyer".into(), workers: 1 },
        );

        let window = DateWindow::new(Utc::now() - ChronoDuration::hours(1), Utc::now()).unwrap();
        let summary = run_batch(&marketplace, &orchestrator, &projector, window, false, CancellationToken::new()).await;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.exit_code(), 1);
    }
}
