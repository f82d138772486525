//! Typed wrapper around the external marketplace order/financial-event API
//! (spec.md §6 "Marketplace adapter (inbound)").
//!
//! Grounded on the teacher's `cloud_sync/worker.rs::push_with_retry`: bounded
//! exponential backoff, 3 attempts. `FixtureMarketplaceAdapter` replays the
//! worked examples from spec.md §8 (a)/(b), grounded on the original's
//! committed Amazon Financial Events JSON samples referenced in
//! `fee_mapper.py`'s docstring.

use crate::decomposer::RawFinancialEvents;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use shared::ids::OrderId;
use std::time::Duration;

const MAX_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const UPSTREAM_CLAMP: ChronoDuration = ChronoDuration::minutes(2);

#[derive(Debug, thiserror::Error)]
pub enum MarketplaceError {
    #[error("posted_after {posted_after} is not before the clamped posted_before {posted_before}")]
    EmptyWindow { posted_after: DateTime<Utc>, posted_before: DateTime<Utc> },
    #[error("marketplace request failed after {attempts} attempts: {detail}")]
    RequestFailed { attempts: u32, detail: String },
    #[error("malformed marketplace response: {0}")]
    MalformedResponse(String),
    #[error("fixture adapter has no recording for order {0}")]
    NoFixture(String),
}

/// `[posted_after, posted_before)`, strict ISO-8601 Z. `posted_before` is
/// always clamped to `now - 2 minutes` (spec.md §6) — the upstream does not
/// guarantee a stable view of events more recent than that, and the system
/// never invents a fallback date for `posted_after`.
#[derive(Debug, Clone, Copy)]
pub struct DateWindow {
    pub posted_after: DateTime<Utc>,
    pub posted_before: DateTime<Utc>,
}

impl DateWindow {
    pub fn new(posted_after: DateTime<Utc>, posted_before: DateTime<Utc>) -> Result<Self, MarketplaceError> {
        let clamp = Utc::now() - UPSTREAM_CLAMP;
        let posted_before = posted_before.min(clamp);
        if posted_after >= posted_before {
            return Err(MarketplaceError::EmptyWindow { posted_after, posted_before });
        }
        Ok(Self { posted_after, posted_before })
    }
}

#[derive(Debug, Deserialize)]
struct OrderPage {
    order_ids: Vec<OrderId>,
    next_token: Option<String>,
}

#[async_trait]
pub trait MarketplaceAdapter: Send + Sync {
    async fn fetch_financial_events(&self, order_id: &OrderId) -> Result<RawFinancialEvents, MarketplaceError>;

    /// Streams order ids posted within `window`, walking continuation-token
    /// pages until the upstream signals exhaustion.
    fn list_order_ids(&self, window: DateWindow) -> BoxStream<'_, Result<OrderId, MarketplaceError>>;
}

/// `reqwest`-backed production adapter.
pub struct HttpMarketplaceAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpMarketplaceAdapter {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self { client: reqwest::Client::new(), base_url, api_key }
    }

    /// Bounded exponential backoff, 3 attempts — the teacher's
    /// `push_with_retry` idiom, generalized from a POST to a GET.
    async fn get_with_retry(&self, path: &str, query: &[(&str, String)]) -> Result<serde_json::Value, MarketplaceError> {
        let url = format!("{}{}", self.base_url, path);
        let mut delay = INITIAL_RETRY_DELAY;

        for attempt in 0..MAX_RETRIES {
            let result = match self.client.get(&url).bearer_auth(&self.api_key).query(query).send().await {
                Ok(resp) => resp.error_for_status(),
                Err(e) => Err(e),
            };

            match result {
                Ok(resp) => {
                    return resp.json::<serde_json::Value>().await.map_err(|e| MarketplaceError::MalformedResponse(e.to_string()));
                }
                Err(e) if attempt + 1 < MAX_RETRIES => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        delay_secs = delay.as_secs(),
                        "marketplace request failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(60));
                }
                Err(e) => return Err(MarketplaceError::RequestFailed { attempts: attempt + 1, detail: e.to_string() }),
            }
        }
        unreachable!()
    }
}

enum PageState {
    Pending { token: Option<String> },
    Done,
}

#[async_trait]
impl MarketplaceAdapter for HttpMarketplaceAdapter {
    async fn fetch_financial_events(&self, order_id: &OrderId) -> Result<RawFinancialEvents, MarketplaceError> {
        let value = self.get_with_retry(&format!("/orders/{order_id}/financial-events"), &[]).await?;
        serde_json::from_value(value).map_err(|e| MarketplaceError::MalformedResponse(e.to_string()))
    }

    fn list_order_ids(&self, window: DateWindow) -> BoxStream<'_, Result<OrderId, MarketplaceError>> {
        let state = PageState::Pending { token: None };
        let pages = stream::unfold(state, move |state| async move {
            let PageState::Pending { token } = state else { return None };

            let posted_after = window.posted_after.to_rfc3339();
            let posted_before = window.posted_before.to_rfc3339();
            let mut query = vec![("posted_after", posted_after), ("posted_before", posted_before)];
            if let Some(token) = &token {
                query.push(("next_token", token.clone()));
            }

            match self.get_with_retry("/orders", &query).await {
                Ok(value) => match serde_json::from_value::<OrderPage>(value) {
                    Ok(page) => {
                        let next = match page.next_token {
                            Some(t) => PageState::Pending { token: Some(t) },
                            None => PageState::Done,
                        };
                        Some((Ok(page.order_ids), next))
                    }
                    Err(e) => Some((Err(MarketplaceError::MalformedResponse(e.to_string())), PageState::Done)),
                },
                Err(e) => Some((Err(e), PageState::Done)),
            }
        });

        Box::pin(pages.flat_map(|result| match result {
            Ok(ids) => stream::iter(ids.into_iter().map(Ok).collect::<Vec<_>>()),
            Err(e) => stream::iter(vec![Err(e)]),
        }))
    }
}

/// Replays static, in-memory recordings instead of calling out over HTTP —
/// used by orchestrator tests in place of `HttpMarketplaceAdapter`, grounded
/// on the original's committed Amazon Financial Events JSON fixtures.
#[cfg(test)]
pub struct FixtureMarketplaceAdapter {
    recordings: std::collections::HashMap<String, RawFinancialEvents>,
    order_ids: Vec<OrderId>,
}

#[cfg(test)]
impl FixtureMarketplaceAdapter {
    pub fn new() -> Self {
        Self { recordings: std::collections::HashMap::new(), order_ids: Vec::new() }
    }

    pub fn with_recording(mut self, order_id: OrderId, events: RawFinancialEvents) -> Self {
        self.order_ids.push(order_id.clone());
        self.recordings.insert(order_id.to_string(), events);
        self
    }

    /// spec.md §8 scenario (a): single item, all fees known.
    pub fn scenario_a() -> (OrderId, RawFinancialEvents) {
        use rust_decimal_macros::dec;

        let order_id = OrderId::new("123-4567890-1234567").unwrap();
        let events = RawFinancialEvents {
            shipment_event_list: vec![crate::decomposer::RawShipmentEvent {
                posted_date: Some(Utc::now()),
                shipment_item_list: vec![crate::decomposer::RawShipmentItem {
                    seller_sku: "JR-ZS283".into(),
                    quantity_shipped: 1,
                    item_charge_list: vec![crate::decomposer::RawCharge {
                        charge_type: "Principal".into(),
                        charge_amount: crate::decomposer::RawCurrencyAmount {
                            currency_amount: dec!(198.83),
                            currency_code: "EGP".into(),
                        },
                    }],
                    item_fee_list: vec![
                        crate::decomposer::RawFee {
                            fee_type: "FBAPerUnitFulfillmentFee".into(),
                            fee_amount: crate::decomposer::RawCurrencyAmount {
                                currency_amount: dec!(-21.66),
                                currency_code: "EGP".into(),
                            },
                        },
                        crate::decomposer::RawFee {
                            fee_type: "Commission".into(),
                            fee_amount: crate::decomposer::RawCurrencyAmount {
                                currency_amount: dec!(-27.21),
                                currency_code: "EGP".into(),
                            },
                        },
                    ],
                    promotion_list: vec![],
                }],
            }],
        };
        (order_id, events)
    }
}

#[cfg(test)]
#[async_trait]
impl MarketplaceAdapter for FixtureMarketplaceAdapter {
    async fn fetch_financial_events(&self, order_id: &OrderId) -> Result<RawFinancialEvents, MarketplaceError> {
        self.recordings.get(order_id.as_str()).cloned().ok_or_else(|| MarketplaceError::NoFixture(order_id.to_string()))
    }

    fn list_order_ids(&self, _window: DateWindow) -> BoxStream<'_, Result<OrderId, MarketplaceError>> {
        Box::pin(stream::iter(self.order_ids.clone().into_iter().map(Ok)))
    }
}
