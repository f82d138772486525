//! Turns a raw marketplace financial-event payload into a balance-checked
//! `FinancialBreakdown`.
//!
//! Grounded directly on
//! `examples/original_source/core/infrastructure/adapters/amazon/fee_mapper.py`
//! (`AmazonFeeMapper.parse_financial_events` / `calculate_sku_breakdown`):
//! same iteration order (shipment events, then shipment items, then
//! charge/fee/promotion lists), same sign conventions, same two documented
//! fallbacks.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use shared::fee::{FeeKind, FeeTable, FeeTableError};
use shared::financial::{FinancialBreakdown, FinancialLine, LineType, SkuBreakdown};
use shared::ids::{OrderId, Sku};
use shared::money::{Currency, CurrencyError, Money, MoneyError};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize)]
pub struct RawFinancialEvents {
    #[serde(default, rename = "ShipmentEventList")]
    pub shipment_event_list: Vec<RawShipmentEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawShipmentEvent {
    #[serde(rename = "PostedDate")]
    pub posted_date: Option<DateTime<Utc>>,
    #[serde(default, rename = "ShipmentItemList")]
    pub shipment_item_list: Vec<RawShipmentItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawShipmentItem {
    #[serde(rename = "SellerSKU")]
    pub seller_sku: String,
    #[serde(default = "default_quantity_shipped", rename = "QuantityShipped")]
    pub quantity_shipped: u32,
    #[serde(default, rename = "ItemChargeList")]
    pub item_charge_list: Vec<RawCharge>,
    #[serde(default, rename = "ItemFeeList")]
    pub item_fee_list: Vec<RawFee>,
    #[serde(default, rename = "PromotionList")]
    pub promotion_list: Vec<RawPromotion>,
}

fn default_quantity_shipped() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCurrencyAmount {
    #[serde(rename = "CurrencyAmount")]
    pub currency_amount: Decimal,
    #[serde(rename = "CurrencyCode")]
    pub currency_code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCharge {
    #[serde(rename = "ChargeType")]
    pub charge_type: String,
    #[serde(rename = "ChargeAmount")]
    pub charge_amount: RawCurrencyAmount,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFee {
    #[serde(rename = "FeeType")]
    pub fee_type: String,
    #[serde(rename = "FeeAmount")]
    pub fee_amount: RawCurrencyAmount,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPromotion {
    #[serde(rename = "PromotionAmount")]
    pub promotion_amount: RawCurrencyAmount,
}

#[derive(Debug, thiserror::Error)]
pub enum DecomposerError {
    #[error("malformed financial-event payload for order {order_id}: {detail}")]
    MalformedPayload { order_id: String, detail: String },
    #[error("mixed currencies in one order's principal: {0} then {1}")]
    MixedCurrency(Currency, Currency),
    #[error(transparent)]
    Currency(#[from] CurrencyError),
    #[error(transparent)]
    Money(#[from] MoneyError),
    #[error(transparent)]
    FeeTable(#[from] FeeTableError),
    #[error("balance violation for order {order_id}: computed net {computed}, expected {expected}, diff {diff}")]
    BalanceViolation { order_id: String, computed: Decimal, expected: Decimal, diff: Decimal },
}

/// Decompose a raw payload into a `FinancialBreakdown` (spec.md §4.2).
///
/// `expected_net_proceeds`, when supplied by the caller (e.g. an
/// independently reported order total from the marketplace), is
/// cross-checked against the computed net proceeds within `tolerance`;
/// a present-but-dropped fee surfaces here as `BalanceViolation`. When
/// `None`, the invariant holds trivially — net proceeds is computed from
/// the same lines it is checked against.
pub fn decompose(
    order_id: &OrderId,
    raw: &RawFinancialEvents,
    fee_table: &FeeTable,
    tolerance: Decimal,
    expected_net_proceeds: Option<Decimal>,
) -> Result<FinancialBreakdown, DecomposerError> {
    if raw.shipment_event_list.is_empty() {
        tracing::warn!(order_id = %order_id, "no shipment events in financial-event payload");
    }

    let mut principal = Decimal::ZERO;
    let mut currency: Option<Currency> = None;
    let mut posted_date: Option<DateTime<Utc>> = None;
    let mut lines = Vec::new();

    for shipment in &raw.shipment_event_list {
        if posted_date.is_none() {
            posted_date = shipment.posted_date;
        }

        for item in &shipment.shipment_item_list {
            let sku = Sku::new(item.seller_sku.clone());

            for charge in &item.item_charge_list {
                let item_currency = parse_currency(&charge.charge_amount.currency_code, order_id)?;
                record_currency(&mut currency, item_currency, order_id)?;
                let amount = charge.charge_amount.currency_amount;

                match charge.charge_type.as_str() {
                    "Principal" => {
                        principal += amount;
                        tracing::info!(order_id = %order_id, %sku, %amount, "extracted principal");
                    }
                    "ShippingCharge" => {
                        push_line(
                            &mut lines,
                            LineType::Charge,
                            amount,
                            item_currency,
                            "Amazon Shipping Charge".into(),
                            Some(sku.clone()),
                            Some(FeeKind::ShippingCharge),
                            fee_table.resolve(FeeKind::ShippingCharge)?,
                        );
                    }
                    "PaymentMethodFee" => {
                        // Fallback (a): payment-method fees map to the principal account.
                        push_line(
                            &mut lines,
                            LineType::Charge,
                            amount,
                            item_currency,
                            "Amazon Payment Method Fee".into(),
                            Some(sku.clone()),
                            Some(FeeKind::PaymentMethodFee),
                            fee_table.principal_mapping()?,
                        );
                    }
                    other => {
                        tracing::warn!(order_id = %order_id, charge_type = other, "unknown charge type, dropped");
                    }
                }
            }

            for fee in &item.item_fee_list {
                let item_currency = parse_currency(&fee.fee_amount.currency_code, order_id)?;
                record_currency(&mut currency, item_currency, order_id)?;
                let amount = fee.fee_amount.currency_amount;

                if amount.is_zero() {
                    continue;
                }

                if let Some(kind) = FeeKind::from_upstream(&fee.fee_type) {
                    push_line(
                        &mut lines,
                        LineType::Fee,
                        amount,
                        item_currency,
                        format!("Amazon {}", fee.fee_type),
                        Some(sku.clone()),
                        Some(kind),
                        fee_table.resolve(kind)?,
                    );
                } else if matches!(fee.fee_type.as_str(), "CODChargeback" | "ShippingChargeback" | "ShippingHB") {
                    // Fallback (b): shipping-chargeback / shipping-hb / COD chargeback
                    // map to the commission account.
                    push_line(
                        &mut lines,
                        LineType::Fee,
                        amount,
                        item_currency,
                        format!("Amazon {}", fee.fee_type),
                        Some(sku.clone()),
                        None,
                        fee_table.commission_mapping()?,
                    );
                } else {
                    tracing::warn!(
                        order_id = %order_id, fee_type = %fee.fee_type, %amount,
                        "unknown non-zero fee type, dropped — balance check is the safety net"
                    );
                }
            }

            for promo in &item.promotion_list {
                let item_currency = parse_currency(&promo.promotion_amount.currency_code, order_id)?;
                record_currency(&mut currency, item_currency, order_id)?;
                let amount = promo.promotion_amount.currency_amount;
                if amount.is_zero() {
                    continue;
                }
                push_line(
                    &mut lines,
                    LineType::Promo,
                    amount,
                    item_currency,
                    "Amazon Promotion Rebate".into(),
                    Some(sku.clone()),
                    Some(FeeKind::PromoRebate),
                    fee_table.resolve(FeeKind::PromoRebate)?,
                );
            }
        }
    }

    let currency = currency.ok_or_else(|| DecomposerError::MalformedPayload {
        order_id: order_id.to_string(),
        detail: "no currency-bearing charge, fee, or promotion found".into(),
    })?;

    let total_lines: Decimal = lines.iter().map(|l: &FinancialLine| l.amount.amount()).sum();
    let net_proceeds_amount = principal + total_lines;

    if let Some(expected) = expected_net_proceeds {
        let diff = (net_proceeds_amount - expected).abs();
        if diff > tolerance {
            return Err(DecomposerError::BalanceViolation {
                order_id: order_id.to_string(),
                computed: net_proceeds_amount,
                expected,
                diff,
            });
        }
    }

    let per_sku = sku_breakdown(raw, currency);

    Ok(FinancialBreakdown {
        principal: Money::new(principal, currency)?,
        lines,
        net_proceeds: Money::signed(net_proceeds_amount, currency),
        posted_date: posted_date.unwrap_or_else(Utc::now),
        per_sku,
    })
}

/// Per-SKU view of the same payload (spec.md §4.2 "Per-SKU view"), ordered
/// by SKU for deterministic ERP invoice-line order across runs.
pub fn sku_breakdown(
    raw: &RawFinancialEvents,
    currency: Currency,
) -> BTreeMap<Sku, SkuBreakdown> {
    let mut acc: BTreeMap<Sku, (Decimal, Decimal, Decimal, Decimal, u32)> = BTreeMap::new();

    for shipment in &raw.shipment_event_list {
        for item in &shipment.shipment_item_list {
            let sku = Sku::new(item.seller_sku.clone());
            let entry =
                acc.entry(sku).or_insert((Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, 0));
            entry.4 += item.quantity_shipped;

            for charge in &item.item_charge_list {
                match charge.charge_type.as_str() {
                    "Principal" => entry.0 += charge.charge_amount.currency_amount,
                    "ShippingCharge" | "PaymentMethodFee" => entry.1 += charge.charge_amount.currency_amount,
                    _ => {}
                }
            }
            for fee in &item.item_fee_list {
                entry.2 += fee.fee_amount.currency_amount;
            }
            for promo in &item.promotion_list {
                entry.3 += promo.promotion_amount.currency_amount;
            }
        }
    }

    acc.into_iter()
        .map(|(sku, (principal, charges, fees, promos, quantity))| {
            let total_sales = principal + charges;
            let net = total_sales + fees + promos;
            (
                sku,
                SkuBreakdown {
                    principal: Money::signed(principal, currency),
                    charges: Money::signed(charges, currency),
                    fees: Money::signed(fees, currency),
                    promos: Money::signed(promos, currency),
                    total_sales: Money::signed(total_sales, currency),
                    net: Money::signed(net, currency),
                    quantity,
                },
            )
        })
        .collect()
}

fn parse_currency(code: &str, order_id: &OrderId) -> Result<Currency, DecomposerError> {
    Currency::new(code).map_err(|_| DecomposerError::MalformedPayload {
        order_id: order_id.to_string(),
        detail: format!("invalid currency code {code:?}"),
    })
}

fn record_currency(slot: &mut Option<Currency>, found: Currency, order_id: &OrderId) -> Result<(), DecomposerError> {
    match slot {
        None => {
            *slot = Some(found);
            Ok(())
        }
        Some(existing) if *existing == found => Ok(()),
        Some(existing) => {
            let err = DecomposerError::MixedCurrency(*existing, found);
            tracing::error!(order_id = %order_id, "{err}");
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn push_line(
    lines: &mut Vec<FinancialLine>,
    line_type: LineType,
    amount: Decimal,
    currency: Currency,
    description: String,
    sku: Option<Sku>,
    fee_kind: Option<FeeKind>,
    account: shared::fee::AccountMapping,
) {
    if amount.is_zero() {
        return;
    }
    lines.push(FinancialLine {
        line_type,
        amount: Money::signed(amount, currency),
        description,
        sku,
        fee_kind,
        account: Some(account),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use shared::fee::AccountMapping;
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

    fn single_item_payload() -> RawFinancialEvents {
        RawFinancialEvents {
            shipment_event_list: vec![RawShipmentEvent {
                posted_date: Some(Utc::now()),
                shipment_item_list: vec![RawShipmentItem {
                    seller_sku: "JR-ZS283".into(),
                    quantity_shipped: 1,
                    item_charge_list: vec![RawCharge {
                        charge_type: "Principal".into(),
                        charge_amount: RawCurrencyAmount { currency_amount: dec!(198.83), currency_code: "EGP".into() },
                    }],
                    item_fee_list: vec![
                        RawFee {
                            fee_type: "FBAPerUnitFulfillmentFee".into(),
                            fee_amount: RawCurrencyAmount { currency_amount: dec!(-21.66), currency_code: "EGP".into() },
                        },
                        RawFee {
                            fee_type: "Commission".into(),
                            fee_amount: RawCurrencyAmount { currency_amount: dec!(-27.21), currency_code: "EGP".into() },
                        },
                    ],
                    promotion_list: vec![],
                }],
            }],
        }
    }

    #[test]
    fn scenario_a_single_item_order_all_fees_known() {
        let order_id = OrderId::new("123-4567890-1234567").unwrap();
        let table = test_fee_table();
        let breakdown = decompose(&order_id, &single_item_payload(), &table, dec!(0.01), None).unwrap();

        assert_eq!(breakdown.principal.amount(), dec!(198.83));
        assert_eq!(breakdown.lines.len(), 2);
        assert_eq!(breakdown.net_proceeds.amount(), dec!(149.96));
        assert!(breakdown.is_balanced(dec!(0.01)));
    }

    #[test]
    fn scenario_b_multi_item_two_skus() {
        let order_id = OrderId::new("123-4567890-1234567").unwrap();
        let table = test_fee_table();
        let payload = RawFinancialEvents {
            shipment_event_list: vec![RawShipmentEvent {
                posted_date: Some(Utc::now()),
                shipment_item_list: vec![
                    RawShipmentItem {
                        seller_sku: "SKU-A".into(),
                        quantity_shipped: 1,
                        item_charge_list: vec![RawCharge {
                            charge_type: "Principal".into(),
                            charge_amount: RawCurrencyAmount { currency_amount: dec!(100.00), currency_code: "EGP".into() },
                        }],
                        item_fee_list: vec![],
                        promotion_list: vec![],
                    },
                    RawShipmentItem {
                        seller_sku: "SKU-B".into(),
                        quantity_shipped: 1,
                        item_charge_list: vec![
                            RawCharge {
                                charge_type: "Principal".into(),
                                charge_amount: RawCurrencyAmount { currency_amount: dec!(200.00), currency_code: "EGP".into() },
                            },
                            RawCharge {
                                charge_type: "ShippingCharge".into(),
                                charge_amount: RawCurrencyAmount { currency_amount: dec!(15.00), currency_code: "EGP".into() },
                            },
                        ],
                        item_fee_list: vec![RawFee {
                            fee_type: "Commission".into(),
                            fee_amount: RawCurrencyAmount { currency_amount: dec!(-30.00), currency_code: "EGP".into() },
                        }],
                        promotion_list: vec![],
                    },
                ],
            }],
        };

        let breakdown = decompose(&order_id, &payload, &table, dec!(0.01), None).unwrap();
        assert_eq!(breakdown.principal.amount(), dec!(300.00));
        assert_eq!(breakdown.net_proceeds.amount(), dec!(285.00));

        let skus = sku_breakdown(&payload, Currency::new("EGP").unwrap());
        assert_eq!(skus.len(), 2);
        assert_eq!(skus[&Sku::new("SKU-A")].principal.amount(), dec!(100.00));
        assert_eq!(skus[&Sku::new("SKU-B")].principal.amount(), dec!(200.00));
    }

    #[test]
    fn scenario_f_balance_violation_when_a_present_fee_is_omitted() {
        let order_id = OrderId::new("123-4567890-1234567").unwrap();
        let table = test_fee_table();
        // Payload omits the commission fee that an authoritative upstream total accounts for.
        let payload = RawFinancialEvents {
            shipment_event_list: vec![RawShipmentEvent {
                posted_date: Some(Utc::now()),
                shipment_item_list: vec![RawShipmentItem {
                    seller_sku: "JR-ZS283".into(),
                    quantity_shipped: 1,
                    item_charge_list: vec![RawCharge {
                        charge_type: "Principal".into(),
                        charge_amount: RawCurrencyAmount { currency_amount: dec!(198.83), currency_code: "EGP".into() },
                    }],
                    item_fee_list: vec![RawFee {
                        fee_type: "FBAPerUnitFulfillmentFee".into(),
                        fee_amount: RawCurrencyAmount { currency_amount: dec!(-21.66), currency_code: "EGP".into() },
                    }],
                    promotion_list: vec![],
                }],
            }],
        };

        let err = decompose(&order_id, &payload, &table, dec!(0.01), Some(dec!(149.96))).unwrap_err();
        assert!(matches!(err, DecomposerError::BalanceViolation { .. }));
    }

    #[test]
    fn unknown_fee_type_is_dropped_not_fatal() {
        let order_id = OrderId::new("123-4567890-1234567").unwrap();
        let table = test_fee_table();
        let mut payload = single_item_payload();
        payload.shipment_event_list[0].shipment_item_list[0].item_fee_list.push(RawFee {
            fee_type: "SomeBrandNewFeeType".into(),
            fee_amount: RawCurrencyAmount { currency_amount: dec!(-5.00), currency_code: "EGP".into() },
        });

        let breakdown = decompose(&order_id, &payload, &table, dec!(0.01), None).unwrap();
        assert_eq!(breakdown.lines.len(), 2, "unknown fee type must be dropped, not appended");
    }

    #[test]
    fn mixed_currency_within_one_order_is_rejected() {
        let order_id = OrderId::new("123-4567890-1234567").unwrap();
        let table = test_fee_table();
        let mut payload = single_item_payload();
        payload.shipment_event_list[0].shipment_item_list[0].item_fee_list[0].fee_amount.currency_code = "USD".into();

        let err = decompose(&order_id, &payload, &table, dec!(0.01), None).unwrap_err();
        assert!(matches!(err, DecomposerError::MixedCurrency(_, _)));
    }
}
