//! Pure financial value objects. No I/O, no decomposition logic — that
//! lives in `sync_engine::decomposer`. This mirrors the teacher's split
//! between `shared::order` (value types) and `edge-server::orders` (logic).

use crate::fee::{AccountMapping, FeeKind};
use crate::ids::Sku;
use crate::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a `FinancialLine` represents. Constrains sign conventions:
/// fees and promos are negative, charges and principal are positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineType {
    Fee,
    Charge,
    Promo,
    Principal,
}

/// A single financial component of an order's breakdown. Each line maps
/// 1:1 to an ERP invoice line (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialLine {
    pub line_type: LineType,
    /// Signed amount — negative for fees/promos, positive for charges/principal.
    pub amount: Money,
    pub description: String,
    pub sku: Option<Sku>,
    pub fee_kind: Option<FeeKind>,
    pub account: Option<AccountMapping>,
}

/// Complete financial decomposition of an order. Carries no ERP
/// identifiers — it is a pure domain value (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialBreakdown {
    pub principal: Money,
    pub lines: Vec<FinancialLine>,
    pub net_proceeds: Money,
    pub posted_date: DateTime<Utc>,
    /// Per-SKU view (spec.md §4.2), carried alongside the aggregate lines so
    /// it survives event-log replay for the ERP projector's revenue-line
    /// construction (spec.md §4.8 step 4).
    pub per_sku: std::collections::BTreeMap<Sku, SkuBreakdown>,
}

impl FinancialBreakdown {
    /// Check the Balance invariant: `principal + Σ lines = net_proceeds`,
    /// within `tolerance` (spec.md §3, §8 invariant 1).
    pub fn is_balanced(&self, tolerance: rust_decimal::Decimal) -> bool {
        let total_lines: rust_decimal::Decimal = self.lines.iter().map(|l| l.amount.amount()).sum();
        let computed = self.principal.amount() + total_lines;
        (computed - self.net_proceeds.amount()).abs() <= tolerance
    }

    pub fn fees(&self) -> impl Iterator<Item = &FinancialLine> {
        self.lines.iter().filter(|l| l.line_type == LineType::Fee)
    }

    pub fn charges(&self) -> impl Iterator<Item = &FinancialLine> {
        self.lines.iter().filter(|l| l.line_type == LineType::Charge)
    }

    pub fn promos(&self) -> impl Iterator<Item = &FinancialLine> {
        self.lines.iter().filter(|l| l.line_type == LineType::Promo)
    }
}

/// Per-SKU financial view, used by the ERP projector to attach revenue
/// lines to the correct sale-order line (spec.md §4.2 "Per-SKU view").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkuBreakdown {
    pub principal: Money,
    pub charges: Money,
    pub fees: Money,
    pub promos: Money,
    pub total_sales: Money,
    pub net: Money,
    /// Units shipped for this SKU (Amazon's `QuantityShipped`), used to
    /// derive `price_unit = principal / quantity` for the invoice revenue
    /// line (spec.md §4.8 step 4).
    pub quantity: u32,
}

/// An order line item (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub sku: Sku,
    pub title: String,
    pub quantity: u32,
    pub unit_price: Money,
    pub total: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderItemError {
    #[error("quantity must be positive, got {0}")]
    NonPositiveQuantity(u32),
    #[error("unit_price × quantity must equal total: {unit_price} × {quantity} != {total}")]
    TotalMismatch { unit_price: String, quantity: u32, total: String },
}

impl OrderItem {
    pub fn new(
        sku: Sku,
        title: String,
        quantity: u32,
        unit_price: Money,
        total: Money,
    ) -> Result<Self, OrderItemError> {
        if quantity == 0 {
            return Err(OrderItemError::NonPositiveQuantity(quantity));
        }
        let expected = unit_price.amount() * rust_decimal::Decimal::from(quantity);
        if expected != total.amount() || unit_price.currency() != total.currency() {
            return Err(OrderItemError::TotalMismatch {
                unit_price: unit_price.to_string(),
                quantity,
                total: total.to_string(),
            });
        }
        Ok(Self { sku, title, quantity, unit_price, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;
    use rust_decimal_macros::dec;

    fn egp() -> Currency {
        Currency::new("EGP").unwrap()
    }

    #[test]
    fn balance_invariant_holds_within_tolerance() {
        let principal = Money::new(dec!(198.83), egp()).unwrap();
        let net = Money::new(dec!(149.96), egp()).unwrap();
        let lines = vec![
            FinancialLine {
                line_type: LineType::Fee,
                amount: Money::signed(dec!(-21.66), egp()),
                description: "Amazon FBAPerUnitFulfillmentFee".into(),
                sku: Some(Sku::new("JR-ZS283")),
                fee_kind: Some(FeeKind::Fulfillment),
                account: None,
            },
            FinancialLine {
                line_type: LineType::Fee,
                amount: Money::signed(dec!(-27.21), egp()),
                description: "Amazon Commission".into(),
                sku: Some(Sku::new("JR-ZS283")),
                fee_kind: Some(FeeKind::Commission),
                account: None,
            },
        ];
        let breakdown = FinancialBreakdown {
            principal,
            lines,
            net_proceeds: net,
            posted_date: Utc::now(),
            per_sku: std::collections::BTreeMap::new(),
        };
        assert!(breakdown.is_balanced(dec!(0.01)));
    }

    #[test]
    fn order_item_requires_consistent_total() {
        let unit_price = Money::new(dec!(50.00), egp()).unwrap();
        let total = Money::new(dec!(100.00), egp()).unwrap();
        assert!(OrderItem::new(Sku::new("X"), "Widget".into(), 2, unit_price, total).is_ok());

        let bad_total = Money::new(dec!(99.00), egp()).unwrap();
        assert!(OrderItem::new(Sku::new("X"), "Widget".into(), 2, unit_price, bad_total).is_err());
    }
}
