//! Fee taxonomy and the static fee→account mapping table.
//!
//! The mapping table is authoritative and immutable at runtime (spec.md §3,
//! §5 "Static ERP identifier config"): loaded once from `EngineConfig` and
//! passed around by value/`Arc`, never read through a global singleton
//! (teacher's §9 "Global state" design note).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Closed enumeration of known fee kinds (spec.md §3 "Fee taxonomy").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeKind {
    Fulfillment,
    Commission,
    RefundCommission,
    ShippingCharge,
    PromoRebate,
    Storage,
    /// Fallback (a): payment-method fees map to the principal account.
    PaymentMethodFee,
    /// Fallback (b): COD-chargeback / shipping-chargeback / shipping-hb map
    /// to the commission account.
    ShippingChargeback,
}

impl FeeKind {
    /// Map an upstream Amazon `FeeType`/`ChargeType` string to a taxonomy member.
    /// Returns `None` for anything not in the closed set — the caller decides
    /// whether that is a documented fallback, a drop, or a fatal error.
    pub fn from_upstream(raw: &str) -> Option<Self> {
        match raw {
            "FBAPerUnitFulfillmentFee" => Some(Self::Fulfillment),
            "Commission" => Some(Self::Commission),
            "RefundCommission" => Some(Self::RefundCommission),
            "ShippingCharge" => Some(Self::ShippingCharge),
            "PROMO_REBATE" => Some(Self::PromoRebate),
            "StorageFee" => Some(Self::Storage),
            "PaymentMethodFee" => Some(Self::PaymentMethodFee),
            "CODChargeback" | "ShippingChargeback" | "ShippingHB" => Some(Self::ShippingChargeback),
            _ => None,
        }
    }
}

/// Odoo account + analytic account pair a fee kind resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMapping {
    pub account_id: u32,
    pub analytic_account_id: Option<u32>,
}

impl AccountMapping {
    pub fn new(account_id: u32, analytic_account_id: Option<u32>) -> Result<Self, FeeTableError> {
        if account_id == 0 {
            return Err(FeeTableError::InvalidAccountId(account_id));
        }
        if analytic_account_id == Some(0) {
            return Err(FeeTableError::InvalidAccountId(0));
        }
        Ok(Self { account_id, analytic_account_id })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeeTableError {
    #[error("account id must be non-zero, got {0}")]
    InvalidAccountId(u32),
    #[error("fee table is missing a mapping for {0:?}")]
    MissingMapping(FeeKind),
}

/// Immutable fee→account mapping table, frozen after load (spec.md §6 "Configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeTable(HashMap<FeeKind, AccountMapping>);

impl FeeTable {
    pub fn new(mappings: HashMap<FeeKind, AccountMapping>) -> Self {
        Self(mappings)
    }

    pub fn resolve(&self, kind: FeeKind) -> Result<AccountMapping, FeeTableError> {
        self.0.get(&kind).copied().ok_or(FeeTableError::MissingMapping(kind))
    }

    /// Principal account, used for the `PaymentMethodFee` fallback.
    pub fn principal_mapping(&self) -> Result<AccountMapping, FeeTableError> {
        self.resolve(FeeKind::PaymentMethodFee)
    }

    /// Commission account, used for the shipping-chargeback fallback.
    pub fn commission_mapping(&self) -> Result<AccountMapping, FeeTableError> {
        self.resolve(FeeKind::Commission)
    }
}
