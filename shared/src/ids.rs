//! Opaque identifiers threaded through events, stream messages, and logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

fn order_id_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^\d{3}-\d{7}-\d{7}$").expect("static regex is valid"))
}

/// Marketplace order identifier, validated against `DDD-DDDDDDD-DDDDDDD`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderId(String);

impl OrderId {
    pub fn new(raw: impl Into<String>) -> Result<Self, OrderIdError> {
        let raw = raw.into();
        if !order_id_regex().is_match(&raw) {
            return Err(OrderIdError::InvalidFormat(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for OrderId {
    type Error = OrderIdError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OrderId> for String {
    fn from(value: OrderId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderIdError {
    #[error("order id {0:?} does not match the marketplace format DDD-DDDDDDD-DDDDDDD")]
    InvalidFormat(String),
}

/// Per-invocation correlation id, generated once at every public entry point
/// and carried through every emitted event, stream message, and log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Reconstruct an `ExecutionId` read back from storage. Not for minting
    /// new ids — those are always freshly generated at an entry point.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The synthetic aggregate id for run-scoped events (`SyncStarted`/`SyncCompleted`).
    pub fn sync_aggregate_id(&self) -> String {
        format!("sync-{}", self.0)
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A marketplace stock-keeping unit. Opaque beyond non-emptiness.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sku(String);

impl Sku {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Amazon placeholder SKUs of the form `AMZ-<order_id>` carry no real
    /// product linkage — the ERP projector logs and skips sale-line matching
    /// for these (spec.md §4.8 step 2).
    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with("AMZ-")
    }
}

impl fmt::Display for Sku {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_id_validates_format() {
        assert!(OrderId::new("123-4567890-1234567").is_ok());
        assert!(OrderId::new("123-456-1234567").is_err());
        assert!(OrderId::new("not-an-order-id").is_err());
    }

    #[test]
    fn execution_id_forms_sync_aggregate() {
        let id = ExecutionId::new();
        assert!(id.sync_aggregate_id().starts_with("sync-"));
    }

    #[test]
    fn placeholder_sku_detection() {
        assert!(Sku::new("AMZ-123-4567890-1234567").is_placeholder());
        assert!(!Sku::new("JR-ZS283").is_placeholder());
    }
}
