//! Value types shared between the sync engine's binary and library code:
//! money, identifiers, the fee taxonomy, financial breakdowns, the order
//! aggregate shape, and domain events. No I/O lives in this crate.

pub mod event;
pub mod fee;
pub mod financial;
pub mod ids;
pub mod money;
pub mod order;
