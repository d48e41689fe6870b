//! Application layer orchestrating confirmation and allocation.
//!
//! `Reconciler` and `Allocator` carry the exactly-once rules; `PaymentEngine`
//! is the surface every inbound path (webhook, poll, manual recheck, sweep)
//! goes through.

pub mod allocator;
pub mod engine;
pub mod reconciler;

pub use allocator::{Allocation, Allocator};
pub use engine::{Confirmation, ImportReport, PaymentEngine, StatusView, SweepReport, Trigger};
pub use reconciler::{AllocationOutcome, ReconcileOutcome, Reconciler};
