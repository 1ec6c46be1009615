//! Reconciler / Update Manager: the central state machine that
//! drives a cloud-sourced `DesiredStatus` to a `UnitStatus` across the SM
//! workers registered on this node.

mod engine;
mod plan;
mod registry;

pub use engine::{Reconciler, ReconcilerConfig};
pub use plan::{diff_instances, diff_items, InstanceDiff, ItemPlan, SmDelta};
pub use registry::SmRegistry;
