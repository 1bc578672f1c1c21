//! Monthly quota governance: admission, reservations and reconciliation
//! between the volatile counter and the durable store.

mod governor;
mod reconcile;

pub use governor::{FeatureQuota, QuotaGovernor, QuotaStatus, QuotaSummary, Reservation};
pub use reconcile::{ReconcileQueue, ReconcileReport, Reconciler};
