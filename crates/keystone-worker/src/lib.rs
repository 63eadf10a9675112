//! Keystone background work
//!
//! Three loops share one shutdown signal:
//! - [`delivery`]: leases queued notifications and sends them through the channel
//!   transports, retrying with capped exponential backoff.
//! - [`reconciler`]: resolves gateway payments left PENDING by a timeout and replays the
//!   per-tenant settlement report.
//! - [`installments`]: charges payment-plan installments that fall due.

pub mod context;
pub mod delivery;
pub mod installments;
pub mod periodic;
pub mod reconciler;

pub use context::WorkerContext;
pub use delivery::{DeliveryConfig, DeliveryReport, NotificationDispatcher};
pub use installments::InstallmentJob;
pub use periodic::{PeriodicJob, WorkerHandle};
pub use reconciler::ReconcileJob;
