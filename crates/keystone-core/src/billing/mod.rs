//! Bill calculation
//!
//! A two-level pipeline: each line is priced by [`breakdown::calculate_line`], then
//! [`bill::calculate_bill`] aggregates the lines, applies bill-level rules and the bill tax.
//! Everything here is deterministic and free of I/O so recomputation is idempotent.

pub mod bill;
pub mod breakdown;
pub mod plan;
pub mod rules;
pub mod summary;
pub mod tax;

pub use bill::{calculate_bill, BillTotals};
pub use breakdown::{calculate_line, LineCalculation};
pub use plan::{compute_plan, credit_installment, installment_dates, InstallmentCredit, PlanFigures};
pub use rules::{AppliedAmount, Ledger};
pub use summary::{build_summary, SummaryRow};
pub use tax::TaxRule;
