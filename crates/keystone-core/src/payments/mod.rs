//! Payment status mapping and refund validation.

pub mod refund;
pub mod status;

pub use refund::{
    bill_status_after_refund, bill_status_on_initiate, resolve_request_status,
    validate_refund_request, ValidatedRefund, ValidatedRefundLine,
};
pub use status::{
    ensure_transition, parent_after_ledger_refund, parent_after_refund, refund_status, status_after_sale,
    status_from_gateway, RefundMethodology,
};
