//! JSON error body
//!
//! The `IntoResponse` mapping from `AppError` lives in `keystone-api` (orphan rule); this
//! is the shape it writes.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// `{code, detail, status_code}`; payment failures may add `extra_data` for the client
/// widget.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Stable machine-readable code such as `user_locked` or `invalid_cvv`.
    pub code: String,
    pub detail: String,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub extra_data: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, detail: impl Into<String>, status_code: u16) -> Self {
        Self {
            code: code.into(),
            detail: detail.into(),
            status_code,
            extra_data: None,
        }
    }

    pub fn with_extra_data(mut self, extra_data: serde_json::Value) -> Self {
        self.extra_data = Some(extra_data);
        self
    }
}
