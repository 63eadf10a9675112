//! HTTP error response conversion
//!
//! **Handler pattern:** return `Result<impl IntoResponse, HttpAppError>` and let `?` turn
//! any `AppError` into a `{code, detail, status_code}` body with the right status.

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    extract::{FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use keystone_core::{AppError, ErrorMetadata, LogLevel};
use keystone_infra::ErrorResponse;
use serde::de::DeserializeOwned;

/// Wrapper so `IntoResponse` can be implemented for the core error type (orphan rule).
#[derive(Debug)]
pub struct HttpAppError(pub AppError);

impl From<AppError> for HttpAppError {
    fn from(err: AppError) -> Self {
        HttpAppError(err)
    }
}

impl From<anyhow::Error> for HttpAppError {
    fn from(err: anyhow::Error) -> Self {
        HttpAppError(AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        })
    }
}

/// JSON body deserialization failures become `invalid_input`.
impl From<JsonRejection> for HttpAppError {
    fn from(rejection: JsonRejection) -> Self {
        HttpAppError(AppError::InvalidInput(format!(
            "Invalid request body: {}",
            rejection.body_text()
        )))
    }
}

impl From<PathRejection> for HttpAppError {
    fn from(rejection: PathRejection) -> Self {
        HttpAppError(AppError::InvalidInput(format!(
            "Invalid path parameter: {}",
            rejection.body_text()
        )))
    }
}

impl From<QueryRejection> for HttpAppError {
    fn from(rejection: QueryRejection) -> Self {
        HttpAppError(AppError::InvalidInput(format!(
            "Invalid query string: {}",
            rejection.body_text()
        )))
    }
}

/// JSON body extractor that answers malformed bodies with the standard error shape.
#[derive(Debug, Clone, Copy)]
pub struct ValidatedJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = HttpAppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(inner) = Json::<T>::from_request(req, state)
            .await
            .map_err(HttpAppError::from)?;
        Ok(ValidatedJson(inner))
    }
}

fn log_error(error: &AppError) {
    let error_type = error.error_type();
    match error.log_level() {
        LogLevel::Debug => {
            tracing::debug!(error = %error, error_type = error_type, "Request failed");
        }
        LogLevel::Warn => {
            tracing::warn!(error = %error, error_type = error_type, "Request failed");
        }
        LogLevel::Error => {
            tracing::error!(error = %error, error_type = error_type, "Request failed");
        }
    }
}

fn is_production_env() -> bool {
    std::env::var("ENVIRONMENT")
        .map(|env| matches!(env.to_lowercase().as_str(), "production" | "prod"))
        .unwrap_or(false)
}

/// Build the body for an error. Outside production, non-sensitive errors carry their
/// cause chain under `extra_data.details`.
pub fn error_body(error: &AppError, expose_details: bool) -> ErrorResponse {
    let body = ErrorResponse::new(
        error.error_code(),
        error.client_message(),
        error.http_status_code(),
    );
    if expose_details && !error.is_sensitive() {
        body.with_extra_data(serde_json::json!({
            "error_type": error.error_type(),
            "details": error.detailed_message(),
        }))
    } else {
        body
    }
}

impl IntoResponse for HttpAppError {
    fn into_response(self) -> Response {
        let app_error = &self.0;
        let status = StatusCode::from_u16(app_error.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        log_error(app_error);

        let body = error_body(app_error, !is_production_env());
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_locked_user_maps_to_forbidden() {
        let body = error_body(&AppError::UserLocked, false);
        assert_eq!(body.code, "user_locked");
        assert_eq!(body.status_code, 403);
        assert!(body.extra_data.is_none());
    }

    #[test]
    fn test_sensitive_errors_never_expose_details() {
        let body = error_body(&AppError::Internal("pool exhausted".to_string()), true);
        assert_eq!(body.status_code, 500);
        assert_eq!(body.detail, "Internal server error");
        assert!(body.extra_data.is_none());
    }

    #[test]
    fn test_refund_error_detail_names_amounts() {
        let error = AppError::TotalRefundRequestedTooLarge {
            requested: dec!(150),
            refundable: dec!(100),
        };
        let body = error_body(&error, true);
        assert_eq!(body.code, "total_refund_requested_too_large");
        assert_eq!(body.status_code, 400);
        assert!(body.detail.contains("150"));
        let extra = body.extra_data.unwrap();
        assert_eq!(extra["error_type"], "TotalRefundRequestedTooLarge");
    }

    #[test]
    fn test_error_response_shape() {
        let body = error_body(&AppError::NotFound("bill 42".to_string()), false);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "not_found");
        assert_eq!(json["detail"], "bill 42");
        assert_eq!(json["status_code"], 404);
        assert!(json.get("extra_data").is_none());
    }
}
