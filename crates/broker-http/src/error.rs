use axum::{http::StatusCode, response::IntoResponse, Json};
use broker_core::BrokerError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Translates `BrokerError` into the HTTP status table from the error
/// handling design: InvalidInput/NotFound/Unauthorized/Conflict/
/// StoreUnavailable map directly; anything else is `Internal`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        let status = match &err {
            BrokerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            BrokerError::Conflict(_) => StatusCode::CONFLICT,
            BrokerError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(event = "broker.http.internal_error", error = %err, "internal error");
        }

        Self {
            status,
            message: err.message().to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}
