use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    serde_json::json,
};

/// Control API error taxonomy. All responses are JSON.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("{0}")]
    BadRequest(String),

    /// Deliberately generic: the expected signature is never leaked.
    #[error("authentication failed")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// 422 with structured, per-field details.
    #[error("validation failed")]
    Unprocessable(serde_json::Value),
}

impl HttpError {
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, json!({ "error": message })),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "authentication failed" }),
            ),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, json!({ "error": message })),
            Self::PayloadTooLarge { limit } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                json!({ "error": format!("request body exceeds {limit} bytes") }),
            ),
            Self::Unprocessable(details) => (StatusCode::UNPROCESSABLE_ENTITY, details),
        };
        (status, Json(body)).into_response()
    }
}
