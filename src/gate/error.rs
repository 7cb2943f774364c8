//! HTTP mapping of gateway errors

use crate::Error;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

impl Error {
    /// HTTP status reported to callers
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidKey => StatusCode::UNAUTHORIZED,
            Error::ForbiddenModel(_) => StatusCode::FORBIDDEN,
            Error::UnknownModel(_) | Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::BadRequest(_) | Error::ConfigValidation { .. } => StatusCode::BAD_REQUEST,
            Error::DuplicateKey => StatusCode::CONFLICT,
            Error::KeyGenerationExhausted
            | Error::Io(_)
            | Error::Json(_)
            | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// OpenAI-shaped error body
pub fn error_body(status: StatusCode, message: &str, category: &str) -> serde_json::Value {
    json!({
        "error": {
            "message": message,
            "type": category,
            "code": status.as_u16(),
        }
    })
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(category = self.category(), "{}", self);
        }
        (status, Json(error_body(status, &self.to_string(), self.category()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UpstreamError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::InvalidKey.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::ForbiddenModel("m".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(Error::UnknownModel("m".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(Error::DuplicateKey.status_code(), StatusCode::CONFLICT);
        assert_eq!(Error::invalid("m", "bad").status_code(), StatusCode::BAD_REQUEST);
        for upstream in [
            UpstreamError::AuthFailed { status: 401, message: String::new() },
            UpstreamError::RateLimited { message: String::new() },
            UpstreamError::Unavailable { message: String::new() },
            UpstreamError::malformed("x", "y"),
        ] {
            assert_eq!(Error::from(upstream).status_code(), StatusCode::BAD_GATEWAY);
        }
    }

    #[test]
    fn test_error_body_shape() {
        let body = error_body(StatusCode::FORBIDDEN, "nope", "model_not_permitted");
        assert_eq!(body["error"]["type"], "model_not_permitted");
        assert_eq!(body["error"]["code"], 403);
        assert_eq!(body["error"]["message"], "nope");
    }
}
