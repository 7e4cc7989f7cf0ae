//! HTTP error responses
//!
//! Error responses carry a JSON body: `{"status": 404, "message": "..."}`

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nimbus_common::{Error, ObjectKeyError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Result type of HTTP handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// An [`Error`] on its way to the client
#[derive(Debug)]
pub struct ApiError(pub Error);

/// JSON body of an error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: u16,
    pub message: String,
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<ObjectKeyError> for ApiError {
    fn from(err: ObjectKeyError) -> Self {
        Self(Error::from(err))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self(Error::from(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.0.to_string();
        if status.is_server_error() {
            error!("{message}");
        } else {
            debug!("{status}: {message}");
        }
        let body = ErrorBody {
            status: status.as_u16(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_body() {
        let err = ApiError(Error::ObjectNotFound {
            bucket: "lb".into(),
            object: "missing".into(),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(body.status, 404);
        assert!(body.message.contains("lb/missing"));
    }

    #[test]
    fn test_status_mapping() {
        let status = |e: Error| ApiError(e).status();
        assert_eq!(status(Error::Forbidden("/x".into())), StatusCode::FORBIDDEN);
        assert_eq!(
            status(Error::invalid_request("bad")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(Error::LockTimeout { key: "b/o".into() }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(status(Error::Aborted), StatusCode::SERVICE_UNAVAILABLE);
    }
}
