pub mod api;
pub mod ws;

pub use api::api_routes;
pub use ws::ws_handler;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use nodesync_core::SyncError;
use tracing::error;

/// A [`SyncError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            SyncError::Validation(_) | SyncError::InvalidInput(_) | SyncError::Crdt(_) => {
                StatusCode::BAD_REQUEST
            }
            SyncError::Permission(_) => StatusCode::FORBIDDEN,
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(self.0.to_serializable())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (SyncError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (SyncError::Permission("x".into()), StatusCode::FORBIDDEN),
            (SyncError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                SyncError::ConcurrencyConflict {
                    id: "n".into(),
                    expected: 1,
                },
                StatusCode::CONFLICT,
            ),
            (SyncError::NoConfigDir, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
