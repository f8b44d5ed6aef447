//! HTTP error conversion for the check-in endpoint, following `dwctl::errors`'
//! "one JSON body shape, status code picked per variant" convention.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FrontendError>;

#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("datastore error: {0}")]
    Datastore(#[from] ranger_datastore::DatastoreError),
    #[error("queue error: {0}")]
    Queue(#[from] ranger_queue::QueueError),
    #[error("routing error: {0}")]
    Router(#[from] ranger_flows::RouterError),
    #[error("foreman error: {0}")]
    Foreman(#[from] ranger_foreman::ForemanError),
    #[error("message encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("unknown client `{0}`")]
    UnknownClient(String),
}

impl FrontendError {
    fn status_code(&self) -> StatusCode {
        match self {
            FrontendError::UnknownClient(_) => StatusCode::NOT_FOUND,
            FrontendError::Datastore(_) | FrontendError::Queue(_) | FrontendError::Router(_) | FrontendError::Foreman(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            FrontendError::Encoding(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for FrontendError {
    fn into_response(self) -> Response {
        match &self {
            FrontendError::UnknownClient(_) | FrontendError::Encoding(_) => {
                tracing::debug!("client error: {self}");
            }
            _ => tracing::error!("check-in handler failed: {self}"),
        }
        let status = self.status_code();
        (status, axum::response::Json(json!({ "error": status.as_str(), "message": self.to_string() }))).into_response()
    }
}
