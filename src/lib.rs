// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::Json;
use serde_json::json;
use std::fmt;
use std::sync::Arc;

pub mod apps {
    #[path = "disease-insights/mod.rs"]
    pub mod disease_insights;
}

pub mod app {
    pub use crate::apps::disease_insights::*;
}

pub mod auth;
pub mod common;
pub mod config;
pub mod gemini;
pub mod model;
pub mod store;

use auth::TokenIssuer;
use gemini::LlmClient;
use model::ModelRegistry;
use store::Store;

/// Shared state handed to every handler.
pub struct AppState {
    /// Users and per-session prediction history.
    pub store: Arc<dyn Store>,
    /// Fitted classifiers, one per supported disease.
    pub models: ModelRegistry,
    /// Remote LLM used for recommendations and chat replies.
    pub llm: Arc<dyn LlmClient>,
    /// Issues and verifies bearer tokens.
    pub tokens: TokenIssuer,
    /// PBKDF2 rounds for newly hashed passwords.
    pub password_rounds: u32,
}

/// Implement IntoResponse for InsightsError.
impl IntoResponse for InsightsError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            InsightsError::GenericError(e) => (StatusCode::BAD_REQUEST, e),
            InsightsError::Unauthorized(e) => (StatusCode::UNAUTHORIZED, e),
            InsightsError::Conflict(e) => (StatusCode::CONFLICT, e),
            InsightsError::StoreError(e) => {
                tracing::error!(detail = %e, "store failure");
                (StatusCode::INTERNAL_SERVER_ERROR, e)
            }
            InsightsError::ModelError(e) => (StatusCode::INTERNAL_SERVER_ERROR, e),
            InsightsError::InternalError(e) => (StatusCode::INTERNAL_SERVER_ERROR, e),
            InsightsError::LlmError(e) => {
                tracing::error!(detail = %e, "llm failure");
                (StatusCode::BAD_GATEWAY, e)
            }
        };
        let body = Json(json!({
            "error": error_message,
        }));
        (status, body).into_response()
    }
}

/// Service errors enum.
#[derive(Debug)]
pub enum InsightsError {
    GenericError(String),
    Unauthorized(String),
    Conflict(String),
    StoreError(String),
    ModelError(String),
    LlmError(String),
    InternalError(String),
}

impl fmt::Display for InsightsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsightsError::GenericError(e) => write!(f, "{e}"),
            InsightsError::Unauthorized(e) => write!(f, "Unauthorized: {e}"),
            InsightsError::Conflict(e) => write!(f, "Conflict: {e}"),
            InsightsError::StoreError(e) => write!(f, "Store error: {e}"),
            InsightsError::ModelError(e) => write!(f, "Model error: {e}"),
            InsightsError::LlmError(e) => write!(f, "LLM error: {e}"),
            InsightsError::InternalError(e) => write!(f, "Internal error: {e}"),
        }
    }
}

impl std::error::Error for InsightsError {}

impl From<mongodb::error::Error> for InsightsError {
    fn from(err: mongodb::error::Error) -> Self {
        InsightsError::StoreError(err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::body::to_bytes;

    async fn error_body(err: InsightsError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let (status, body) =
            error_body(InsightsError::GenericError("No input data provided".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No input data provided");

        let (status, _) = error_body(InsightsError::Unauthorized("Invalid token".into())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = error_body(InsightsError::Conflict("dup".into())).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = error_body(InsightsError::LlmError("quota".into())).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_display_prefixes() {
        assert_eq!(InsightsError::GenericError("x".into()).to_string(), "x");
        assert_eq!(
            InsightsError::StoreError("down".into()).to_string(),
            "Store error: down"
        );
    }
}
