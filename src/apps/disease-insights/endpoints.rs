// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::prompts;
use super::types::*;
use crate::auth::{bearer_token, hash_password, verify_password};
use crate::common::{header_str, health_check};
use crate::model::Disease;
use crate::store::{ChatMessage, HistoryUpdate, NewUser, SessionKey, UserRecord};
use crate::{AppState, InsightsError};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{Map, Value};
use std::path::Path as FsPath;
use std::sync::Arc;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{debug, info};

/// Header carrying the client's session id.
pub const SESSION_HEADER: &str = "SessionId";

/// All API routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/sign-in", post(sign_in))
        .route("/api/sign-up", post(sign_up))
        .route("/api/sign-out", post(sign_out))
        .route("/api/predict/:disease", post(predict))
        .route("/api/recommend/:disease", post(recommend))
        .route("/api/chat/:disease", post(chat))
        .route("/api/prediction_history", get(prediction_history))
        .route("/api/session_history", get(session_history))
        .with_state(state)
}

/// API routes plus the built frontend, when `static_dir` exists.
pub fn router_with_frontend(state: Arc<AppState>, static_dir: Option<&FsPath>) -> Router {
    let api = router(state);
    match static_dir.filter(|dir| dir.is_dir()) {
        Some(dir) => {
            info!("Serving frontend from {}", dir.display());
            let index = ServeFile::new(dir.join("index.html"));
            api.fallback_service(ServeDir::new(dir).fallback(index))
        }
        None => api,
    }
}

// ============================================
// Helpers
// ============================================

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Account for a trimmed email. New accounts are stored lower-cased, older
/// ones may keep the case they were registered with.
async fn find_user_by_email(
    state: &AppState,
    email: &str,
) -> Result<Option<UserRecord>, InsightsError> {
    let normalized = email.to_lowercase();
    if let Some(user) = state.store.find_user_by_email(&normalized).await? {
        return Ok(Some(user));
    }
    if normalized == email {
        return Ok(None);
    }
    state.store.find_user_by_email(email).await
}

fn form_object(body: Option<Json<Value>>) -> Result<Map<String, Value>, InsightsError> {
    match body {
        Some(Json(Value::Object(map))) => Ok(map),
        _ => Err(InsightsError::GenericError("No input data provided".to_string())),
    }
}

/// Run CPU-heavy work (password hashing) off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, InsightsError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| InsightsError::InternalError(format!("Worker failed: {e}")))
}

/// Session to persist into, if the request carries a session id and a valid token.
///
/// A token that verifies but is no longer the user's current one is rejected.
async fn session_key(
    state: &AppState,
    headers: &HeaderMap,
    disease: Disease,
) -> Result<Option<SessionKey>, InsightsError> {
    let Some(session_id) = header_str(headers, SESSION_HEADER) else {
        return Ok(None);
    };
    let Some(token) = bearer_token(headers) else {
        return Ok(None);
    };
    let Some(user_id) = state.tokens.verify(token) else {
        debug!("Session {} has no valid token, not persisting", session_id);
        return Ok(None);
    };
    match state.store.find_user_by_id(&user_id).await? {
        Some(user) if user.auth_token == token => Ok(Some(SessionKey {
            session_id: session_id.to_string(),
            user_id,
            disease: disease.as_str().to_string(),
        })),
        _ => Err(InsightsError::Unauthorized("Invalid token".to_string())),
    }
}

/// User owning the bearer token, which must be their current one.
async fn authenticated_user(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<UserRecord, InsightsError> {
    let invalid = || InsightsError::Unauthorized("Invalid token".to_string());
    let token = bearer_token(headers).ok_or_else(invalid)?;
    let user_id = state.tokens.verify(token).ok_or_else(invalid)?;
    let user = state
        .store
        .find_user_by_id(&user_id)
        .await?
        .ok_or_else(invalid)?;
    if user.auth_token != token {
        return Err(invalid());
    }
    Ok(user)
}

async fn start_session(state: &AppState, user: &UserRecord) -> Result<String, InsightsError> {
    let token = state.tokens.issue(&user.id)?;
    state.store.set_auth_token(&user.id, &token).await?;
    Ok(token)
}

// ============================================
// Accounts
// ============================================

pub async fn sign_up(
    State(state): State<Arc<AppState>>,
    body: Option<Json<SignUpRequest>>,
) -> Result<(StatusCode, Json<AuthResponse>), InsightsError> {
    let Json(request) = body.ok_or_else(|| {
        InsightsError::GenericError("No input data provided".to_string())
    })?;

    let (Some(name), Some(email), Some(password)) = (
        non_empty(request.name),
        non_empty(request.email),
        request.password.filter(|p| !p.is_empty()),
    ) else {
        return Err(InsightsError::GenericError("Missing required fields".to_string()));
    };

    if find_user_by_email(&state, &email).await?.is_some() {
        return Err(InsightsError::Conflict("Email already registered".to_string()));
    }

    let rounds = state.password_rounds;
    let password_hash = blocking(move || hash_password(&password, rounds)).await??;

    let user = state
        .store
        .insert_user(NewUser {
            name,
            email: email.to_lowercase(),
            password_hash,
            provider: non_empty(request.provider).unwrap_or_else(|| "email".to_string()),
            avatar: non_empty(request.avatar),
        })
        .await?;
    let token = start_session(&state, &user).await?;

    info!("Registered user {}", user.id);
    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            message: "User registered successfully".to_string(),
            token,
            user_data: UserProfile::from(&user),
        }),
    ))
}

pub async fn sign_in(
    State(state): State<Arc<AppState>>,
    body: Option<Json<SignInRequest>>,
) -> Result<(StatusCode, Json<AuthResponse>), InsightsError> {
    let Json(request) = body.ok_or_else(|| {
        InsightsError::GenericError("No input data provided".to_string())
    })?;

    let (Some(email), Some(password)) = (
        non_empty(request.email),
        request.password.filter(|p| !p.is_empty()),
    ) else {
        return Err(InsightsError::GenericError("Missing required fields".to_string()));
    };

    let user = find_user_by_email(&state, &email)
        .await?
        .ok_or_else(|| InsightsError::Unauthorized("User not found".to_string()))?;

    let stored = user.password.clone();
    if !blocking(move || verify_password(&password, &stored)).await? {
        return Err(InsightsError::Unauthorized("Invalid password".to_string()));
    }

    let token = start_session(&state, &user).await?;

    info!("User {} signed in", user.id);
    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            message: "User Login successfully".to_string(),
            token,
            user_data: UserProfile::from(&user),
        }),
    ))
}

pub async fn sign_out(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<MessageResponse>, InsightsError> {
    let token = bearer_token(&headers).ok_or_else(|| {
        InsightsError::Unauthorized("Authorization header missing or invalid".to_string())
    })?;
    let user_id = state
        .tokens
        .verify(token)
        .ok_or_else(|| InsightsError::Unauthorized("Invalid or expired token".to_string()))?;

    let cleared = state.store.clear_auth_token(&user_id, token).await?;
    debug!("Sign out for {}: token cleared = {}", user_id, cleared);

    Ok(Json(MessageResponse {
        message: "User signed out successfully".to_string(),
    }))
}

// ============================================
// Predictions
// ============================================

pub async fn predict(
    State(state): State<Arc<AppState>>,
    Path(disease): Path<String>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Json<PredictionResponse>, InsightsError> {
    let disease: Disease = disease.parse()?;
    let input = form_object(body)?;

    let expected = disease.expected_inputs();
    if input.len() != expected {
        return Err(InsightsError::GenericError(format!(
            "{} model expects {} input values, but got {}",
            disease.display_name(),
            expected,
            input.len()
        )));
    }

    let model = state.models.get(disease)?;
    let values = model.feature_vector(&input)?;
    let prediction = model.predict(&values)?.to_string();
    info!("Predicted {} for {}", prediction, disease);

    if let Some(key) = session_key(&state, &headers, disease).await? {
        state
            .store
            .upsert_history(
                &key,
                HistoryUpdate::Prediction {
                    prediction: prediction.clone(),
                    input_data: Value::Object(input),
                },
            )
            .await?;
    }

    Ok(Json(PredictionResponse { prediction }))
}

pub async fn recommend(
    State(state): State<Arc<AppState>>,
    Path(disease): Path<String>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Json<RecommendationResponse>, InsightsError> {
    let disease: Disease = disease.parse()?;
    let mut input = form_object(body)?;

    let prediction = input
        .get("prediction")
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string();
    let prompt = prompts::recommendation_prompt(&input, &prediction);
    let recommendations = state.llm.generate(&prompt).await?;

    if let Some(key) = session_key(&state, &headers, disease).await? {
        input.shift_remove("prediction");
        state
            .store
            .upsert_history(
                &key,
                HistoryUpdate::Recommendation {
                    recommendation: recommendations.clone(),
                    input_data: Value::Object(input),
                },
            )
            .await?;
    }

    Ok(Json(RecommendationResponse { recommendations }))
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    Path(disease): Path<String>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<Json<ChatResponse>, InsightsError> {
    let disease: Disease = disease.parse()?;
    let Some(Json(raw)) = body else {
        return Err(InsightsError::GenericError("No input data provided".to_string()));
    };
    let request: ChatRequest = serde_json::from_value(raw)
        .map_err(|e| InsightsError::GenericError(format!("Invalid chat request: {e}")))?;

    let greeting = || vec![ChatMessage::assistant(prompts::GREETING)];
    let message = non_empty(request.message);
    let session = session_key(&state, &headers, disease).await?;

    let mut conversation = match &session {
        Some(key) => {
            let stored = state
                .store
                .find_history(&key.user_id, &key.session_id, Some(&key.disease))
                .await?
                .and_then(|record| record.messages)
                .filter(|messages| !messages.is_empty());
            let mut conversation = stored.unwrap_or_else(greeting);
            conversation.push(ChatMessage::user(message.unwrap_or_else(|| "Hi".to_string())));
            conversation
        }
        None => {
            let mut conversation = request
                .messages
                .filter(|messages| !messages.is_empty())
                .unwrap_or_else(greeting);
            if let Some(message) = message {
                conversation.push(ChatMessage::user(message));
            }
            conversation
        }
    };

    let form = request.form_data.unwrap_or_default();
    let prediction = non_empty(request.prediction);
    let recommendation = non_empty(request.recommendation);
    let prompt = prompts::chat_prompt(
        disease,
        &form,
        prediction.as_deref(),
        recommendation.as_deref(),
        &conversation,
    );
    let reply = state.llm.generate(&prompt).await?;

    if let Some(key) = session {
        conversation.push(ChatMessage::assistant(reply.clone()));
        state
            .store
            .upsert_history(&key, HistoryUpdate::Messages(conversation))
            .await?;
    }

    Ok(Json(ChatResponse { message: reply }))
}

// ============================================
// History
// ============================================

pub async fn prediction_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<HistoryListResponse>, InsightsError> {
    let user = authenticated_user(&state, &headers).await?;
    let records = state.store.list_history(&user.id).await?;
    Ok(Json(HistoryListResponse {
        history: records
            .into_iter()
            .map(|record| HistoryView::from_record(record, true))
            .collect(),
    }))
}

pub async fn session_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<SessionHistoryQuery>,
) -> Result<Json<SessionHistoryResponse>, InsightsError> {
    let session_id = non_empty(query.session_id)
        .ok_or_else(|| InsightsError::GenericError("Session ID is required".to_string()))?;
    let user = authenticated_user(&state, &headers).await?;
    let disease = non_empty(query.disease).map(|d| d.to_lowercase());

    let record = state
        .store
        .find_history(&user.id, &session_id, disease.as_deref())
        .await?;
    Ok(Json(SessionHistoryResponse {
        history: record.map(|record| HistoryView::from_record(record, false)),
    }))
}
