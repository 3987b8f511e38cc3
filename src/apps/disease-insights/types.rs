// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::store::{to_chrono, ChatMessage, HistoryRecord, UserRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request for /api/sign-up
#[derive(Debug, Default, Deserialize)]
pub struct SignUpRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub avatar: Option<String>,
    pub provider: Option<String>,
}

/// Request for /api/sign-in
#[derive(Debug, Default, Deserialize)]
pub struct SignInRequest {
    pub email: Option<String>,
    pub password: Option<String>,
}

/// Public view of a user; never carries the password hash or token.
#[derive(Debug, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    pub provider: String,
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&UserRecord> for UserProfile {
    fn from(user: &UserRecord) -> Self {
        Self {
            id: user.id.clone(),
            name: user.name.clone(),
            email: user.email.clone(),
            provider: user.provider.clone(),
            avatar: user.avatar.clone(),
            created_at: to_chrono(user.created_at),
            updated_at: to_chrono(user.updated_at),
        }
    }
}

/// Response for /api/sign-up and /api/sign-in
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub message: String,
    pub token: String,
    pub user_data: UserProfile,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Response for /api/predict/:disease
#[derive(Debug, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub prediction: String,
}

/// Response for /api/recommend/:disease
#[derive(Debug, Serialize, Deserialize)]
pub struct RecommendationResponse {
    pub recommendations: String,
}

/// Request for /api/chat/:disease
#[derive(Debug, Default, Deserialize)]
pub struct ChatRequest {
    /// Latest user turn.
    pub message: Option<String>,
    /// Full conversation, sent by clients without a stored session.
    pub messages: Option<Vec<ChatMessage>>,
    pub form_data: Option<Map<String, Value>>,
    pub prediction: Option<String>,
    pub recommendation: Option<String>,
}

/// Response for /api/chat/:disease
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: String,
}

/// Query for /api/session_history
#[derive(Debug, Default, Deserialize)]
pub struct SessionHistoryQuery {
    pub session_id: Option<String>,
    pub disease: Option<String>,
}

/// History entry as returned to the owning user.
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryView {
    pub session_id: String,
    pub disease: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl HistoryView {
    pub fn from_record(record: HistoryRecord, with_timestamp: bool) -> Self {
        Self {
            session_id: record.session_id,
            disease: record.disease,
            prediction: record.prediction,
            recommendation: record.recommendation,
            input_data: record.input_data,
            messages: record.messages,
            updated_at: record.updated_at.filter(|_| with_timestamp).map(to_chrono),
        }
    }
}

/// Response for /api/prediction_history
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryListResponse {
    pub history: Vec<HistoryView>,
}

/// Response for /api/session_history
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionHistoryResponse {
    pub history: Option<HistoryView>,
}
