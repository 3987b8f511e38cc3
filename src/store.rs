// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::InsightsError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOneOptions, FindOptions, IndexOptions, UpdateOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

const USERS: &str = "users";
const PREDICTION_HISTORY: &str = "prediction_history";

/// Server code for a unique index violation.
const DUPLICATE_KEY: i32 = 11000;

// ============================================
// Records
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub email: String,
    /// Password hash, never returned to clients.
    pub password: String,
    pub provider: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub auth_token: String,
    pub created_at: mongodb::bson::DateTime,
    pub updated_at: mongodb::bson::DateTime,
}

/// Fields supplied at sign-up.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub provider: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub user: bool,
    pub message: String,
}

impl ChatMessage {
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            user: true,
            message: message.into(),
        }
    }

    pub fn assistant(message: impl Into<String>) -> Self {
        Self {
            user: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub session_id: String,
    pub user_id: String,
    pub disease: String,
    #[serde(default)]
    pub prediction: Option<String>,
    #[serde(default)]
    pub recommendation: Option<String>,
    #[serde(default)]
    pub input_data: Option<serde_json::Value>,
    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(default)]
    pub created_at: Option<mongodb::bson::DateTime>,
    #[serde(default)]
    pub updated_at: Option<mongodb::bson::DateTime>,
}

/// Identifies one (session, user, disease) history document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub session_id: String,
    pub user_id: String,
    pub disease: String,
}

impl SessionKey {
    fn filter(&self) -> Document {
        doc! {
            "session_id": self.session_id.as_str(),
            "user_id": self.user_id.as_str(),
            "disease": self.disease.as_str(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum HistoryUpdate {
    Prediction {
        prediction: String,
        input_data: serde_json::Value,
    },
    Recommendation {
        recommendation: String,
        input_data: serde_json::Value,
    },
    Messages(Vec<ChatMessage>),
}

impl HistoryUpdate {
    fn set_document(&self) -> Result<Document, InsightsError> {
        let to_bson = |v: &serde_json::Value| {
            mongodb::bson::to_bson(v)
                .map_err(|e| InsightsError::StoreError(format!("Failed to encode input data: {e}")))
        };
        Ok(match self {
            HistoryUpdate::Prediction {
                prediction,
                input_data,
            } => doc! { "prediction": prediction.as_str(), "input_data": to_bson(input_data)? },
            HistoryUpdate::Recommendation {
                recommendation,
                input_data,
            } => doc! { "recommendation": recommendation.as_str(), "input_data": to_bson(input_data)? },
            HistoryUpdate::Messages(messages) => {
                let messages = mongodb::bson::to_bson(messages)
                    .map_err(|e| InsightsError::StoreError(format!("Failed to encode messages: {e}")))?;
                doc! { "messages": messages }
            }
        })
    }

    fn apply(self, record: &mut HistoryRecord) {
        match self {
            HistoryUpdate::Prediction {
                prediction,
                input_data,
            } => {
                record.prediction = Some(prediction);
                record.input_data = Some(input_data);
            }
            HistoryUpdate::Recommendation {
                recommendation,
                input_data,
            } => {
                record.recommendation = Some(recommendation);
                record.input_data = Some(input_data);
            }
            HistoryUpdate::Messages(messages) => record.messages = Some(messages),
        }
    }
}

/// Convert a stored timestamp for API responses.
pub fn to_chrono(dt: mongodb::bson::DateTime) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(dt.timestamp_millis()).unwrap_or_default()
}

// ============================================
// Store trait
// ============================================

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, InsightsError>;

    async fn find_user_by_id(&self, id: &str) -> Result<Option<UserRecord>, InsightsError>;

    /// Insert a new user; fails with `Conflict` when the email is taken.
    async fn insert_user(&self, user: NewUser) -> Result<UserRecord, InsightsError>;

    async fn set_auth_token(&self, user_id: &str, token: &str) -> Result<(), InsightsError>;

    /// Clear the token if it is still the user's current one.
    async fn clear_auth_token(&self, user_id: &str, token: &str) -> Result<bool, InsightsError>;

    async fn upsert_history(
        &self,
        key: &SessionKey,
        update: HistoryUpdate,
    ) -> Result<(), InsightsError>;

    /// One session's record. Without a disease, the most recently updated one.
    async fn find_history(
        &self,
        user_id: &str,
        session_id: &str,
        disease: Option<&str>,
    ) -> Result<Option<HistoryRecord>, InsightsError>;

    /// All of a user's history, most recently updated first.
    async fn list_history(&self, user_id: &str) -> Result<Vec<HistoryRecord>, InsightsError>;
}

// ============================================
// MongoDB
// ============================================

pub struct MongoStore {
    users: Collection<UserRecord>,
    history: Collection<HistoryRecord>,
}

impl MongoStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, InsightsError> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(database);
        info!("Connected to MongoDB database {}", database);
        Ok(Self::from_database(&db))
    }

    pub fn from_database(db: &Database) -> Self {
        Self {
            users: db.collection(USERS),
            history: db.collection(PREDICTION_HISTORY),
        }
    }

    pub async fn ensure_indexes(&self) -> Result<(), InsightsError> {
        let email = IndexModel::builder()
            .keys(doc! { "email": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.users.create_index(email, None).await?;

        let session = IndexModel::builder()
            .keys(doc! { "user_id": 1, "session_id": 1, "disease": 1 })
            .build();
        self.history.create_index(session, None).await?;
        debug!("MongoDB indexes ensured");
        Ok(())
    }
}

#[async_trait]
impl Store for MongoStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, InsightsError> {
        Ok(self.users.find_one(doc! { "email": email }, None).await?)
    }

    async fn find_user_by_id(&self, id: &str) -> Result<Option<UserRecord>, InsightsError> {
        Ok(self.users.find_one(doc! { "id": id }, None).await?)
    }

    async fn insert_user(&self, user: NewUser) -> Result<UserRecord, InsightsError> {
        if self.find_user_by_email(&user.email).await?.is_some() {
            return Err(InsightsError::Conflict("Email already registered".to_string()));
        }
        let oid = ObjectId::new();
        let record = new_user_record(oid.to_hex(), user);

        let mut document = mongodb::bson::to_document(&record)
            .map_err(|e| InsightsError::StoreError(format!("Failed to encode user: {e}")))?;
        document.insert("_id", oid);
        match self
            .users
            .clone_with_type::<Document>()
            .insert_one(document, None)
            .await
        {
            Ok(_) => Ok(record),
            // Lost a race with a concurrent sign-up on the unique email index.
            Err(e) if is_duplicate_key(&e.kind) => {
                Err(InsightsError::Conflict("Email already registered".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_auth_token(&self, user_id: &str, token: &str) -> Result<(), InsightsError> {
        self.users
            .update_one(
                doc! { "id": user_id },
                doc! { "$set": { "auth_token": token, "updated_at": mongodb::bson::DateTime::now() } },
                None,
            )
            .await?;
        Ok(())
    }

    async fn clear_auth_token(&self, user_id: &str, token: &str) -> Result<bool, InsightsError> {
        let result = self
            .users
            .update_one(
                doc! { "id": user_id, "auth_token": token },
                doc! { "$set": { "auth_token": "" } },
                None,
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn upsert_history(
        &self,
        key: &SessionKey,
        update: HistoryUpdate,
    ) -> Result<(), InsightsError> {
        let now = mongodb::bson::DateTime::now();
        let mut set = update.set_document()?;
        set.insert("updated_at", now);

        let options = UpdateOptions::builder().upsert(true).build();
        self.history
            .update_one(
                key.filter(),
                doc! { "$set": set, "$setOnInsert": { "created_at": now } },
                options,
            )
            .await?;
        Ok(())
    }

    async fn find_history(
        &self,
        user_id: &str,
        session_id: &str,
        disease: Option<&str>,
    ) -> Result<Option<HistoryRecord>, InsightsError> {
        let mut filter = doc! { "user_id": user_id, "session_id": session_id };
        if let Some(disease) = disease {
            filter.insert("disease", Bson::String(disease.to_string()));
        }
        let options = FindOneOptions::builder()
            .sort(doc! { "updated_at": -1 })
            .build();
        Ok(self.history.find_one(filter, options).await?)
    }

    async fn list_history(&self, user_id: &str) -> Result<Vec<HistoryRecord>, InsightsError> {
        let options = FindOptions::builder()
            .sort(doc! { "updated_at": -1 })
            .build();
        let cursor = self.history.find(doc! { "user_id": user_id }, options).await?;
        let records: Vec<HistoryRecord> = cursor.try_collect().await?;
        Ok(records)
    }
}

fn is_duplicate_key(kind: &ErrorKind) -> bool {
    matches!(kind, ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == DUPLICATE_KEY)
}

fn new_user_record(id: String, user: NewUser) -> UserRecord {
    let now = mongodb::bson::DateTime::now();
    UserRecord {
        id,
        name: user.name,
        email: user.email,
        password: user.password_hash,
        provider: user.provider,
        avatar: user.avatar,
        auth_token: String::new(),
        created_at: now,
        updated_at: now,
    }
}

// ============================================
// In-memory
// ============================================

/// Process-local store used when no MongoDB URI is configured, and in tests.
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, UserRecord>>,
    history: RwLock<HashMap<SessionKey, HistoryRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, InsightsError> {
        let users = self.users.read().await;
        Ok(users.values().find(|u| u.email == email).cloned())
    }

    async fn find_user_by_id(&self, id: &str) -> Result<Option<UserRecord>, InsightsError> {
        Ok(self.users.read().await.get(id).cloned())
    }

    async fn insert_user(&self, user: NewUser) -> Result<UserRecord, InsightsError> {
        let mut users = self.users.write().await;
        if users.values().any(|u| u.email == user.email) {
            return Err(InsightsError::Conflict("Email already registered".to_string()));
        }
        let record = new_user_record(ObjectId::new().to_hex(), user);
        users.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn set_auth_token(&self, user_id: &str, token: &str) -> Result<(), InsightsError> {
        if let Some(user) = self.users.write().await.get_mut(user_id) {
            user.auth_token = token.to_string();
            user.updated_at = mongodb::bson::DateTime::now();
        }
        Ok(())
    }

    async fn clear_auth_token(&self, user_id: &str, token: &str) -> Result<bool, InsightsError> {
        match self.users.write().await.get_mut(user_id) {
            Some(user) if user.auth_token == token => {
                user.auth_token.clear();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn upsert_history(
        &self,
        key: &SessionKey,
        update: HistoryUpdate,
    ) -> Result<(), InsightsError> {
        let now = mongodb::bson::DateTime::now();
        let mut history = self.history.write().await;
        let record = history.entry(key.clone()).or_insert_with(|| HistoryRecord {
            session_id: key.session_id.clone(),
            user_id: key.user_id.clone(),
            disease: key.disease.clone(),
            prediction: None,
            recommendation: None,
            input_data: None,
            messages: None,
            created_at: Some(now),
            updated_at: None,
        });
        update.apply(record);
        record.updated_at = Some(now);
        Ok(())
    }

    async fn find_history(
        &self,
        user_id: &str,
        session_id: &str,
        disease: Option<&str>,
    ) -> Result<Option<HistoryRecord>, InsightsError> {
        let history = self.history.read().await;
        Ok(history
            .values()
            .filter(|r| {
                r.user_id == user_id
                    && r.session_id == session_id
                    && disease.map_or(true, |d| r.disease == d)
            })
            .max_by_key(|r| r.updated_at)
            .cloned())
    }

    async fn list_history(&self, user_id: &str) -> Result<Vec<HistoryRecord>, InsightsError> {
        let history = self.history.read().await;
        let mut records: Vec<HistoryRecord> = history
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn new_user(email: &str) -> NewUser {
        NewUser {
            name: "Ada".to_string(),
            email: email.to_string(),
            password_hash: "$pbkdf2-sha256$x".to_string(),
            provider: "email".to_string(),
            avatar: None,
        }
    }

    fn key(session: &str, disease: &str) -> SessionKey {
        SessionKey {
            session_id: session.to_string(),
            user_id: "u1".to_string(),
            disease: disease.to_string(),
        }
    }

    #[tokio::test]
    async fn test_user_lifecycle() {
        let store = MemoryStore::new();
        let user = store.insert_user(new_user("ada@example.com")).await.unwrap();
        assert_eq!(user.id.len(), 24);
        assert!(user.auth_token.is_empty());

        let dup = store.insert_user(new_user("ada@example.com")).await.unwrap_err();
        assert!(matches!(dup, InsightsError::Conflict(_)));

        store.set_auth_token(&user.id, "tok-1").await.unwrap();
        let found = store.find_user_by_email("ada@example.com").await.unwrap().unwrap();
        assert_eq!(found.auth_token, "tok-1");

        assert!(!store.clear_auth_token(&user.id, "stale").await.unwrap());
        assert!(store.clear_auth_token(&user.id, "tok-1").await.unwrap());
        let found = store.find_user_by_id(&user.id).await.unwrap().unwrap();
        assert!(found.auth_token.is_empty());
    }

    #[tokio::test]
    async fn test_history_upsert_merges_fields() {
        let store = MemoryStore::new();
        let k = key("s1", "diabetes");

        store
            .upsert_history(
                &k,
                HistoryUpdate::Prediction {
                    prediction: "Positive".to_string(),
                    input_data: json!({ "Glucose": "180" }),
                },
            )
            .await
            .unwrap();
        let created = store.find_history("u1", "s1", Some("diabetes")).await.unwrap().unwrap();

        store
            .upsert_history(
                &k,
                HistoryUpdate::Messages(vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")]),
            )
            .await
            .unwrap();

        let record = store.find_history("u1", "s1", Some("diabetes")).await.unwrap().unwrap();
        assert_eq!(record.prediction.as_deref(), Some("Positive"));
        assert_eq!(record.input_data, Some(json!({ "Glucose": "180" })));
        assert_eq!(record.messages.as_ref().map(Vec::len), Some(2));
        assert_eq!(record.created_at, created.created_at);

        assert!(store.find_history("u1", "s1", Some("heart")).await.unwrap().is_none());
        assert!(store.find_history("u1", "s1", None).await.unwrap().is_some());
        assert!(store.find_history("u2", "s1", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_history_without_disease_picks_latest() {
        let store = MemoryStore::new();
        for disease in ["heart", "liver", "lung", "diabetes"] {
            store
                .upsert_history(
                    &key("s", disease),
                    HistoryUpdate::Prediction {
                        prediction: "Negative".to_string(),
                        input_data: json!({}),
                    },
                )
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let latest = store.find_history("u1", "s", None).await.unwrap().unwrap();
        assert_eq!(latest.disease, "diabetes");

        store
            .upsert_history(
                &key("s", "liver"),
                HistoryUpdate::Messages(vec![ChatMessage::user("Hi")]),
            )
            .await
            .unwrap();
        let latest = store.find_history("u1", "s", None).await.unwrap().unwrap();
        assert_eq!(latest.disease, "liver");

        let heart = store.find_history("u1", "s", Some("heart")).await.unwrap().unwrap();
        assert_eq!(heart.disease, "heart");
    }

    #[tokio::test]
    async fn test_list_history_newest_first() {
        let store = MemoryStore::new();
        for (session, disease) in [("s1", "heart"), ("s2", "liver")] {
            store
                .upsert_history(
                    &key(session, disease),
                    HistoryUpdate::Recommendation {
                        recommendation: "Eat well".to_string(),
                        input_data: json!({}),
                    },
                )
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let records = store.list_history("u1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].session_id, "s2");
        assert!(store.list_history("nobody").await.unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_key_detection() {
        let write_error = |code: i32| -> ErrorKind {
            let error: mongodb::error::WriteError = mongodb::bson::from_document(doc! {
                "code": code,
                "errmsg": "E11000 duplicate key error collection: insights_db.users index: email_1",
            })
            .unwrap();
            ErrorKind::Write(WriteFailure::WriteError(error))
        };
        assert!(is_duplicate_key(&write_error(11000)));
        assert!(!is_duplicate_key(&write_error(121)));
    }

    #[test]
    fn test_update_documents() {
        let set = HistoryUpdate::Prediction {
            prediction: "Negative".to_string(),
            input_data: json!({ "Age": 50 }),
        }
        .set_document()
        .unwrap();
        assert_eq!(set.get_str("prediction").unwrap(), "Negative");
        assert!(set.get_document("input_data").is_ok());

        let set = HistoryUpdate::Messages(vec![ChatMessage::user("Hi")])
            .set_document()
            .unwrap();
        assert_eq!(set.get_array("messages").unwrap().len(), 1);
    }
}
