// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEV_JWT_SECRET: &str = "insights-development-secret-change-me";

/// Server configuration, read from YAML and overridden by environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// When unset the server keeps users and history in memory.
    pub mongodb_uri: Option<String>,
    pub database: String,
    /// Directory holding `<disease>_model.json` artifacts.
    pub model_dir: PathBuf,
    /// Built frontend, served as the router fallback when present.
    pub static_dir: Option<PathBuf>,
    pub jwt_secret: String,
    pub token_ttl_secs: i64,
    pub password_rounds: u32,
    pub cors_origins: Vec<String>,
    pub gemini: GeminiSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            mongodb_uri: None,
            database: "insights_db".to_string(),
            model_dir: PathBuf::from("training"),
            static_dir: Some(PathBuf::from("dist")),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            token_ttl_secs: 7 * 24 * 60 * 60,
            password_rounds: 600_000,
            cors_origins: vec!["http://localhost:5173".to_string(), "*".to_string()],
            gemini: GeminiSettings::default(),
        }
    }
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gemini-2.0-flash-001".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            timeout_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Load from an optional YAML file, then apply process environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            None => ServerConfig::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from `lookup`; empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = get("MONGODB_URI") {
            self.mongodb_uri = Some(v);
        }
        if let Some(v) = get("MONGODB_DATABASE") {
            self.database = v;
        }
        if let Some(v) = get("MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = get("STATIC_DIR") {
            self.static_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("JWT_SECRET") {
            self.jwt_secret = v;
        }
        if let Some(v) = get("GEMINI_API_KEY") {
            self.gemini.api_key = Some(v);
        }
        if let Some(v) = get("GEMINI_MODEL") {
            self.gemini.model = v;
        }
    }

    pub fn uses_default_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}
