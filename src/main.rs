// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use clap::Parser;
use insights_server::app::router_with_frontend;
use insights_server::auth::TokenIssuer;
use insights_server::common::cors_layer;
use insights_server::config::ServerConfig;
use insights_server::gemini::{GeminiClient, GeminiConfig, LlmClient};
use insights_server::model::ModelRegistry;
use insights_server::store::{MemoryStore, MongoStore, Store};
use insights_server::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "insights-server", version, about = "Disease prediction API server")]
struct Args {
    /// YAML config file.
    #[arg(long, env = "INSIGHTS_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config value.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("insights_server=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if config.uses_default_secret() {
        warn!("JWT_SECRET not set, signing tokens with the development secret");
    }

    let models = ModelRegistry::load_dir(&config.model_dir)
        .with_context(|| format!("Failed to load models from {}", config.model_dir.display()))?;
    info!("Loaded {} models from {}", models.len(), config.model_dir.display());

    let store: Arc<dyn Store> = match config.mongodb_uri.as_deref() {
        Some(uri) => {
            let store = MongoStore::connect(uri, &config.database)
                .await
                .context("Failed to connect to MongoDB")?;
            store
                .ensure_indexes()
                .await
                .context("Failed to create MongoDB indexes")?;
            info!("Using MongoDB database {}", config.database);
            Arc::new(store)
        }
        None => {
            warn!("MONGODB_URI not set, users and history are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    if config.gemini.api_key.is_none() {
        warn!("GEMINI_API_KEY not set, recommendations and chat will fail");
    }
    let llm: Arc<dyn LlmClient> = Arc::new(GeminiClient::new(GeminiConfig::from(&config.gemini))?);

    let state = Arc::new(AppState {
        store,
        models,
        llm,
        tokens: TokenIssuer::new(&config.jwt_secret, config.token_ttl_secs),
        password_rounds: config.password_rounds,
    });

    let app = router_with_frontend(state, config.static_dir.as_deref())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.cors_origins));

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service())
        .await
        .context("Server error")?;
    Ok(())
}
