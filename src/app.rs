use crate::config::{Config, DirectoryBackendConfig, RoutingBackendConfig};
use crate::directory::{DirectoryData, DirectoryService, HttpDirectory, MemoryDirectory};
use crate::handler;
use crate::history::{HistoryRecorderAdapter, HistoryRecorderManagerBuilder, HistorySender};
use crate::provider::{RestProvider, TelephonyProvider};
use crate::routing::{HttpRoutingStore, MemoryRoutingStore, RoutingData, RoutingStore};
use crate::session::SessionStore;
use anyhow::{anyhow, Result};
use axum::Router;
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

pub struct AppStateInner {
    pub config: Arc<Config>,
    /// Zone interpreter availability windows are evaluated in.
    pub timezone: Tz,
    pub session_store: SessionStore,
    pub directory: Arc<dyn DirectoryService>,
    pub routing: Arc<dyn RoutingStore>,
    pub provider: Arc<dyn TelephonyProvider>,
    pub history: HistoryRecorderAdapter,
    pub token: CancellationToken,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    /// Absolute URL for a webhook path, as the provider must reach it.
    pub fn webhook_url(&self, path: &str, query: &str) -> String {
        let base = self.config.public_url.trim_end_matches('/');
        if query.is_empty() {
            format!("{}{}", base, path)
        } else {
            format!("{}{}?{}", base, path, query)
        }
    }
}

/// Assembles the engine from config, with injection points for every
/// collaborator so tests can swap in fakes.
#[derive(Default)]
pub struct AppStateBuilder {
    config: Option<Config>,
    directory: Option<Arc<dyn DirectoryService>>,
    routing: Option<Arc<dyn RoutingStore>>,
    provider: Option<Arc<dyn TelephonyProvider>>,
    history_sender: Option<HistorySender>,
    token: Option<CancellationToken>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn DirectoryService>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_routing(mut self, routing: Arc<dyn RoutingStore>) -> Self {
        self.routing = Some(routing);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn TelephonyProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_history_sender(mut self, sender: HistorySender) -> Self {
        self.history_sender = Some(sender);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub async fn build(self) -> Result<AppState> {
        let config = Arc::new(self.config.unwrap_or_default());
        let token = self.token.unwrap_or_default();
        let timezone: Tz = config
            .timezone
            .parse()
            .map_err(|_| anyhow!("invalid timezone '{}'", config.timezone))?;

        let directory = match self.directory {
            Some(directory) => directory,
            None => build_directory(&config.directory)?,
        };
        let routing = match self.routing {
            Some(routing) => routing,
            None => build_routing(&config.routing)?,
        };
        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(RestProvider::new(config.provider.clone())));

        let history_sender = match self.history_sender {
            Some(sender) => sender,
            None => {
                let mut manager = HistoryRecorderManagerBuilder::new()
                    .with_cancel_token(token.child_token())
                    .with_config(config.history.clone())
                    .build();
                let sender = manager.sender.clone();
                tokio::spawn(async move {
                    manager.serve().await;
                });
                sender
            }
        };
        let history = HistoryRecorderAdapter::new(
            directory.clone(),
            history_sender,
            config.history.min_billable_secs,
        );

        Ok(Arc::new(AppStateInner {
            config,
            timezone,
            session_store: SessionStore::new(),
            directory,
            routing,
            provider,
            history,
            token,
        }))
    }
}

fn build_directory(config: &DirectoryBackendConfig) -> Result<Arc<dyn DirectoryService>> {
    Ok(match config {
        DirectoryBackendConfig::Memory => Arc::new(MemoryDirectory::new(DirectoryData::default())),
        DirectoryBackendConfig::File { path } => Arc::new(MemoryDirectory::load(path)?),
        DirectoryBackendConfig::Http { url, headers } => {
            Arc::new(HttpDirectory::new(url.clone(), headers.clone()))
        }
    })
}

fn build_routing(config: &RoutingBackendConfig) -> Result<Arc<dyn RoutingStore>> {
    Ok(match config {
        RoutingBackendConfig::Memory => Arc::new(MemoryRoutingStore::new(RoutingData::default())),
        RoutingBackendConfig::File { path } => Arc::new(MemoryRoutingStore::load(path)?),
        RoutingBackendConfig::Http { url, headers } => {
            Arc::new(HttpRoutingStore::new(url.clone(), headers.clone()))
        }
    })
}

pub fn create_router(state: AppState) -> Router {
    handler::router()
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Serves webhooks until the cancel token fires.
pub async fn run(state: AppState) -> Result<()> {
    let listener = TcpListener::bind(&state.config.http_addr).await?;
    info!("listening on {}", listener.local_addr()?);
    let token = state.token.clone();
    let router = create_router(state);
    tokio::select! {
        result = axum::serve(listener, router) => {
            result?;
        }
        _ = token.cancelled() => {
            info!("shutdown requested, stopping webhook server");
        }
    }
    Ok(())
}
