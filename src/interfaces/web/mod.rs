mod handlers;
mod router;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::core::calendar::CalendarExporter;
use crate::core::grist::GristClient;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::orchestrator::ScrapePipeline;
use crate::core::tasks::TaskRunner;
use crate::interfaces::discord::CompletionNotifier;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) pipeline: Arc<ScrapePipeline>,
    pub(crate) runner: Arc<TaskRunner>,
    pub(crate) grist: Arc<GristClient>,
    pub(crate) exporter: Arc<CalendarExporter>,
    /// Present when the Discord consumer runs in this process; completion
    /// callbacks are routed to it.
    pub(crate) notifier: Option<Arc<CompletionNotifier>>,
}

pub struct ApiServerConfig {
    pub pipeline: Arc<ScrapePipeline>,
    pub runner: Arc<TaskRunner>,
    pub grist: Arc<GristClient>,
    pub exporter: Arc<CalendarExporter>,
    pub notifier: Option<Arc<CompletionNotifier>>,
    pub host: String,
    pub port: u16,
}

/// HTTP interface over the pipeline, job runner and record store.
pub struct ApiServer {
    state: AppState,
    host: String,
    port: u16,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self {
            state: AppState {
                pipeline: config.pipeline,
                runner: config.runner,
                grist: config.grist,
                exporter: config.exporter,
                notifier: config.notifier,
            },
            host: config.host,
            port: config.port,
        }
    }
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API Server Interface initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let state = self.state.clone();
        let addr = format!("{}:{}", self.host, self.port);

        tokio::spawn(async move {
            let app = router::build_router(state);
            if let Ok(listener) = tokio::net::TcpListener::bind(&addr).await {
                info!("API Server running at http://{addr}");
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!("API Server crashed: {}", e);
                }
            } else {
                tracing::error!("API Server failed to bind {addr}");
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server Interface shutting down...");
        Ok(())
    }
}
