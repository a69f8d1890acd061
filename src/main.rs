mod config;
mod core;
mod interfaces;
mod logging;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::Settings;
use crate::core::calendar::CalendarExporter;
use crate::core::correlation::CorrelationStore;
use crate::core::fetcher::HttpBrowserFetcher;
use crate::core::grist::{GristClient, GristConfig};
use crate::core::lifecycle::LifecycleManager;
use crate::core::llm::gemini::GeminiExtractor;
use crate::core::orchestrator::ScrapePipeline;
use crate::core::tasks::TaskRunner;
use crate::interfaces::discord::{CompletionNotifier, DiscordConsumer, DiscordConsumerConfig};
use crate::interfaces::web::{ApiServer, ApiServerConfig};

#[tokio::main]
async fn main() {
    logging::init();

    if let Err(e) = run().await {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let settings = Settings::from_env()?;

    let extractor = Arc::new(GeminiExtractor::new(
        settings.gemini_api_key.clone(),
        settings.gemini_model.clone(),
    ));
    let fetcher = Arc::new(HttpBrowserFetcher::new(settings.browser_fetch_url.clone()));
    let pipeline = Arc::new(
        ScrapePipeline::new(fetcher, extractor)
            .with_low_confidence_threshold(settings.low_confidence_threshold),
    );

    let grist = Arc::new(GristClient::new(GristConfig {
        api_base: settings.grist_api_base.clone(),
        api_key: settings.grist_api_key.clone(),
        doc_id: settings.grist_doc_id.clone(),
        table: settings.grist_table.clone(),
        ui_base: settings.grist_ui_base.clone(),
        ui_doc_id: settings.grist_ui_doc_id.clone(),
        ui_page: settings.grist_ui_page.clone(),
    }));

    let runner = Arc::new(TaskRunner::new(Arc::clone(&pipeline), Arc::clone(&grist)));
    let exporter = Arc::new(CalendarExporter::new(
        Arc::clone(&grist),
        settings.calendar_week_start,
    ));

    let mut lifecycle = LifecycleManager::new();

    let notifier = if settings.discord_enabled() {
        let store = Arc::new(CorrelationStore::open(Path::new(&settings.db_path))?);
        let http = Arc::new(serenity::all::Http::new(&settings.discord_token));

        let consumer = DiscordConsumer::new(DiscordConsumerConfig {
            token: settings.discord_token.clone(),
            channels: settings.discord_channels.clone(),
            agent_api_url: settings.agent_api_url.clone(),
            callback_url: settings.callback_url.clone(),
            store: Arc::clone(&store),
            grist: Arc::clone(&grist),
            exporter: Arc::clone(&exporter),
        });
        lifecycle.attach(Arc::new(Mutex::new(consumer)));

        Some(Arc::new(CompletionNotifier::new(
            http,
            store,
            settings.discord_channels.clone(),
        )))
    } else {
        info!("DISCORD_TOKEN not set, Discord consumer disabled");
        None
    };

    let api = ApiServer::new(ApiServerConfig {
        pipeline,
        runner,
        grist,
        exporter,
        notifier,
        host: settings.host.clone(),
        port: settings.port,
    });
    lifecycle.attach(Arc::new(Mutex::new(api)));

    lifecycle.start().await?;
    info!("weave ready on {}:{}", settings.host, settings.port);

    tokio::signal::ctrl_c().await?;
    lifecycle.shutdown().await?;
    Ok(())
}
