use anyhow::Context;
use roomdigest::adapter::MatrixAdapter;
use roomdigest::analysis::AnalysisPipeline;
use roomdigest::config::{parse_wall_clock, ProviderSettings, Settings};
use roomdigest::delivery::{DeliveryManager, DeliveryPolicy};
use roomdigest::llm::{OpenAiProvider, Orchestrator, ProviderRegistry};
use roomdigest::report::{ChromiumRenderer, FileTemplateStore, HtmlRenderer, ReportRenderer};
use roomdigest::scheduler::Scheduler;
use roomdigest::store::RoomConfigStore;
use roomdigest::throttle::Throttler;
use roomdigest::Service;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = Settings::default_path();
    let settings = match Settings::load(&config_path) {
        Ok(settings) => settings,
        Err(roomdigest::error::ConfigError::Io(e))
            if e.kind() == std::io::ErrorKind::NotFound =>
        {
            warn!(path = %config_path.display(), "no config file, running on defaults");
            Settings::default()
        }
        Err(e) => return Err(e).context("loading config"),
    };
    let settings = Arc::new(settings);

    let rooms_path = config_path.with_file_name("rooms.toml");
    let store = Arc::new(
        RoomConfigStore::load(&rooms_path, &settings.group_access).context("loading room table")?,
    );

    let homeserver =
        std::env::var("MATRIX_HOMESERVER").context("MATRIX_HOMESERVER is not set")?;
    let token =
        std::env::var("MATRIX_ACCESS_TOKEN").context("MATRIX_ACCESS_TOKEN is not set")?;
    let adapter = Arc::new(MatrixAdapter::new(&homeserver, &token));

    let mut registry = ProviderRegistry::new(&settings.llm.provider_id);
    if settings.llm.providers.is_empty() {
        warn!("no llm providers configured, registering the local default");
        registry.register(Arc::new(OpenAiProvider::new(
            &settings.llm.provider_id,
            &ProviderSettings::default(),
        )));
    }
    for (id, provider_settings) in &settings.llm.providers {
        registry.register(Arc::new(OpenAiProvider::new(id, provider_settings)));
    }

    let pipeline = AnalysisPipeline::new(
        Arc::clone(&settings),
        Throttler::new(settings.analysis.max_concurrent_tasks),
        Orchestrator::from_settings(&settings.llm),
        Arc::new(registry),
    );

    let html: Option<Arc<dyn HtmlRenderer>> = settings
        .output
        .pdf
        .browser_path
        .clone()
        .map(|path| Arc::new(ChromiumRenderer::new(path)) as Arc<dyn HtmlRenderer>);
    if html.is_none() {
        info!("no browser configured, image and pdf output will be unavailable");
    }
    let renderer = ReportRenderer::new(
        Box::new(FileTemplateStore::new(settings.output.template_dir.clone())),
        html,
        PathBuf::from("reports"),
        settings.output.pdf.filename_format.clone(),
    );

    let delivery = DeliveryManager::new(adapter.clone(), DeliveryPolicy::default());

    let service = Arc::new(Service {
        settings: Arc::clone(&settings),
        store: Arc::clone(&store),
        adapter,
        pipeline,
        renderer,
        delivery,
    });

    let fire_at = parse_wall_clock(&settings.auto_analysis.time)
        .context("auto_analysis.time is not HH:MM")?;
    let scheduler = Scheduler::new(service.clone(), store, fire_at);
    if settings.auto_analysis.enabled {
        scheduler.reload();
    } else {
        info!("auto analysis disabled, timers not armed");
    }

    info!(homeserver, "roomdigest up");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    scheduler.stop();
    Ok(())
}
