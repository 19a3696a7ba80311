use std::sync::Arc;

use log::info;
use tokio_util::sync::CancellationToken;

use crate::{
    batch::BatchProcessor,
    config::{AppEnv, LoadFromEnv},
    extractor::SelectorExtractor,
    identity::IdentityPool,
    metrics::HealthThresholds,
    orchestrator::Orchestrator,
    requests::RequestClient,
    scrape_client::{HttpScraper, Scraper},
    store::{EventLog, ScanStore, postgres::PgStore},
};

/// Everything a command or request handler needs, built once per process.
pub struct ScrapingContext {
    pub env: AppEnv,
    pub store: Arc<dyn ScanStore>,
    pub events: Arc<dyn EventLog>,
    pub orchestrator: Arc<Orchestrator>,
    pub health: HealthThresholds,
    pub shutdown: CancellationToken,
}

impl ScrapingContext {
    /// Loads the environment and connects to Postgres.
    pub async fn new() -> anyhow::Result<Self> {
        let env = AppEnv::load_from_env()?;
        let store = Arc::new(
            PgStore::connect(env.database_url()?, env.database_max_connections).await?,
        );
        info!("Connected to postgres");
        Self::with_store(env, store.clone(), store)
    }

    /// Wires the live scrape client on top of an existing store.
    pub fn with_store(
        env: AppEnv,
        store: Arc<dyn ScanStore>,
        events: Arc<dyn EventLog>,
    ) -> anyhow::Result<Self> {
        let source = env.source()?;
        let identities = IdentityPool::new(Some(source.base_url.origin().ascii_serialization()));
        let request_client =
            RequestClient::new(env.session(), identities, env.rate_limiter(), env.pacing()?)?;
        let extractor = SelectorExtractor::new(&env.selectors(), env.source_currency.clone())?;
        let shutdown = CancellationToken::new();
        let scraper: Arc<dyn Scraper> = Arc::new(
            HttpScraper::new(
                source,
                request_client,
                env.retry_policy(),
                Box::new(extractor),
                events.clone(),
            )
            .with_shutdown(shutdown.clone()),
        );
        Ok(Self::wire(env, store, events, scraper, shutdown))
    }

    /// Wires everything around a given scraper.
    pub fn with_scraper(
        env: AppEnv,
        store: Arc<dyn ScanStore>,
        events: Arc<dyn EventLog>,
        scraper: Arc<dyn Scraper>,
    ) -> Self {
        Self::wire(env, store, events, scraper, CancellationToken::new())
    }

    fn wire(
        env: AppEnv,
        store: Arc<dyn ScanStore>,
        events: Arc<dyn EventLog>,
        scraper: Arc<dyn Scraper>,
        shutdown: CancellationToken,
    ) -> Self {
        let health = env.health();
        let batch = BatchProcessor::new(store.clone(), scraper, env.batch())
            .with_shutdown(shutdown.clone())
            .with_health(events.clone(), health.clone());
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(batch),
            env.orchestrator(),
        ));
        ScrapingContext {
            env,
            store,
            events,
            orchestrator,
            health,
            shutdown,
        }
    }
}
