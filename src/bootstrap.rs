use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    config::Config,
    error::AppResult,
    identity::IdentityResolver,
    matching::{MatchConfig, MatchEngine},
    packages::PackageExpander,
    pending::PendingQueue,
    providers::{ProviderRegistry, SquareProvider, StripeProvider},
    reconcile::{ImportResolver, OrchestratorConfig, ReconciliationOrchestrator},
    store::{PgStore, ReconStore},
    sync::SessionTracker,
};

/// Wire the full reconciliation stack over a Postgres store
pub async fn initialize_orchestrator(config: &Config) -> AppResult<ReconciliationOrchestrator> {
    info!("Initializing reconciliation components ...");

    let pool = initialize_database(&config.database_url).await?;
    let store: Arc<dyn ReconStore> = Arc::new(PgStore::new(pool));

    Ok(build_orchestrator(store, config))
}

/// Wire the stack over any store implementation; the batch driver uses
/// Postgres, tests plug in the in-memory store
pub fn build_orchestrator(
    store: Arc<dyn ReconStore>,
    config: &Config,
) -> ReconciliationOrchestrator {
    let mut registry = ProviderRegistry::new();

    if let Some(api_key) = &config.stripe_api_key {
        registry.register(Arc::new(StripeProvider::new(
            config.stripe_api_url.clone(),
            api_key.clone(),
        )));
        info!("✅ Stripe provider registered");
    } else {
        warn!("⚠️  STRIPE_API_KEY not set - Stripe sync disabled");
    }

    if let Some(token) = &config.square_access_token {
        registry.register(Arc::new(SquareProvider::new(
            config.square_api_url.clone(),
            token.clone(),
        )));
        info!("✅ Square provider registered");
    } else {
        warn!("⚠️  SQUARE_ACCESS_TOKEN not set - Square sync disabled");
    }

    let providers = Arc::new(registry);

    let engine = Arc::new(MatchEngine::new(MatchConfig {
        amount_tolerance_minor: config.amount_tolerance_minor,
        ..MatchConfig::default()
    }));

    let resolver = Arc::new(ImportResolver::new(
        store.clone(),
        IdentityResolver::new(store.clone()),
        PackageExpander::new(store.clone()),
    ));

    let queue = Arc::new(PendingQueue::new(
        store.clone(),
        engine.clone(),
        providers.clone(),
        resolver.clone(),
        config.max_retries,
    ));

    let sessions = SessionTracker::new(store.clone());

    ReconciliationOrchestrator::new(
        store,
        providers,
        engine,
        resolver,
        queue,
        sessions,
        OrchestratorConfig {
            page_size: config.page_size,
            provider_lookup_budget: config.provider_lookup_budget,
            require_all_providers: config.require_all_providers,
        },
    )
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await?;

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
