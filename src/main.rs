use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reconciler::{bootstrap, Config};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,reconciler=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("🚀 Starting payment reconciliation run");

    dotenv::dotenv().ok();
    let config = Config::from_env()?;

    let orchestrator = bootstrap::initialize_orchestrator(&config).await?;

    match orchestrator.run().await {
        Ok(stats) => {
            info!(
                processed = stats.processed,
                resolved = stats.resolved,
                pending = stats.pending,
                failed = stats.failed,
                skipped = stats.skipped,
                customers_created = stats.customers_created,
                tickets_expanded = stats.tickets_expanded,
                "✓ Reconciliation run completed"
            );
            for message in &stats.errors {
                info!("diagnostic: {}", message);
            }
            Ok(())
        }
        Err(e) => {
            error!("❌ Reconciliation run failed: {:?}", e);
            Err(e.into())
        }
    }
}
