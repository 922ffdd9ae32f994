use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub stripe_api_key: Option<String>,
    pub stripe_api_url: String,
    pub square_access_token: Option<String>,
    pub square_api_url: String,
    /// Bound on PendingImport retries before an item moves to the failed store
    pub max_retries: i32,
    /// Per-run cap on direct provider charge lookups from the pending queue
    pub provider_lookup_budget: u32,
    /// Amount tolerance (minor units) for the email+amount match strategy
    pub amount_tolerance_minor: i64,
    /// Page size for provider charge listing
    pub page_size: u32,
    /// Fail the run if any provider errors, instead of skipping it
    pub require_all_providers: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/reconciler".to_string()),
            stripe_api_key: std::env::var("STRIPE_API_KEY").ok(),
            stripe_api_url: std::env::var("STRIPE_API_URL")
                .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
            square_access_token: std::env::var("SQUARE_ACCESS_TOKEN").ok(),
            square_api_url: std::env::var("SQUARE_API_URL")
                .unwrap_or_else(|_| "https://connect.squareup.com".to_string()),
            max_retries: std::env::var("MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            provider_lookup_budget: std::env::var("PROVIDER_LOOKUP_BUDGET")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(25),
            amount_tolerance_minor: std::env::var("AMOUNT_TOLERANCE_MINOR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            page_size: std::env::var("SYNC_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            require_all_providers: std::env::var("REQUIRE_ALL_PROVIDERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        })
    }
}
