use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::providers::traits::PaymentProvider;
use crate::store::models::PaymentSource;

pub struct ProviderRegistry {
    providers: HashMap<PaymentSource, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn PaymentProvider>) {
        info!("Registering payment provider: {}", provider.name());
        self.providers.insert(provider.source(), provider);
    }

    pub fn get(&self, source: PaymentSource) -> Option<Arc<dyn PaymentProvider>> {
        self.providers.get(&source).cloned()
    }

    /// Providers in a fixed order so run output is reproducible
    pub fn all(&self) -> Vec<Arc<dyn PaymentProvider>> {
        let mut result = Vec::new();
        for source in PaymentSource::all() {
            if let Some(provider) = self.providers.get(&source) {
                result.push(provider.clone());
            }
        }
        result
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
