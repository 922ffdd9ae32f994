use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::identity::hash::IdentityCandidate;
use crate::reconcile::context::RunContext;
use crate::store::models::{Customer, CustomerType};
use crate::store::ReconStore;

/// Finds or creates exactly one Customer per identity hash.
///
/// Lookup order: run cache, primary store, secondary/staging store - first
/// hit wins. Every resolution within a run shares the cache so repeated
/// candidates neither create duplicates nor incur repeated store round
/// trips.
pub struct IdentityResolver {
    primary: Arc<dyn ReconStore>,
    secondary: Option<Arc<dyn ReconStore>>,
}

impl IdentityResolver {
    pub fn new(primary: Arc<dyn ReconStore>) -> Self {
        Self {
            primary,
            secondary: None,
        }
    }

    pub fn with_secondary(mut self, secondary: Arc<dyn ReconStore>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub async fn resolve(
        &self,
        ctx: &mut RunContext,
        candidate: &IdentityCandidate,
    ) -> AppResult<Customer> {
        if candidate.is_broad_key() && ctx.should_warn_broad_key() {
            warn!(
                "Resolving identities with neither email nor business name; \
                 dedup falls back to name-only keys for such candidates"
            );
        }

        let hash = candidate.identity_hash();

        if let Some(customer) = ctx.cached_customer(&hash) {
            debug!(identity_hash = %hash, "Identity cache hit");
            return Ok(customer);
        }

        if let Some(mut customer) = self.primary.get_customer_by_hash(&hash).await? {
            // Merge any fields this candidate knows that the stored row
            // does not; populated fields are never overwritten.
            let incoming = self.build_customer(&hash, candidate);
            if customer.merge_from(&incoming) {
                customer.updated_at = Utc::now();
                self.primary.upsert_customer(&customer).await?;
            }
            ctx.cache_customer(customer.clone());
            return Ok(customer);
        }

        if let Some(secondary) = &self.secondary {
            if let Some(customer) = secondary.get_customer_by_hash(&hash).await? {
                debug!(identity_hash = %hash, "Identity found in staging store");
                self.primary.upsert_customer(&customer).await?;
                ctx.cache_customer(customer.clone());
                return Ok(customer);
            }
        }

        let customer = self.build_customer(&hash, candidate);
        self.primary.upsert_customer(&customer).await?;
        ctx.stats.customers_created += 1;
        ctx.cache_customer(customer.clone());
        info!(
            customer_id = %customer.id,
            customer_type = ?customer.customer_type,
            "Created customer"
        );
        Ok(customer)
    }

    fn build_customer(&self, hash: &str, candidate: &IdentityCandidate) -> Customer {
        let now = Utc::now();
        let business_name = candidate.normalized_business_name();
        Customer {
            id: Uuid::new_v4(),
            identity_hash: hash.to_string(),
            first_name: candidate.first_name.trim().to_string(),
            last_name: candidate.last_name.trim().to_string(),
            email: candidate.normalized_email(),
            business_name: candidate.business_name.trim().to_string(),
            phone: candidate.phone.trim().to_string(),
            address: candidate.address.trim().to_string(),
            customer_type: if business_name.is_empty() {
                CustomerType::Person
            } else {
                CustomerType::Business
            },
            created_at: now,
            updated_at: now,
        }
    }
}
