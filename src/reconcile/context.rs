use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::store::models::Customer;
use crate::sync::statistics::RunStatistics;

/// Per-run working state, created by the orchestrator at run start and
/// dropped at run end. Carries the identity cache, the run counters, and
/// the provider-lookup budget - nothing here outlives the run.
pub struct RunContext {
    pub stats: RunStatistics,
    started_at: DateTime<Utc>,
    identity_cache: HashMap<String, Customer>,
    provider_lookups_remaining: u32,
    broad_key_warned: bool,
    pending_payment_ids: HashSet<String>,
    pending_registration_ids: HashSet<Uuid>,
}

impl RunContext {
    pub fn new(provider_lookup_budget: u32) -> Self {
        Self {
            stats: RunStatistics::new(),
            started_at: Utc::now(),
            identity_cache: HashMap::new(),
            provider_lookups_remaining: provider_lookup_budget,
            broad_key_warned: false,
            pending_payment_ids: HashSet::new(),
            pending_registration_ids: HashSet::new(),
        }
    }

    pub fn run_started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Seed the dedup sets from items already parked in the queue so a
    /// re-listed charge (after a failed run) is not enqueued twice
    pub fn note_pending_payment(&mut self, provider_payment_id: impl Into<String>) {
        self.pending_payment_ids.insert(provider_payment_id.into());
    }

    pub fn note_pending_registration(&mut self, registration_id: Uuid) {
        self.pending_registration_ids.insert(registration_id);
    }

    pub fn is_payment_pending(&self, provider_payment_id: &str) -> bool {
        self.pending_payment_ids.contains(provider_payment_id)
    }

    pub fn is_registration_pending(&self, registration_id: Uuid) -> bool {
        self.pending_registration_ids.contains(&registration_id)
    }

    pub fn cached_customer(&self, identity_hash: &str) -> Option<Customer> {
        self.identity_cache.get(identity_hash).cloned()
    }

    pub fn cache_customer(&mut self, customer: Customer) {
        self.identity_cache
            .insert(customer.identity_hash.clone(), customer);
    }

    /// Take one unit from the per-run provider lookup budget. The budget is
    /// shared across all pending items, not per item.
    pub fn take_provider_lookup(&mut self) -> bool {
        if self.provider_lookups_remaining == 0 {
            return false;
        }
        self.provider_lookups_remaining -= 1;
        true
    }

    pub fn provider_lookups_remaining(&self) -> u32 {
        self.provider_lookups_remaining
    }

    /// Record a diagnostic in the de-duplicated run error list
    pub fn diagnostic(&mut self, message: impl Into<String>) {
        self.stats.record_error(message);
    }

    /// The broad-identity-key warning fires at most once per run
    pub fn should_warn_broad_key(&mut self) -> bool {
        if self.broad_key_warned {
            false
        } else {
            self.broad_key_warned = true;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_lookup_budget_is_exhaustible() {
        let mut ctx = RunContext::new(2);
        assert!(ctx.take_provider_lookup());
        assert!(ctx.take_provider_lookup());
        assert!(!ctx.take_provider_lookup());
        assert_eq!(ctx.provider_lookups_remaining(), 0);
    }

    #[test]
    fn test_broad_key_warning_fires_once() {
        let mut ctx = RunContext::new(0);
        assert!(ctx.should_warn_broad_key());
        assert!(!ctx.should_warn_broad_key());
    }
}
