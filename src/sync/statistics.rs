use serde::{Deserialize, Serialize};

/// Statistics for one reconciliation run, persisted on its sync session row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStatistics {
    /// Charges seen across all providers
    #[serde(default)]
    pub processed: u64,
    /// Payments matched and attached to a registration
    #[serde(default)]
    pub resolved: u64,
    /// Payments parked in the pending queue this run
    #[serde(default)]
    pub pending: u64,
    /// Imports moved to the terminal failed store this run
    #[serde(default)]
    pub failed: u64,
    /// Charges skipped (test transactions, malformed objects)
    #[serde(default)]
    pub skipped: u64,
    /// Customers created by identity resolution
    #[serde(default)]
    pub customers_created: u64,
    /// Individual tickets produced by package expansion
    #[serde(default)]
    pub tickets_expanded: u64,
    /// De-duplicated error/diagnostic messages
    #[serde(default)]
    pub errors: Vec<String>,
}

impl RunStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a diagnostic, keeping the list de-duplicated
    pub fn record_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.errors.contains(&message) {
            self.errors.push(message);
        }
    }

    /// Merge per-provider statistics into the run total
    pub fn merge(&mut self, other: &RunStatistics) {
        self.processed += other.processed;
        self.resolved += other.resolved;
        self.pending += other.pending;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.customers_created += other.customers_created;
        self.tickets_expanded += other.tickets_expanded;
        for message in &other.errors {
            self.record_error(message.clone());
        }
    }
}
