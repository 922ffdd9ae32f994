use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::matching::MatchEngine;
use crate::pending::PendingQueue;
use crate::providers::{Charge, PaymentProvider, ProviderRegistry};
use crate::reconcile::context::RunContext;
use crate::reconcile::resolve::ImportResolver;
use crate::store::mapping;
use crate::store::models::{
    ImportErrorRecord, PendingSubject, Registration, RegistrationPaymentStatus, SessionStatus,
};
use crate::store::ReconStore;
use crate::sync::{RunStatistics, SessionTracker};

/// Orchestrator tunables, separated from component configs so a batch
/// driver can override them independently
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub page_size: u32,
    pub provider_lookup_budget: u32,
    pub require_all_providers: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            provider_lookup_budget: 25,
            require_all_providers: false,
        }
    }
}

/// Drives one end-to-end reconciliation run: provider charges in, matched
/// customers/registrations/tickets out, the rest parked in the pending
/// queue, and a sync session row recording what happened.
pub struct ReconciliationOrchestrator {
    store: Arc<dyn ReconStore>,
    providers: Arc<ProviderRegistry>,
    engine: Arc<MatchEngine>,
    resolver: Arc<ImportResolver>,
    queue: Arc<PendingQueue>,
    sessions: SessionTracker,
    config: OrchestratorConfig,
}

impl ReconciliationOrchestrator {
    pub fn new(
        store: Arc<dyn ReconStore>,
        providers: Arc<ProviderRegistry>,
        engine: Arc<MatchEngine>,
        resolver: Arc<ImportResolver>,
        queue: Arc<PendingQueue>,
        sessions: SessionTracker,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            providers,
            engine,
            resolver,
            queue,
            sessions,
            config,
        }
    }

    /// One discrete batch run. Only store connectivity failures abort it; a
    /// failing provider is skipped and the session still completes for the
    /// providers that succeeded (unless configured to require all).
    pub async fn run(&self) -> AppResult<RunStatistics> {
        let since = self.sessions.last_successful_sync().await?;
        match since {
            Some(watermark) => info!(%watermark, "Starting incremental reconciliation run"),
            None => info!("No completed run on record; performing full historical sync"),
        }

        let session = self.sessions.start_session().await?;
        let mut ctx = RunContext::new(self.config.provider_lookup_budget);
        self.seed_pending_dedup(&mut ctx).await?;

        let mut fatal: Option<AppError> = None;

        for provider in self.providers.all() {
            match self.sync_provider(&mut ctx, provider.as_ref(), since).await {
                Ok(()) => {}
                Err(AppError::Provider(e)) => {
                    warn!(
                        provider = provider.name(),
                        error = %e,
                        "Provider failed; skipping it for the remainder of this run"
                    );
                    ctx.diagnostic(format!("provider {} skipped: {}", provider.name(), e));
                    if self.config.require_all_providers {
                        fatal = Some(AppError::Provider(e));
                        break;
                    }
                }
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            }
        }

        if fatal.is_none() {
            if let Err(e) = self.sweep_unmatched_registrations(&mut ctx).await {
                fatal = Some(e);
            }
        }

        if fatal.is_none() {
            if let Err(e) = self.queue.process(&mut ctx).await {
                fatal = Some(e);
            }
        }

        if fatal.is_none() {
            if let Err(e) = self.detect_expansion_remnants(&mut ctx).await {
                fatal = Some(e);
            }
        }

        match fatal {
            None => {
                let session = self
                    .sessions
                    .end_session(session, SessionStatus::Completed, ctx.stats.clone())
                    .await?;
                Ok(session.statistics)
            }
            Some(error) => {
                // Best effort: the Failed row never advances the watermark
                if let Err(e) = self
                    .sessions
                    .end_session(session, SessionStatus::Failed, ctx.stats.clone())
                    .await
                {
                    warn!(error = %e, "Could not record failed session");
                }
                Err(error)
            }
        }
    }

    async fn seed_pending_dedup(&self, ctx: &mut RunContext) -> AppResult<()> {
        for item in self.store.pending_oldest_first().await? {
            if let Some(id) = &item.provider_payment_id {
                ctx.note_pending_payment(id.clone());
            }
            if let PendingSubject::Registration { registration } = &item.subject {
                ctx.note_pending_registration(registration.id);
            }
        }
        Ok(())
    }

    /// Page through one provider's charges since the watermark
    async fn sync_provider(
        &self,
        ctx: &mut RunContext,
        provider: &dyn PaymentProvider,
        since: Option<chrono::DateTime<Utc>>,
    ) -> AppResult<()> {
        match provider.is_available().await {
            Ok(true) => {}
            Ok(false) => {
                ctx.diagnostic(format!("provider {} unavailable", provider.name()));
                warn!(provider = provider.name(), "Provider unavailable; skipping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        info!(provider = provider.name(), "Syncing provider charges");
        let mut cursor: Option<String> = None;

        loop {
            let page = provider
                .list_charges_since(since, cursor, self.config.page_size)
                .await?;
            let page_len = page.charges.len();

            for charge in page.charges {
                self.process_charge(ctx, charge).await?;
            }

            if !page.has_more || page.next_cursor.is_none() || page_len == 0 {
                break;
            }
            cursor = page.next_cursor;
        }

        Ok(())
    }

    /// The per-payment pipeline: mirror, match, resolve or park
    async fn process_charge(&self, ctx: &mut RunContext, charge: Charge) -> AppResult<()> {
        ctx.stats.processed += 1;

        if charge.is_test_transaction() {
            debug!(charge = %charge.id, "Skipping test transaction");
            ctx.stats.skipped += 1;
            return Ok(());
        }

        if let Err(message) = Self::validate_charge(&charge) {
            self.store
                .record_import_error(&ImportErrorRecord {
                    id: Uuid::new_v4(),
                    source: charge.source.to_string(),
                    message: message.clone(),
                    payload: charge.raw.clone(),
                    recorded_at: Utc::now(),
                })
                .await?;
            ctx.diagnostic(message);
            ctx.stats.skipped += 1;
            return Ok(());
        }

        let payment = charge.into_payment();
        self.store.upsert_payment(&payment).await?;

        // Already attached on a previous run: nothing to match, but a
        // refund arriving upstream must still be reflected.
        if let Some(mut registration) = self
            .store
            .find_registration_by_payment(&payment.provider_payment_id)
            .await?
        {
            if registration.is_matched() {
                if payment.is_refunded()
                    && registration.payment_status != RegistrationPaymentStatus::Refunded
                {
                    registration.payment_status = RegistrationPaymentStatus::Refunded;
                    self.store.upsert_registration(&registration).await?;
                    info!(
                        registration = %registration.id,
                        payment = %payment.provider_payment_id,
                        "Reflected upstream refund"
                    );
                }
                return Ok(());
            }
        }

        let pool = self.store.unmatched_registrations().await?;
        match self.engine.find_match(&payment, &pool) {
            Some(outcome) => {
                let registration = pool
                    .into_iter()
                    .find(|r| r.id == outcome.registration_id)
                    .ok_or_else(|| {
                        AppError::Internal("match outcome references unknown registration".into())
                    })?;
                self.resolver
                    .resolve(ctx, registration, &payment, &outcome)
                    .await?;
            }
            None => {
                if !ctx.is_payment_pending(&payment.provider_payment_id) {
                    ctx.note_pending_payment(payment.provider_payment_id.clone());
                    self.queue
                        .enqueue_payment(ctx, payment, "no matching registration")
                        .await?;
                }
            }
        }

        Ok(())
    }

    fn validate_charge(charge: &Charge) -> Result<(), String> {
        if charge.amount_minor < 0 {
            return Err(format!(
                "charge {} has negative amount {}",
                charge.id, charge.amount_minor
            ));
        }
        if charge.currency.trim().is_empty() {
            return Err(format!("charge {} carries no currency", charge.id));
        }
        Ok(())
    }

    /// Registrations that reference a payment the store has never seen go
    /// into the pending queue, where the bounded provider lookup can catch
    /// charges visible upstream but not yet mirrored.
    async fn sweep_unmatched_registrations(&self, ctx: &mut RunContext) -> AppResult<()> {
        for registration in self.store.unmatched_registrations().await? {
            if ctx.is_registration_pending(registration.id) {
                continue;
            }
            let Some(reference) = Self::payment_reference(&registration) else {
                continue;
            };
            if self.store.get_payment(&reference).await?.is_some() {
                // Mirrored already; the queue's local re-match will pick it
                // up without our help, and the main loop handles new charges
                continue;
            }

            ctx.note_pending_registration(registration.id);
            self.queue
                .enqueue_registration(
                    ctx,
                    registration,
                    Some(reference.clone()),
                    format!("referenced payment {} not mirrored locally", reference),
                )
                .await?;
        }
        Ok(())
    }

    fn payment_reference(registration: &Registration) -> Option<String> {
        registration
            .provider_payment_id
            .clone()
            .or_else(|| mapping::embedded_payment_reference(&registration.raw))
            .or_else(|| {
                registration
                    .confirmation_number
                    .clone()
                    .filter(|c| c.starts_with("ch_") || c.starts_with("py_"))
            })
    }

    /// A crash between the two replacement writes can leave a package
    /// ticket coexisting with its children; surface those for correction.
    async fn detect_expansion_remnants(&self, ctx: &mut RunContext) -> AppResult<()> {
        let remnants = self.store.package_tickets_with_children().await?;
        for ticket_id in remnants {
            warn!(ticket = %ticket_id, "Package ticket coexists with its expansion set");
            ctx.diagnostic(format!(
                "package ticket {} still present alongside its expanded tickets",
                ticket_id
            ));
        }
        Ok(())
    }
}
