use std::sync::Arc;
use tracing::info;

use crate::error::AppResult;
use crate::identity::{IdentityCandidate, IdentityResolver};
use crate::matching::MatchOutcome;
use crate::packages::PackageExpander;
use crate::reconcile::context::RunContext;
use crate::store::models::{Payment, Registration, RegistrationPaymentStatus};
use crate::store::ReconStore;

/// The single resolution step shared by the orchestrator and the pending
/// queue: attach a matched payment to its registration, resolve the
/// customer identity, expand any package tickets, and persist the result.
pub struct ImportResolver {
    store: Arc<dyn ReconStore>,
    identity: IdentityResolver,
    expander: PackageExpander,
}

impl ImportResolver {
    pub fn new(
        store: Arc<dyn ReconStore>,
        identity: IdentityResolver,
        expander: PackageExpander,
    ) -> Self {
        Self {
            store,
            identity,
            expander,
        }
    }

    pub async fn resolve(
        &self,
        ctx: &mut RunContext,
        mut registration: Registration,
        payment: &Payment,
        outcome: &MatchOutcome,
    ) -> AppResult<()> {
        let mut candidate = IdentityCandidate::from_registration(&registration);
        if candidate.email.is_empty() {
            // The charge's receipt email identifies the payer when intake
            // recorded no contact email
            if let Some(receipt_email) = &payment.receipt_email {
                candidate.email = receipt_email.clone();
            }
        }
        let customer = self.identity.resolve(ctx, &candidate).await?;

        registration.customer_id = Some(customer.id);
        registration.provider_payment_id = Some(payment.provider_payment_id.clone());
        registration.payment_status = if payment.is_refunded() {
            RegistrationPaymentStatus::Refunded
        } else {
            RegistrationPaymentStatus::Paid
        };
        registration.matched_confidence = Some(outcome.confidence);
        registration.matched_reason =
            Some(format!("{}: {}", outcome.strategy.as_str(), outcome.reason));

        // Replace package tickets with their expansion sets. The insert and
        // the remove are two separate writes (per-document atomicity only);
        // a crash between them leaves a remnant the corrective pass detects.
        let mut ticket_ids = Vec::with_capacity(registration.ticket_ids.len());
        for ticket_id in registration.ticket_ids.clone() {
            let ticket = match self.store.get_ticket(ticket_id).await? {
                Some(ticket) => ticket,
                None => {
                    ctx.diagnostic(format!(
                        "Registration {} references missing ticket {}",
                        registration.id, ticket_id
                    ));
                    ticket_ids.push(ticket_id);
                    continue;
                }
            };
            if !ticket.is_package {
                ticket_ids.push(ticket_id);
                continue;
            }

            let children = self.expander.expand(ctx, &ticket, customer.id).await?;
            if children.is_empty() {
                // Expansion failed soft; keep the package ticket in place
                ticket_ids.push(ticket_id);
                continue;
            }
            self.store.insert_tickets(&children).await?;
            self.store.remove_ticket(ticket.id).await?;
            ticket_ids.extend(children.iter().map(|t| t.id));
        }
        registration.ticket_ids = ticket_ids;
        self.store.upsert_registration(&registration).await?;

        ctx.stats.resolved += 1;
        info!(
            registration = %registration.id,
            payment = %payment.provider_payment_id,
            confidence = outcome.confidence,
            strategy = outcome.strategy.as_str(),
            "Resolved registration"
        );
        Ok(())
    }
}
