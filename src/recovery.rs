//! Provider record recovery.
//!
//! Given a local subscription record whose Stripe identifiers may be missing
//! or stale, find the live Stripe subscription with an ordered chain of
//! cost-increasing lookup strategies, stopping at the first hit. Every
//! outcome is tagged so callers can both recover the record and backfill the
//! stale identifiers the lookup exposed.

use crate::model::{normalize_email, SubscriptionRecord};
use crate::stripe::{pick_preferred, StripeClient, StripeSubscription, SubscriptionStatusFilter};

/// Terminal classification of a locate attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateStatus {
    /// A live subscription was found.
    Found,
    /// Apple IAP records are not queryable through Stripe.
    SkippedApple,
    /// The record carried no identifiers to try.
    NoStripeIds,
    /// The linked customer exists but has no subscriptions.
    NoSubsForCustomer,
    /// Identifiers existed but every lookup came back empty.
    Missing,
}

/// Which strategy produced the hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMethod {
    BySubscriptionId,
    /// Historical alias field; a hit here drives the one-time migration of
    /// the ID into the canonical field.
    ByLegacyId,
    ByCustomerId,
    /// Email search is the fuzziest strategy; treat hits as lower
    /// confidence.
    ByEmail,
}

/// Tagged result of a locate attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct LocateOutcome {
    pub status: LocateStatus,
    pub subscription: Option<StripeSubscription>,
    pub recovery_method: Option<RecoveryMethod>,
    /// Whether the hit exposed identifiers missing from the local record.
    pub needs_backfill: bool,
}

impl LocateOutcome {
    fn found(subscription: StripeSubscription, method: RecoveryMethod) -> Self {
        Self {
            status: LocateStatus::Found,
            subscription: Some(subscription),
            needs_backfill: !matches!(method, RecoveryMethod::BySubscriptionId),
            recovery_method: Some(method),
        }
    }

    fn empty(status: LocateStatus) -> Self {
        Self {
            status,
            subscription: None,
            recovery_method: None,
            needs_backfill: false,
        }
    }
}

/// The ordered strategy chain, cheap/precise first.
#[derive(Debug, Clone, Copy)]
enum Strategy {
    SubscriptionId,
    LegacySubscriptionId,
    CustomerId,
    Email,
}

const CHAIN: [Strategy; 4] = [
    Strategy::SubscriptionId,
    Strategy::LegacySubscriptionId,
    Strategy::CustomerId,
    Strategy::Email,
];

/// Locates live Stripe subscriptions for local records.
pub struct RecordLocator<'a, C: StripeClient> {
    client: &'a C,
}

#[derive(Default)]
struct ProbeState {
    tried_any: bool,
    customer_listed_empty: bool,
}

impl<'a, C: StripeClient> RecordLocator<'a, C> {
    #[must_use]
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    /// Run the strategy chain for one record.
    ///
    /// Strategy-level provider errors are logged and fall through to the
    /// next strategy; the live client has already retried transient
    /// failures.
    pub async fn locate(&self, record: &SubscriptionRecord) -> LocateOutcome {
        if record.is_apple() {
            return LocateOutcome::empty(LocateStatus::SkippedApple);
        }

        let mut probe = ProbeState::default();
        for strategy in CHAIN {
            if let Some(outcome) = self.try_strategy(strategy, record, &mut probe).await {
                if let Some(method) = outcome.recovery_method {
                    if outcome.needs_backfill {
                        tracing::info!(
                            target: "curio::recovery",
                            record_id = %record.id,
                            method = ?method,
                            "Recovered Stripe subscription; identifiers need backfill"
                        );
                    }
                }
                return outcome;
            }
        }

        if !probe.tried_any {
            LocateOutcome::empty(LocateStatus::NoStripeIds)
        } else if probe.customer_listed_empty {
            LocateOutcome::empty(LocateStatus::NoSubsForCustomer)
        } else {
            LocateOutcome::empty(LocateStatus::Missing)
        }
    }

    async fn try_strategy(
        &self,
        strategy: Strategy,
        record: &SubscriptionRecord,
        probe: &mut ProbeState,
    ) -> Option<LocateOutcome> {
        match strategy {
            Strategy::SubscriptionId => {
                let id = record.stripe_subscription_id.as_deref()?;
                probe.tried_any = true;
                self.retrieve(id, RecoveryMethod::BySubscriptionId).await
            }
            Strategy::LegacySubscriptionId => {
                let id = record.legacy_stripe_subscription_id.as_deref()?;
                if record.stripe_subscription_id.as_deref() == Some(id) {
                    return None;
                }
                probe.tried_any = true;
                self.retrieve(id, RecoveryMethod::ByLegacyId).await
            }
            Strategy::CustomerId => {
                let customer_id = record.stripe_customer_id.as_deref()?;
                probe.tried_any = true;
                match self
                    .client
                    .list_subscriptions(customer_id, SubscriptionStatusFilter::All)
                    .await
                {
                    Ok(subs) if subs.is_empty() => {
                        probe.customer_listed_empty = true;
                        None
                    }
                    Ok(subs) => pick_preferred(subs)
                        .map(|sub| LocateOutcome::found(sub, RecoveryMethod::ByCustomerId)),
                    Err(error) => {
                        tracing::warn!(
                            target: "curio::recovery",
                            record_id = %record.id,
                            error = %error,
                            "Customer subscription listing failed; trying next strategy"
                        );
                        None
                    }
                }
            }
            Strategy::Email => {
                let email = normalize_email(&record.user_email);
                if email.is_empty() {
                    return None;
                }
                probe.tried_any = true;
                let customer = self.find_customer_by_email(&email).await?;
                match self
                    .client
                    .list_subscriptions(&customer.id, SubscriptionStatusFilter::All)
                    .await
                {
                    Ok(subs) => pick_preferred(subs)
                        .map(|sub| LocateOutcome::found(sub, RecoveryMethod::ByEmail)),
                    Err(error) => {
                        tracing::warn!(
                            target: "curio::recovery",
                            record_id = %record.id,
                            error = %error,
                            "Subscription listing for email-matched customer failed"
                        );
                        None
                    }
                }
            }
        }
    }

    async fn retrieve(&self, id: &str, method: RecoveryMethod) -> Option<LocateOutcome> {
        match self.client.retrieve_subscription(id).await {
            Ok(Some(sub)) => Some(LocateOutcome::found(sub, method)),
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(
                    target: "curio::recovery",
                    subscription_id = id,
                    error = %error,
                    "Subscription retrieval failed; trying next strategy"
                );
                None
            }
        }
    }

    /// Search API preferred; the list API is the fallback when search is
    /// unavailable.
    async fn find_customer_by_email(&self, email: &str) -> Option<crate::stripe::StripeCustomer> {
        match self.client.search_customers_by_email(email).await {
            Ok(customers) => customers.into_iter().next(),
            Err(error) => {
                tracing::debug!(
                    target: "curio::recovery",
                    error = %error,
                    "Customer search unavailable; falling back to list"
                );
                match self.client.list_customers_by_email(email, 1).await {
                    Ok(customers) => customers.into_iter().next(),
                    Err(error) => {
                        tracing::warn!(
                            target: "curio::recovery",
                            error = %error,
                            "Customer list by email failed"
                        );
                        None
                    }
                }
            }
        }
    }
}
