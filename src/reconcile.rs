//! Single-user reconciliation.
//!
//! Determines the correct billing provider for one account, resolves
//! tier/status from it, and persists the entitlement triple only when it
//! changed. Mobile IAP takes precedence when the account's platform is
//! mobile (its state is mirrored locally by a separate sync path, so no
//! live call is made); otherwise Stripe is consulted; with no subscription
//! anywhere the account defaults to free.
//!
//! Idempotent by construction: the final write is a full-field overwrite,
//! so rerunning with no provider change reports `updated = false`.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::EngineConfig;
use crate::drift::DriftStore;
use crate::error::{EngineError, Result};
use crate::model::{
    normalize_email, Provider, Role, SubscriptionLevel, SubscriptionStatus, Tier, User,
};
use crate::store::{EntitlementUpdate, SubscriptionStore, UserStore};
use crate::stripe::{pick_preferred, StripeClient, SubscriptionStatusFilter};
use crate::tier::TierResolver;

/// Identity of the invoking principal.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub role: Role,
}

impl Caller {
    /// An admin principal (operator tooling).
    #[must_use]
    pub fn admin() -> Self {
        Self {
            user_id: None,
            email: None,
            role: Role::Admin,
        }
    }

    /// A regular account owner.
    #[must_use]
    pub fn member(user_id: Uuid, email: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id),
            email: Some(email.into()),
            role: Role::Member,
        }
    }
}

/// How a reconcile target is addressed.
#[derive(Debug, Clone)]
pub enum UserRef {
    Id(Uuid),
    Email(String),
}

/// Which path produced the resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileSource {
    AppleSubscription,
    StripeSubscription,
    DefaultFree,
}

impl ReconcileSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppleSubscription => "apple_subscription",
            Self::StripeSubscription => "stripe_subscription",
            Self::DefaultFree => "default_free",
        }
    }
}

/// Result of a reconcile invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub source: ReconcileSource,
    pub subscription_level: SubscriptionLevel,
    pub subscription_status: Option<SubscriptionStatus>,
    pub subscription_tier: Option<Tier>,
    /// Whether stored state differed and was overwritten.
    pub updated: bool,
    pub details: String,
}

struct Resolution {
    source: ReconcileSource,
    level: SubscriptionLevel,
    status: Option<SubscriptionStatus>,
    tier: Option<Tier>,
    /// Customer linkage discovered along the way, to backfill onto the user.
    backfill_customer: Option<String>,
    details: String,
}

/// Reconciles a single account against its billing provider.
pub struct Reconciler<U, S, C> {
    users: U,
    subs: S,
    client: Arc<C>,
    price_tiers: HashMap<String, Tier>,
    drift: Option<Arc<dyn DriftStore>>,
}

impl<U, S, C> Reconciler<U, S, C>
where
    U: UserStore,
    S: SubscriptionStore,
    C: StripeClient,
{
    #[must_use]
    pub fn new(users: U, subs: S, client: Arc<C>, config: &EngineConfig) -> Self {
        Self {
            users,
            subs,
            client,
            price_tiers: config.price_tiers.clone(),
            drift: None,
        }
    }

    /// Wire a drift store so a successful run closes the account's open
    /// drift record.
    #[must_use]
    pub fn with_drift_store(mut self, drift: Arc<dyn DriftStore>) -> Self {
        self.drift = Some(drift);
        self
    }

    /// Reconcile one account.
    ///
    /// Authorization: the account owner or an admin. Provider outages
    /// propagate as errors rather than downgrading the account; only a
    /// confirmed absence of subscriptions resolves to free.
    pub async fn reconcile(
        &self,
        caller: Option<&Caller>,
        target: UserRef,
    ) -> Result<ReconcileOutcome> {
        authorize(caller, &target)?;
        let user = self.load_user(&target).await?;

        let resolution = match self.apple_resolution(&user).await? {
            Some(resolution) => resolution,
            None => self.stripe_resolution(&user).await?,
        };

        let changed = user.subscription_level != resolution.level
            || user.subscription_status != resolution.status
            || user.subscription_tier != resolution.tier;

        if changed {
            self.users
                .update_entitlement(
                    user.id,
                    &EntitlementUpdate {
                        level: resolution.level,
                        status: resolution.status,
                        tier: resolution.tier,
                    },
                )
                .await?;
        }

        if let Some(ref customer_id) = resolution.backfill_customer {
            if user.stripe_customer_id.is_none() {
                self.users
                    .set_stripe_customer_id(user.id, customer_id)
                    .await?;
            }
        }

        if let Some(ref drift) = self.drift {
            if drift.resolve_for_user(user.id).await? {
                tracing::info!(
                    target: "curio::reconcile",
                    user_id = %user.id,
                    "Closed open drift record after reconcile"
                );
            }
        }

        tracing::info!(
            target: "curio::reconcile",
            user_id = %user.id,
            source = resolution.source.as_str(),
            level = resolution.level.as_str(),
            updated = changed,
            "Reconciled account entitlement"
        );

        Ok(ReconcileOutcome {
            source: resolution.source,
            subscription_level: resolution.level,
            subscription_status: resolution.status,
            subscription_tier: resolution.tier,
            updated: changed,
            details: resolution.details,
        })
    }

    async fn load_user(&self, target: &UserRef) -> Result<User> {
        let user = match target {
            UserRef::Id(id) => self.users.get(*id).await?,
            UserRef::Email(email) => self.users.get_by_email(email).await?,
        };
        user.ok_or_else(|| EngineError::not_found("user not found"))
    }

    /// Mobile accounts: an active local Apple row wins without a live call.
    async fn apple_resolution(&self, user: &User) -> Result<Option<Resolution>> {
        if !user.platform.is_mobile() {
            return Ok(None);
        }
        let Some(row) = self
            .subs
            .find_active_for_user(user, Provider::Apple)
            .await?
        else {
            return Ok(None);
        };

        Ok(Some(Resolution {
            source: ReconcileSource::AppleSubscription,
            level: SubscriptionLevel::Paid,
            status: Some(row.status),
            // The row's stored tier is authoritative for IAP; a paid signal
            // with no tier defaults to premium.
            tier: row.tier.or(Some(Tier::Premium)),
            backfill_customer: None,
            details: "active mobile subscription on record".to_string(),
        }))
    }

    async fn stripe_resolution(&self, user: &User) -> Result<Resolution> {
        let email = user.normalized_email();
        let (customer_id, discovered) = match user.stripe_customer_id {
            Some(ref id) => (id.clone(), false),
            None => match self.find_customer_by_email(&email).await? {
                Some(customer) => (customer.id, true),
                None => {
                    // No customer anywhere: create one so the linkage exists
                    // for future checkouts, then resolve to free.
                    let customer = self.client.create_customer(&email).await?;
                    tracing::info!(
                        target: "curio::reconcile",
                        user_id = %user.id,
                        "Created Stripe customer during reconcile"
                    );
                    return Ok(Resolution {
                        backfill_customer: Some(customer.id),
                        details: "no Stripe customer existed; created one".to_string(),
                        ..default_free()
                    });
                }
            },
        };

        let subscriptions = self
            .client
            .list_subscriptions(&customer_id, SubscriptionStatusFilter::All)
            .await?;
        let candidate = pick_preferred(
            subscriptions
                .into_iter()
                .filter(|s| s.status.is_paying())
                .collect(),
        );

        let Some(subscription) = candidate else {
            return Ok(Resolution {
                backfill_customer: discovered.then(|| customer_id.clone()),
                details: "no active or trialing Stripe subscription".to_string(),
                ..default_free()
            });
        };

        let resolver = TierResolver::new(&*self.client, &self.price_tiers);
        let (resolved_tier, tier_note) = match resolver.resolve(&subscription).await {
            Ok(tier) => (tier, tier.is_none().then_some("tier unresolved; kept stored value")),
            Err(error) => {
                tracing::warn!(
                    target: "curio::reconcile",
                    user_id = %user.id,
                    error = %error,
                    "Tier resolution failed; keeping stored tier"
                );
                (None, Some("tier resolution failed; kept stored value"))
            }
        };
        let tier = resolved_tier
            .or(user.subscription_tier)
            .or(Some(Tier::Premium));

        Ok(Resolution {
            source: ReconcileSource::StripeSubscription,
            level: SubscriptionLevel::Paid,
            status: Some(subscription.status),
            tier,
            backfill_customer: discovered.then(|| customer_id.clone()),
            details: tier_note
                .unwrap_or("resolved from live Stripe subscription")
                .to_string(),
        })
    }

    /// Search API preferred, list fallback when search is unavailable;
    /// listing failures propagate (an outage must not downgrade anyone).
    async fn find_customer_by_email(
        &self,
        email: &str,
    ) -> Result<Option<crate::stripe::StripeCustomer>> {
        match self.client.search_customers_by_email(email).await {
            Ok(customers) => Ok(customers.into_iter().next()),
            Err(error) => {
                tracing::debug!(
                    target: "curio::reconcile",
                    error = %error,
                    "Customer search unavailable; falling back to list"
                );
                Ok(self
                    .client
                    .list_customers_by_email(email, 1)
                    .await?
                    .into_iter()
                    .next())
            }
        }
    }
}

fn default_free() -> Resolution {
    Resolution {
        source: ReconcileSource::DefaultFree,
        level: SubscriptionLevel::Free,
        status: None,
        tier: None,
        backfill_customer: None,
        details: String::new(),
    }
}

fn authorize(caller: Option<&Caller>, target: &UserRef) -> Result<()> {
    let caller =
        caller.ok_or_else(|| EngineError::unauthorized("caller identity required"))?;
    if caller.role.is_admin() {
        return Ok(());
    }
    let allowed = match target {
        UserRef::Id(id) => caller.user_id == Some(*id),
        UserRef::Email(email) => {
            caller.email.as_deref().map(normalize_email) == Some(normalize_email(email))
        }
    };
    if allowed {
        Ok(())
    } else {
        Err(EngineError::forbidden(
            "caller may only reconcile their own account",
        ))
    }
}
