//! Invocation facade.
//!
//! Bundles configuration, stores, and the provider client cache, and exposes
//! the engine's public operations. Components are constructed per
//! invocation so the engine stays request-scoped; the client cache is the
//! only state shared across invocations.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::drift::{DriftDetector, DriftScanSummary, DriftStore};
use crate::error::Result;
use crate::model::{SubscriptionRecord, User};
use crate::reconcile::{Caller, ReconcileOutcome, Reconciler, UserRef};
use crate::repair::{RepairDriver, RepairOptions, RepairSummary};
use crate::resolver::{resolve_access_now, ResolvedEntitlement};
use crate::store::{SubscriptionStore, UserStore};
use crate::stripe::cache::StripeClientCache;
use crate::stripe::live::{LiveStripeClient, LiveStripeClientConfig};
use crate::stripe::StripeClient;

/// The entitlement reconciliation engine.
pub struct Engine<U, S, D, C> {
    users: U,
    subs: S,
    drift: D,
    config: EngineConfig,
    clients: StripeClientCache<C>,
}

impl<U, S, D> Engine<U, S, D, LiveStripeClient>
where
    U: UserStore + Clone,
    S: SubscriptionStore + Clone,
    D: DriftStore + Clone + 'static,
{
    /// Build an engine wired to the live Stripe API.
    #[must_use]
    pub fn with_live_client(users: U, subs: S, drift: D, config: EngineConfig) -> Self {
        let timeout_seconds = config.provider_timeout.as_secs();
        let clients = StripeClientCache::with_ttl(config.client_cache_ttl, move |secret| {
            LiveStripeClient::new(
                secret.clone(),
                LiveStripeClientConfig::default().timeout_seconds(timeout_seconds),
            )
        });
        Self::new(users, subs, drift, config, clients)
    }
}

impl<U, S, D, C> Engine<U, S, D, C>
where
    U: UserStore + Clone,
    S: SubscriptionStore + Clone,
    D: DriftStore + Clone + 'static,
    C: StripeClient,
{
    /// Build an engine over an explicit client cache (tests inject fakes
    /// here).
    #[must_use]
    pub fn new(
        users: U,
        subs: S,
        drift: D,
        config: EngineConfig,
        clients: StripeClientCache<C>,
    ) -> Self {
        Self {
            users,
            subs,
            drift,
            config,
            clients,
        }
    }

    /// Reconcile one account. Owner or admin only.
    pub async fn reconcile_user(
        &self,
        caller: Option<&Caller>,
        target: UserRef,
    ) -> Result<ReconcileOutcome> {
        let client = self.client()?;
        Reconciler::new(
            self.users.clone(),
            self.subs.clone(),
            client,
            &self.config,
        )
        .with_drift_store(Arc::new(self.drift.clone()))
        .reconcile(caller, target)
        .await
    }

    /// Run a bulk repair pass. Admin only.
    pub async fn repair_tiers(
        &self,
        caller: Option<&Caller>,
        options: RepairOptions,
    ) -> Result<RepairSummary> {
        let client = self.client()?;
        RepairDriver::new(
            self.users.clone(),
            self.subs.clone(),
            client,
            &self.config,
        )
        .repair_tiers(caller, options)
        .await
    }

    /// Pure canonical resolution; callable by any internal consumer.
    #[must_use]
    pub fn resolve_access(
        &self,
        user: &User,
        subscription: Option<&SubscriptionRecord>,
    ) -> ResolvedEntitlement {
        resolve_access_now(user, subscription)
    }

    /// Scan a bounded user sample for entitlement drift.
    pub async fn detect_drift(&self, sample_limit: usize) -> Result<DriftScanSummary> {
        DriftDetector::new(
            self.users.clone(),
            self.subs.clone(),
            self.drift.clone(),
        )
        .scan(sample_limit)
        .await
    }

    fn client(&self) -> Result<Arc<C>> {
        self.clients.get(&self.config.stripe_secret_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drift::test::InMemoryDriftStore;
    use crate::model::{
        Platform, Role, SubscriptionLevel, SubscriptionStatus, Tier,
    };
    use crate::store::test::{InMemorySubscriptionStore, InMemoryUserStore};
    use crate::stripe::test::{subscription_fixture, MockStripeClient};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    const TEST_KEY: &str = "sk_test_4eC39HqLyjWDarjtT1zdp7dc";

    fn config() -> EngineConfig {
        EngineConfig::builder()
            .with_stripe_secret_key(TEST_KEY.to_string())
            .build()
            .unwrap()
    }

    fn user(email: &str) -> User {
        User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            role: Role::Member,
            platform: Platform::Web,
            subscription_level: SubscriptionLevel::Free,
            subscription_status: None,
            subscription_tier: None,
            stripe_customer_id: None,
            created_at: Utc::now() - chrono::Duration::days(400),
        }
    }

    struct Fixture {
        users: InMemoryUserStore,
        subs: InMemorySubscriptionStore,
        drift: InMemoryDriftStore,
        client: MockStripeClient,
        builds: Arc<AtomicU32>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                users: InMemoryUserStore::new(),
                subs: InMemorySubscriptionStore::new(),
                drift: InMemoryDriftStore::new(),
                client: MockStripeClient::new(),
                builds: Arc::new(AtomicU32::new(0)),
            }
        }

        fn engine(
            &self,
        ) -> Engine<InMemoryUserStore, InMemorySubscriptionStore, InMemoryDriftStore, MockStripeClient>
        {
            let mock = self.client.clone();
            let builds = Arc::clone(&self.builds);
            let cache = StripeClientCache::new(move |_secret| {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(mock.clone())
            });
            Engine::new(
                self.users.clone(),
                self.subs.clone(),
                self.drift.clone(),
                config(),
                cache,
            )
        }
    }

    #[tokio::test]
    async fn reconcile_runs_through_the_facade() {
        let fx = Fixture::new();
        let mut u = user("web@example.com");
        u.stripe_customer_id = Some("cus_1".to_string());
        fx.users.insert(u.clone());
        let mut sub = subscription_fixture("sub_1", "cus_1", SubscriptionStatus::Active);
        sub.metadata.insert("tier".to_string(), "pro".to_string());
        fx.client.add_subscription(sub);

        let outcome = fx
            .engine()
            .reconcile_user(Some(&Caller::admin()), UserRef::Id(u.id))
            .await
            .unwrap();

        assert!(outcome.updated);
        assert_eq!(outcome.subscription_tier, Some(Tier::Pro));
    }

    #[tokio::test]
    async fn invocations_share_one_cached_client() {
        let fx = Fixture::new();
        let u = user("web@example.com");
        fx.users.insert(u.clone());
        fx.client.add_customer("cus_1", "web@example.com");

        let engine = fx.engine();
        engine
            .reconcile_user(Some(&Caller::admin()), UserRef::Id(u.id))
            .await
            .unwrap();
        engine
            .reconcile_user(Some(&Caller::admin()), UserRef::Id(u.id))
            .await
            .unwrap();

        assert_eq!(fx.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drift_detected_then_closed_by_reconcile() {
        let fx = Fixture::new();
        // Stored free, but the provider has an active subscription.
        let mut u = user("drifted@example.com");
        u.stripe_customer_id = Some("cus_1".to_string());
        fx.users.insert(u.clone());
        let rec = crate::model::SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: Some(u.id),
            user_email: u.email.clone(),
            provider: Some(crate::model::Provider::Stripe),
            stripe_subscription_id: Some("sub_1".to_string()),
            legacy_stripe_subscription_id: None,
            stripe_customer_id: Some("cus_1".to_string()),
            tier: Some(Tier::Premium),
            status: SubscriptionStatus::Active,
            billing_interval: None,
            current_period_start: None,
            current_period_end: Some(Utc::now() + chrono::Duration::days(20)),
            trial_end: None,
            started_at: Some(Utc::now() - chrono::Duration::days(30)),
        };
        fx.subs.insert(rec);
        let mut live = subscription_fixture("sub_1", "cus_1", SubscriptionStatus::Active);
        live.metadata.insert("tier".to_string(), "premium".to_string());
        fx.client.add_subscription(live);

        let engine = fx.engine();

        let scan = engine.detect_drift(10).await.unwrap();
        assert_eq!(scan.detected, 1);
        assert_eq!(fx.drift.list_open().await.unwrap().len(), 1);

        engine
            .reconcile_user(Some(&Caller::admin()), UserRef::Id(u.id))
            .await
            .unwrap();
        assert!(fx.drift.list_open().await.unwrap().is_empty());

        // A rescan of the now-consistent account stays clean.
        let rescan = engine.detect_drift(10).await.unwrap();
        assert_eq!(rescan.detected, 0);
    }

    #[tokio::test]
    async fn repair_runs_through_the_facade() {
        let fx = Fixture::new();
        let u = user("found@example.com");
        fx.users.insert(u);
        let rec = crate::model::SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: None,
            user_email: "found@example.com".to_string(),
            provider: Some(crate::model::Provider::Stripe),
            stripe_subscription_id: None,
            legacy_stripe_subscription_id: None,
            stripe_customer_id: None,
            tier: None,
            status: SubscriptionStatus::Active,
            billing_interval: None,
            current_period_start: None,
            current_period_end: Some(Utc::now() + chrono::Duration::days(20)),
            trial_end: None,
            started_at: None,
        };
        fx.subs.insert(rec);
        fx.client.add_customer("cus_found", "found@example.com");
        fx.client.add_subscription(subscription_fixture(
            "sub_found",
            "cus_found",
            SubscriptionStatus::Active,
        ));

        let summary = fx
            .engine()
            .repair_tiers(Some(&Caller::admin()), RepairOptions::default())
            .await
            .unwrap();

        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.recovered_by_email, 1);
    }

    #[tokio::test]
    async fn resolve_access_is_exposed_unchanged() {
        let fx = Fixture::new();
        let mut u = user("pure@example.com");
        u.subscription_level = SubscriptionLevel::Paid;
        u.subscription_tier = Some(Tier::Pro);

        let resolved = fx.engine().resolve_access(&u, None);
        assert!(resolved.has_paid_access);
        assert!(resolved.has_pro_access);
        assert_eq!(resolved.plan_label, "Pro");
    }
}
