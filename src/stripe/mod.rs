//! Stripe provider boundary.
//!
//! The engine talks to Stripe through the [`StripeClient`] trait so tests
//! can substitute a mock and production wires in the live client. Wire data
//! is parsed into closed-enum types here; nothing downstream compares raw
//! provider strings.

pub mod cache;
pub mod live;

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::SubscriptionStatus;

/// A Stripe customer, reduced to the fields the engine uses.
#[derive(Debug, Clone, PartialEq)]
pub struct StripeCustomer {
    pub id: String,
    pub email: Option<String>,
}

/// A live Stripe subscription with its expanded price.
#[derive(Debug, Clone, PartialEq)]
pub struct StripeSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub created: DateTime<Utc>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub metadata: HashMap<String, String>,
    /// Expanded price of the first subscription item, when available.
    pub price: Option<StripePrice>,
    /// Price ID of the first item even when the price was not expanded.
    pub price_id: Option<String>,
}

impl StripeSubscription {
    /// Metadata tag lookup, e.g. `metadata["tier"]`.
    #[must_use]
    pub fn metadata_tag(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// A Stripe price, reduced to the fields tier resolution inspects.
#[derive(Debug, Clone, PartialEq)]
pub struct StripePrice {
    pub id: String,
    pub lookup_key: Option<String>,
    pub nickname: Option<String>,
    pub product_id: Option<String>,
    pub metadata: HashMap<String, String>,
    pub recurring_interval: Option<String>,
}

/// A Stripe product, reduced to the fields tier resolution inspects.
#[derive(Debug, Clone, PartialEq)]
pub struct StripeProduct {
    pub id: String,
    pub name: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Status filter for subscription listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatusFilter {
    All,
    Active,
    Trialing,
}

impl SubscriptionStatusFilter {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Active => "active",
            Self::Trialing => "trialing",
        }
    }
}

/// Trait for the Stripe API operations the engine issues.
///
/// Implementations must treat transient failures and `not_found` uniformly
/// from the caller's perspective: `retrieve_*` return `Ok(None)` on
/// `not_found` so lookup chains fall through to the next strategy.
#[allow(async_fn_in_trait)]
pub trait StripeClient: Send + Sync {
    /// `customers.list({email, limit})`.
    async fn list_customers_by_email(
        &self,
        email: &str,
        limit: u8,
    ) -> Result<Vec<StripeCustomer>>;

    /// `customers.search({query})`, preferred over list when available.
    async fn search_customers_by_email(&self, email: &str) -> Result<Vec<StripeCustomer>>;

    /// `customers.create({email})`.
    async fn create_customer(&self, email: &str) -> Result<StripeCustomer>;

    /// `subscriptions.list({customer, status, limit, expand})`.
    async fn list_subscriptions(
        &self,
        customer_id: &str,
        status: SubscriptionStatusFilter,
    ) -> Result<Vec<StripeSubscription>>;

    /// `subscriptions.retrieve(id, {expand})`; `Ok(None)` on `not_found`.
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<StripeSubscription>>;

    /// `prices.retrieve(id)`; `Ok(None)` on `not_found`.
    async fn retrieve_price(&self, price_id: &str) -> Result<Option<StripePrice>>;

    /// `products.retrieve(id)`; `Ok(None)` on `not_found`.
    async fn retrieve_product(&self, product_id: &str) -> Result<Option<StripeProduct>>;
}

/// Pick the subscription recovery should prefer from a listing: `active`
/// first, then `trialing`, else the most recently created.
#[must_use]
pub fn pick_preferred(subscriptions: Vec<StripeSubscription>) -> Option<StripeSubscription> {
    fn rank(status: SubscriptionStatus) -> u8 {
        match status {
            SubscriptionStatus::Active => 0,
            SubscriptionStatus::Trialing => 1,
            _ => 2,
        }
    }

    subscriptions.into_iter().min_by(|a, b| {
        rank(a.status)
            .cmp(&rank(b.status))
            // Later creation wins further ties.
            .then_with(|| b.created.cmp(&a.created))
    })
}

/// Mock Stripe client for testing.
#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use crate::error::EngineError;
    use std::collections::HashSet;
    use std::sync::{Arc, RwLock};

    /// Mock Stripe client backed by in-memory fixtures.
    ///
    /// Every call is recorded by operation name so tests can assert exactly
    /// which lookup strategies ran; [`poison`](Self::poison) injects
    /// transient failures keyed on the primary argument. Clones share the
    /// same state.
    #[derive(Default, Clone)]
    pub struct MockStripeClient {
        customers: Arc<RwLock<Vec<StripeCustomer>>>,
        subscriptions: Arc<RwLock<Vec<StripeSubscription>>>,
        prices: Arc<RwLock<HashMap<String, StripePrice>>>,
        products: Arc<RwLock<HashMap<String, StripeProduct>>>,
        poisoned: Arc<RwLock<HashSet<String>>>,
        calls: Arc<RwLock<HashMap<String, u64>>>,
        search_unsupported: Arc<RwLock<bool>>,
    }

    impl MockStripeClient {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_customer(&self, id: &str, email: &str) {
            self.customers.write().unwrap().push(StripeCustomer {
                id: id.to_string(),
                email: Some(email.to_string()),
            });
        }

        pub fn add_subscription(&self, subscription: StripeSubscription) {
            self.subscriptions.write().unwrap().push(subscription);
        }

        pub fn add_price(&self, price: StripePrice) {
            self.prices.write().unwrap().insert(price.id.clone(), price);
        }

        pub fn add_product(&self, product: StripeProduct) {
            self.products
                .write()
                .unwrap()
                .insert(product.id.clone(), product);
        }

        /// Make any call whose primary argument equals `key` fail as
        /// transient.
        pub fn poison(&self, key: &str) {
            self.poisoned.write().unwrap().insert(key.to_string());
        }

        /// Simulate an account without the search API; searches error and
        /// callers must fall back to listing.
        pub fn disable_search(&self) {
            *self.search_unsupported.write().unwrap() = true;
        }

        /// Number of times `operation` was invoked.
        #[must_use]
        pub fn call_count(&self, operation: &str) -> u64 {
            self.calls
                .read()
                .unwrap()
                .get(operation)
                .copied()
                .unwrap_or(0)
        }

        fn record(&self, operation: &str) {
            *self
                .calls
                .write()
                .unwrap()
                .entry(operation.to_string())
                .or_insert(0) += 1;
        }

        fn check_poison(&self, operation: &str, key: &str) -> Result<()> {
            if self.poisoned.read().unwrap().contains(key) {
                return Err(EngineError::provider_unavailable(format!(
                    "{operation} failed"
                )));
            }
            Ok(())
        }
    }

    impl StripeClient for MockStripeClient {
        async fn list_customers_by_email(
            &self,
            email: &str,
            limit: u8,
        ) -> Result<Vec<StripeCustomer>> {
            self.record("customers.list");
            self.check_poison("customers.list", email)?;
            Ok(self
                .customers
                .read()
                .unwrap()
                .iter()
                .filter(|c| c.email.as_deref() == Some(email))
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn search_customers_by_email(&self, email: &str) -> Result<Vec<StripeCustomer>> {
            self.record("customers.search");
            if *self.search_unsupported.read().unwrap() {
                return Err(EngineError::provider_unavailable(
                    "customers.search unsupported",
                ));
            }
            self.check_poison("customers.search", email)?;
            Ok(self
                .customers
                .read()
                .unwrap()
                .iter()
                .filter(|c| c.email.as_deref() == Some(email))
                .cloned()
                .collect())
        }

        async fn create_customer(&self, email: &str) -> Result<StripeCustomer> {
            self.record("customers.create");
            self.check_poison("customers.create", email)?;
            let customer = StripeCustomer {
                id: format!("cus_mock_{}", self.customers.read().unwrap().len()),
                email: Some(email.to_string()),
            };
            self.customers.write().unwrap().push(customer.clone());
            Ok(customer)
        }

        async fn list_subscriptions(
            &self,
            customer_id: &str,
            status: SubscriptionStatusFilter,
        ) -> Result<Vec<StripeSubscription>> {
            self.record("subscriptions.list");
            self.check_poison("subscriptions.list", customer_id)?;
            Ok(self
                .subscriptions
                .read()
                .unwrap()
                .iter()
                .filter(|s| s.customer_id == customer_id)
                .filter(|s| match status {
                    SubscriptionStatusFilter::All => true,
                    SubscriptionStatusFilter::Active => {
                        s.status == SubscriptionStatus::Active
                    }
                    SubscriptionStatusFilter::Trialing => {
                        s.status == SubscriptionStatus::Trialing
                    }
                })
                .cloned()
                .collect())
        }

        async fn retrieve_subscription(
            &self,
            subscription_id: &str,
        ) -> Result<Option<StripeSubscription>> {
            self.record("subscriptions.retrieve");
            self.check_poison("subscriptions.retrieve", subscription_id)?;
            Ok(self
                .subscriptions
                .read()
                .unwrap()
                .iter()
                .find(|s| s.id == subscription_id)
                .cloned())
        }

        async fn retrieve_price(&self, price_id: &str) -> Result<Option<StripePrice>> {
            self.record("prices.retrieve");
            self.check_poison("prices.retrieve", price_id)?;
            Ok(self.prices.read().unwrap().get(price_id).cloned())
        }

        async fn retrieve_product(&self, product_id: &str) -> Result<Option<StripeProduct>> {
            self.record("products.retrieve");
            self.check_poison("products.retrieve", product_id)?;
            Ok(self.products.read().unwrap().get(product_id).cloned())
        }
    }

    /// A subscription fixture with sensible defaults.
    #[must_use]
    pub fn subscription_fixture(
        id: &str,
        customer_id: &str,
        status: SubscriptionStatus,
    ) -> StripeSubscription {
        StripeSubscription {
            id: id.to_string(),
            customer_id: customer_id.to_string(),
            status,
            created: chrono::Utc::now() - chrono::Duration::days(30),
            current_period_start: Some(chrono::Utc::now() - chrono::Duration::days(10)),
            current_period_end: Some(chrono::Utc::now() + chrono::Duration::days(20)),
            trial_end: None,
            cancel_at_period_end: false,
            metadata: HashMap::new(),
            price: None,
            price_id: None,
        }
    }
}
