//! Storage traits for users and subscription records.
//!
//! The engine treats persistence as a generic entity store; implement these
//! traits over your database. In-memory implementations are provided for
//! testing.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    normalize_email, Provider, SubscriptionLevel, SubscriptionRecord, SubscriptionStatus, Tier,
    User,
};

/// Atomic entitlement write: all three fields land together so an observer
/// never sees a partially-updated entitlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementUpdate {
    pub level: SubscriptionLevel,
    pub status: Option<SubscriptionStatus>,
    pub tier: Option<Tier>,
}

/// Partial update applied to a subscription record after recovery.
///
/// `None` fields are left untouched; identifiers are only ever added, never
/// cleared, except for the legacy alias once it has been migrated into the
/// canonical field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionBackfill {
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub tier: Option<Tier>,
    pub status: Option<SubscriptionStatus>,
    pub clear_legacy_id: bool,
}

impl SubscriptionBackfill {
    /// Whether applying this backfill would change anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stripe_subscription_id.is_none()
            && self.stripe_customer_id.is_none()
            && self.tier.is_none()
            && self.status.is_none()
            && !self.clear_legacy_id
    }
}

/// Store for user accounts.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<User>>;

    /// Lookup by email; implementations must compare normalized forms.
    async fn get_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Persist the entitlement triple atomically.
    async fn update_entitlement(&self, id: Uuid, update: &EntitlementUpdate) -> Result<()>;

    /// Backfill the Stripe customer linkage discovered during recovery.
    async fn set_stripe_customer_id(&self, id: Uuid, customer_id: &str) -> Result<()>;

    /// A bounded, stably-ordered sample of users for drift scanning.
    async fn sample(&self, limit: usize) -> Result<Vec<User>>;
}

/// Store for local subscription records.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn list_all(&self) -> Result<Vec<SubscriptionRecord>>;

    /// All records owned by the user, matched by id or normalized email.
    async fn find_for_user(&self, user: &User) -> Result<Vec<SubscriptionRecord>>;

    /// The user's active record for a given provider, if any.
    async fn find_active_for_user(
        &self,
        user: &User,
        provider: Provider,
    ) -> Result<Option<SubscriptionRecord>>;

    async fn apply_backfill(&self, id: Uuid, backfill: &SubscriptionBackfill) -> Result<()>;
}

/// In-memory stores for tests.
#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, RwLock};

    /// In-memory [`UserStore`].
    #[derive(Default, Clone)]
    pub struct InMemoryUserStore {
        users: Arc<RwLock<HashMap<Uuid, User>>>,
    }

    impl InMemoryUserStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a user for a test.
        pub fn insert(&self, user: User) {
            self.users.write().unwrap().insert(user.id, user);
        }

        /// Snapshot a user for assertions.
        #[must_use]
        pub fn snapshot(&self, id: Uuid) -> Option<User> {
            self.users.read().unwrap().get(&id).cloned()
        }
    }

    #[async_trait]
    impl UserStore for InMemoryUserStore {
        async fn get(&self, id: Uuid) -> Result<Option<User>> {
            Ok(self.users.read().unwrap().get(&id).cloned())
        }

        async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
            let wanted = normalize_email(email);
            Ok(self
                .users
                .read()
                .unwrap()
                .values()
                .find(|u| u.normalized_email() == wanted)
                .cloned())
        }

        async fn update_entitlement(&self, id: Uuid, update: &EntitlementUpdate) -> Result<()> {
            let mut users = self.users.write().unwrap();
            if let Some(user) = users.get_mut(&id) {
                user.subscription_level = update.level;
                user.subscription_status = update.status;
                user.subscription_tier = update.tier;
            }
            Ok(())
        }

        async fn set_stripe_customer_id(&self, id: Uuid, customer_id: &str) -> Result<()> {
            let mut users = self.users.write().unwrap();
            if let Some(user) = users.get_mut(&id) {
                user.stripe_customer_id = Some(customer_id.to_string());
            }
            Ok(())
        }

        async fn sample(&self, limit: usize) -> Result<Vec<User>> {
            let mut users: Vec<User> = self.users.read().unwrap().values().cloned().collect();
            // Stable order so scans are deterministic.
            users.sort_by(|a, b| a.email.cmp(&b.email));
            users.truncate(limit);
            Ok(users)
        }
    }

    /// In-memory [`SubscriptionStore`].
    #[derive(Default, Clone)]
    pub struct InMemorySubscriptionStore {
        records: Arc<RwLock<HashMap<Uuid, SubscriptionRecord>>>,
    }

    impl InMemorySubscriptionStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, record: SubscriptionRecord) {
            self.records.write().unwrap().insert(record.id, record);
        }

        #[must_use]
        pub fn snapshot(&self, id: Uuid) -> Option<SubscriptionRecord> {
            self.records.read().unwrap().get(&id).cloned()
        }

        fn owned_by(record: &SubscriptionRecord, user: &User) -> bool {
            record.user_id == Some(user.id)
                || normalize_email(&record.user_email) == user.normalized_email()
        }
    }

    #[async_trait]
    impl SubscriptionStore for InMemorySubscriptionStore {
        async fn list_all(&self) -> Result<Vec<SubscriptionRecord>> {
            let mut records: Vec<SubscriptionRecord> =
                self.records.read().unwrap().values().cloned().collect();
            // Stable order so batch runs are deterministic.
            records.sort_by(|a, b| a.user_email.cmp(&b.user_email).then(a.id.cmp(&b.id)));
            Ok(records)
        }

        async fn find_for_user(&self, user: &User) -> Result<Vec<SubscriptionRecord>> {
            Ok(self
                .records
                .read()
                .unwrap()
                .values()
                .filter(|r| Self::owned_by(r, user))
                .cloned()
                .collect())
        }

        async fn find_active_for_user(
            &self,
            user: &User,
            provider: Provider,
        ) -> Result<Option<SubscriptionRecord>> {
            Ok(self
                .records
                .read()
                .unwrap()
                .values()
                .find(|r| {
                    Self::owned_by(r, user)
                        && r.provider == Some(provider)
                        && r.status == SubscriptionStatus::Active
                })
                .cloned())
        }

        async fn apply_backfill(&self, id: Uuid, backfill: &SubscriptionBackfill) -> Result<()> {
            let mut records = self.records.write().unwrap();
            if let Some(record) = records.get_mut(&id) {
                if let Some(ref sub_id) = backfill.stripe_subscription_id {
                    record.stripe_subscription_id = Some(sub_id.clone());
                }
                if let Some(ref cus_id) = backfill.stripe_customer_id {
                    record.stripe_customer_id = Some(cus_id.clone());
                }
                if let Some(tier) = backfill.tier {
                    record.tier = Some(tier);
                }
                if let Some(status) = backfill.status {
                    record.status = status;
                }
                if backfill.clear_legacy_id {
                    record.legacy_stripe_subscription_id = None;
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::{InMemorySubscriptionStore, InMemoryUserStore};
    use super::*;
    use crate::model::{Platform, Role};
    use chrono::Utc;

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

    #[tokio::test]
    async fn user_lookup_by_email_is_normalized() {
        let store = InMemoryUserStore::new();
        let u = user("Jane@Example.com");
        store.insert(u.clone());

        let found = store.get_by_email("  jane@example.COM ").await.unwrap();
        assert_eq!(found.map(|f| f.id), Some(u.id));
    }

    #[tokio::test]
    async fn entitlement_update_writes_all_three_fields() {
        let store = InMemoryUserStore::new();
        let mut u = user("owner@example.com");
        u.subscription_level = SubscriptionLevel::Paid;
        u.subscription_status = Some(SubscriptionStatus::Active);
        u.subscription_tier = Some(Tier::Pro);
        let id = u.id;
        store.insert(u);

        store
            .update_entitlement(
                id,
                &EntitlementUpdate {
                    level: SubscriptionLevel::Free,
                    status: None,
                    tier: None,
                },
            )
            .await
            .unwrap();

        let after = store.snapshot(id).unwrap();
        assert_eq!(after.subscription_level, SubscriptionLevel::Free);
        assert_eq!(after.subscription_status, None);
        assert_eq!(after.subscription_tier, None);
    }

    #[tokio::test]
    async fn backfill_adds_identifiers_without_clearing() {
        let store = InMemorySubscriptionStore::new();
        let owner = user("owner@example.com");
        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: Some(owner.id),
            user_email: owner.email.clone(),
            provider: Some(Provider::Stripe),
            stripe_subscription_id: None,
            legacy_stripe_subscription_id: Some("sub_legacy".to_string()),
            stripe_customer_id: Some("cus_existing".to_string()),
            tier: Some(Tier::Premium),
            status: SubscriptionStatus::Active,
            billing_interval: None,
            current_period_start: None,
            current_period_end: None,
            trial_end: None,
            started_at: None,
        };
        let id = record.id;
        store.insert(record);

        store
            .apply_backfill(
                id,
                &SubscriptionBackfill {
                    stripe_subscription_id: Some("sub_legacy".to_string()),
                    clear_legacy_id: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let after = store.snapshot(id).unwrap();
        assert_eq!(after.stripe_subscription_id.as_deref(), Some("sub_legacy"));
        assert_eq!(after.legacy_stripe_subscription_id, None);
        // Untouched fields survive.
        assert_eq!(after.stripe_customer_id.as_deref(), Some("cus_existing"));
        assert_eq!(after.tier, Some(Tier::Premium));
    }
}
