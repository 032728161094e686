//! Drift detection between canonical and stored entitlement.
//!
//! A background comparison producing a queue of accounts whose canonical
//! resolution disagrees with stored state, for operator triage. Scheduling
//! is external; this module only exposes the scan. Records are deduplicated
//! per user (one open record at a time) and closed by a subsequent
//! successful reconcile.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{pick_authoritative, Tier, User};
use crate::resolver::{resolve_access_now, EntitlementSource, ResolvedEntitlement};
use crate::store::{SubscriptionStore, UserStore};

/// Kind of disagreement between canonical and stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftType {
    TierMismatch,
    PaidFlagMismatch,
    StaleProviderLink,
}

impl DriftType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TierMismatch => "tier_mismatch",
            Self::PaidFlagMismatch => "paid_flag_mismatch",
            Self::StaleProviderLink => "stale_provider_link",
        }
    }
}

/// Operator-facing severity.
///
/// `Critical` means a paying user is under-provisioned or a non-paying user
/// over-provisioned; everything else is a `Warning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftSeverity {
    Critical,
    Warning,
}

/// A detected mismatch, queued for operator triage.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub user_email: String,
    pub drift_type: DriftType,
    pub severity: DriftSeverity,
    pub details: String,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
}

/// Store for drift records.
#[async_trait]
pub trait DriftStore: Send + Sync {
    /// The user's open (unresolved) record, if any.
    async fn open_record(&self, user_id: Uuid) -> Result<Option<DriftRecord>>;

    async fn insert(&self, record: DriftRecord) -> Result<()>;

    /// Mark the user's open records resolved; returns whether any were.
    async fn resolve_for_user(&self, user_id: Uuid) -> Result<bool>;

    async fn list_open(&self) -> Result<Vec<DriftRecord>>;
}

/// Result of one drift scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftScanSummary {
    pub examined: usize,
    pub detected: usize,
    /// Users skipped because a record is already open for them.
    pub skipped_existing: usize,
}

/// Compares canonical resolution against stored user fields.
pub struct DriftDetector<U, S, D> {
    users: U,
    subs: S,
    store: D,
}

impl<U, S, D> DriftDetector<U, S, D>
where
    U: UserStore,
    S: SubscriptionStore,
    D: DriftStore,
{
    #[must_use]
    pub fn new(users: U, subs: S, store: D) -> Self {
        Self { users, subs, store }
    }

    /// Scan a bounded user sample for drift.
    pub async fn scan(&self, sample_limit: usize) -> Result<DriftScanSummary> {
        let users = self.users.sample(sample_limit).await?;
        let mut summary = DriftScanSummary {
            examined: users.len(),
            detected: 0,
            skipped_existing: 0,
        };

        for user in &users {
            if self.store.open_record(user.id).await?.is_some() {
                summary.skipped_existing += 1;
                continue;
            }

            let records = self.subs.find_for_user(user).await?;
            let authoritative = pick_authoritative(&records);
            // Resolve against a neutral snapshot: the stored entitlement
            // fields are the thing under test and must not feed back into
            // the canonical side of the comparison.
            let baseline = User {
                subscription_level: crate::model::SubscriptionLevel::Free,
                subscription_status: None,
                subscription_tier: None,
                ..user.clone()
            };
            let resolved = resolve_access_now(&baseline, authoritative);

            let stale_link = authoritative.and_then(|record| {
                match (&user.stripe_customer_id, &record.stripe_customer_id) {
                    (Some(stored), Some(actual)) if stored != actual => Some(actual.clone()),
                    _ => None,
                }
            });

            if let Some(drift) = classify(user, &resolved, stale_link) {
                tracing::info!(
                    target: "curio::drift",
                    user_id = %user.id,
                    drift_type = drift.drift_type.as_str(),
                    severity = ?drift.severity,
                    "Entitlement drift detected"
                );
                self.store.insert(drift).await?;
                summary.detected += 1;
            }
        }

        Ok(summary)
    }
}

/// Classify a user's drift, if any.
fn classify(
    user: &User,
    resolved: &ResolvedEntitlement,
    stale_link: Option<String>,
) -> Option<DriftRecord> {
    // The new-account window is an ephemeral grant that is deliberately
    // never persisted; the admin override is operational and likewise not
    // stored. Neither is drift.
    if matches!(
        resolved.source,
        EntitlementSource::NewAccountTrial | EntitlementSource::Admin
    ) {
        return None;
    }

    let stored_paid = user.subscription_level.is_paid();

    let (drift_type, severity, details) = if resolved.has_paid_access != stored_paid {
        let details = if resolved.has_paid_access {
            "canonical resolution grants paid access but the account is stored as free"
        } else {
            "account is stored as paid but canonical resolution grants no paid access"
        };
        (
            DriftType::PaidFlagMismatch,
            DriftSeverity::Critical,
            details.to_string(),
        )
    } else if resolved.has_paid_access && resolved.tier != user.subscription_tier {
        let under_provisioned =
            resolved.has_paid_access && resolved.tier == Some(Tier::Pro);
        (
            DriftType::TierMismatch,
            if under_provisioned {
                DriftSeverity::Critical
            } else {
                DriftSeverity::Warning
            },
            format!(
                "canonical tier {} vs stored {}",
                resolved.tier.map(|t| t.as_str()).unwrap_or("none"),
                user.subscription_tier.map(|t| t.as_str()).unwrap_or("none"),
            ),
        )
    } else if let Some(actual) = stale_link {
        (
            DriftType::StaleProviderLink,
            DriftSeverity::Warning,
            format!("stored customer linkage does not match the authoritative subscription ({actual})"),
        )
    } else {
        return None;
    };

    Some(DriftRecord {
        id: Uuid::new_v4(),
        user_id: user.id,
        user_email: user.email.clone(),
        drift_type,
        severity,
        details,
        detected_at: Utc::now(),
        resolved: false,
    })
}

/// In-memory drift store for tests.
#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use std::sync::{Arc, RwLock};

    /// In-memory [`DriftStore`].
    #[derive(Default, Clone)]
    pub struct InMemoryDriftStore {
        records: Arc<RwLock<Vec<DriftRecord>>>,
    }

    impl InMemoryDriftStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Every record ever inserted, for assertions.
        #[must_use]
        pub fn all(&self) -> Vec<DriftRecord> {
            self.records.read().unwrap().clone()
        }
    }

    #[async_trait]
    impl DriftStore for InMemoryDriftStore {
        async fn open_record(&self, user_id: Uuid) -> Result<Option<DriftRecord>> {
            Ok(self
                .records
                .read()
                .unwrap()
                .iter()
                .find(|r| r.user_id == user_id && !r.resolved)
                .cloned())
        }

        async fn insert(&self, record: DriftRecord) -> Result<()> {
            self.records.write().unwrap().push(record);
            Ok(())
        }

        async fn resolve_for_user(&self, user_id: Uuid) -> Result<bool> {
            let mut records = self.records.write().unwrap();
            let mut any = false;
            for record in records.iter_mut() {
                if record.user_id == user_id && !record.resolved {
                    record.resolved = true;
                    any = true;
                }
            }
            Ok(any)
        }

        async fn list_open(&self) -> Result<Vec<DriftRecord>> {
            Ok(self
                .records
                .read()
                .unwrap()
                .iter()
                .filter(|r| !r.resolved)
                .cloned()
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::InMemoryDriftStore;
    use super::*;
    use crate::model::{
        Platform, Provider, Role, SubscriptionLevel, SubscriptionRecord, SubscriptionStatus,
    };
    use crate::store::test::{InMemorySubscriptionStore, InMemoryUserStore};

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

    fn active_record(owner: &User, tier: Option<Tier>) -> SubscriptionRecord {
        SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: Some(owner.id),
            user_email: owner.email.clone(),
            provider: Some(Provider::Stripe),
            stripe_subscription_id: Some("sub_1".to_string()),
            legacy_stripe_subscription_id: None,
            stripe_customer_id: Some("cus_1".to_string()),
            tier,
            status: SubscriptionStatus::Active,
            billing_interval: None,
            current_period_start: None,
            current_period_end: Some(Utc::now() + chrono::Duration::days(20)),
            trial_end: None,
            started_at: Some(Utc::now() - chrono::Duration::days(30)),
        }
    }

    fn detector(
        users: &InMemoryUserStore,
        subs: &InMemorySubscriptionStore,
        drift: &InMemoryDriftStore,
    ) -> DriftDetector<InMemoryUserStore, InMemorySubscriptionStore, InMemoryDriftStore> {
        DriftDetector::new(users.clone(), subs.clone(), drift.clone())
    }

    #[tokio::test]
    async fn under_provisioned_paying_user_is_critical() {
        let users = InMemoryUserStore::new();
        let subs = InMemorySubscriptionStore::new();
        let drift = InMemoryDriftStore::new();

        let u = user("paying@example.com");
        subs.insert(active_record(&u, Some(Tier::Premium)));
        users.insert(u.clone());

        let summary = detector(&users, &subs, &drift).scan(10).await.unwrap();
        assert_eq!(summary.examined, 1);
        assert_eq!(summary.detected, 1);

        let open = drift.list_open().await.unwrap();
        assert_eq!(open[0].drift_type, DriftType::PaidFlagMismatch);
        assert_eq!(open[0].severity, DriftSeverity::Critical);
        assert_eq!(open[0].user_id, u.id);
    }

    #[tokio::test]
    async fn over_provisioned_free_user_is_critical() {
        let users = InMemoryUserStore::new();
        let subs = InMemorySubscriptionStore::new();
        let drift = InMemoryDriftStore::new();

        let mut u = user("stale@example.com");
        u.subscription_level = SubscriptionLevel::Paid;
        u.subscription_status = Some(SubscriptionStatus::Canceled);
        users.insert(u);

        let summary = detector(&users, &subs, &drift).scan(10).await.unwrap();
        assert_eq!(summary.detected, 1);
        let open = drift.list_open().await.unwrap();
        assert_eq!(open[0].drift_type, DriftType::PaidFlagMismatch);
        assert_eq!(open[0].severity, DriftSeverity::Critical);
    }

    #[tokio::test]
    async fn missing_pro_tier_is_critical_tier_mismatch() {
        let users = InMemoryUserStore::new();
        let subs = InMemorySubscriptionStore::new();
        let drift = InMemoryDriftStore::new();

        let mut u = user("pro@example.com");
        u.subscription_level = SubscriptionLevel::Paid;
        u.subscription_status = Some(SubscriptionStatus::Active);
        u.subscription_tier = None;
        subs.insert(active_record(&u, Some(Tier::Pro)));
        users.insert(u);

        let summary = detector(&users, &subs, &drift).scan(10).await.unwrap();
        assert_eq!(summary.detected, 1);
        let open = drift.list_open().await.unwrap();
        assert_eq!(open[0].drift_type, DriftType::TierMismatch);
        assert_eq!(open[0].severity, DriftSeverity::Critical);
    }

    #[tokio::test]
    async fn stale_customer_link_is_warning() {
        let users = InMemoryUserStore::new();
        let subs = InMemorySubscriptionStore::new();
        let drift = InMemoryDriftStore::new();

        let mut u = user("linked@example.com");
        u.subscription_level = SubscriptionLevel::Paid;
        u.subscription_status = Some(SubscriptionStatus::Active);
        u.subscription_tier = Some(Tier::Premium);
        u.stripe_customer_id = Some("cus_old".to_string());
        let mut rec = active_record(&u, Some(Tier::Premium));
        rec.stripe_customer_id = Some("cus_new".to_string());
        subs.insert(rec);
        users.insert(u);

        let summary = detector(&users, &subs, &drift).scan(10).await.unwrap();
        assert_eq!(summary.detected, 1);
        let open = drift.list_open().await.unwrap();
        assert_eq!(open[0].drift_type, DriftType::StaleProviderLink);
        assert_eq!(open[0].severity, DriftSeverity::Warning);
    }

    #[tokio::test]
    async fn clean_accounts_produce_no_drift() {
        let users = InMemoryUserStore::new();
        let subs = InMemorySubscriptionStore::new();
        let drift = InMemoryDriftStore::new();

        let mut u = user("clean@example.com");
        u.subscription_level = SubscriptionLevel::Paid;
        u.subscription_status = Some(SubscriptionStatus::Active);
        u.subscription_tier = Some(Tier::Premium);
        u.stripe_customer_id = Some("cus_1".to_string());
        subs.insert(active_record(&u, Some(Tier::Premium)));
        users.insert(u);

        let summary = detector(&users, &subs, &drift).scan(10).await.unwrap();
        assert_eq!(summary.detected, 0);
    }

    #[tokio::test]
    async fn new_account_trial_window_is_not_drift() {
        let users = InMemoryUserStore::new();
        let subs = InMemorySubscriptionStore::new();
        let drift = InMemoryDriftStore::new();

        let mut u = user("fresh@example.com");
        u.created_at = Utc::now() - chrono::Duration::days(2);
        users.insert(u);

        let summary = detector(&users, &subs, &drift).scan(10).await.unwrap();
        assert_eq!(summary.detected, 0);
    }

    #[tokio::test]
    async fn open_records_are_deduplicated() {
        let users = InMemoryUserStore::new();
        let subs = InMemorySubscriptionStore::new();
        let drift = InMemoryDriftStore::new();

        let u = user("paying@example.com");
        subs.insert(active_record(&u, None));
        users.insert(u.clone());

        let d = detector(&users, &subs, &drift);
        let first = d.scan(10).await.unwrap();
        assert_eq!(first.detected, 1);

        let second = d.scan(10).await.unwrap();
        assert_eq!(second.detected, 0);
        assert_eq!(second.skipped_existing, 1);
        assert_eq!(drift.all().len(), 1);
    }

    #[tokio::test]
    async fn resolving_reopens_detection() {
        let users = InMemoryUserStore::new();
        let subs = InMemorySubscriptionStore::new();
        let drift = InMemoryDriftStore::new();

        let u = user("paying@example.com");
        subs.insert(active_record(&u, None));
        users.insert(u.clone());

        let d = detector(&users, &subs, &drift);
        d.scan(10).await.unwrap();
        assert!(drift.resolve_for_user(u.id).await.unwrap());
        assert!(drift.open_record(u.id).await.unwrap().is_none());

        // Still drifted in storage, so a new record opens.
        let third = d.scan(10).await.unwrap();
        assert_eq!(third.detected, 1);
        assert_eq!(drift.all().len(), 2);
    }
}
