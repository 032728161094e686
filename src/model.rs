//! Core data model: users, subscription records, and the closed enums the
//! engine reasons over.
//!
//! Free-text provider fields are parsed into these enums at the system
//! boundary (storage adapters, the live Stripe client); internal logic never
//! compares raw strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The paid product level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Premium,
    Pro,
}

impl Tier {
    /// Parse a tier tag from provider metadata or stored text.
    ///
    /// Only exact (case-insensitive) `pro`/`premium` values parse; anything
    /// else returns `None` so callers fall back explicitly.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pro" => Some(Self::Pro),
            "premium" => Some(Self::Premium),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Premium => "premium",
            Self::Pro => "pro",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stored access level on a user record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionLevel {
    Free,
    Paid,
}

impl SubscriptionLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Paid => "paid",
        }
    }

    #[must_use]
    pub fn is_paid(&self) -> bool {
        matches!(self, Self::Paid)
    }
}

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
}

impl SubscriptionStatus {
    /// Parse from a provider status string.
    #[must_use]
    pub fn from_provider(status: &str) -> Self {
        match status {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" => Self::PastDue,
            "canceled" => Self::Canceled,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "unpaid" => Self::Unpaid,
            // Unknown statuses grant nothing.
            _ => Self::Canceled,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Unpaid => "unpaid",
        }
    }

    /// Active and trialing subscriptions confer paid access.
    #[must_use]
    pub fn is_paying(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    /// Rank used when picking the authoritative record among duplicates.
    /// Lower ranks win.
    #[must_use]
    pub(crate) fn authority_rank(&self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Trialing => 1,
            Self::PastDue => 2,
            _ => 3,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing system of record for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Stripe,
    Apple,
}

impl Provider {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::Apple => "apple",
        }
    }
}

/// Billing interval on a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    /// Parse from a provider interval string.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "month" | "monthly" => Some(Self::Month),
            "year" | "yearly" | "annual" => Some(Self::Year),
            _ => None,
        }
    }
}

/// Signup platform recorded on the account.
///
/// Informational routing only: a platform value must never grant or deny
/// paid access by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Web,
    Ios,
    Android,
}

impl Platform {
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "ios" => Self::Ios,
            "android" => Self::Android,
            _ => Self::Web,
        }
    }

    /// Whether the account signed up through a mobile store.
    #[must_use]
    pub fn is_mobile(&self) -> bool {
        matches!(self, Self::Ios | Self::Android)
    }
}

/// Account role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Admin,
}

impl Role {
    #[must_use]
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

/// Normalize an email for comparison and provider lookups: trim and ASCII
/// lowercase. Applied at every boundary that keys on email.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// A user account with its cached entitlement snapshot.
///
/// Only the reconciler and the repair driver mutate the entitlement fields;
/// accounts are created by signup, outside this engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Case-insensitive key; compare via [`normalize_email`].
    pub email: String,
    pub role: Role,
    pub platform: Platform,
    pub subscription_level: SubscriptionLevel,
    /// Mirror of the authoritative subscription's status; `None` ⇔ "none".
    pub subscription_status: Option<SubscriptionStatus>,
    pub subscription_tier: Option<Tier>,
    /// Stripe customer linkage, backfilled on recovery.
    pub stripe_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }

    #[must_use]
    pub fn normalized_email(&self) -> String {
        normalize_email(&self.email)
    }
}

/// Local mirror of a provider-side subscription.
///
/// Created by the checkout/webhook flow (external); this engine only
/// backfills identifiers and transitions tier/status. Records are never
/// hard-deleted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    /// May be unset for legacy records; the owner is then resolved by email.
    pub user_id: Option<Uuid>,
    pub user_email: String,
    pub provider: Option<Provider>,
    pub stripe_subscription_id: Option<String>,
    /// Historical alias for the subscription ID, kept only until the
    /// backfill migration rewrites it into the canonical field.
    pub legacy_stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub tier: Option<Tier>,
    pub status: SubscriptionStatus,
    pub billing_interval: Option<BillingInterval>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

impl SubscriptionRecord {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status.is_paying()
    }

    #[must_use]
    pub fn is_trialing(&self) -> bool {
        self.status == SubscriptionStatus::Trialing
    }

    /// Whether the paid period has not yet lapsed, regardless of status.
    #[must_use]
    pub fn period_end_in_future(&self, now: DateTime<Utc>) -> bool {
        self.current_period_end.is_some_and(|end| end > now)
    }

    #[must_use]
    pub fn is_apple(&self) -> bool {
        self.provider == Some(Provider::Apple)
    }
}

/// Pick the single authoritative record among duplicates for one user.
///
/// Order: `active` > `trialing` > `past_due` > everything else; further ties
/// go to the most recently started record.
#[must_use]
pub fn pick_authoritative(records: &[SubscriptionRecord]) -> Option<&SubscriptionRecord> {
    records.iter().min_by(|a, b| {
        a.status
            .authority_rank()
            .cmp(&b.status.authority_rank())
            // Later start wins, hence the reversed comparison.
            .then_with(|| b.started_at.cmp(&a.started_at))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(status: SubscriptionStatus, started_days_ago: i64) -> SubscriptionRecord {
        let started = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
            - chrono::Duration::days(started_days_ago);
        SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: None,
            user_email: "collector@example.com".to_string(),
            provider: Some(Provider::Stripe),
            stripe_subscription_id: None,
            legacy_stripe_subscription_id: None,
            stripe_customer_id: None,
            tier: None,
            status,
            billing_interval: None,
            current_period_start: None,
            current_period_end: None,
            trial_end: None,
            started_at: Some(started),
        }
    }

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email("  Jane@Example.COM \n"), "jane@example.com");
        assert_eq!(normalize_email("plain@example.com"), "plain@example.com");
    }

    #[test]
    fn status_parses_known_values() {
        assert_eq!(
            SubscriptionStatus::from_provider("active"),
            SubscriptionStatus::Active
        );
        assert_eq!(
            SubscriptionStatus::from_provider("trialing"),
            SubscriptionStatus::Trialing
        );
        assert_eq!(
            SubscriptionStatus::from_provider("past_due"),
            SubscriptionStatus::PastDue
        );
    }

    #[test]
    fn unknown_status_grants_nothing() {
        let status = SubscriptionStatus::from_provider("some_future_status");
        assert_eq!(status, SubscriptionStatus::Canceled);
        assert!(!status.is_paying());
    }

    #[test]
    fn tier_parse_is_exact() {
        assert_eq!(Tier::parse("pro"), Some(Tier::Pro));
        assert_eq!(Tier::parse(" PREMIUM "), Some(Tier::Premium));
        assert_eq!(Tier::parse("pro_monthly"), None);
        assert_eq!(Tier::parse(""), None);
    }

    #[test]
    fn authoritative_pick_prefers_active_over_trialing() {
        let records = vec![
            record(SubscriptionStatus::Trialing, 1),
            record(SubscriptionStatus::Active, 30),
        ];
        let picked = pick_authoritative(&records).unwrap();
        assert_eq!(picked.status, SubscriptionStatus::Active);

        // Same result regardless of list order.
        let reversed: Vec<_> = records.into_iter().rev().collect();
        let picked = pick_authoritative(&reversed).unwrap();
        assert_eq!(picked.status, SubscriptionStatus::Active);
    }

    #[test]
    fn authoritative_pick_breaks_ties_by_most_recent_start() {
        let older = record(SubscriptionStatus::Active, 30);
        let newer = record(SubscriptionStatus::Active, 2);
        let newer_id = newer.id;
        let records = [older, newer];
        let picked = pick_authoritative(&records).unwrap();
        assert_eq!(picked.id, newer_id);
    }

    #[test]
    fn authoritative_pick_ranks_past_due_above_canceled() {
        let records = vec![
            record(SubscriptionStatus::Canceled, 1),
            record(SubscriptionStatus::PastDue, 60),
        ];
        let picked = pick_authoritative(&records).unwrap();
        assert_eq!(picked.status, SubscriptionStatus::PastDue);
    }

    #[test]
    fn platform_parse_defaults_to_web() {
        assert_eq!(Platform::parse("ios"), Platform::Ios);
        assert_eq!(Platform::parse("android"), Platform::Android);
        assert_eq!(Platform::parse("desktop"), Platform::Web);
        assert!(Platform::Ios.is_mobile());
        assert!(!Platform::Web.is_mobile());
    }

    #[test]
    fn period_end_in_future_requires_a_date() {
        let now = Utc::now();
        let mut rec = record(SubscriptionStatus::Canceled, 1);
        assert!(!rec.period_end_in_future(now));
        rec.current_period_end = Some(now + chrono::Duration::days(3));
        assert!(rec.period_end_in_future(now));
        rec.current_period_end = Some(now - chrono::Duration::days(3));
        assert!(!rec.period_end_in_future(now));
    }
}
