//! Canonical access resolution.
//!
//! Pure functions mapping `(user, subscription)` to derived access rights.
//! No network or storage access; callable identically from the
//! reconciliation engine and UI-facing consumers. Results are computed
//! fresh on every call and must never be cached beyond a single request.

use chrono::{DateTime, Duration, Utc};

use crate::config::NEW_ACCOUNT_TRIAL_DAYS;
use crate::model::{SubscriptionRecord, SubscriptionStatus, Tier, User};

/// What granted (or failed to grant) access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntitlementSource {
    /// Operational override for admin accounts.
    Admin,
    /// An authoritative subscription in a paying status.
    Subscription,
    /// The stored entitlement snapshot on the user record.
    UserRecord,
    /// The new-account trial window, independent of provider state.
    NewAccountTrial,
    /// No paid signal.
    None,
}

/// Derived access rights for a user at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntitlement {
    pub tier: Option<Tier>,
    pub has_paid_access: bool,
    pub has_pro_access: bool,
    pub is_trialing: bool,
    pub plan_label: &'static str,
    pub source: EntitlementSource,
}

/// Resolve access rights for a user and their authoritative subscription.
///
/// `now` is explicit so the new-account trial boundary is deterministic
/// under test; the window is exclusive (an account created exactly
/// `NEW_ACCOUNT_TRIAL_DAYS` ago is outside it).
///
/// The user's `platform` is deliberately never consulted: store platforms
/// are routing information, not entitlement signals.
#[must_use]
pub fn resolve_access(
    user: &User,
    subscription: Option<&SubscriptionRecord>,
    now: DateTime<Utc>,
) -> ResolvedEntitlement {
    let admin = user.is_admin();
    let status = subscription
        .map(|s| s.status)
        .or(user.subscription_status);
    let status_paying = status.is_some_and(|s| s.is_paying());
    let level_paid = user.subscription_level.is_paid();
    let in_trial_window =
        now.signed_duration_since(user.created_at) < Duration::days(NEW_ACCOUNT_TRIAL_DAYS);

    let has_paid_access = admin || level_paid || status_paying || in_trial_window;

    let tier = user
        .subscription_tier
        .or_else(|| subscription.and_then(|s| s.tier))
        .or(if admin {
            Some(Tier::Pro)
        } else if has_paid_access {
            Some(Tier::Premium)
        } else {
            None
        });

    let has_pro_access = admin || (has_paid_access && tier == Some(Tier::Pro));
    let is_trialing = status == Some(SubscriptionStatus::Trialing);

    let plan_label = if !has_paid_access {
        "Free"
    } else if has_pro_access {
        "Pro"
    } else {
        "Premium"
    };

    let source = if admin {
        EntitlementSource::Admin
    } else if subscription.is_some_and(|s| s.status.is_paying()) {
        EntitlementSource::Subscription
    } else if level_paid || user.subscription_status.is_some_and(|s| s.is_paying()) {
        EntitlementSource::UserRecord
    } else if in_trial_window {
        EntitlementSource::NewAccountTrial
    } else {
        EntitlementSource::None
    };

    ResolvedEntitlement {
        tier,
        has_paid_access,
        has_pro_access,
        is_trialing,
        plan_label,
        source,
    }
}

/// [`resolve_access`] against the wall clock.
#[must_use]
pub fn resolve_access_now(
    user: &User,
    subscription: Option<&SubscriptionRecord>,
) -> ResolvedEntitlement {
    resolve_access(user, subscription, Utc::now())
}
