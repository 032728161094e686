//! Curio entitlements - the reconciliation engine behind Curio's
//! subscription tiers.
//!
//! Decides, authoritatively, what tier and access level an account holds by
//! cross-referencing local subscription records against Stripe (web) and
//! Apple IAP (mobile, mirrored locally by a separate sync path). Tolerates
//! missing linkage identifiers, duplicate or orphaned provider records, and
//! partial provider failures, and supports safe, idempotent bulk repair.
//!
//! # Components
//!
//! - **Canonical resolution** ([`resolve_access`]): pure mapping from a
//!   user and their authoritative subscription to derived access rights
//! - **Record recovery** ([`RecordLocator`]): ordered, cost-increasing
//!   lookup chain from local records to live Stripe subscriptions
//! - **Tier resolution** ([`TierResolver`]): priority chain over metadata,
//!   pricing identifiers, and product naming
//! - **Reconciliation** ([`Reconciler`]): per-account provider selection
//!   and apply-if-changed persistence
//! - **Bulk repair** ([`RepairDriver`]): dry-run-first batch recovery with
//!   bounded samples
//! - **Drift detection** ([`DriftDetector`]): canonical-vs-stored
//!   comparison feeding an operator queue
//!
//! # Quick start
//!
//! ```rust,ignore
//! use curio_entitlements::{Caller, Engine, EngineConfig, UserRef};
//!
//! let config = EngineConfig::builder().from_env().build()?;
//! let engine = Engine::with_live_client(users, subs, drift, config);
//!
//! let outcome = engine
//!     .reconcile_user(Some(&Caller::admin()), UserRef::Email(email))
//!     .await?;
//! ```

#![allow(async_fn_in_trait)] // provider client traits are generic-only seams

pub mod config;
pub mod drift;
pub mod engine;
mod error;
pub mod model;
pub mod reconcile;
pub mod recovery;
pub mod repair;
pub mod resolver;
pub mod store;
pub mod stripe;
pub mod tier;

// Re-exports for the public API
pub use config::{mask_secret, EngineConfig, EngineConfigBuilder, NEW_ACCOUNT_TRIAL_DAYS};
pub use drift::{
    DriftDetector, DriftRecord, DriftScanSummary, DriftSeverity, DriftStore, DriftType,
};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use model::{
    normalize_email, pick_authoritative, BillingInterval, Platform, Provider, Role,
    SubscriptionLevel, SubscriptionRecord, SubscriptionStatus, Tier, User,
};
pub use reconcile::{Caller, ReconcileOutcome, ReconcileSource, Reconciler, UserRef};
pub use recovery::{LocateOutcome, LocateStatus, RecordLocator, RecoveryMethod};
pub use repair::{
    RepairDriver, RepairOptions, RepairSample, RepairSamples, RepairSummary, MAX_REPAIR_LIMIT,
};
pub use resolver::{resolve_access, resolve_access_now, EntitlementSource, ResolvedEntitlement};
pub use store::{EntitlementUpdate, SubscriptionBackfill, SubscriptionStore, UserStore};
pub use stripe::cache::StripeClientCache;
pub use stripe::live::{LiveStripeClient, LiveStripeClientConfig};
pub use stripe::{
    StripeClient, StripeCustomer, StripePrice, StripeProduct, StripeSubscription,
    SubscriptionStatusFilter,
};
pub use tier::TierResolver;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging with sensible defaults.
///
/// Call early in your application, before constructing the engine.
///
/// # Environment Variables
///
/// - `RUST_LOG`: log level filter (e.g. "info", "curio=debug")
/// - `CURIO_LOG_JSON`: set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("CURIO_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
