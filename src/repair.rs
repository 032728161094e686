//! Bulk tier repair.
//!
//! Scans eligible local subscription records, recovers their live Stripe
//! counterparts, re-resolves tiers, and (outside dry-run) persists
//! identifier backfills and corrected user entitlements. Records are
//! processed strictly sequentially to respect provider rate limits and keep
//! counters deterministic; a per-record failure is bucketed and the loop
//! continues.
//!
//! Concurrent invocations are tolerated but not coordinated: the final
//! writes are idempotent full-field overwrites, so two overlapping runs
//! waste work without corrupting state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::model::{SubscriptionLevel, SubscriptionRecord, Tier, User};
use crate::reconcile::Caller;
use crate::recovery::{LocateStatus, RecordLocator, RecoveryMethod};
use crate::store::{EntitlementUpdate, SubscriptionBackfill, SubscriptionStore, UserStore};
use crate::stripe::StripeClient;
use crate::tier::TierResolver;

/// Hard bound on records per invocation.
pub const MAX_REPAIR_LIMIT: usize = 1000;

/// Cap on every sample list, so batch results stay small regardless of
/// `limit`.
const SAMPLE_CAP: usize = 10;

/// Options for a repair invocation.
#[derive(Debug, Clone)]
pub struct RepairOptions {
    /// Report without persisting. The default.
    pub dry_run: bool,
    /// Maximum records to process, clamped to `1..=MAX_REPAIR_LIMIT`.
    pub limit: usize,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            dry_run: true,
            limit: MAX_REPAIR_LIMIT,
        }
    }
}

/// One sampled record for operator inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairSample {
    pub subscription_id: Uuid,
    pub user_email: String,
    pub note: String,
}

/// Capped sample lists, one per interesting bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairSamples {
    pub updated: Vec<RepairSample>,
    pub recovered: Vec<RepairSample>,
    pub unknown_tier: Vec<RepairSample>,
    pub missing: Vec<RepairSample>,
    pub errors: Vec<RepairSample>,
}

/// Aggregate result of a repair run. Dry-run and apply runs over identical
/// data report identical counts; only persistence differs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairSummary {
    pub dry_run: bool,
    pub scanned: usize,
    pub updated_subscriptions: usize,
    pub updated_users: usize,
    pub recovered_by_customer: usize,
    pub recovered_by_email: usize,
    pub recovered_by_legacy_id: usize,
    pub skipped_apple: usize,
    pub no_stripe_ids: usize,
    pub missing_stripe_subscription: usize,
    pub unknown_tier: usize,
    pub provider_errors: usize,
    pub samples: RepairSamples,
}

/// Drives bulk repair over the subscription table.
pub struct RepairDriver<U, S, C> {
    users: U,
    subs: S,
    client: Arc<C>,
    price_tiers: HashMap<String, Tier>,
}

impl<U, S, C> RepairDriver<U, S, C>
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
        }
    }

    /// Run a repair pass. Admin only.
    pub async fn repair_tiers(
        &self,
        caller: Option<&Caller>,
        options: RepairOptions,
    ) -> Result<RepairSummary> {
        let caller =
            caller.ok_or_else(|| EngineError::unauthorized("caller identity required"))?;
        if !caller.role.is_admin() {
            return Err(EngineError::forbidden("tier repair is admin-only"));
        }

        let limit = options.limit.clamp(1, MAX_REPAIR_LIMIT);
        let now = Utc::now();

        let mut summary = RepairSummary {
            dry_run: options.dry_run,
            ..Default::default()
        };

        let mut eligible = Vec::new();
        for record in self.subs.list_all().await? {
            if record.is_apple() {
                summary.skipped_apple += 1;
                continue;
            }
            if record.is_active() || record.period_end_in_future(now) {
                eligible.push(record);
            }
        }
        eligible.truncate(limit);
        summary.scanned = eligible.len();

        tracing::info!(
            target: "curio::repair",
            scanned = summary.scanned,
            skipped_apple = summary.skipped_apple,
            dry_run = options.dry_run,
            "Starting tier repair pass"
        );

        let locator = RecordLocator::new(&*self.client);
        let resolver = TierResolver::new(&*self.client, &self.price_tiers);

        // Strictly sequential: provider rate limits, deterministic counters.
        for record in &eligible {
            if let Err(error) = self
                .process_record(record, &locator, &resolver, options.dry_run, &mut summary)
                .await
            {
                summary.provider_errors += 1;
                push_sample(
                    &mut summary.samples.errors,
                    record,
                    &format!("{}: {}", error.code(), error.safe_message()),
                );
                tracing::warn!(
                    target: "curio::repair",
                    record_id = %record.id,
                    error = %error,
                    "Record repair failed; continuing batch"
                );
            }
        }

        tracing::info!(
            target: "curio::repair",
            updated_subscriptions = summary.updated_subscriptions,
            updated_users = summary.updated_users,
            unknown_tier = summary.unknown_tier,
            provider_errors = summary.provider_errors,
            dry_run = options.dry_run,
            "Tier repair pass finished"
        );

        Ok(summary)
    }

    async fn process_record(
        &self,
        record: &SubscriptionRecord,
        locator: &RecordLocator<'_, C>,
        resolver: &TierResolver<'_, C>,
        dry_run: bool,
        summary: &mut RepairSummary,
    ) -> Result<()> {
        let outcome = locator.locate(record).await;

        match outcome.status {
            LocateStatus::SkippedApple => {
                summary.skipped_apple += 1;
                return Ok(());
            }
            LocateStatus::NoStripeIds => {
                summary.no_stripe_ids += 1;
                return Ok(());
            }
            LocateStatus::NoSubsForCustomer | LocateStatus::Missing => {
                summary.missing_stripe_subscription += 1;
                push_sample(
                    &mut summary.samples.missing,
                    record,
                    "no live Stripe subscription found",
                );
                return Ok(());
            }
            LocateStatus::Found => {}
        }
        let Some(live) = outcome.subscription else {
            return Ok(());
        };

        match outcome.recovery_method {
            Some(RecoveryMethod::ByCustomerId) => {
                summary.recovered_by_customer += 1;
                push_sample(
                    &mut summary.samples.recovered,
                    record,
                    "recovered via customer listing",
                );
            }
            Some(RecoveryMethod::ByEmail) => {
                summary.recovered_by_email += 1;
                push_sample(
                    &mut summary.samples.recovered,
                    record,
                    "recovered via email lookup (lower confidence)",
                );
            }
            Some(RecoveryMethod::ByLegacyId) => {
                summary.recovered_by_legacy_id += 1;
                push_sample(
                    &mut summary.samples.recovered,
                    record,
                    "legacy subscription id migrated to canonical field",
                );
            }
            _ => {}
        }

        // Tier-resolution failures propagate to the caller, which buckets
        // them without aborting the batch.
        let resolved_tier = resolver.resolve(&live).await?;
        if resolved_tier.is_none() {
            summary.unknown_tier += 1;
            push_sample(
                &mut summary.samples.unknown_tier,
                record,
                "tier unresolved; stored tier preserved",
            );
        }

        let tier_changed = resolved_tier.is_some() && resolved_tier != record.tier;
        if !outcome.needs_backfill && !tier_changed {
            return Ok(());
        }

        summary.updated_subscriptions += 1;
        push_sample(
            &mut summary.samples.updated,
            record,
            if outcome.needs_backfill {
                "identifiers backfilled"
            } else {
                "tier corrected"
            },
        );

        // The owning user is resolved in both modes so dry-run and apply
        // report the same counts.
        let owner = self.resolve_owner(record).await?;
        let target_level = if live.status.is_paying() {
            SubscriptionLevel::Paid
        } else {
            SubscriptionLevel::Free
        };
        let target_status = Some(live.status);
        let target_tier = resolved_tier.or(record.tier);
        let owner_changed = owner.as_ref().is_some_and(|u| {
            u.subscription_level != target_level
                || u.subscription_status != target_status
                || u.subscription_tier != target_tier
        });
        if owner_changed {
            summary.updated_users += 1;
        }

        if dry_run {
            return Ok(());
        }

        let backfill = SubscriptionBackfill {
            stripe_subscription_id: outcome.needs_backfill.then(|| live.id.clone()),
            stripe_customer_id: outcome.needs_backfill.then(|| live.customer_id.clone()),
            tier: resolved_tier,
            status: Some(live.status),
            clear_legacy_id: matches!(
                outcome.recovery_method,
                Some(RecoveryMethod::ByLegacyId)
            ),
        };
        self.subs.apply_backfill(record.id, &backfill).await?;

        if let Some(owner) = owner {
            if owner_changed {
                self.users
                    .update_entitlement(
                        owner.id,
                        &EntitlementUpdate {
                            level: target_level,
                            status: target_status,
                            tier: target_tier,
                        },
                    )
                    .await?;
            }
            if owner.stripe_customer_id.is_none() && outcome.needs_backfill {
                self.users
                    .set_stripe_customer_id(owner.id, &live.customer_id)
                    .await?;
            }
        }

        Ok(())
    }

    /// The owning user: by `user_id` when set, else by normalized email.
    async fn resolve_owner(&self, record: &SubscriptionRecord) -> Result<Option<User>> {
        if let Some(user_id) = record.user_id {
            if let Some(user) = self.users.get(user_id).await? {
                return Ok(Some(user));
            }
        }
        if record.user_email.trim().is_empty() {
            return Ok(None);
        }
        self.users.get_by_email(&record.user_email).await
    }
}

fn push_sample(list: &mut Vec<RepairSample>, record: &SubscriptionRecord, note: &str) {
    if list.len() < SAMPLE_CAP {
        list.push(RepairSample {
            subscription_id: record.id,
            user_email: record.user_email.clone(),
            note: note.to_string(),
        });
    }
}
