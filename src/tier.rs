//! Tier resolution from live provider subscriptions.
//!
//! An ordered priority chain over subscription metadata, pricing
//! identifiers, and product naming, evaluated with early exit on the first
//! confident value. Read-only apart from the lookups it issues; network
//! failures propagate to the caller, which counts and samples them instead
//! of aborting its batch.

use std::collections::HashMap;

use crate::error::Result;
use crate::model::Tier;
use crate::stripe::{StripeClient, StripePrice, StripeSubscription};

/// Metadata key carrying an explicit tier tag.
const TIER_METADATA_KEY: &str = "tier";

/// The resolution chain, highest-priority first.
#[derive(Debug, Clone, Copy)]
enum Strategy {
    SubscriptionMetadata,
    PriceText,
    ProductText,
    PriceIdMap,
}

const CHAIN: [Strategy; 4] = [
    Strategy::SubscriptionMetadata,
    Strategy::PriceText,
    Strategy::ProductText,
    Strategy::PriceIdMap,
];

/// Resolves the product tier of a live Stripe subscription.
pub struct TierResolver<'a, C: StripeClient> {
    client: &'a C,
    price_tiers: &'a HashMap<String, Tier>,
}

impl<'a, C: StripeClient> TierResolver<'a, C> {
    #[must_use]
    pub fn new(client: &'a C, price_tiers: &'a HashMap<String, Tier>) -> Self {
        Self {
            client,
            price_tiers,
        }
    }

    /// Try each strategy in priority order until one yields a tier.
    ///
    /// Returns `Ok(None)` when every strategy is exhausted; the caller falls
    /// back to the previously stored tier and flags the record.
    pub async fn resolve(&self, subscription: &StripeSubscription) -> Result<Option<Tier>> {
        // Fetched at most once, and only if a strategy needs it.
        let mut price_slot: Option<Option<StripePrice>> = None;

        for strategy in CHAIN {
            if let Some(tier) = self
                .try_strategy(strategy, subscription, &mut price_slot)
                .await?
            {
                return Ok(Some(tier));
            }
        }
        Ok(None)
    }

    async fn try_strategy(
        &self,
        strategy: Strategy,
        subscription: &StripeSubscription,
        price_slot: &mut Option<Option<StripePrice>>,
    ) -> Result<Option<Tier>> {
        match strategy {
            Strategy::SubscriptionMetadata => Ok(subscription
                .metadata_tag(TIER_METADATA_KEY)
                .and_then(Tier::parse)),
            Strategy::PriceText => {
                let price = self.price(subscription, price_slot).await?;
                Ok(price.and_then(|p| {
                    p.lookup_key
                        .as_deref()
                        .and_then(tier_from_text)
                        .or_else(|| p.nickname.as_deref().and_then(tier_from_text))
                }))
            }
            Strategy::ProductText => {
                let Some(product_id) = self
                    .price(subscription, price_slot)
                    .await?
                    .and_then(|p| p.product_id.clone())
                else {
                    return Ok(None);
                };
                let Some(product) = self.client.retrieve_product(&product_id).await? else {
                    return Ok(None);
                };
                Ok(product
                    .metadata
                    .get(TIER_METADATA_KEY)
                    .and_then(|v| Tier::parse(v))
                    .or_else(|| product.name.as_deref().and_then(tier_from_text)))
            }
            Strategy::PriceIdMap => {
                let price_id = self
                    .price(subscription, price_slot)
                    .await?
                    .map(|p| p.id.clone())
                    .or_else(|| subscription.price_id.clone());
                Ok(price_id.and_then(|id| self.price_tiers.get(&id).copied()))
            }
        }
    }

    /// The subscription's price: the expanded object when present, else
    /// fetched by ID once and cached for the rest of the chain.
    async fn price<'s>(
        &self,
        subscription: &'s StripeSubscription,
        slot: &'s mut Option<Option<StripePrice>>,
    ) -> Result<Option<&'s StripePrice>> {
        if let Some(ref price) = subscription.price {
            return Ok(Some(price));
        }
        if slot.is_none() {
            let fetched = match subscription.price_id.as_deref() {
                Some(id) => self.client.retrieve_price(id).await?,
                None => None,
            };
            *slot = Some(fetched);
        }
        Ok(slot.as_ref().and_then(Option::as_ref))
    }
}

/// Case-insensitive substring classification of pricing/product text.
///
/// `premium` is checked first: identifiers like `prod_premium` contain
/// `pro` as an accidental substring.
fn tier_from_text(text: &str) -> Option<Tier> {
    let lower = text.to_ascii_lowercase();
    if lower.contains("premium") {
        Some(Tier::Premium)
    } else if lower.contains("pro") {
        Some(Tier::Pro)
    } else {
        None
    }
}
