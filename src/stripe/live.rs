//! Live Stripe client.
//!
//! Production client with secure API key handling, bounded timeouts, retry
//! with exponential backoff for transient failures, and error mapping that
//! never surfaces raw provider error bodies.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::{mask_secret, validate_secret_key};
use crate::error::{EngineError, Result};
use crate::model::SubscriptionStatus;

use super::{
    StripeClient, StripeCustomer, StripePrice, StripeProduct, StripeSubscription,
    SubscriptionStatusFilter,
};

const DEFAULT_BASE_URL: &str = "https://api.stripe.com/v1";

/// Page size for listing calls; recovery only ever inspects the first page.
const LIST_LIMIT: &str = "100";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the live Stripe client.
#[derive(Debug, Clone)]
pub struct LiveStripeClientConfig {
    /// Maximum number of retry attempts for transient failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Per-attempt request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for LiveStripeClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            timeout_seconds: 15,
        }
    }
}

impl LiveStripeClientConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

// ============================================================================
// Client
// ============================================================================

/// Live Stripe client for production use.
///
/// The API key is held in a [`SecretString`] and never appears in debug
/// output; transient failures (HTTP 429, 5xx, timeouts) are retried with
/// exponential backoff and jitter, bounded per attempt by the configured
/// timeout so a slow provider call can never hang a batch.
#[derive(Clone)]
pub struct LiveStripeClient {
    http: reqwest::Client,
    api_key: SecretString,
    config: LiveStripeClientConfig,
    base_url: String,
}

impl LiveStripeClient {
    /// Create a new live client.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the key shape is invalid; the
    /// message carries the masked key only.
    pub fn new(
        api_key: impl Into<SecretString>,
        config: LiveStripeClientConfig,
    ) -> Result<Self> {
        let api_key: SecretString = api_key.into();
        validate_secret_key(api_key.expose_secret())?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| EngineError::configuration(format!("http client: {e}")))?;

        Ok(Self {
            http,
            api_key,
            config,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Create a client with default configuration.
    pub fn with_default_config(api_key: impl Into<SecretString>) -> Result<Self> {
        Self::new(api_key, LiveStripeClientConfig::default())
    }

    /// Override the API base URL (stripe-mock, test proxies).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Whether the client is using a test-mode key.
    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }

    /// Issue a GET, returning `Ok(None)` on `not_found` and retrying
    /// transient failures.
    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>> {
        self.execute(operation, reqwest::Method::GET, path, query, None)
            .await
    }

    /// Issue a POST with a form body. One idempotency key covers every
    /// retry attempt so the provider deduplicates replays.
    async fn post_form<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<Option<T>> {
        let idempotency_key = format!("{}_{}", operation, uuid::Uuid::new_v4());
        self.execute(
            operation,
            reqwest::Method::POST,
            path,
            form,
            Some(&idempotency_key),
        )
        .await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        method: reqwest::Method,
        path: &str,
        params: &[(&str, &str)],
        idempotency_key: Option<&str>,
    ) -> Result<Option<T>> {
        let url = format!("{}{}", self.base_url, path);
        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let mut attempts = 0;

        loop {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .basic_auth(self.api_key.expose_secret(), Option::<&str>::None);
            request = if method == reqwest::Method::GET {
                request.query(params)
            } else {
                request.form(params)
            };
            if let Some(key) = idempotency_key {
                request = request.header("Idempotency-Key", key);
            }

            let outcome = tokio::time::timeout(timeout, request.send()).await;
            match outcome {
                Ok(Ok(response)) => match self.handle_response(operation, response).await? {
                    Attempt::Done(value) => return Ok(value),
                    Attempt::Retry(reason) => {
                        if attempts >= self.config.max_retries {
                            return Err(EngineError::provider_unavailable(format!(
                                "{operation}: {reason} after {attempts} retries"
                            )));
                        }
                        self.backoff(operation, attempts, &reason).await;
                        attempts += 1;
                    }
                },
                Ok(Err(error)) => {
                    let transient = error.is_timeout() || error.is_connect();
                    if !transient || attempts >= self.config.max_retries {
                        tracing::debug!(
                            target: "curio::stripe",
                            operation,
                            error = %error,
                            "Stripe transport error"
                        );
                        return Err(EngineError::provider_unavailable(format!(
                            "{operation}: transport error"
                        )));
                    }
                    self.backoff(operation, attempts, "transport error").await;
                    attempts += 1;
                }
                Err(_elapsed) => {
                    if attempts >= self.config.max_retries {
                        return Err(EngineError::provider_unavailable(format!(
                            "{operation}: timed out after {} seconds",
                            self.config.timeout_seconds
                        )));
                    }
                    self.backoff(operation, attempts, "timeout").await;
                    attempts += 1;
                }
            }
        }
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<Attempt<T>> {
        let status = response.status();

        if status.is_success() {
            let value = response.json::<T>().await.map_err(|e| {
                tracing::debug!(
                    target: "curio::stripe",
                    operation,
                    error = %e,
                    "Stripe response did not parse"
                );
                EngineError::provider_unavailable(format!("{operation}: malformed response"))
            })?;
            return Ok(Attempt::Done(Some(value)));
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Attempt::Done(None));
        }

        // Retryable statuses: rate limiting and server errors.
        if status.as_u16() == 429 || status.is_server_error() {
            return Ok(Attempt::Retry(format!("status {}", status.as_u16())));
        }

        // Error bodies are logged at debug only; messages surfaced to
        // callers carry the operation and code, never provider text.
        let body = response.json::<ApiErrorEnvelope>().await.unwrap_or_default();
        tracing::debug!(
            target: "curio::stripe",
            operation,
            status = status.as_u16(),
            code = body.error.code.as_deref().unwrap_or(""),
            message = body.error.message.as_deref().unwrap_or(""),
            "Stripe API error"
        );

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(EngineError::configuration(format!(
                "Stripe rejected credential {}",
                mask_secret(self.api_key.expose_secret())
            )));
        }

        Err(EngineError::provider_unavailable(format!(
            "{operation}: status {}{}",
            status.as_u16(),
            body.error
                .code
                .map(|c| format!(" ({c})"))
                .unwrap_or_default()
        )))
    }

    async fn backoff(&self, operation: &'static str, attempts: u32, reason: &str) {
        let delay = calculate_backoff_delay(
            attempts,
            self.config.base_delay_ms,
            self.config.max_delay_ms,
        );
        tracing::warn!(
            target: "curio::stripe",
            operation,
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            reason,
            "Retrying Stripe call after transient failure"
        );
        tokio::time::sleep(delay).await;
    }
}

// Debug implementation that doesn't expose the API key.
impl std::fmt::Debug for LiveStripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStripeClient")
            .field("config", &self.config)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

enum Attempt<T> {
    Done(Option<T>),
    Retry(String),
}

/// Exponential backoff with jitter (0–25% of the delay).
fn calculate_backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
    let delay_ms = delay_ms.min(max_ms);
    let jitter = if delay_ms > 0 {
        fastrand::u64(0..=delay_ms / 4)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter))
}

/// Escape a value for a Stripe search query string.
fn escape_search_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

impl StripeClient for LiveStripeClient {
    async fn list_customers_by_email(
        &self,
        email: &str,
        limit: u8,
    ) -> Result<Vec<StripeCustomer>> {
        let limit = limit.to_string();
        let list: Option<ApiList<ApiCustomer>> = self
            .get_json(
                "customers.list",
                "/customers",
                &[("email", email), ("limit", &limit)],
            )
            .await?;
        Ok(list
            .map(|l| l.data.into_iter().map(ApiCustomer::into_customer).collect())
            .unwrap_or_default())
    }

    async fn search_customers_by_email(&self, email: &str) -> Result<Vec<StripeCustomer>> {
        let query = format!("email:'{}'", escape_search_value(email));
        let list: Option<ApiList<ApiCustomer>> = self
            .get_json(
                "customers.search",
                "/customers/search",
                &[("query", &query)],
            )
            .await?;
        Ok(list
            .map(|l| l.data.into_iter().map(ApiCustomer::into_customer).collect())
            .unwrap_or_default())
    }

    async fn create_customer(&self, email: &str) -> Result<StripeCustomer> {
        let created: Option<ApiCustomer> = self
            .post_form("customers.create", "/customers", &[("email", email)])
            .await?;
        created
            .map(ApiCustomer::into_customer)
            .ok_or_else(|| EngineError::provider_unavailable("customers.create: empty response"))
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
        status: SubscriptionStatusFilter,
    ) -> Result<Vec<StripeSubscription>> {
        let list: Option<ApiList<ApiSubscription>> = self
            .get_json(
                "subscriptions.list",
                "/subscriptions",
                &[
                    ("customer", customer_id),
                    ("status", status.as_str()),
                    ("limit", LIST_LIMIT),
                    ("expand[]", "data.items.data.price"),
                ],
            )
            .await?;
        Ok(list
            .map(|l| {
                l.data
                    .into_iter()
                    .map(ApiSubscription::into_subscription)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<StripeSubscription>> {
        let sub: Option<ApiSubscription> = self
            .get_json(
                "subscriptions.retrieve",
                &format!("/subscriptions/{subscription_id}"),
                &[("expand[]", "items.data.price")],
            )
            .await?;
        Ok(sub.map(ApiSubscription::into_subscription))
    }

    async fn retrieve_price(&self, price_id: &str) -> Result<Option<StripePrice>> {
        let price: Option<ApiPrice> = self
            .get_json("prices.retrieve", &format!("/prices/{price_id}"), &[])
            .await?;
        Ok(price.map(ApiPrice::into_price))
    }

    async fn retrieve_product(&self, product_id: &str) -> Result<Option<StripeProduct>> {
        let product: Option<ApiProduct> = self
            .get_json("products.retrieve", &format!("/products/{product_id}"), &[])
            .await?;
        Ok(product.map(ApiProduct::into_product))
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ApiCustomer {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

impl ApiCustomer {
    fn into_customer(self) -> StripeCustomer {
        StripeCustomer {
            id: self.id,
            email: self.email,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiSubscription {
    id: String,
    customer: String,
    status: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    created: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    current_period_start: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    current_period_end: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    trial_end: Option<DateTime<Utc>>,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    items: ApiSubscriptionItems,
}

#[derive(Debug, Default, Deserialize)]
struct ApiSubscriptionItems {
    #[serde(default)]
    data: Vec<ApiSubscriptionItem>,
}

#[derive(Debug, Deserialize)]
struct ApiSubscriptionItem {
    #[serde(default)]
    price: Option<ApiPrice>,
}

impl ApiSubscription {
    fn into_subscription(self) -> StripeSubscription {
        let price = self
            .items
            .data
            .into_iter()
            .next()
            .and_then(|item| item.price)
            .map(ApiPrice::into_price);
        StripeSubscription {
            id: self.id,
            customer_id: self.customer,
            // The one place a raw provider status string enters the engine.
            status: SubscriptionStatus::from_provider(&self.status),
            created: self.created,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            trial_end: self.trial_end,
            cancel_at_period_end: self.cancel_at_period_end,
            metadata: self.metadata,
            price_id: price.as_ref().map(|p| p.id.clone()),
            price,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiPrice {
    id: String,
    #[serde(default)]
    lookup_key: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    product: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    recurring: Option<ApiRecurring>,
}

#[derive(Debug, Deserialize)]
struct ApiRecurring {
    #[serde(default)]
    interval: Option<String>,
}

impl ApiPrice {
    fn into_price(self) -> StripePrice {
        StripePrice {
            id: self.id,
            lookup_key: self.lookup_key,
            nickname: self.nickname,
            product_id: self.product,
            metadata: self.metadata,
            recurring_interval: self.recurring.and_then(|r| r.interval),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiProduct {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl ApiProduct {
    fn into_product(self) -> StripeProduct {
        StripeProduct {
            id: self.id,
            name: self.name,
            metadata: self.metadata,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorEnvelope {
    #[serde(default)]
    error: ApiErrorBody,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "sk_test_4eC39HqLyjWDarjtT1zdp7dc";

    #[test]
    fn new_rejects_malformed_key() {
        let err = LiveStripeClient::with_default_config("whsec_not_an_api_key_here".to_string())
            .err()
            .unwrap();
        assert_eq!(err.code(), "configuration_error");
    }

    #[test]
    fn detects_test_mode() {
        let client = LiveStripeClient::with_default_config(TEST_KEY.to_string()).unwrap();
        assert!(client.is_test_mode());
    }

    #[test]
    fn debug_hides_the_key() {
        let client = LiveStripeClient::with_default_config(TEST_KEY.to_string()).unwrap();
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("4eC39HqLyjWDarjtT1zdp7dc"));
    }

    #[test]
    fn backoff_is_bounded_and_grows() {
        let first = calculate_backoff_delay(0, 500, 30_000);
        assert!(first >= Duration::from_millis(500));
        assert!(first <= Duration::from_millis(625));

        let capped = calculate_backoff_delay(20, 500, 30_000);
        assert!(capped <= Duration::from_millis(37_500));
    }

    #[test]
    fn search_values_are_escaped() {
        assert_eq!(escape_search_value("o'neil@example.com"), "o\\'neil@example.com");
        assert_eq!(escape_search_value("a\\b"), "a\\\\b");
    }

    #[test]
    fn subscription_payload_parses_with_expanded_price() {
        let payload = serde_json::json!({
            "id": "sub_123",
            "object": "subscription",
            "customer": "cus_9",
            "status": "active",
            "created": 1_700_000_000,
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_702_592_000,
            "trial_end": null,
            "cancel_at_period_end": false,
            "metadata": { "tier": "pro" },
            "items": {
                "object": "list",
                "data": [{
                    "id": "si_1",
                    "price": {
                        "id": "price_pro_month",
                        "lookup_key": "pro_monthly",
                        "nickname": "Pro (monthly)",
                        "product": "prod_42",
                        "metadata": {},
                        "recurring": { "interval": "month" }
                    }
                }]
            }
        });

        let api: ApiSubscription = serde_json::from_value(payload).unwrap();
        let sub = api.into_subscription();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.metadata_tag("tier"), Some("pro"));
        assert_eq!(sub.price_id.as_deref(), Some("price_pro_month"));
        let price = sub.price.unwrap();
        assert_eq!(price.lookup_key.as_deref(), Some("pro_monthly"));
        assert_eq!(price.product_id.as_deref(), Some("prod_42"));
        assert_eq!(price.recurring_interval.as_deref(), Some("month"));
    }

    #[test]
    fn subscription_payload_tolerates_missing_expansions() {
        let payload = serde_json::json!({
            "id": "sub_min",
            "customer": "cus_9",
            "status": "some_future_status",
            "created": 1_700_000_000
        });
        let api: ApiSubscription = serde_json::from_value(payload).unwrap();
        let sub = api.into_subscription();
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert!(sub.price.is_none());
        assert!(sub.current_period_end.is_none());
    }

    #[test]
    fn error_envelope_parses() {
        let payload = serde_json::json!({
            "error": { "type": "invalid_request_error", "code": "resource_missing",
                       "message": "No such subscription: sub_x" }
        });
        let envelope: ApiErrorEnvelope = serde_json::from_value(payload).unwrap();
        assert_eq!(envelope.error.code.as_deref(), Some("resource_missing"));
        assert!(envelope.error.message.is_some());
    }
}
