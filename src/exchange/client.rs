// =============================================================================
// Exchange /info client — typed request dispatch under the rate budget
// =============================================================================
//
// Single entry point `post_info`: look up the endpoint weight, get admission
// from the rate-budget scheduler, POST the JSON body, parse the response.
// Polling and backfill callers that are refused admission sleep 2-5 s with
// jitter and retry; thirty refusals in a row abort the request. User-priority
// reads never wait on the budget (the user path is cap-bound inside the
// scheduler, not target-bound).
//
// The typed helpers wrap `post_info` with the exponential-backoff retry
// policy (1 s, x2, capped 30 s, 3 attempts) and reject on shape mismatch.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::budget::{Priority, RateBudget};
use crate::error::{IndexerError, Result};
use crate::exchange::types::{
    AllMids, ClearinghouseState, Fill, InfoRequest, UserFundingEntry,
};
use crate::stream::retry::{retry, HTTP_RETRY};

/// Consecutive budget refusals before a request is abandoned.
const MAX_REFUSALS: u32 = 30;
/// Fixed part of the refusal backoff (milliseconds).
const REFUSAL_BASE_DELAY_MS: u64 = 2000;
/// Random jitter added on top (exclusive upper bound, milliseconds).
const REFUSAL_JITTER_MS: u64 = 3000;

/// HTTP client for the exchange's `POST /info` endpoint.
#[derive(Clone)]
pub struct InfoClient {
    http: reqwest::Client,
    base_url: String,
    budget: Arc<RateBudget>,
}

impl InfoClient {
    pub fn new(base_url: impl Into<String>, budget: Arc<RateBudget>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            base_url: base_url.into(),
            budget,
        }
    }

    // -------------------------------------------------------------------------
    // Core dispatch
    // -------------------------------------------------------------------------

    /// POST a typed request to `/info` and return the raw JSON response.
    #[instrument(skip(self, request), fields(endpoint = request.kind()), name = "info::post")]
    pub async fn post_info(
        &self,
        request: &InfoRequest,
        priority: Priority,
    ) -> Result<serde_json::Value> {
        let weight = request.weight();
        self.admit(request.kind(), priority, weight).await?;

        let url = format!("{}/info", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(IndexerError::from)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(IndexerError::Exchange {
                status: status.as_u16(),
                body,
            });
        }

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| IndexerError::protocol(format!("{} response not JSON: {e}", request.kind())))?;

        debug!(endpoint = request.kind(), weight, %priority, "info request completed");
        Ok(value)
    }

    /// Wait for budget admission. `User` requests proceed after a single
    /// attempt; everything else backs off with jitter up to [`MAX_REFUSALS`].
    async fn admit(&self, endpoint: &str, priority: Priority, weight: u32) -> Result<()> {
        let mut refusals = 0u32;
        loop {
            if self.budget.record(priority, weight) {
                return Ok(());
            }
            if priority == Priority::User {
                // User reads are bounded by the hard cap only; never queue
                // them behind the polling target.
                warn!(endpoint, weight, "user request proceeding past a saturated window");
                return Ok(());
            }

            refusals += 1;
            if refusals >= MAX_REFUSALS {
                warn!(endpoint, %priority, refusals, "abandoning request, budget exhausted");
                return Err(IndexerError::BudgetExhausted { attempts: refusals });
            }

            let jitter = rand::thread_rng().gen_range(0..REFUSAL_JITTER_MS);
            let delay = Duration::from_millis(REFUSAL_BASE_DELAY_MS + jitter);
            debug!(
                endpoint,
                %priority,
                refusals,
                delay_ms = delay.as_millis() as u64,
                "budget refused, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Run a typed request through the HTTP retry policy and decode the
    /// response, failing with `Protocol` on shape mismatch.
    async fn fetch<T: DeserializeOwned>(
        &self,
        request: InfoRequest,
        priority: Priority,
    ) -> Result<T> {
        let kind = request.kind();
        let client = self;
        retry(kind, HTTP_RETRY, || {
            let request = request.clone();
            async move {
                let value = client.post_info(&request, priority).await?;
                serde_json::from_value(value)
                    .map_err(|e| IndexerError::protocol(format!("{kind}: {e}")))
            }
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Typed helpers
    // -------------------------------------------------------------------------

    /// Authoritative positions/margin snapshot for one trader.
    pub async fn clearinghouse_state(
        &self,
        user: &str,
        priority: Priority,
    ) -> Result<ClearinghouseState> {
        self.fetch(InfoRequest::ClearinghouseState { user: user.to_string() }, priority)
            .await
    }

    /// Fills for `user` with `time >= start_time`.
    pub async fn user_fills_by_time(
        &self,
        user: &str,
        start_time: i64,
        priority: Priority,
    ) -> Result<Vec<Fill>> {
        self.fetch(
            InfoRequest::UserFillsByTime {
                user: user.to_string(),
                start_time,
                end_time: None,
            },
            priority,
        )
        .await
    }

    /// Funding ledger entries for `user` with `time >= start_time`.
    pub async fn user_funding(
        &self,
        user: &str,
        start_time: i64,
        priority: Priority,
    ) -> Result<Vec<UserFundingEntry>> {
        self.fetch(
            InfoRequest::UserFunding {
                user: user.to_string(),
                start_time,
                end_time: None,
            },
            priority,
        )
        .await
    }

    /// Current mid-price for every listed coin.
    pub async fn all_mids(&self, priority: Priority) -> Result<AllMids> {
        self.fetch(InfoRequest::AllMids, priority).await
    }

    /// Portfolio summary; the payload is period-keyed and schemaless, so the
    /// raw JSON is returned for the read API to shape.
    pub async fn portfolio(&self, user: &str, priority: Priority) -> Result<serde_json::Value> {
        let client = self;
        let request = InfoRequest::Portfolio { user: user.to_string() };
        retry("portfolio", HTTP_RETRY, || {
            let request = request.clone();
            async move { client.post_info(&request, priority).await }
        })
        .await
    }
}

impl std::fmt::Debug for InfoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfoClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn user_priority_never_blocks_on_refusal() {
        let budget = Arc::new(RateBudget::new());
        // Saturate the hard cap so even user records are refused.
        assert!(budget.record(Priority::User, 1200));

        let client = InfoClient::new("http://localhost:0", budget);
        // Must return immediately rather than entering the backoff loop.
        client.admit("clearinghouseState", Priority::User, 2).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn polling_refusals_eventually_abort() {
        let budget = Arc::new(RateBudget::new());
        assert!(budget.record(Priority::User, 1200));

        let client = InfoClient::new("http://localhost:0", budget);
        let result = client.admit("userFillsByTime", Priority::Polling, 20).await;

        assert!(matches!(
            result,
            Err(IndexerError::BudgetExhausted { attempts: 30 })
        ));
    }

    #[tokio::test]
    async fn admission_charges_the_window() {
        let budget = Arc::new(RateBudget::new());
        let client = InfoClient::new("http://localhost:0", budget.clone());

        client.admit("clearinghouseState", Priority::Polling, 2).await.unwrap();
        client.admit("userFillsByTime", Priority::Polling, 20).await.unwrap();

        let stats = budget.stats();
        assert_eq!(stats.breakdown.polling, 22);
    }
}
