//! Rate-limited CSQAQ API client.
//!
//! ## Request discipline
//!
//! Every call, regardless of endpoint, first acquires a slot from one
//! shared rate limiter, so total throughput stays inside the configured
//! QPS budget even when fetches run from parallel tasks. Failed calls
//! retry with jittered exponential backoff up to a fixed attempt ceiling;
//! a 429 widens the backoff to at least the server's `Retry-After`.
//!
//! ## Response envelope
//!
//! The upstream wraps every 2xx body as `{code, msg, data}`. A business
//! code other than 0/200 is a request-level rejection even though the
//! HTTP layer reported success.

use crate::error::{Result, SkinflowError};
use crate::types::{ItemSpec, KlinePeriod, Platform};
use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Total attempts per logical fetch, first try included.
pub const MAX_FETCH_ATTEMPTS: u32 = 5;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Shared request throttle. Holding the internal lock across the wait
/// serializes callers, so permits are spaced at least `1/qps` apart under
/// any number of concurrent tasks.
pub struct RateLimiter {
    min_interval: Duration,
    last_permit: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(qps: f64) -> Self {
        let min_interval = if qps > 0.0 {
            Duration::from_secs_f64(1.0 / qps)
        } else {
            Duration::ZERO
        };
        Self {
            min_interval,
            last_permit: Mutex::new(None),
        }
    }

    /// Block until the next permitted request slot.
    pub async fn acquire(&self) {
        let mut last = self.last_permit.lock().await;
        if let Some(prev) = *last {
            let next_allowed = prev + self.min_interval;
            let now = Instant::now();
            if next_allowed > now {
                sleep(next_allowed - now).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Jittered exponential backoff: base doubles per attempt up to a cap,
/// plus a uniform random share of the base on top.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    current_attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            current_attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self
            .initial_delay
            .saturating_mul(2_u32.saturating_pow(self.current_attempt))
            .min(self.max_delay);
        self.current_attempt += 1;
        if base.is_zero() {
            return base;
        }
        base + rand::thread_rng().gen_range(Duration::ZERO..base)
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

/// Outcome of one request attempt, before retry policy is applied.
pub(crate) enum AttemptOutcome<T> {
    Success(T),
    /// Worth another try; `cooldown` is a server-mandated minimum wait.
    Transient {
        reason: String,
        cooldown: Option<Duration>,
    },
    /// Retrying cannot help; surface immediately.
    Fatal(SkinflowError),
}

/// Drive `attempt` under the retry policy: transient outcomes back off
/// and retry up to the ceiling, fatal ones short-circuit.
pub(crate) async fn run_with_retry<T, F, Fut>(
    endpoint: &str,
    backoff: &mut ExponentialBackoff,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AttemptOutcome<T>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt().await {
            AttemptOutcome::Success(value) => {
                backoff.reset();
                return Ok(value);
            }
            AttemptOutcome::Fatal(err) => return Err(err),
            AttemptOutcome::Transient { reason, cooldown } => {
                if tries >= MAX_FETCH_ATTEMPTS {
                    return Err(SkinflowError::TransientFetch {
                        endpoint: endpoint.to_string(),
                        attempts: tries,
                        message: reason,
                    });
                }
                let mut delay = backoff.next_delay();
                if let Some(cooldown) = cooldown {
                    delay = delay.max(cooldown);
                }
                warn!(
                    "⏳ {} attempt {}/{} failed ({}), retrying in {:.1}s",
                    endpoint,
                    tries,
                    MAX_FETCH_ATTEMPTS,
                    reason,
                    delay.as_secs_f64()
                );
                sleep(delay).await;
            }
        }
    }
}

/// Current two-platform quote for one item, from `batch_price`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairPrice {
    pub buff_sell_price: Option<f64>,
    pub yyyp_sell_price: Option<f64>,
    pub buff_buy_price: Option<f64>,
    pub yyyp_buy_price: Option<f64>,
    pub buff_sell_num: Option<f64>,
    pub yyyp_sell_num: Option<f64>,
    pub buff_buy_num: Option<f64>,
    pub yyyp_buy_num: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct BatchPriceData {
    #[serde(default)]
    success: HashMap<String, PairPrice>,
    #[serde(default)]
    fail: Vec<String>,
}

/// One K-line style series from the chart endpoint. Timestamps are epoch
/// milliseconds; values may be null where the upstream has gaps.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChartSeries {
    #[serde(default)]
    pub timestamp: Vec<i64>,
    #[serde(default)]
    pub main_data: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchSuggestion {
    pub id: i64,
    #[serde(default)]
    pub value: String,
}

/// The slice of the upstream the ingestion pipeline depends on. Kept as a
/// trait so cycle tests can substitute a scripted source.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Current BUFF/YYYP quote for one item, `None` when the upstream
    /// does not know the item.
    async fn fetch_pair_price(&self, item: &ItemSpec) -> Result<Option<PairPrice>>;

    /// Hourly sell-price history for one item/platform, for seeding.
    async fn fetch_hourly_sell_history(
        &self,
        item: &ItemSpec,
        platform: Platform,
    ) -> Result<ChartSeries>;
}

pub struct CsqaqClient {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
    limiter: RateLimiter,
}

impl CsqaqClient {
    /// Arguments:
    /// - `base_url`: API root, no trailing slash required
    /// - `api_token`: sent as the `ApiToken` header on every call
    /// - `qps`: shared request budget
    /// - `timeout_secs`: per-request HTTP timeout
    pub fn new(base_url: &str, api_token: &str, qps: f64, timeout_secs: u64) -> Result<Self> {
        if api_token.is_empty() {
            warn!("⚠️ API token is empty, upstream calls will fail authentication");
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
            limiter: RateLimiter::new(qps),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Issue one rate-limited request and translate the response into an
    /// attempt outcome per the retry policy.
    async fn attempt_request<F>(&self, endpoint: &str, build: &F) -> AttemptOutcome<Value>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        self.limiter.acquire().await;

        let started = Instant::now();
        let response = match build(&self.http)
            .header("ApiToken", &self.api_token)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                return AttemptOutcome::Transient {
                    reason: format!("transport: {err}"),
                    cooldown: None,
                }
            }
        };

        let status = response.status();
        info!(
            "🌐 {} -> {} in {}ms",
            endpoint,
            status.as_u16(),
            started.elapsed().as_millis()
        );

        if status.is_success() {
            let value: Value = match response.json().await {
                Ok(value) => value,
                Err(err) => {
                    return AttemptOutcome::Transient {
                        reason: format!("body decode: {err}"),
                        cooldown: None,
                    }
                }
            };
            if let Some((code, msg)) = envelope_error(&value) {
                return AttemptOutcome::Fatal(SkinflowError::InvalidRequest {
                    endpoint: endpoint.to_string(),
                    detail: format!("business code {code}: {msg}"),
                });
            }
            return AttemptOutcome::Success(value);
        }

        match status.as_u16() {
            401 | 403 => AttemptOutcome::Fatal(SkinflowError::Auth {
                status: status.as_u16(),
                message: snippet(response.text().await.unwrap_or_default()),
            }),
            422 => AttemptOutcome::Fatal(SkinflowError::InvalidRequest {
                endpoint: endpoint.to_string(),
                detail: snippet(response.text().await.unwrap_or_default()),
            }),
            429 => {
                let cooldown = retry_after(&response);
                AttemptOutcome::Transient {
                    reason: "rate limited (429)".to_string(),
                    cooldown,
                }
            }
            code if status.is_server_error() => AttemptOutcome::Transient {
                reason: format!("HTTP {code}"),
                cooldown: None,
            },
            code => AttemptOutcome::Fatal(SkinflowError::InvalidRequest {
                endpoint: endpoint.to_string(),
                detail: format!(
                    "HTTP {code}: {}",
                    snippet(response.text().await.unwrap_or_default())
                ),
            }),
        }
    }

    async fn request_json<F>(&self, endpoint: &str, build: F) -> Result<Value>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut backoff = ExponentialBackoff::new(BACKOFF_INITIAL, BACKOFF_MAX);
        run_with_retry(endpoint, &mut backoff, || {
            self.attempt_request(endpoint, &build)
        })
        .await
    }

    /// POST /goods/getPriceByMarketHashName for one item.
    pub async fn batch_price(&self, market_hash_name: &str) -> Result<Option<PairPrice>> {
        let url = self.url("goods/getPriceByMarketHashName");
        let body = serde_json::json!({ "marketHashNameList": [market_hash_name] });
        let value = self
            .request_json("batch_price", |http| http.post(&url).json(&body))
            .await?;

        let data = value.get("data").cloned().unwrap_or(Value::Null);
        let mut parsed: BatchPriceData = if data.is_null() {
            BatchPriceData::default()
        } else {
            serde_json::from_value(data)?
        };
        if parsed.fail.iter().any(|name| name == market_hash_name) {
            debug!("batch_price has no quote for {}", market_hash_name);
        }
        Ok(parsed.success.remove(market_hash_name))
    }

    /// POST /info/chart, one metric series for one item/platform.
    pub async fn good_chart(
        &self,
        good_id: i64,
        key: &str,
        platform: Platform,
        period: KlinePeriod,
    ) -> Result<ChartSeries> {
        let url = self.url("info/chart");
        let body = serde_json::json!({
            "good_id": good_id.to_string(),
            "key": key,
            "platform": platform.code(),
            "period": period.as_str(),
            "style": "all_style",
        });
        let value = self
            .request_json("good_chart", |http| http.post(&url).json(&body))
            .await?;

        let data = value.get("data").cloned().unwrap_or(Value::Null);
        if data.is_null() {
            return Ok(ChartSeries::default());
        }
        Ok(serde_json::from_value(data)?)
    }

    /// GET /info/good, raw detail payload for one item.
    pub async fn good_detail(&self, good_id: i64) -> Result<Value> {
        let url = self.url("info/good");
        let value = self
            .request_json("good_detail", |http| {
                http.get(&url).query(&[("id", good_id)])
            })
            .await?;
        Ok(value.get("data").cloned().unwrap_or(Value::Null))
    }

    /// GET /search/suggest, name lookup helper.
    pub async fn search_suggest(&self, text: &str) -> Result<Vec<SearchSuggestion>> {
        let url = self.url("search/suggest");
        let value = self
            .request_json("search_suggest", |http| {
                http.get(&url).query(&[("text", text)])
            })
            .await?;

        let data = value.get("data").cloned().unwrap_or(Value::Null);
        if data.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(data)?)
    }
}

#[async_trait]
impl MarketDataSource for CsqaqClient {
    async fn fetch_pair_price(&self, item: &ItemSpec) -> Result<Option<PairPrice>> {
        self.batch_price(&item.market_hash_name).await
    }

    async fn fetch_hourly_sell_history(
        &self,
        item: &ItemSpec,
        platform: Platform,
    ) -> Result<ChartSeries> {
        self.good_chart(item.item_id, "sell_price", platform, KlinePeriod::Hour1)
            .await
    }
}

/// Business-envelope rejection, if any: `(code, msg)` for codes other
/// than 0/200. A body without a `code` field passes through untouched.
fn envelope_error(value: &Value) -> Option<(i64, String)> {
    let code = value.get("code")?.as_i64()?;
    if code == 0 || code == 200 {
        return None;
    }
    let msg = value
        .get("msg")
        .and_then(|m| m.as_str())
        .unwrap_or("")
        .to_string();
    Some((code, msg))
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn snippet(text: String) -> String {
    text.chars().take(200).collect()
}
