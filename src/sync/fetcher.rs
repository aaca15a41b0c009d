use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::Value;

use crate::api::{
    classify, HttpClient, Method, Reply, BASE_URL, MEASURE_PATH, MEASURE_V2_PATH, SLEEP_V2_PATH,
};
use crate::auth::TokenStore;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::sync::chunk::{split_range, DateRange};
use crate::sync::rate_limit::{RateLimiter, RetryPolicy};
use crate::sync::record::{decode_item, items_key, Record, HEART_RATE_MEASURE_TYPE, SLEEP_FIELDS};
use crate::sync::DataType;

/// Records decoded from one sub-range.
#[derive(Debug, Clone)]
pub struct FetchedChunk {
    pub range: DateRange,
    pub records: Vec<Record>,
    /// Items that could not be decoded and were skipped.
    pub decode_failures: u64,
}

/// Fetches a data type range by range, respecting the vendor's per-request
/// span, the rate limit, and the retry policy.
pub struct ChunkedFetcher<H: HttpClient, C: Clock> {
    http: H,
    clock: C,
    limiter: RateLimiter<C>,
    policy: RetryPolicy,
    base_url: String,
}

impl<H: HttpClient, C: Clock> ChunkedFetcher<H, C> {
    pub fn new(http: H, clock: C, limiter: RateLimiter<C>, policy: RetryPolicy) -> Self {
        Self {
            http,
            clock,
            limiter,
            policy,
            base_url: BASE_URL.to_string(),
        }
    }

    /// Shared limiter, so token refreshes count against the same budget.
    pub fn limiter(&mut self) -> &mut RateLimiter<C> {
        &mut self.limiter
    }

    /// Lazily fetch `[start, end)` one sub-range at a time. Nothing is
    /// requested until `next()` is awaited.
    pub fn fetch<'a>(
        &'a mut self,
        tokens: &'a mut TokenStore<H, C>,
        data_type: DataType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ChunkStream<'a, H, C> {
        let chunks = split_range(start, end, data_type.max_span());
        log::debug!(
            "{data_type}: {} chunk(s) over {}",
            chunks.len(),
            DateRange::new(start, end)
        );
        ChunkStream {
            total: chunks.len(),
            chunks: chunks.into_iter(),
            fetcher: self,
            tokens,
            data_type,
        }
    }

    /// Fetch every page of one sub-range.
    pub async fn fetch_chunk(
        &mut self,
        tokens: &mut TokenStore<H, C>,
        data_type: DataType,
        range: DateRange,
    ) -> Result<FetchedChunk> {
        let mut records = Vec::new();
        let mut decode_failures = 0u64;
        let mut offset: Option<i64> = None;
        let mut seen_offsets = HashSet::new();

        loop {
            let body = self.request_page(tokens, data_type, range, offset).await?;

            let items = body
                .get(items_key(data_type))
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for item in items {
                match decode_item(data_type, item) {
                    Ok(mut decoded) => records.append(&mut decoded),
                    Err(e) => {
                        log::warn!("Skipping item: {e}");
                        decode_failures += 1;
                    }
                }
            }

            if !has_more(&body) {
                break;
            }
            match body.get("offset").and_then(Value::as_i64) {
                Some(next) if seen_offsets.insert(next) => offset = Some(next),
                Some(next) => {
                    log::warn!("{data_type} {range}: offset {next} repeated, stopping pagination");
                    break;
                }
                None => {
                    log::warn!(
                        "{data_type} {range}: 'more' set without an offset, stopping pagination"
                    );
                    break;
                }
            }
        }

        log::debug!("{data_type} {range}: {} record(s)", records.len());
        Ok(FetchedChunk {
            range,
            records,
            decode_failures,
        })
    }

    async fn request_page(
        &mut self,
        tokens: &mut TokenStore<H, C>,
        data_type: DataType,
        range: DateRange,
        offset: Option<i64>,
    ) -> Result<Value> {
        let (method, path, params) = build_request(data_type, range, offset);
        let url = format!("{}{}", self.base_url, path);
        let mut last_error = String::new();

        for attempt in 0..self.policy.max_attempts {
            // The slot wait can outlast the token, so re-check before sending.
            let cred = loop {
                let cred = tokens.get_valid_token(&mut self.limiter).await?;
                self.limiter.acquire().await;
                if tokens.is_live(&cred) {
                    break cred;
                }
                log::debug!("Access token expired while waiting for a request slot");
            };

            let reply = match self
                .http
                .request(method, &url, &[cred.authorization_header()], &params)
                .await
            {
                Ok(resp) => classify(&resp),
                Err(e) => Reply::Retryable(e.to_string()),
            };

            match reply {
                Reply::Ok(body) => return Ok(body),
                Reply::Unauthorized(msg) => {
                    return Err(Error::AuthExpired(format!(
                        "{data_type} request was refused ({msg})"
                    )));
                }
                Reply::Rejected(msg) => {
                    return Err(Error::FetchFailed {
                        data_type,
                        range,
                        message: msg,
                    });
                }
                Reply::RateLimited(msg) | Reply::Retryable(msg) => {
                    last_error = msg;
                    if attempt + 1 < self.policy.max_attempts {
                        let context = format!("{data_type} {range}: {last_error}");
                        self.policy.backoff(&self.clock, attempt, &context).await;
                    }
                }
            }
        }

        Err(Error::FetchFailed {
            data_type,
            range,
            message: format!(
                "gave up after {} attempts: {last_error}",
                self.policy.max_attempts
            ),
        })
    }
}

/// Lazy sequence of chunks for one data type.
pub struct ChunkStream<'a, H: HttpClient, C: Clock> {
    fetcher: &'a mut ChunkedFetcher<H, C>,
    tokens: &'a mut TokenStore<H, C>,
    data_type: DataType,
    chunks: std::vec::IntoIter<DateRange>,
    total: usize,
}

impl<H: HttpClient, C: Clock> ChunkStream<'_, H, C> {
    pub fn total(&self) -> usize {
        self.total
    }

    pub async fn next(&mut self) -> Option<Result<FetchedChunk>> {
        let range = self.chunks.next()?;
        Some(
            self.fetcher
                .fetch_chunk(self.tokens, self.data_type, range)
                .await,
        )
    }
}

fn has_more(body: &Value) -> bool {
    match body.get("more") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

/// Last calendar day touched by the half-open range.
fn last_day(range: DateRange) -> NaiveDate {
    (range.end - Duration::seconds(1)).max(range.start).date_naive()
}

fn build_request(
    data_type: DataType,
    range: DateRange,
    offset: Option<i64>,
) -> (Method, &'static str, Vec<(String, String)>) {
    let p = |k: &str, v: String| (k.to_string(), v);
    let epoch_bounds = || {
        vec![
            p("startdate", range.start.timestamp().to_string()),
            p("enddate", (range.end.timestamp() - 1).to_string()),
        ]
    };
    let ymd_bounds = || {
        vec![
            p("startdateymd", range.start.date_naive().format("%Y-%m-%d").to_string()),
            p("enddateymd", last_day(range).format("%Y-%m-%d").to_string()),
        ]
    };

    let (method, path, mut params) = match data_type {
        DataType::Measurement => {
            let mut params = vec![p("action", "getmeas".into()), p("category", "1".into())];
            params.extend(epoch_bounds());
            (Method::Get, MEASURE_PATH, params)
        }
        DataType::HeartRate => {
            let mut params = vec![
                p("action", "getmeas".into()),
                p("meastype", HEART_RATE_MEASURE_TYPE.to_string()),
                p("category", "1".into()),
            ];
            params.extend(epoch_bounds());
            (Method::Get, MEASURE_PATH, params)
        }
        DataType::Activity => {
            let mut params = vec![p("action", "getactivity".into())];
            params.extend(ymd_bounds());
            (Method::Get, MEASURE_V2_PATH, params)
        }
        DataType::Sleep => {
            let mut params = vec![p("action", "getsummary".into())];
            params.extend(ymd_bounds());
            params.push(p("data_fields", SLEEP_FIELDS.join(",")));
            (Method::Post, SLEEP_V2_PATH, params)
        }
    };

    if let Some(offset) = offset {
        params.push(p("offset", offset.to_string()));
    }
    (method, path, params)
}
