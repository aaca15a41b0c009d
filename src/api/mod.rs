//! Vendor HTTP plumbing: the `HttpClient` seam, the production `reqwest`
//! implementation, and classification of Withings' `{status, body}` envelope.

mod reqwest_client;

pub use reqwest_client::ReqwestHttp;

use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;

pub const BASE_URL: &str = "https://wbsapi.withings.net";
pub const MEASURE_PATH: &str = "/measure";
pub const MEASURE_V2_PATH: &str = "/v2/measure";
pub const SLEEP_V2_PATH: &str = "/v2/sleep";
pub const OAUTH2_PATH: &str = "/v2/oauth2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Outbound HTTP capability. GET sends `params` as the query string, POST as
/// a form body. Transport failures come back as `Error::Http`.
#[allow(async_fn_in_trait)]
pub trait HttpClient: Clone {
    async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &[(String, String)],
        params: &[(String, String)],
    ) -> Result<HttpResponse>;
}

/// What a vendor response means for the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Envelope status 0; carries `body`.
    Ok(Value),
    /// HTTP 429 or vendor status 601.
    RateLimited(String),
    /// HTTP 5xx, vendor status 2555, or an unparseable body.
    Retryable(String),
    /// HTTP 401/403 or a vendor authentication status.
    Unauthorized(String),
    /// Anything else the vendor refused.
    Rejected(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: i64,
    #[serde(default)]
    body: Value,
    #[serde(default)]
    error: Option<String>,
}

pub fn classify(resp: &HttpResponse) -> Reply {
    match resp.status {
        429 => return Reply::RateLimited("HTTP 429".into()),
        401 | 403 => return Reply::Unauthorized(format!("HTTP {}", resp.status)),
        s if s >= 500 => return Reply::Retryable(format!("HTTP {s}")),
        s if !(200..300).contains(&s) => {
            return Reply::Rejected(format!("HTTP {s}: {}", snippet(&resp.body)))
        }
        _ => {}
    }

    let envelope: Envelope = match serde_json::from_str(&resp.body) {
        Ok(e) => e,
        Err(e) => {
            return Reply::Retryable(format!(
                "non-JSON response ({e}): {}",
                snippet(&resp.body)
            ))
        }
    };

    let message = || {
        let known = status_message(envelope.status);
        match (&envelope.error, known) {
            (Some(err), _) => format!("status {}: {err}", envelope.status),
            (None, Some(m)) => format!("status {}: {m}", envelope.status),
            (None, None) => format!("status {}", envelope.status),
        }
    };

    match envelope.status {
        0 => Reply::Ok(envelope.body),
        601 => Reply::RateLimited(message()),
        2555 => Reply::Retryable(message()),
        100 | 101 | 102 | 200 | 328 | 401 => Reply::Unauthorized(message()),
        _ => Reply::Rejected(message()),
    }
}

fn status_message(status: i64) -> Option<&'static str> {
    Some(match status {
        100 | 101 | 102 | 200 => "the access token is missing, invalid or expired",
        247 => "user is deactivated",
        328 => "user is unauthorized",
        401 => "invalid token",
        503 => "invalid params",
        601 => "too many requests",
        2554 => "unknown action",
        2555 => "an unknown error occurred",
        _ => return None,
    })
}

fn snippet(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(200)
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    &body[..end]
}
