//! Fakes shared by unit tests: virtual time and a scripted HTTP client.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::api::{HttpClient, HttpResponse, Method};
use crate::clock::Clock;
use crate::error::Result;

struct ClockState {
    now: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

/// Virtual clock: `sleep` returns immediately after moving time forward.
#[derive(Clone)]
pub struct ManualClock(Arc<Mutex<ClockState>>);

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Arc::new(Mutex::new(ClockState {
            now,
            sleeps: Vec::new(),
        })))
    }

    pub fn at(y: i32, m: u32, d: u32) -> Self {
        Self::new(Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap())
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.0.lock().unwrap();
        state.now += chrono::Duration::from_std(by).unwrap();
    }

    /// Every duration passed to `sleep`, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.0.lock().unwrap().sleeps.clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.0.lock().unwrap().now
    }

    async fn sleep(&self, duration: Duration) {
        let mut state = self.0.lock().unwrap();
        state.now += chrono::Duration::from_std(duration).unwrap();
        state.sleeps.push(duration);
    }
}

#[derive(Debug, Clone)]
pub struct Call {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub params: Vec<(String, String)>,
}

impl Call {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

type Handler = Box<dyn Fn(&Call) -> Result<HttpResponse> + Send>;

/// HTTP client whose responses come from a closure; records every call.
#[derive(Clone)]
pub struct MockHttp {
    handler: Arc<Mutex<Handler>>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl MockHttp {
    pub fn new(handler: impl Fn(&Call) -> Result<HttpResponse> + Send + 'static) -> Self {
        Self {
            handler: Arc::new(Mutex::new(Box::new(handler))),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls whose `action` parameter matches.
    pub fn calls_with_action(&self, action: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.param("action") == Some(action))
            .collect()
    }
}

impl HttpClient for MockHttp {
    async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &[(String, String)],
        params: &[(String, String)],
    ) -> Result<HttpResponse> {
        let call = Call {
            method,
            url: url.to_string(),
            headers: headers.to_vec(),
            params: params.to_vec(),
        };
        self.calls.lock().unwrap().push(call.clone());
        let handler = self.handler.lock().unwrap();
        handler(&call)
    }
}

/// A 200 response wrapping `body` in the vendor envelope.
pub fn ok(body: Value) -> Result<HttpResponse> {
    Ok(HttpResponse {
        status: 200,
        body: serde_json::json!({ "status": 0, "body": body }).to_string(),
    })
}

pub fn http_status(status: u16) -> Result<HttpResponse> {
    Ok(HttpResponse {
        status,
        body: String::new(),
    })
}

/// A 200 response carrying a non-zero vendor status.
pub fn vendor_status(status: i64) -> Result<HttpResponse> {
    Ok(HttpResponse {
        status: 200,
        body: serde_json::json!({ "status": status, "error": "scripted" }).to_string(),
    })
}

/// Successful token endpoint reply.
pub fn token_reply(access: &str, refresh: &str, expires_in: i64) -> Result<HttpResponse> {
    ok(serde_json::json!({
        "userid": "4242",
        "access_token": access,
        "refresh_token": refresh,
        "expires_in": expires_in,
        "scope": "user.info,user.metrics,user.activity,user.sleepevents",
        "token_type": "Bearer",
    }))
}

/// Token store in `dir` holding a credential valid for three hours.
pub fn token_store(
    dir: &std::path::Path,
    http: MockHttp,
    clock: ManualClock,
) -> crate::auth::TokenStore<MockHttp, ManualClock> {
    let path = dir.join("credentials.json");
    let cred = crate::auth::Credential {
        access_token: "access-1".into(),
        refresh_token: "refresh-1".into(),
        expires_at: clock.now() + chrono::Duration::hours(3),
        scope: Some(crate::auth::SCOPES.into()),
        user_id: Some("4242".into()),
        token_type: "Bearer".into(),
    };
    std::fs::write(&path, serde_json::to_string(&cred).unwrap()).unwrap();
    crate::auth::TokenStore::open(
        http,
        clock,
        test_app(),
        path,
        chrono::Duration::seconds(60),
        crate::sync::rate_limit::RetryPolicy::new(3),
    )
    .unwrap()
}

pub fn test_app() -> crate::config::OAuthApp {
    crate::config::OAuthApp {
        client_id: "client-123".into(),
        client_secret: "secret-456".into(),
        callback_uri: "http://localhost:8080".into(),
    }
}
