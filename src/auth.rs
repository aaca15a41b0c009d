//! OAuth2 credential storage and refresh.
//!
//! The credential lives in a single JSON file (default
//! `~/.withings/credentials.json`, mode 0600) that is replaced atomically on
//! every refresh. Rejected refresh tokens surface as `AuthExpired` and are
//! never retried; transport and vendor hiccups are retried with the same
//! backoff the fetcher uses.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::{classify, HttpClient, Method, Reply, BASE_URL, OAUTH2_PATH};
use crate::clock::Clock;
use crate::config::OAuthApp;
use crate::error::{Error, Result};
use crate::sync::rate_limit::{RateLimiter, RetryPolicy};

pub const AUTHORIZE_URL: &str = "https://account.withings.com/oauth2_user/authorize2";
pub const SCOPES: &str = "user.info,user.metrics,user.activity,user.sleepevents";

/// Token lifetime assumed when the vendor omits `expires_in`.
const DEFAULT_EXPIRES_IN: i64 = 10_800;

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Credential {
    /// True if the token is expired or will be within `margin` of `now`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        now + margin >= self.expires_at
    }

    pub fn authorization_header(&self) -> (String, String) {
        (
            "Authorization".to_string(),
            format!("Bearer {}", self.access_token),
        )
    }
}

// Tokens never end up in logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("user_id", &self.user_id)
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenBody {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    userid: Option<Value>,
    #[serde(default)]
    token_type: Option<String>,
}

pub struct TokenStore<H: HttpClient, C: Clock> {
    http: H,
    clock: C,
    app: OAuthApp,
    path: PathBuf,
    token_url: String,
    margin: chrono::Duration,
    policy: RetryPolicy,
    credential: Option<Credential>,
}

impl<H: HttpClient, C: Clock> TokenStore<H, C> {
    /// Open the store, loading the credential file if it exists.
    pub fn open(
        http: H,
        clock: C,
        app: OAuthApp,
        path: impl AsRef<Path>,
        margin: chrono::Duration,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let credential = load_credential(&path)?;
        Ok(Self {
            http,
            clock,
            app,
            path,
            token_url: format!("{BASE_URL}{OAUTH2_PATH}"),
            margin,
            policy,
            credential,
        })
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// A credential good for at least one more call, refreshing first if it
    /// expires within the safety margin.
    pub async fn get_valid_token(&mut self, limiter: &mut RateLimiter<C>) -> Result<Credential> {
        let cred = self.credential.as_ref().ok_or_else(|| {
            Error::AuthExpired(format!("no credential at {}", self.path.display()))
        })?;

        if !cred.needs_refresh(self.clock.now(), self.margin) {
            return Ok(cred.clone());
        }

        log::info!(
            "Access token expires at {}, refreshing",
            cred.expires_at.format("%Y-%m-%d %H:%M:%S")
        );
        self.refresh(limiter).await
    }

    /// Whether `cred` has not yet expired.
    pub fn is_live(&self, cred: &Credential) -> bool {
        !cred.needs_refresh(self.clock.now(), chrono::Duration::zero())
    }

    /// Trade the refresh token for a new credential and persist it.
    pub async fn refresh(&mut self, limiter: &mut RateLimiter<C>) -> Result<Credential> {
        let previous = self
            .credential
            .clone()
            .ok_or_else(|| Error::AuthExpired("no credential to refresh".into()))?;

        let params = vec![
            ("action".to_string(), "requesttoken".to_string()),
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("client_id".to_string(), self.app.client_id.clone()),
            ("client_secret".to_string(), self.app.client_secret.clone()),
            ("refresh_token".to_string(), previous.refresh_token.clone()),
        ];
        let mut fresh = self.request_token(limiter, &params, "token refresh").await?;

        // The vendor does not always echo these back.
        if fresh.user_id.is_none() {
            fresh.user_id = previous.user_id.clone();
        }
        if fresh.scope.is_none() {
            fresh.scope = previous.scope.clone();
        }

        self.store(fresh.clone())?;
        log::info!(
            "Refreshed access token, valid until {}",
            fresh.expires_at.format("%Y-%m-%d %H:%M:%S")
        );
        Ok(fresh)
    }

    /// Build the URL the user opens to grant access. Returns the URL and the
    /// `state` value it carries.
    pub fn authorize_url(&self, state: Option<&str>) -> Result<(String, String)> {
        let state = match state {
            Some(s) => s.to_string(),
            None => rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(32)
                .map(char::from)
                .collect(),
        };
        let url = url::Url::parse_with_params(
            AUTHORIZE_URL,
            &[
                ("response_type", "code"),
                ("client_id", self.app.client_id.as_str()),
                ("redirect_uri", self.app.callback_uri.as_str()),
                ("scope", SCOPES),
                ("state", state.as_str()),
            ],
        )
        .map_err(|e| Error::Config(format!("invalid authorize URL: {e}")))?;
        Ok((url.into(), state))
    }

    /// Exchange an authorization code for the first credential.
    pub async fn exchange_code(
        &mut self,
        limiter: &mut RateLimiter<C>,
        code: &str,
    ) -> Result<Credential> {
        let params = vec![
            ("action".to_string(), "requesttoken".to_string()),
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("client_id".to_string(), self.app.client_id.clone()),
            ("client_secret".to_string(), self.app.client_secret.clone()),
            ("code".to_string(), code.trim().to_string()),
            ("redirect_uri".to_string(), self.app.callback_uri.clone()),
        ];
        let cred = self
            .request_token(limiter, &params, "authorization code exchange")
            .await?;
        self.store(cred.clone())?;
        log::info!("Stored credential at {}", self.path.display());
        Ok(cred)
    }

    async fn request_token(
        &self,
        limiter: &mut RateLimiter<C>,
        params: &[(String, String)],
        what: &str,
    ) -> Result<Credential> {
        let headers = [("Accept".to_string(), "application/json".to_string())];
        let mut last_error = String::new();

        for attempt in 0..self.policy.max_attempts {
            limiter.acquire().await;
            let reply = match self
                .http
                .request(Method::Post, &self.token_url, &headers, params)
                .await
            {
                Ok(resp) => classify(&resp),
                Err(e) => Reply::Retryable(e.to_string()),
            };

            match reply {
                Reply::Ok(body) => return self.parse_token(body),
                Reply::Unauthorized(msg) | Reply::Rejected(msg) => {
                    return Err(Error::AuthExpired(format!("{what} rejected ({msg})")));
                }
                Reply::RateLimited(msg) | Reply::Retryable(msg) => {
                    last_error = msg;
                    if attempt + 1 < self.policy.max_attempts {
                        self.policy
                            .backoff(&self.clock, attempt, &format!("{what} failed: {last_error}"))
                            .await;
                    }
                }
            }
        }

        Err(Error::TransientAuth(format!(
            "{what} failed after {} attempts: {last_error}",
            self.policy.max_attempts
        )))
    }

    fn parse_token(&self, body: Value) -> Result<Credential> {
        let body: TokenBody = serde_json::from_value(body)?;
        let expires_in = body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        let user_id = body.userid.and_then(|v| match v {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        Ok(Credential {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at: self.clock.now() + chrono::Duration::seconds(expires_in),
            scope: body.scope,
            user_id,
            token_type: body.token_type.unwrap_or_else(default_token_type),
        })
    }

    fn store(&mut self, cred: Credential) -> Result<()> {
        save_credential(&self.path, &cred)?;
        self.credential = Some(cred);
        Ok(())
    }
}

pub fn load_credential(path: &Path) -> Result<Option<Credential>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write to a 0600 temp file beside the target, fsync, then rename over it.
fn save_credential(path: &Path, cred: &Credential) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), cred)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
