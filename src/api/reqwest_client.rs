use std::time::Duration;

use super::{HttpClient, HttpResponse, Method};
use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// `HttpClient` over a shared `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestHttp {
    http: reqwest::Client,
}

impl ReqwestHttp {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("withings-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self { http })
    }
}

impl HttpClient for ReqwestHttp {
    async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &[(String, String)],
        params: &[(String, String)],
    ) -> Result<HttpResponse> {
        let mut builder = match method {
            Method::Get => self.http.get(url).query(params),
            Method::Post => self.http.post(url).form(params),
        };
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Http(format!("{} {url}: {e}", method.as_str())))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Http(format!("reading body of {url}: {e}")))?;

        log::trace!("{} {url} -> {status}", method.as_str());
        Ok(HttpResponse { status, body })
    }
}
