use std::time::Duration;

use futures_util::TryStreamExt;
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Serialize, de::DeserializeOwned};

use crate::config::HttpCfg;
use crate::error::{CoreResult, DoodlepadError};
use crate::event::ENTITLEMENT_CODES;
use crate::frame::ByteStream;

/// Request context: caller identity and an optional correlation id.
#[derive(Clone, Copy, Default)]
pub struct RequestCtx<'a> {
    pub bearer: Option<&'a SecretString>,
    pub request_id: Option<&'a str>,
}

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    request_timeout: Duration,
    user_agent: String,
}

impl HttpClient {
    pub fn new(cfg: &HttpCfg) -> CoreResult<Self> {
        // No client-wide total timeout: it would cut long generation streams.
        // Non-streaming calls set `request_timeout` per request instead.
        let mut builder = Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| DoodlepadError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
            user_agent: "doodlepad/0.1".to_string(),
        })
    }

    pub fn new_default() -> CoreResult<Self> {
        Self::new(&HttpCfg::default())
    }

    fn request(&self, method: Method, url: &str, ctx: &RequestCtx<'_>) -> reqwest::RequestBuilder {
        let mut req = self
            .inner
            .request(method, url)
            .header("User-Agent", &self.user_agent);
        if let Some(token) = ctx.bearer {
            req = req.bearer_auth(token.expose_secret());
        }
        if let Some(rid) = ctx.request_id {
            req = req.header("X-Request-Id", rid);
        }
        req
    }

    /// POST JSON and return the response body as a byte stream, once the
    /// status says a stream has started. A non-2xx status is an error here,
    /// before any stream bytes are read.
    pub async fn post_stream<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<ByteStream> {
        let resp = self
            .request(Method::POST, url, ctx)
            .json(body)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| unavailable(url, &e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_http_error(url, status, &body));
        }

        let endpoint = url.to_string();
        let byte_stream = resp.bytes_stream().map_err(move |e| {
            tracing::warn!(%endpoint, error = %e, "stream body read failed");
            DoodlepadError::Unavailable {
                endpoint: endpoint.clone(),
            }
        });
        Ok(Box::pin(byte_stream))
    }

    pub async fn get_json<R: DeserializeOwned>(&self, url: &str, ctx: &RequestCtx<'_>) -> CoreResult<R> {
        self.send_json::<(), R>(Method::GET, url, None, ctx).await
    }

    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<R> {
        self.send_json(Method::POST, url, Some(body), ctx).await
    }

    pub async fn put_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<R> {
        self.send_json(Method::PUT, url, Some(body), ctx).await
    }

    pub async fn delete_json<R: DeserializeOwned>(&self, url: &str, ctx: &RequestCtx<'_>) -> CoreResult<R> {
        self.send_json::<(), R>(Method::DELETE, url, None, ctx).await
    }

    async fn send_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&T>,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<R> {
        let mut req = self.request(method, url, ctx).timeout(self.request_timeout);
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req.send().await.map_err(|e| unavailable(url, &e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(map_http_error(url, status, &text));
        }

        resp.json::<R>()
            .await
            .map_err(|e| DoodlepadError::Decode(format!("json decode error: {e}")))
    }
}

fn unavailable(url: &str, err: &reqwest::Error) -> DoodlepadError {
    tracing::debug!(endpoint = url, error = %err, "request failed before a response");
    DoodlepadError::Unavailable {
        endpoint: url.to_string(),
    }
}

/// The backend reports access problems as `{"error": "<code>"}`.
fn entitlement_code(body: &str) -> Option<String> {
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    let code = v.get("error")?.as_str()?;
    ENTITLEMENT_CODES.contains(&code).then(|| code.to_string())
}

fn map_http_error(url: &str, status: StatusCode, body: &str) -> DoodlepadError {
    if let Some(code) = entitlement_code(body) {
        return DoodlepadError::EntitlementRequired { code };
    }
    match status {
        StatusCode::PAYMENT_REQUIRED => DoodlepadError::EntitlementRequired {
            code: "subscription_required".into(),
        },
        s if s.is_server_error() => DoodlepadError::Unavailable {
            endpoint: url.to_string(),
        },
        s => DoodlepadError::Status {
            code: s.as_u16(),
            message: truncate(body, 300),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
