//! JSON request gateway with bearer auth and transparent token refresh.
//!
//! Every call goes out once. A 401 triggers at most one refresh against
//! `/auth/refresh` followed by at most one retry with the new access token.
//! The refresh call itself never enters this recovery path. Concurrent 401s
//! share a single in-flight refresh.
//!
//! Session state is wiped only when no refresh token exists or the API says
//! the refresh token has expired. Every other failure is returned unchanged.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::RequestError;
use crate::metrics::{
    CREDENTIALS_CLEARED, REQUEST_FAILURES, REQUEST_LATENCY, REQUEST_RETRIES, REQUEST_TOTAL,
    TOKEN_REFRESH_FAILURES, TOKEN_REFRESHES,
};
use crate::models::{Method, RefreshRequest, RefreshResponse, RequestDescriptor};
use crate::state::{AuthState, AuthUpdate};

pub const REFRESH_PATH: &str = "/auth/refresh";
/// Default request timeout applied by the underlying HTTP client.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

type RefreshFuture = Shared<BoxFuture<'static, Result<String, RequestError>>>;

pub struct GatewayBuilder {
    base_url: String,
    timeout: Duration,
    client: Option<reqwest::Client>,
}

impl GatewayBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Uses a preconfigured client; the timeout setting is then ignored.
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self, auth: Arc<dyn AuthState>) -> Result<Gateway, RequestError> {
        let base_url = self.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(RequestError::Config("API base URL is not configured.".to_string()));
        }

        let parsed = Url::parse(&base_url)
            .map_err(|err| RequestError::Config(format!("Invalid API base URL {base_url}: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RequestError::Config(format!(
                "API base URL must use http or https, got {}",
                parsed.scheme()
            )));
        }

        let client = match self.client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(|err| {
                    RequestError::Config(format!("Failed to initialize HTTP client: {err}"))
                })?,
        };

        Ok(Gateway {
            inner: Arc::new(Inner {
                transport: Transport { client, base_url },
                auth,
                in_flight: Mutex::new(None),
            }),
        })
    }
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Transport,
    auth: Arc<dyn AuthState>,
    in_flight: Mutex<Option<RefreshFuture>>,
}

impl Gateway {
    pub fn builder(base_url: &str) -> GatewayBuilder {
        GatewayBuilder {
            base_url: base_url.to_string(),
            timeout: DEFAULT_TIMEOUT,
            client: None,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.inner.transport.base_url
    }

    pub fn auth(&self) -> &Arc<dyn AuthState> {
        &self.inner.auth
    }

    /// Sends a request and returns the parsed JSON body.
    pub async fn send(&self, descriptor: RequestDescriptor) -> Result<Value, RequestError> {
        let result = match self.inner.transport.dispatch(&descriptor).await {
            Ok(body) => return Ok(body),
            Err(err) if err.is_unauthorized() => self.recover_unauthorized(descriptor, err).await,
            Err(err) => {
                warn!(
                    method = %descriptor.method,
                    path = %descriptor.path,
                    error = %err,
                    "request failed"
                );
                Err(err)
            }
        };

        if result.is_err() {
            REQUEST_FAILURES.inc();
        }
        result
    }

    /// Like [`Gateway::send`] but decodes the body into `T`.
    pub async fn send_as<T: DeserializeOwned>(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<T, RequestError> {
        let body = self.send(descriptor).await?;
        serde_json::from_value(body)
            .map_err(|err| RequestError::Parse(format!("Unexpected response shape: {err}")))
    }

    /// Sends with the session's current access token attached.
    pub async fn send_authenticated(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<Value, RequestError> {
        let token = self.inner.auth.read().access_token;
        self.send(descriptor.with_token(token)).await
    }

    async fn recover_unauthorized(
        &self,
        descriptor: RequestDescriptor,
        original: RequestError,
    ) -> Result<Value, RequestError> {
        let access_token = match self.renewal(descriptor.token.as_deref()).await {
            Renewal::Missing => {
                warn!(
                    path = %descriptor.path,
                    "access token rejected and no refresh token available, clearing session"
                );
                clear_session(self.inner.auth.as_ref());
                return Err(original);
            }
            Renewal::Current(token) => {
                debug!(path = %descriptor.path, "access token already refreshed, retrying");
                token
            }
            Renewal::Pending(refresh) => self.await_refresh(refresh).await?,
        };

        REQUEST_RETRIES.inc();
        let retry = descriptor.with_token(access_token);
        self.inner.transport.dispatch(&retry).await.inspect_err(|err| {
            warn!(
                method = %retry.method,
                path = %retry.path,
                error = %err,
                "request failed after token refresh"
            );
        })
    }

    // Decides how to renew under the in-flight lock, so a refresh that
    // finished while this request was failing is seen here
    async fn renewal(&self, used_token: Option<&str>) -> Renewal {
        let mut slot = self.inner.in_flight.lock().await;

        if let Some(pending) = slot.as_ref().filter(|pending| pending.peek().is_none()) {
            debug!("joining in-flight token refresh");
            return Renewal::Pending(pending.clone());
        }

        let snapshot = self.inner.auth.read();
        let superseded = snapshot.is_authenticated()
            && used_token.is_some_and(|used| used != snapshot.access_token);
        if superseded {
            return Renewal::Current(snapshot.access_token);
        }

        let Some(refresh_token) = snapshot.refresh_token.filter(|t| !t.is_empty()) else {
            return Renewal::Missing;
        };

        let transport = self.inner.transport.clone();
        let auth = self.inner.auth.clone();
        let refresh = run_refresh(transport, auth, refresh_token).boxed().shared();
        *slot = Some(refresh.clone());
        Renewal::Pending(refresh)
    }

    async fn await_refresh(&self, refresh: RefreshFuture) -> Result<String, RequestError> {
        let result = refresh.await;

        let mut slot = self.inner.in_flight.lock().await;
        if slot.as_ref().is_some_and(|done| done.peek().is_some()) {
            *slot = None;
        }
        result
    }
}

enum Renewal {
    /// Session already holds a newer access token than the rejected one.
    Current(String),
    Pending(RefreshFuture),
    /// No refresh token to renew with.
    Missing,
}

async fn run_refresh(
    transport: Transport,
    auth: Arc<dyn AuthState>,
    refresh_token: String,
) -> Result<String, RequestError> {
    TOKEN_REFRESHES.inc();
    info!("access token expired, refreshing");

    let body = serde_json::to_value(RefreshRequest { refresh_token })
        .map_err(|err| RequestError::Serialization(format!("Failed to encode request: {err}")))?;
    let descriptor = RequestDescriptor::post(REFRESH_PATH).with_body(body);

    let outcome = transport
        .dispatch(&descriptor)
        .await
        .and_then(parse_refresh_response);

    match outcome {
        Ok((access_token, rotated)) => {
            auth.write(AuthUpdate::tokens(access_token.clone(), rotated));
            info!("access token refreshed");
            Ok(access_token)
        }
        Err(err) => {
            TOKEN_REFRESH_FAILURES.inc();
            if err.is_refresh_expired() {
                warn!("refresh token expired, clearing session");
                clear_session(auth.as_ref());
            } else {
                warn!(error = %err, "token refresh failed, keeping session");
            }
            Err(err)
        }
    }
}

// Yields the new access token and, if the API rotated it, the new refresh token
fn parse_refresh_response(body: Value) -> Result<(String, Option<String>), RequestError> {
    let response: RefreshResponse = serde_json::from_value(body)
        .map_err(|err| RequestError::InvalidRefreshResponse(err.to_string()))?;

    let data = response.data.ok_or_else(|| {
        RequestError::InvalidRefreshResponse("response has no data field".to_string())
    })?;

    match data.access_token {
        Some(token) if !token.is_empty() => {
            Ok((token, data.refresh_token.filter(|t| !t.is_empty())))
        }
        _ => Err(RequestError::InvalidRefreshResponse(
            "response did not include an access token".to_string(),
        )),
    }
}

fn clear_session(auth: &dyn AuthState) {
    CREDENTIALS_CLEARED.inc();
    auth.clear();
}

// One-shot HTTP exchange; no auth recovery
#[derive(Clone)]
struct Transport {
    client: reqwest::Client,
    base_url: String,
}

impl Transport {
    async fn dispatch(&self, descriptor: &RequestDescriptor) -> Result<Value, RequestError> {
        let url = self.url_for(descriptor)?;
        debug!(method = %descriptor.method, url = %url, "sending request");

        let mut request = self
            .client
            .request(descriptor.method.into(), url)
            .header(CONTENT_TYPE, "application/json");

        if let Some(token) = &descriptor.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = &descriptor.body {
            let payload = serde_json::to_vec(body).map_err(|err| {
                RequestError::Serialization(format!("Failed to encode request: {err}"))
            })?;
            request = request.body(payload);
        }

        REQUEST_TOTAL.inc();
        let start_time = Instant::now();
        let response = request.send().await;
        REQUEST_LATENCY.observe(start_time.elapsed().as_secs_f64());

        let response = response.map_err(RequestError::from_reqwest)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(RequestError::from_reqwest)?;

        if !status.is_success() {
            return Err(RequestError::from_response(
                status.as_u16(),
                &String::from_utf8_lossy(&bytes),
            ));
        }

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|err| RequestError::Parse(format!("Failed to decode response: {err}")))
    }

    fn url_for(&self, descriptor: &RequestDescriptor) -> Result<Url, RequestError> {
        let joined = join_url(&self.base_url, &descriptor.path);
        let mut url = Url::parse(&joined)
            .map_err(|err| RequestError::Config(format!("Invalid request URL {joined}: {err}")))?;

        if !descriptor.query.is_empty() {
            if descriptor.method == Method::Get {
                url.query_pairs_mut().extend_pairs(descriptor.query.iter());
            } else {
                debug!(method = %descriptor.method, "query parameters ignored for non-GET request");
            }
        }
        Ok(url)
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    let path = path.trim().trim_start_matches('/');

    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}
