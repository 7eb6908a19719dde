//! Single-shot HTTP client for the catalog upstream.
//!
//! [`HttpUpstream`] performs exactly one GET per call and knows nothing about
//! retries, fallbacks or caching. It is a [`tower::Service`], so anything
//! with the same request/response types (a `service_fn` in tests, a service
//! wrapped in extra tower layers) can stand in for it through the
//! [`Upstream`] trait.

use crate::config::ConfigError;
use catalog_readthrough_core::UpstreamError;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Service, ServiceExt};

/// A fully formed upstream read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    /// Path relative to the configured base URL, e.g. `products`.
    pub path: String,
    /// Query-string parameters.
    pub query: BTreeMap<String, String>,
    /// Upper bound for this one call.
    pub timeout: Duration,
}

impl UpstreamRequest {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            query: BTreeMap::new(),
            timeout,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }
}

/// Credential material supplied by the embedding application.
///
/// Opaque to the read path; it is only turned into an `Authorization` header.
#[derive(Clone, Default)]
pub enum Credentials {
    /// No authorization header.
    #[default]
    None,
    /// HTTP basic auth, e.g. a consumer key / secret pair.
    Basic { username: String, password: String },
    /// `Authorization: Bearer <token>`.
    Bearer(String),
}

impl Credentials {
    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Credentials::None => request,
            Credentials::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            Credentials::Bearer(token) => request.bearer_auth(token),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::None => f.write_str("None"),
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

/// Connection settings for [`HttpUpstream`].
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub(crate) base_url: String,
    pub(crate) credentials: Credentials,
    pub(crate) fields_param: String,
    pub(crate) fields: Option<String>,
    pub(crate) user_agent: String,
}

impl UpstreamConfig {
    /// Settings for `base_url` with no credentials and no field selection.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials: Credentials::None,
            fields_param: "_fields".to_string(),
            fields: None,
            user_agent: concat!("catalog-readthrough/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Restricts responses to the listed fields, e.g. `id,name,price`.
    pub fn fields(mut self, fields: impl Into<String>) -> Self {
        self.fields = Some(fields.into());
        self
    }

    /// Name of the field-selection query parameter.
    ///
    /// Default: `_fields`
    pub fn fields_param(mut self, param: impl Into<String>) -> Self {
        self.fields_param = param.into();
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Reads settings from `CATALOG_UPSTREAM_*` environment variables.
    ///
    /// | variable | meaning |
    /// |---|---|
    /// | `CATALOG_UPSTREAM_URL` | base URL (required) |
    /// | `CATALOG_UPSTREAM_KEY` / `CATALOG_UPSTREAM_SECRET` | basic credentials |
    /// | `CATALOG_UPSTREAM_TOKEN` | bearer token, used when no key is set |
    /// | `CATALOG_UPSTREAM_FIELDS` | field selection |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url =
            lookup("CATALOG_UPSTREAM_URL").ok_or(ConfigError::Missing("CATALOG_UPSTREAM_URL"))?;
        let mut config = Self::new(base_url);

        config.credentials = match (
            lookup("CATALOG_UPSTREAM_KEY"),
            lookup("CATALOG_UPSTREAM_SECRET"),
            lookup("CATALOG_UPSTREAM_TOKEN"),
        ) {
            (Some(username), Some(password), _) => Credentials::Basic { username, password },
            (Some(_), None, _) => return Err(ConfigError::Missing("CATALOG_UPSTREAM_SECRET")),
            (None, _, Some(token)) => Credentials::Bearer(token),
            (None, _, None) => Credentials::None,
        };

        if let Some(fields) = lookup("CATALOG_UPSTREAM_FIELDS") {
            config.fields = Some(fields);
        }
        Ok(config)
    }
}

/// `reqwest`-backed upstream client.
#[derive(Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    config: Arc<UpstreamConfig>,
}

impl HttpUpstream {
    pub fn new(config: UpstreamConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ConfigError::Client(e.to_string()))?;
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url, path.trim_start_matches('/'))
    }

    /// Issues one GET and parses the JSON body.
    ///
    /// The whole exchange, body included, races a timer of
    /// `request.timeout`; whichever finishes first drops the other.
    pub async fn get(&self, request: UpstreamRequest) -> Result<Value, UpstreamError> {
        let limit = request.timeout;
        let mut builder = self.client.get(self.url(&request.path)).query(&request.query);
        if let Some(fields) = &self.config.fields {
            builder = builder.query(&[(self.config.fields_param.as_str(), fields.as_str())]);
        }
        let builder = self.config.credentials.apply(builder);

        let exchange = async move {
            let response = builder.send().await.map_err(|e| classify(e, limit))?;
            let status = response.status();
            if !status.is_success() {
                return Err(UpstreamError::Http {
                    status: status.as_u16(),
                });
            }
            response
                .json::<Value>()
                .await
                .map_err(|e| classify(e, limit))
        };

        match tokio::time::timeout(limit, exchange).await {
            Ok(result) => result,
            Err(_elapsed) => Err(UpstreamError::Timeout(limit)),
        }
    }
}

impl fmt::Debug for HttpUpstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpUpstream")
            .field("base_url", &self.config.base_url)
            .finish()
    }
}

fn classify(error: reqwest::Error, limit: Duration) -> UpstreamError {
    if error.is_timeout() {
        UpstreamError::Timeout(limit)
    } else if error.is_decode() {
        UpstreamError::Shape(error.to_string())
    } else if let Some(status) = error.status() {
        UpstreamError::Http {
            status: status.as_u16(),
        }
    } else {
        UpstreamError::Transport(error.to_string())
    }
}

impl Service<UpstreamRequest> for HttpUpstream {
    type Response = Value;
    type Error = UpstreamError;
    type Future = BoxFuture<'static, Result<Value, UpstreamError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: UpstreamRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.get(request).await })
    }
}

/// Anything that can serve [`UpstreamRequest`]s.
///
/// Blanket-implemented for every cloneable tower service with matching
/// types, so `tower::service_fn` closures work out of the box.
pub trait Upstream: Clone + Send + Sync + 'static {
    fn fetch(&self, request: UpstreamRequest) -> BoxFuture<'static, Result<Value, UpstreamError>>;
}

impl<S> Upstream for S
where
    S: Service<UpstreamRequest, Response = Value, Error = UpstreamError>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    fn fetch(&self, request: UpstreamRequest) -> BoxFuture<'static, Result<Value, UpstreamError>> {
        let mut service = self.clone();
        Box::pin(async move { service.ready().await?.call(request).await })
    }
}
