//! Shared fixtures for read-through integration tests.

mod freshness;

use catalog_readthrough::{
    EndpointCandidate, ReadThrough, ReadThroughConfig, ReadThroughConfigBuilder, ResourceConfig,
    RetryPlan, Upstream, UpstreamError, UpstreamRequest,
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Responder = Box<dyn FnMut(&UpstreamRequest) -> Result<Value, UpstreamError> + Send>;

/// Scripted upstream that counts and records every call.
#[derive(Clone)]
pub struct FakeUpstream {
    calls: Arc<AtomicUsize>,
    paths: Arc<Mutex<Vec<String>>>,
    delay: Arc<Mutex<Duration>>,
    respond: Arc<Mutex<Responder>>,
}

impl FakeUpstream {
    pub fn new<F>(respond: F) -> Self
    where
        F: FnMut(&UpstreamRequest) -> Result<Value, UpstreamError> + Send + 'static,
    {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            paths: Arc::new(Mutex::new(Vec::new())),
            delay: Arc::new(Mutex::new(Duration::ZERO)),
            respond: Arc::new(Mutex::new(Box::new(respond))),
        }
    }

    /// Always answers with `ids` as a product list.
    pub fn serving(ids: &[u64]) -> Self {
        let body = products(ids);
        Self::new(move |_| Ok(body.clone()))
    }

    /// Always fails with HTTP `status`.
    pub fn failing(status: u16) -> Self {
        Self::new(move |_| Err(UpstreamError::Http { status }))
    }

    pub fn respond_with<F>(&self, respond: F)
    where
        F: FnMut(&UpstreamRequest) -> Result<Value, UpstreamError> + Send + 'static,
    {
        *self.respond.lock().unwrap() = Box::new(respond);
    }

    pub fn serve(&self, ids: &[u64]) {
        let body = products(ids);
        self.respond_with(move |_| Ok(body.clone()));
    }

    pub fn fail(&self, status: u16) {
        self.respond_with(move |_| Err(UpstreamError::Http { status }));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Paths requested so far, in order.
    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }

    pub fn service(&self) -> impl Upstream {
        let fake = self.clone();
        tower::service_fn(move |request: UpstreamRequest| {
            let fake = fake.clone();
            async move {
                fake.calls.fetch_add(1, Ordering::SeqCst);
                fake.paths.lock().unwrap().push(request.path.clone());
                let delay = *fake.delay.lock().unwrap();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let result = (fake.respond.lock().unwrap())(&request);
                result
            }
        })
    }
}

pub fn products(ids: &[u64]) -> Value {
    Value::Array(
        ids.iter()
            .map(|id| json!({ "id": id, "name": format!("product {id}"), "status": "publish" }))
            .collect(),
    )
}

pub fn ids(records: &[catalog_readthrough::NormalizedRecord]) -> Vec<u64> {
    records.iter().map(|r| r.id).collect()
}

/// fresh 60s, max-serve 600s, threshold 3, cooldown 30s, one attempt per
/// candidate.
pub fn builder() -> ReadThroughConfigBuilder {
    ReadThroughConfig::builder()
        .name("test")
        .fresh_window(Duration::from_secs(60))
        .max_serve_window(Duration::from_secs(600))
        .failure_threshold(3)
        .cooldown(Duration::from_secs(30))
        .retry_plan(RetryPlan {
            max_attempts: 1,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            per_attempt_timeout: Duration::from_secs(5),
            max_delay: None,
        })
        .sync_deadline(Duration::from_secs(10))
        .refresh_deadline(Duration::from_secs(30))
}

pub fn single_resource() -> Vec<ResourceConfig> {
    vec![ResourceConfig::new(
        "products",
        vec![EndpointCandidate::new("all", "products")],
    )]
}

pub fn cache_over(fake: &FakeUpstream) -> ReadThrough<impl Upstream> {
    cache_with(fake, builder().build().unwrap(), single_resource())
}

pub fn cache_with(
    fake: &FakeUpstream,
    config: ReadThroughConfig,
    resources: Vec<ResourceConfig>,
) -> ReadThrough<impl Upstream> {
    ReadThrough::new(fake.service(), config, resources).unwrap()
}
