//! Resilient read-through cache for a slow, rate-limited catalog API.
//!
//! Request handlers call [`ReadThrough::fetch_normalized`] and always get
//! something plausible back as long as any earlier fetch for the same query
//! succeeded. Behind that call sit, leaf-first:
//!
//! - [`HttpUpstream`]: one HTTP GET per call, bounded by a timeout
//! - [`RetryExecutor`]: exponential backoff over one endpoint
//! - [`FallbackChain`]: ordered, semantically equivalent endpoint variants
//! - [`CircuitBreaker`]: stops calling a failing upstream for a cooldown
//! - [`CacheStore`]: immutable entries keyed by [`QueryShape`]
//! - [`ResponseShaper`]: pure filter / project / sort / truncate
//!
//! # Request flow
//!
//! | breaker | cache | action |
//! |---|---|---|
//! | open | present | serve cache, `breaker_engaged = true` |
//! | open | absent | [`ReadError::UpstreamUnavailable`] |
//! | closed | fresh | serve cache, no network |
//! | closed | stale but serveable | serve cache, refresh in background |
//! | closed | expired / absent | fetch now, fall back to any cache on failure |
//!
//! Concurrent fetches for the same query collapse into one upstream
//! operation, whether they come from requests or background refreshes.
//!
//! # Example
//!
//! ```rust,no_run
//! use catalog_readthrough::{
//!     EndpointCandidate, QueryShape, ReadThrough, ReadThroughConfig, ResourceConfig,
//!     ResponseShaper, UpstreamConfig,
//! };
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let upstream = UpstreamConfig::new("https://shop.example.com/wp-json/wc/v3");
//!
//! let config = ReadThroughConfig::builder()
//!     .name("bookable-products")
//!     .fresh_window(Duration::from_secs(60))
//!     .max_serve_window(Duration::from_secs(600))
//!     .failure_threshold(3)
//!     .cooldown(Duration::from_secs(30))
//!     .build()?;
//!
//! let resources = vec![ResourceConfig::new(
//!     "bookable",
//!     vec![
//!         EndpointCandidate::new("booking-type", "products").param("type", "booking"),
//!         EndpointCandidate::new("bookable-type", "products").param("type", "bookable"),
//!         EndpointCandidate::new("all-published", "products").param("status", "publish"),
//!     ],
//! )
//! .shaper(ResponseShaper::default().with_kinds(["booking", "bookable"]))];
//!
//! let cache = ReadThrough::connect(upstream, config, resources)?;
//! let response = cache.fetch_normalized(&QueryShape::new("bookable"), 12).await?;
//! println!("{} records (cached: {})", response.records.len(), response.cached);
//! # Ok(())
//! # }
//! ```

mod circuit;
mod config;
mod events;
mod fallback;
mod inflight;
mod query;
mod readthrough;
mod retry;
mod shaper;
mod store;
mod upstream;

pub use catalog_readthrough_core::{EventListeners, ReadError, UpstreamError};
pub use circuit::{Admission, CircuitBreaker, CircuitState, Transition};
pub use config::{ConfigError, ReadThroughConfig, ReadThroughConfigBuilder, ResourceConfig};
pub use events::ReadThroughEvent;
pub use fallback::{
    CandidateFailure, ChainError, ChainSuccess, EarlyStop, EndpointCandidate, FallbackChain,
    Pagination, Validator, record_list,
};
pub use query::QueryShape;
pub use readthrough::{ReadResponse, ReadThrough};
pub use retry::{RetryExecutor, RetryPlan};
pub use shaper::{NormalizedRecord, ResponseShaper, SortKey};
pub use store::{CacheEntry, CacheStore, Freshness, FreshnessPolicy};
pub use upstream::{Credentials, HttpUpstream, Upstream, UpstreamConfig, UpstreamRequest};
