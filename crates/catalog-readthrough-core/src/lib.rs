//! Shared building blocks for the catalog read-through cache.
//!
//! This crate holds the pieces that every layer of the read path agrees on:
//! - [`UpstreamError`]: what a single upstream attempt can fail with
//! - [`ReadError`]: the only error a request handler ever sees
//! - An event system ([`Event`], [`EventListeners`]) for observability hooks

pub mod error;
pub mod events;

pub use error::{ReadError, UpstreamError};
pub use events::{Event, EventListeners};
