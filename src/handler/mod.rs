//! Handler module - endpoint registration and call serving.
//!
//! Provides:
//! - [`EndpointRegistry`] - maps endpoint names (`arg1`) to handlers
//! - [`ResponseContext`] - lets handlers respond exactly once

mod context;
mod registry;

pub use context::{HandlerOutcome, ResponseContext};
pub use registry::{BoxFuture, EndpointHandler, EndpointRegistry, InboundCall};
