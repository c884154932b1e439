//! Endpoint registry for dispatching call requests by name.
//!
//! Endpoints are registered flat at the channel level under the byte
//! string that arrives as `arg1`. Registering a name twice is an
//! error; there is no implicit redefinition.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use super::ResponseContext;
use crate::error::{FramewireError, Result};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An inbound call as seen by an endpoint handler.
#[derive(Debug, Clone)]
pub struct InboundCall {
    /// Application headers (`arg2`).
    pub arg2: Bytes,
    /// Application body (`arg3`).
    pub arg3: Bytes,
    /// The remote node's identity (`host:port` from its init body).
    pub caller: String,
}

/// Trait for endpoint handlers.
///
/// Handlers complete by invoking [`ResponseContext::respond`]; the
/// future's own output is discarded.
pub trait EndpointHandler: Send + Sync {
    /// Handle a call; respond through `ctx`.
    fn call(&self, call: InboundCall, ctx: ResponseContext) -> BoxFuture<'static, ()>;
}

/// Wrapper turning an async closure into an [`EndpointHandler`].
struct FnHandler<F>(F);

impl<F, Fut> EndpointHandler for FnHandler<F>
where
    F: Fn(InboundCall, ResponseContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, call: InboundCall, ctx: ResponseContext) -> BoxFuture<'static, ()> {
        Box::pin((self.0)(call, ctx))
    }
}

/// Registry mapping endpoint names to handlers.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: HashMap<Vec<u8>, Arc<dyn EndpointHandler>>,
}

impl EndpointRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async closure under an endpoint name.
    ///
    /// Fails with `EndpointAlreadyDefined` when the name is taken.
    pub fn register<F, Fut>(&mut self, name: impl AsRef<[u8]>, handler: F) -> Result<()>
    where
        F: Fn(InboundCall, ResponseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register_handler(name, Arc::new(FnHandler(handler)))
    }

    /// Register a prebuilt handler under an endpoint name.
    pub fn register_handler(
        &mut self,
        name: impl AsRef<[u8]>,
        handler: Arc<dyn EndpointHandler>,
    ) -> Result<()> {
        let name = name.as_ref();
        if self.endpoints.contains_key(name) {
            return Err(FramewireError::EndpointAlreadyDefined(
                String::from_utf8_lossy(name).into_owned(),
            ));
        }
        self.endpoints.insert(name.to_vec(), handler);
        Ok(())
    }

    /// Look up the handler for an `arg1` value.
    pub fn get(&self, name: &[u8]) -> Option<Arc<dyn EndpointHandler>> {
        self.endpoints.get(name).cloned()
    }

    /// Number of registered endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Check if no endpoints are registered.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
