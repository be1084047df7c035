//! Request-scoped context generation.
//!
//! The embedder decides what a request "is": who is calling, which session,
//! which tenant. [`ContextProvider::create_context`] derives that from the raw
//! transport request, and [`ContextProvider::derive`] turns the context into a
//! bag of request-scoped helpers. Both run once per call, in that order,
//! before any handler.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Transport-agnostic view of an incoming request.
#[derive(Debug, Clone, Default)]
pub struct RequestParts {
    /// Header names are lowercased.
    pub headers: BTreeMap<String, String>,
    pub remote_addr: Option<SocketAddr>,
}

impl RequestParts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Token from an `Authorization: Bearer <token>` header.
    pub fn bearer_token(&self) -> Option<&str> {
        self.header("authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
    }
}

/// Embedder-supplied context generation and derivation.
#[async_trait]
pub trait ContextProvider: Send + Sync + 'static {
    type Context: Send + Sync + 'static;
    type Derived: Send + Sync + 'static;

    /// Build the request context. Errors created with [`crate::fail`] keep
    /// their status code; anything else is reported as a server fault.
    async fn create_context(&self, request: &RequestParts) -> anyhow::Result<Self::Context>;

    /// Pure function of the context producing request-scoped helpers.
    fn derive(&self, context: &Self::Context) -> Self::Derived;
}

/// Provider for services without any request context.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContext;

#[async_trait]
impl ContextProvider for NoContext {
    type Context = ();
    type Derived = ();

    async fn create_context(&self, _request: &RequestParts) -> anyhow::Result<()> {
        Ok(())
    }

    fn derive(&self, _context: &()) {}
}
