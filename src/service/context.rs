//! Per-call context handed to methods that ask for it.
//!
//! A method opts in by being bound with
//! [`Bindings::bind_with_context`](super::Bindings::bind_with_context); the
//! context then occupies its first parameter slot and has no counterpart in
//! the wire `args` array.
//!
//! # Example
//!
//! ```ignore
//! bindings.bind_with_context("greet", |svc: Arc<Greeter>, ctx: CallContext, (name,): (String,)| async move {
//!     let locale = ctx.property("locale").unwrap_or("en");
//!     Ok::<_, String>(svc.greet(&name, locale))
//! });
//! ```

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Call-scoped metadata: propagated properties, caller and deadline.
#[derive(Debug, Clone)]
pub struct CallContext {
    properties: HashMap<String, String>,
    source_address: String,
    service_uri: String,
    method: String,
    deadline: Instant,
}

impl CallContext {
    pub fn new(
        service_uri: impl Into<String>,
        method: impl Into<String>,
        source_address: impl Into<String>,
        properties: HashMap<String, String>,
        deadline: Instant,
    ) -> Self {
        Self {
            properties,
            source_address: source_address.into(),
            service_uri: service_uri.into(),
            method: method.into(),
            deadline,
        }
    }

    /// A propagated property (tracing ids, locale, ...).
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// Address of the connection the request arrived on.
    pub fn source_address(&self) -> &str {
        &self.source_address
    }

    pub fn service_uri(&self) -> &str {
        &self.service_uri
    }

    /// Method name as sent by the caller.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the caller stops waiting.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the result would be discarded if produced now.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}
