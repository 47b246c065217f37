//! Service module - the dynamic method registry.
//!
//! Provides:
//! - [`Interface`] - declared capability interface (method names and types)
//! - [`Bindings`] - typed async closures over a service instance
//! - [`ServiceDescriptor`] - validated, read-only method table
//! - [`CallContext`] - call-scoped metadata injected into methods that ask
//!
//! # Example
//!
//! ```ignore
//! use meshwire::service::{Bindings, Interface, ServiceDescriptor};
//!
//! let interface = Interface::new("Echo")
//!     .method::<(String,), Result<String, String>>("Echo");
//!
//! let bindings = Bindings::new(EchoService)
//!     .bind("Echo", |_svc, (text,): (String,)| async move { Ok::<_, String>(text) });
//!
//! let descriptor = ServiceDescriptor::build("/service/echo", "*", bindings, &interface);
//! ```

mod context;
mod descriptor;
mod interface;
mod types;

pub use context::CallContext;
pub use descriptor::{BuildError, MethodMeta, ServiceDescriptor, DEFAULT_GROUP};
pub use interface::{BoxFuture, Bindings, Callable, Interface, MethodSignature};
pub use types::{ArgError, CallOutcome, Fallible, MethodArgs, MethodReturn, TypeDescriptor};
