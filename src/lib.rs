//! # meshwire
//!
//! RPC server core over a compact binary framing protocol.
//!
//! Clients send framed requests naming a service uri, a method and JSON
//! arguments. The server routes each one through a registry of typed methods,
//! runs it on a bounded worker pool under a deadline, and writes back a
//! response carrying a result code.
//!
//! ## Layers
//!
//! - **protocol**: 10-byte header + body frames, snappy compression, JSON
//!   bodies for REQ/RESP/PING/PONG/INFO
//! - **service**: declared interfaces, typed bindings, the method table
//! - **engine**: resolution, argument coercion, deadline race, result codes
//! - **server**: TCP accept loop, per-connection reader and writer tasks,
//!   stat reporting and registry publication
//!
//! ## Example
//!
//! ```ignore
//! use meshwire::service::{Bindings, Interface, ServiceDescriptor};
//! use meshwire::Server;
//!
//! #[tokio::main]
//! async fn main() -> meshwire::Result<()> {
//!     let interface = Interface::new("Greeter")
//!         .method::<(String,), Result<String, String>>("Hello");
//!     let bindings = Bindings::new(()).bind("Hello", |_svc, (name,): (String,)| async move {
//!         Ok::<_, String>(format!("hello {}", name))
//!     });
//!
//!     let server = Server::builder()
//!         .bind_address("0.0.0.0:13000")
//!         .service(ServiceDescriptor::build("/service/greeter", "*", bindings, &interface))
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await
//! }
//! ```

pub mod accounting;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod transport;
pub mod writer;

mod client;
mod server;

pub use accounting::{CallAccounting, InfoReport, InvokePerClient, StatMonitor, StatReport};
pub use client::{Client, ClientBuilder};
pub use config::{Compression, Options, ServerConfig};
pub use error::{Result, WireError};
pub use protocol::{ErrorCode, OpaqueValue, Request, Response};
pub use server::{Server, ServerBuilder};
pub use service::{Bindings, CallContext, Fallible, Interface, ServiceDescriptor};
