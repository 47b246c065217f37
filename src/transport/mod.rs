//! Transport module - TCP sockets carrying the framed protocol.

mod tcp;

pub use tcp::{WireListener, WireStream};
