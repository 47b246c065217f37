//! Codec module - body serialization and compression.
//!
//! - [`JsonCodec`] - JSON via `serde_json`, the only body encoding on the wire
//! - [`SnappyCodec`] - raw snappy blocks for bodies flagged as compressed
//!
//! # Design
//!
//! Codecs are marker structs with static methods rather than trait objects.
//! The body encoding is fixed, so there is nothing to select at runtime.

mod json;
mod snappy;

pub use json::JsonCodec;
pub use snappy::SnappyCodec;
