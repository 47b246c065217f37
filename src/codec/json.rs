//! JSON codec using `serde_json`.
//!
//! Request and response bodies are UTF-8 JSON. Field names on the wire are
//! short and fixed (`action`, `m`, `args`, `ec`, `em`, `result`), so wire
//! structs pin them with `#[serde(rename)]` rather than relying on Rust names.
//!
//! # Example
//!
//! ```
//! use meshwire::codec::JsonCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let msg = Message { id: 42, content: "hello".to_string() };
//! let encoded = JsonCodec::encode(&msg).unwrap();
//! let decoded: Message = JsonCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use bytes::Bytes;

use crate::error::Result;

/// JSON codec for structured bodies.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized (e.g. a map with
    /// non-string keys).
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    /// Decode JSON bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not valid JSON for type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WireError;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Profile {
        id: u32,
        name: String,
        tags: Vec<String>,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = Profile {
            id: 7,
            name: "ada".to_string(),
            tags: vec!["a".into(), "b".into()],
        };
        let encoded = JsonCodec::encode(&original).unwrap();
        assert_eq!(
            &encoded[..],
            br#"{"id":7,"name":"ada","tags":["a","b"]}"#
        );
        let decoded: Profile = JsonCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_wrong_type() {
        let result: Result<Profile> = JsonCodec::decode(br#"{"id":"seven"}"#);
        assert!(matches!(result, Err(WireError::Json(_))));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let result: Result<String> = JsonCodec::decode(&[b'"', 0xFF, b'"']);
        assert!(result.is_err());
    }

    #[test]
    fn test_encode_map() {
        let mut map = HashMap::new();
        map.insert("locale".to_string(), "en".to_string());
        let encoded = JsonCodec::encode(&map).unwrap();
        assert_eq!(&encoded[..], br#"{"locale":"en"}"#);
    }
}
