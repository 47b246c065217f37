//! Command-specific bodies and their JSON wire shapes.
//!
//! ```text
//! REQ   {"action": "<service uri>", "params": {"m": "<method>", "args": [...], "props": {...}}}
//! RESP  {"ec": 200, "em": "", "result": <any>}
//! PING  {"timestamp": <epoch ms>}
//! PONG  {"timestamp": <echoed>}
//! INFO  free-form status map
//! ```
//!
//! Request arguments stay as [`OpaqueValue`]s here: they are only coerced into
//! concrete parameter types by the invocation engine, which knows the target
//! method's signature.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use super::{CmdType, Packet};
use crate::codec::JsonCodec;
use crate::error::Result;

/// Transport-level result code carried in `ec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 200,
    /// Argument count does not match the method signature.
    Serialization = 400,
    ServiceNotFound = 404,
    MethodNotFound = 405,
    /// Request body could not be decoded at all.
    Throwable = 500,
    /// Method panicked, failed, or produced no result.
    InvocationTarget = 501,
    /// An argument or the result could not be (de)serialized.
    SerializationServer = 502,
    TimeoutServer = 504,
}

impl ErrorCode {
    /// Numeric wire value.
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map a wire value back to a known code.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            200 => ErrorCode::Success,
            400 => ErrorCode::Serialization,
            404 => ErrorCode::ServiceNotFound,
            405 => ErrorCode::MethodNotFound,
            500 => ErrorCode::Throwable,
            501 => ErrorCode::InvocationTarget,
            502 => ErrorCode::SerializationServer,
            504 => ErrorCode::TimeoutServer,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// An already-serialized JSON value whose target type is not known yet.
///
/// Equality compares the raw JSON text.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpaqueValue(Box<RawValue>);

impl OpaqueValue {
    /// Serialize a value into an opaque slot.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self(serde_json::value::to_raw_value(value)?))
    }

    /// Wrap raw JSON text, validating that it is well formed.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self(RawValue::from_string(json.to_string())?))
    }

    /// JSON `null`.
    pub fn null() -> Self {
        Self(RawValue::NULL.to_owned())
    }

    /// Deserialize into a concrete type.
    pub fn decode_into<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_str(self.0.get())
    }

    /// Raw JSON text.
    #[inline]
    pub fn as_json(&self) -> &str {
        self.0.get()
    }

    /// Whether this is the JSON literal `null`.
    pub fn is_null(&self) -> bool {
        self.0.get().trim() == "null"
    }
}

impl PartialEq for OpaqueValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.get() == other.0.get()
    }
}

impl fmt::Debug for OpaqueValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.get())
    }
}

#[derive(Serialize, Deserialize)]
struct WireRequest {
    action: String,
    params: WireParams,
}

#[derive(Serialize, Deserialize)]
struct WireParams {
    m: String,
    #[serde(default)]
    args: Vec<OpaqueValue>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    props: HashMap<String, String>,
}

/// A decoded call request.
///
/// `create_time`, `timeout` and `source_address` never travel on the wire:
/// the receiving side stamps them when the request is decoded and handed to
/// the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub service_uri: String,
    pub method_name: String,
    pub args: Vec<OpaqueValue>,
    pub properties: HashMap<String, String>,
    /// Epoch milliseconds at which the request entered this process.
    pub create_time: i64,
    pub timeout: Duration,
    pub source_address: String,
}

impl Request {
    pub fn new(service_uri: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            service_uri: service_uri.into(),
            method_name: method_name.into(),
            args: Vec::new(),
            properties: HashMap::new(),
            create_time: now_millis(),
            timeout: Duration::ZERO,
            source_address: String::new(),
        }
    }

    /// Append one positional argument.
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        self.args.push(OpaqueValue::encode(value)?);
        Ok(self)
    }

    /// Attach a propagated call property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Decode a REQ body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let wire: WireRequest = JsonCodec::decode(body)?;
        Ok(Self {
            service_uri: wire.action,
            method_name: wire.params.m,
            args: wire.params.args,
            properties: wire.params.props,
            create_time: now_millis(),
            timeout: Duration::ZERO,
            source_address: String::new(),
        })
    }

    /// Encode as a REQ body.
    pub fn encode(&self) -> Result<Bytes> {
        let wire = WireRequest {
            action: self.service_uri.clone(),
            params: WireParams {
                m: self.method_name.clone(),
                args: self.args.clone(),
                props: self.properties.clone(),
            },
        };
        JsonCodec::encode(&wire)
    }

    /// Milliseconds left of the budget at `now`, negative once stale.
    pub fn remaining_millis(&self, now: i64) -> i64 {
        let budget = i64::try_from(self.timeout.as_millis()).unwrap_or(i64::MAX);
        budget.saturating_sub(now.saturating_sub(self.create_time))
    }
}

/// A call result as carried in a RESP body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "ec")]
    pub error_code: i32,
    #[serde(rename = "em", default)]
    pub message: String,
    #[serde(default)]
    pub result: Option<OpaqueValue>,
}

impl Response {
    /// Successful call carrying a result. A `null` result is stored as
    /// `None`, which is how it decodes from the wire.
    pub fn success(result: OpaqueValue) -> Self {
        Self {
            error_code: ErrorCode::Success.code(),
            message: String::new(),
            result: if result.is_null() { None } else { Some(result) },
        }
    }

    /// Terminal failure with a code and a message, no result.
    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: code.code(),
            message: message.into(),
            result: None,
        }
    }

    /// Known code for `ec`, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.error_code)
    }

    /// `ec` is SUCCESS or 0.
    pub fn is_success(&self) -> bool {
        self.error_code == 0 || self.error_code == ErrorCode::Success.code()
    }

    /// Deserialize the result slot. A missing result decodes like `null`.
    pub fn decode_result<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.result {
            Some(value) => Ok(value.decode_into()?),
            None => Ok(serde_json::from_str("null")?),
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        JsonCodec::decode(body)
    }

    pub fn encode(&self) -> Result<Bytes> {
        JsonCodec::encode(self)
    }
}

/// PING/PONG body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: i64,
}

impl Heartbeat {
    pub fn now() -> Self {
        Self {
            timestamp: now_millis(),
        }
    }
}

/// Any body, decoded according to the packet's command.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Request(Request),
    Response(Response),
    Ping(Heartbeat),
    Pong(Heartbeat),
    /// Status map. An INFO query may have an empty body, decoded as `null`.
    Info(serde_json::Value),
}

impl Payload {
    /// Decode the body of a packet according to its command.
    pub fn decode(packet: &Packet) -> Result<Self> {
        let body = packet.payload();
        Ok(match packet.command {
            CmdType::Request => Payload::Request(Request::decode(body)?),
            CmdType::Response => Payload::Response(Response::decode(body)?),
            CmdType::Ping => Payload::Ping(JsonCodec::decode(body)?),
            CmdType::Pong => Payload::Pong(JsonCodec::decode(body)?),
            CmdType::Info if body.is_empty() => Payload::Info(serde_json::Value::Null),
            CmdType::Info => Payload::Info(JsonCodec::decode(body)?),
        })
    }

    /// Command this body travels under.
    pub fn command(&self) -> CmdType {
        match self {
            Payload::Request(_) => CmdType::Request,
            Payload::Response(_) => CmdType::Response,
            Payload::Ping(_) => CmdType::Ping,
            Payload::Pong(_) => CmdType::Pong,
            Payload::Info(_) => CmdType::Info,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        match self {
            Payload::Request(r) => r.encode(),
            Payload::Response(r) => r.encode(),
            Payload::Ping(h) | Payload::Pong(h) => JsonCodec::encode(h),
            Payload::Info(serde_json::Value::Null) => Ok(Bytes::new()),
            Payload::Info(v) => JsonCodec::encode(v),
        }
    }

    /// Encode into a packet with the given correlation id.
    pub fn into_packet(self, opaque: u32) -> Result<Packet> {
        let body = self.encode()?;
        Ok(Packet::new(opaque, self.command(), body))
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WireError;

    #[test]
    fn test_request_wire_field_names() {
        let req = Request::new("/service/user", "getUser")
            .arg("alice")
            .unwrap()
            .arg(&42)
            .unwrap();
        let body = req.encode().unwrap();
        assert_eq!(
            std::str::from_utf8(&body).unwrap(),
            r#"{"action":"/service/user","params":{"m":"getUser","args":["alice",42]}}"#
        );
    }

    #[test]
    fn test_request_props_roundtrip() {
        let req = Request::new("/s", "m").property("locale", "de");
        let decoded = Request::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded.properties.get("locale").map(String::as_str), Some("de"));
        assert_eq!(decoded.service_uri, "/s");
        assert_eq!(decoded.method_name, "m");
        assert!(decoded.args.is_empty());
    }

    #[test]
    fn test_request_args_stay_opaque() {
        let body = br#"{"action":"/s","params":{"m":"m","args":[{"a":[1,2]}, "x", null]}}"#;
        let req = Request::decode(body).unwrap();

        assert_eq!(req.args.len(), 3);
        assert_eq!(req.args[0].as_json(), r#"{"a":[1,2]}"#);
        assert_eq!(req.args[1].decode_into::<String>().unwrap(), "x");
        assert!(req.args[2].is_null());
    }

    #[test]
    fn test_request_decode_stamps_create_time() {
        let before = now_millis();
        let req = Request::decode(br#"{"action":"/s","params":{"m":"m"}}"#).unwrap();
        assert!(req.create_time >= before);
        assert_eq!(req.timeout, Duration::ZERO);
        assert!(req.source_address.is_empty());
    }

    #[test]
    fn test_remaining_budget() {
        let mut req = Request::new("/s", "m");
        req.create_time = 1_000;
        req.timeout = Duration::from_millis(500);

        assert_eq!(req.remaining_millis(1_200), 300);
        assert_eq!(req.remaining_millis(1_500), 0);
        assert!(req.remaining_millis(2_000) < 0);
    }

    #[test]
    fn test_response_wire_field_names() {
        let ok = Response::success(OpaqueValue::encode(&vec![1, 2]).unwrap());
        assert_eq!(
            std::str::from_utf8(&ok.encode().unwrap()).unwrap(),
            r#"{"ec":200,"em":"","result":[1,2]}"#
        );

        let err = Response::failure(ErrorCode::TimeoutServer, "late");
        assert_eq!(
            std::str::from_utf8(&err.encode().unwrap()).unwrap(),
            r#"{"ec":504,"em":"late","result":null}"#
        );
    }

    #[test]
    fn test_null_success_survives_the_wire() {
        let sent = Response::success(OpaqueValue::null());
        let body = sent.encode().unwrap();
        assert_eq!(
            std::str::from_utf8(&body).unwrap(),
            r#"{"ec":200,"em":"","result":null}"#
        );
        assert_eq!(Response::decode(&body).unwrap(), sent);
    }

    #[test]
    fn test_response_success_codes() {
        let zero = Response::decode(br#"{"ec":0,"em":"","result":1}"#).unwrap();
        assert!(zero.is_success());
        assert_eq!(zero.decode_result::<i32>().unwrap(), 1);

        let missing = Response::decode(br#"{"ec":404}"#).unwrap();
        assert!(!missing.is_success());
        assert_eq!(missing.code(), Some(ErrorCode::ServiceNotFound));
        assert_eq!(missing.decode_result::<Option<i32>>().unwrap(), None);
    }

    #[test]
    fn test_payload_decode_by_command() {
        let ping = Packet::new(3, CmdType::Ping, Bytes::from_static(br#"{"timestamp":77}"#));
        assert_eq!(
            Payload::decode(&ping).unwrap(),
            Payload::Ping(Heartbeat { timestamp: 77 })
        );

        let info = Packet::new(4, CmdType::Info, Bytes::new());
        assert_eq!(Payload::decode(&info).unwrap(), Payload::Info(serde_json::Value::Null));
    }

    #[test]
    fn test_payload_into_packet() {
        let packet = Payload::Pong(Heartbeat { timestamp: 5 }).into_packet(11).unwrap();
        assert_eq!(packet.opaque, 11);
        assert_eq!(packet.command, CmdType::Pong);
        assert_eq!(packet.payload(), br#"{"timestamp":5}"#);
    }

    #[test]
    fn test_malformed_request_body() {
        let packet = Packet::new(1, CmdType::Request, Bytes::from_static(b"{not json"));
        assert!(matches!(Payload::decode(&packet), Err(WireError::Json(_))));
    }

    #[test]
    fn test_error_code_values() {
        for (code, value) in [
            (ErrorCode::Success, 200),
            (ErrorCode::Serialization, 400),
            (ErrorCode::ServiceNotFound, 404),
            (ErrorCode::MethodNotFound, 405),
            (ErrorCode::Throwable, 500),
            (ErrorCode::InvocationTarget, 501),
            (ErrorCode::SerializationServer, 502),
            (ErrorCode::TimeoutServer, 504),
        ] {
            assert_eq!(code.code(), value);
            assert_eq!(ErrorCode::from_code(value), Some(code));
        }
        assert_eq!(ErrorCode::from_code(201), None);
    }
}
