//! Line-oriented JSON-RPC wire codec for the stratum protocol.
//!
//! Stratum frames are newline-delimited UTF-8 JSON objects (CRLF or LF).
//! Each line parses independently. Requests from the miner carry `method`
//! and `params`; lines carrying a `result` member are replies to
//! server-initiated requests (e.g. `mining.set_difficulty`) and are
//! silently dropped. Replies and notifications are serialized as
//! `<json>\n` with no further framing.
//!
//! This module also holds the hex helpers shared by the handlers: 4-byte
//! big-endian integers (`nTime`, `nBits`, `nVersion`, `nNonce`) and raw
//! 32-byte hashes. Hashes travel in internal byte order, not the reversed
//! display order.

use serde_json::{json, Value};

use crate::error::RpcError;

/// A parsed request (or notification) from the miner.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request id, echoed back in the reply. Null for notifications.
    pub id: Value,
    /// Method name, e.g. "mining.subscribe".
    pub method: String,
    /// Positional parameters. Missing `params` parses as empty.
    pub params: Vec<Value>,
}

/// Parse one line from the wire.
///
/// Returns `Ok(None)` for response frames (a `result` member is present),
/// which the server ignores.
pub fn parse_line(line: &str) -> Result<Option<Request>, RpcError> {
    let value: Value =
        serde_json::from_str(line).map_err(|_| RpcError::parse_error("Parse error"))?;
    let obj = value
        .as_object()
        .ok_or_else(|| RpcError::parse_error("Top-level object parse error"))?;

    if obj.contains_key("result") {
        return Ok(None);
    }

    let id = obj.get("id").cloned().unwrap_or(Value::Null);
    let method = obj
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_request("Missing method"))?
        .to_string();
    let params = match obj.get("params") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => return Err(RpcError::invalid_request("Params must be an array")),
    };

    Ok(Some(Request { id, method, params }))
}

/// Serialize a success reply: `{"result": ..., "error": null, "id": ...}`.
pub fn reply(result: Value, id: &Value) -> String {
    let mut out = json!({ "result": result, "error": Value::Null, "id": id }).to_string();
    out.push('\n');
    out
}

/// Serialize an error reply: `{"result": null, "error": {...}, "id": ...}`.
pub fn error_reply(err: &RpcError, id: &Value) -> String {
    let mut out = json!({
        "result": Value::Null,
        "error": { "code": err.code, "message": err.message },
        "id": id,
    })
    .to_string();
    out.push('\n');
    out
}

/// Serialize a server-initiated notification. Stratum notifications carry
/// an incrementing id even though no reply is expected.
pub fn notification(id: u64, method: &str, params: Value) -> String {
    let mut out = json!({ "id": id, "method": method, "params": params }).to_string();
    out.push('\n');
    out
}

/// Format a u32 as 4 bytes of big-endian hex ("0000abcd" style).
pub fn hex_int4(val: u32) -> String {
    hex::encode(val.to_be_bytes())
}

/// Parse a 4-byte big-endian hex parameter.
pub fn parse_hex_int4(value: &Value, name: &str) -> Result<u32, RpcError> {
    let bytes = parse_hex(value, name)?;
    let arr: [u8; 4] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| RpcError::invalid_parameter(format!("{} must be exactly 4 bytes / 8 hex", name)))?;
    Ok(u32::from_be_bytes(arr))
}

/// Parse a hex string parameter into raw bytes.
pub fn parse_hex(value: &Value, name: &str) -> Result<Vec<u8>, RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::invalid_parameter(format!("{} must be a hexadecimal string", name)))?;
    hex::decode(s).map_err(|_| RpcError::invalid_parameter(format!("{} must be a hexadecimal string", name)))
}

/// Parse a 32-byte hash parameter, in internal byte order.
pub fn parse_uint256(value: &Value, name: &str) -> Result<[u8; 32], RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::invalid_parameter(format!("{} must be a hexadecimal string", name)))?;
    parse_uint256_str(s, name)
}

/// [`parse_uint256`] over a bare string.
pub fn parse_uint256_str(s: &str, name: &str) -> Result<[u8; 32], RpcError> {
    let bytes = hex::decode(s)
        .map_err(|_| RpcError::invalid_parameter(format!("{} must be a hexadecimal string", name)))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| RpcError::invalid_parameter(format!("{} must be exactly 32 bytes / 64 hex", name)))
}

/// Hex-encode a 32-byte hash in internal byte order.
pub fn hex_uint256(bytes: &[u8; 32]) -> String {
    hex::encode(bytes)
}

/// Byte-swap each 32-bit word of a 32-byte hash and hex-encode the
/// result. Stratum delivers `hashPrevBlock` this way for historical
/// reasons.
pub fn hex_uint256_bswap32(bytes: &[u8; 32]) -> String {
    let mut swapped = *bytes;
    for chunk in swapped.chunks_exact_mut(4) {
        chunk.reverse();
    }
    hex::encode(swapped)
}
