//! Stratum JSON-RPC message types.
//!
//! All messages are line-delimited JSON objects with `id`, `method`,
//! `params`; replies are `{id, result, error}` where `error` is null or a
//! `[code, message, null]` triple.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct StratumRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl StratumRequest {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Params as an array slice; requests with object or missing params
    /// yield an empty slice.
    pub fn params_array(&self) -> &[Value] {
        self.params.as_array().map(|v| v.as_slice()).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StratumResponse {
    pub id: Value,
    pub result: Value,
    pub error: Value,
}

impl StratumResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result,
            error: Value::Null,
        }
    }

    pub fn err(id: Value, error: &StratumError) -> Self {
        Self {
            id,
            result: Value::Null,
            error: error.to_triple(),
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Server-to-client notification (no id).
pub fn notification(method: &str, params: Value) -> String {
    json!({
        "id": Value::Null,
        "method": method,
        "params": params,
    })
    .to_string()
}

pub fn set_difficulty(diff: f64) -> String {
    notification("mining.set_difficulty", json!([diff]))
}

/// The reply-error taxonomy visible on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StratumError {
    Stale,
    Duplicate,
    InvalidNtime,
    AboveTarget,
    LowDifficulty,
    InvalidVersionMask,
    InvalidNonce2,
    WorkerMismatch,
    Unauthorized,
    UnauthorizedUserAgent,
    InvalidParams,
    UnknownMethod,
}

impl StratumError {
    pub fn code(&self) -> i32 {
        match self {
            StratumError::InvalidNtime => 20,
            StratumError::Stale => 21,
            StratumError::Duplicate => 22,
            StratumError::LowDifficulty => 23,
            StratumError::Unauthorized => 24,
            StratumError::UnauthorizedUserAgent => 25,
            StratumError::AboveTarget => 26,
            StratumError::InvalidVersionMask => 27,
            StratumError::InvalidNonce2 => 28,
            StratumError::WorkerMismatch => 29,
            StratumError::InvalidParams => -32602,
            StratumError::UnknownMethod => -32601,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            StratumError::Stale => "Stale",
            StratumError::Duplicate => "Duplicate",
            StratumError::InvalidNtime => "Invalid ntime",
            StratumError::AboveTarget => "Above target",
            StratumError::LowDifficulty => "Low difficulty",
            StratumError::InvalidVersionMask => "Invalid version mask",
            StratumError::InvalidNonce2 => "Invalid nonce2",
            StratumError::WorkerMismatch => "Worker mismatch",
            StratumError::Unauthorized => "Unauthorized",
            StratumError::UnauthorizedUserAgent => "Unauthorized useragent",
            StratumError::InvalidParams => "Invalid params",
            StratumError::UnknownMethod => "Unknown method",
        }
    }

    pub fn to_triple(&self) -> Value {
        json!([self.code(), self.message(), Value::Null])
    }
}

/// Useragent whitelist check: prefix compare against each pattern. An
/// empty useragent never matches a nonempty pattern; no patterns means
/// everyone is allowed.
pub fn ua_allowed(ua: &str, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns
        .iter()
        .any(|p| p.is_empty() || (!ua.is_empty() && ua.as_bytes().starts_with(p.as_bytes())))
}

/// Strict hex check used on submit fields.
pub fn validhex(s: &str) -> bool {
    !s.is_empty() && s.len() % 2 == 0 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_minimal() {
        let req = StratumRequest::parse(r#"{"id":1,"method":"mining.subscribe","params":[]}"#)
            .unwrap();
        assert_eq!(req.method, "mining.subscribe");
        assert!(req.params_array().is_empty());
    }

    #[test]
    fn error_reply_is_a_triple() {
        let resp = StratumResponse::err(json!(7), &StratumError::Stale);
        let v: Value = serde_json::from_str(&resp.to_line()).unwrap();
        assert_eq!(v["error"][0], json!(21));
        assert_eq!(v["error"][1], json!("Stale"));
        assert!(v["error"][2].is_null());
        assert!(v["result"].is_null());
    }

    #[test]
    fn set_difficulty_shape() {
        let line = set_difficulty(0.5);
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["method"], json!("mining.set_difficulty"));
        assert_eq!(v["params"][0], json!(0.5));
    }

    #[test]
    fn whitelist_rules() {
        let none: Vec<String> = vec![];
        assert!(ua_allowed("cgminer/4.9", &none));
        let patterns = vec!["cgminer".to_string(), "bfgminer".to_string()];
        assert!(ua_allowed("cgminer/4.9", &patterns));
        assert!(!ua_allowed("cpuminer/2.5", &patterns));
        assert!(!ua_allowed("", &patterns));
        let with_empty = vec![String::new()];
        assert!(ua_allowed("", &with_empty));
    }

    #[test]
    fn validhex_rules() {
        assert!(validhex("deadbeef"));
        assert!(validhex("00"));
        assert!(!validhex(""));
        assert!(!validhex("abc"));
        assert!(!validhex("zz"));
    }
}
