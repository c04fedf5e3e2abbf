use crate::protocol::error_codes::{INVALID_PARAMS, INVALID_REQUEST, PARSE_ERROR};
use crate::protocol::{Params, Parsed, Protocol, ProtocolError, Request};
use log::{error, trace};
use serde::Serialize;
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Serialize)]
struct SuccessEnvelope<'a> {
    jsonrpc: &'static str,
    id: &'a Value,
    result: &'a Value,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope<'a> {
    jsonrpc: &'static str,
    id: &'a Value,
    error: ErrorObject<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorObject<'a> {
    code: i32,
    message: &'a str,
}

/// Strict JSON-RPC 2.0 over newline-delimited JSON. No local commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRpcProtocol;

impl JsonRpcProtocol {
    pub fn new() -> Self {
        Self
    }
}

fn serialize_line<T: Serialize>(envelope: &T) -> String {
    match serde_json::to_string(envelope) {
        Ok(line) => line,
        Err(e) => {
            error!("Failed to serialize JSON-RPC envelope: {}", e);
            format!(
                r#"{{"jsonrpc":"{}","id":null,"error":{{"code":-32603,"message":"Internal error"}}}}"#,
                JSONRPC_VERSION
            )
        }
    }
}

impl Protocol for JsonRpcProtocol {
    fn name(&self) -> &'static str {
        "jsonrpc"
    }

    fn parse(&self, raw: &str) -> Parsed {
        let raw = raw.trim();
        if raw.is_empty() {
            return Parsed::Skip;
        }
        trace!("[RPC RX] {}", raw);

        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(_) => return Parsed::Error(ProtocolError::new(PARSE_ERROR, "Parse error")),
        };

        let Value::Object(mut envelope) = value else {
            return Parsed::Error(ProtocolError::new(
                INVALID_REQUEST,
                "Invalid Request: expected a JSON object",
            ));
        };

        let id = envelope.remove("id").filter(|id| !id.is_null());

        match envelope.get("jsonrpc") {
            Some(Value::String(version)) if version == JSONRPC_VERSION => {}
            _ => {
                return Parsed::Error(
                    ProtocolError::new(
                        INVALID_REQUEST,
                        format!("Invalid Request: jsonrpc must be \"{}\"", JSONRPC_VERSION),
                    )
                    .with_id(id),
                );
            }
        }

        let method = match envelope.remove("method") {
            Some(Value::String(method)) if !method.is_empty() => method,
            _ => {
                return Parsed::Error(
                    ProtocolError::new(INVALID_REQUEST, "Invalid Request: missing method")
                        .with_id(id),
                );
            }
        };

        let params = match envelope.remove("params") {
            None => Params::new(),
            Some(Value::Object(params)) => params,
            Some(_) => {
                return Parsed::Error(
                    ProtocolError::new(INVALID_PARAMS, "Invalid params: expected an object")
                        .with_id(id),
                );
            }
        };

        Parsed::Request(Request { id, method, params })
    }

    fn format_result(&self, request: &Request, value: Option<&Value>) -> String {
        let line = serialize_line(&SuccessEnvelope {
            jsonrpc: JSONRPC_VERSION,
            id: request.id.as_ref().unwrap_or(&Value::Null),
            result: value.unwrap_or(&Value::Null),
        });
        trace!("[RPC TX] {}", line);
        line
    }

    fn format_error(&self, id: Option<&Value>, code: i32, message: &str) -> String {
        let line = serialize_line(&ErrorEnvelope {
            jsonrpc: JSONRPC_VERSION,
            id: id.unwrap_or(&Value::Null),
            error: ErrorObject { code, message },
        });
        trace!("[RPC TX] {}", line);
        line
    }
}
