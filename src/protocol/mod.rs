/// Wire protocol adapters for the session dispatcher
///
/// Every transport that feeds the dispatcher implements [`Protocol`]: it turns
/// one raw line into a [`Request`] (or rejects it as a [`ProtocolError`]) and
/// renders handler outcomes back into the transport's own text format.
///
/// - `repl`: interactive dot-commands and bare expressions
/// - `jsonrpc`: strict JSON-RPC 2.0, one envelope per line
pub mod jsonrpc;
pub mod repl;

use serde_json::{Map, Value};
use std::cell::Cell;
use thiserror::Error;

pub use jsonrpc::JsonRpcProtocol;
pub use repl::ReplProtocol;

/// Named parameters of a request. Always a mapping once parsed.
pub type Params = Map<String, Value>;

// JSON-RPC error codes, shared by every adapter so handler errors carry a
// stable numeric code regardless of transport.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    // Implementation-defined server errors
    pub const EVALUATION_ERROR: i32 = -32000;
}

/// A parsed, dispatchable request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation token; absent for protocols that do not correlate.
    pub id: Option<Value>,
    pub method: String,
    pub params: Params,
}

impl Request {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            id: None,
            method: method.into(),
            params: Params::new(),
        }
    }

    pub fn with_id(mut self, id: Value) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// Raw input that could not be turned into a [`Request`] at all.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ProtocolError {
    pub code: i32,
    pub message: String,
    pub id: Option<Value>,
}

impl ProtocolError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: Option<Value>) -> Self {
        self.id = id;
        self
    }
}

/// Outcome of [`Protocol::parse`].
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// Nothing to do for this line (blank input, local commands).
    Skip,
    Request(Request),
    Error(ProtocolError),
}

/// State a protocol may consult or touch while running a local command.
pub struct LocalContext<'a> {
    methods: &'a [String],
    stop_requested: Cell<bool>,
}

impl<'a> LocalContext<'a> {
    pub fn new(methods: &'a [String]) -> Self {
        Self {
            methods,
            stop_requested: Cell::new(false),
        }
    }

    /// Names of the methods registered on the owning session, sorted.
    pub fn methods(&self) -> &[String] {
        self.methods
    }

    /// Ask the owning session to stop reading input once this command returns.
    pub fn request_stop(&self) {
        self.stop_requested.set(true);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.get()
    }
}

/// One wire format spoken by the session dispatcher.
///
/// Implementations are shared between the read loop and every in-flight
/// handler task, so all methods take `&self`.
pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse(&self, raw: &str) -> Parsed;

    /// Render a handler's resolved value. `None` is an undefined result.
    fn format_result(&self, request: &Request, value: Option<&Value>) -> String;

    fn format_error(&self, id: Option<&Value>, code: i32, message: &str) -> String;

    /// Transport-local commands that never reach the method registry.
    fn handle_local(&self, _raw: &str, _ctx: &LocalContext<'_>) -> Option<String> {
        None
    }
}
