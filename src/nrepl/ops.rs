use super::bencode::Bencode;
use crate::backend::Backend;
use crate::compiler::compile_and_evaluate;
use crate::protocol::repl::render_value;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

pub const DEFAULT_NS: &str = "user";

const OPS: &[&str] = &[
    "clone",
    "close",
    "describe",
    "eval",
    "interrupt",
    "load-file",
    "ls-sessions",
];

/// Session ids handed out by `clone`. They only correlate messages; no
/// evaluation state hangs off them.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: Mutex<BTreeSet<String>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.sessions.lock().await.insert(id.clone());
        id
    }

    pub async fn close(&self, id: &str) -> bool {
        self.sessions.lock().await.remove(id)
    }

    pub async fn list(&self) -> Vec<String> {
        self.sessions.lock().await.iter().cloned().collect()
    }
}

/// Everything an op handler may touch.
pub struct OpContext {
    pub backend: Arc<dyn Backend>,
    pub sessions: Arc<SessionTable>,
    pub language: String,
}

/// Writes replies for one request, stamped with its `id` and `session`.
pub struct Reply {
    id: Option<Bencode>,
    session: Option<Bencode>,
    sink: mpsc::UnboundedSender<Bencode>,
}

impl Reply {
    pub fn new(request: &Bencode, sink: mpsc::UnboundedSender<Bencode>) -> Self {
        Self {
            id: request.get("id").cloned(),
            session: request.get("session").cloned(),
            sink,
        }
    }

    pub fn send<'a>(&self, fields: impl IntoIterator<Item = (&'a str, Bencode)>) {
        let mut message = Bencode::dict(fields);
        if let Bencode::Dict(entries) = &mut message {
            if let Some(id) = &self.id {
                entries.insert(b"id".to_vec(), id.clone());
            }
            if let Some(session) = &self.session {
                entries
                    .entry(b"session".to_vec())
                    .or_insert_with(|| session.clone());
            }
        }
        if self.sink.send(message).is_err() {
            debug!("Dropping nREPL reply, connection already closed");
        }
    }

    pub fn done(&self) {
        self.send([("status", Bencode::str_list(["done"]))]);
    }

    pub fn status(&self, status: &[&str]) {
        self.send([("status", Bencode::str_list(status.iter().copied()))]);
    }
}

/// Run the op named in `request`, emitting every reply through `sink`.
pub async fn dispatch(ctx: &OpContext, request: Bencode, sink: mpsc::UnboundedSender<Bencode>) {
    let reply = Reply::new(&request, sink);
    let op = request.get_str("op").unwrap_or_default();
    debug!("nREPL op '{}'", op);

    match op {
        "clone" => clone_session(ctx, &reply).await,
        "close" => close_session(ctx, &request, &reply).await,
        "describe" => describe(&reply),
        "eval" => eval(ctx, request.get_str("code"), request.get_str("lang"), &reply).await,
        "load-file" => eval(ctx, request.get_str("file"), request.get_str("lang"), &reply).await,
        "ls-sessions" => {
            let sessions = ctx.sessions.list().await;
            reply.send([
                ("sessions", Bencode::str_list(sessions.iter().map(String::as_str))),
                ("status", Bencode::str_list(["done"])),
            ]);
        }
        // Evaluations cannot be cancelled once sent to the page.
        "interrupt" => reply.status(&["session-idle", "done"]),
        _ => {
            warn!("Unknown nREPL op '{}'", op);
            reply.status(&["error", "unknown-op", "done"]);
        }
    }
}

async fn clone_session(ctx: &OpContext, reply: &Reply) {
    let id = ctx.sessions.create().await;
    reply.send([
        ("new-session", Bencode::from(id)),
        ("status", Bencode::str_list(["done"])),
    ]);
}

async fn close_session(ctx: &OpContext, request: &Bencode, reply: &Reply) {
    let closed = match request.get_str("session") {
        Some(id) => ctx.sessions.close(id).await,
        None => false,
    };
    if closed {
        reply.done();
    } else {
        reply.status(&["error", "unknown-session", "done"]);
    }
}

fn describe(reply: &Reply) {
    let ops = Bencode::dict(OPS.iter().map(|op| (*op, Bencode::Dict(BTreeMap::new()))));
    let versions = Bencode::dict([(
        "tabeval",
        Bencode::dict([("version-string", Bencode::from(env!("CARGO_PKG_VERSION")))]),
    )]);
    reply.send([
        ("ops", ops),
        ("versions", versions),
        ("status", Bencode::str_list(["done"])),
    ]);
}

async fn eval(ctx: &OpContext, code: Option<&str>, lang: Option<&str>, reply: &Reply) {
    let Some(code) = code else {
        reply.status(&["error", "no-code", "done"]);
        return;
    };
    let language = lang.unwrap_or(&ctx.language);

    match compile_and_evaluate(ctx.backend.as_ref(), language, code).await {
        Ok(value) => {
            let rendered = match value {
                Some(value) => render_value(Some(&value)),
                None => "nil".to_string(),
            };
            reply.send([("value", Bencode::from(rendered)), ("ns", Bencode::from(DEFAULT_NS))]);
        }
        Err(e) => {
            reply.send([("err", Bencode::from(format!("{}\n", e)))]);
            reply.status(&["eval-error"]);
        }
    }
    reply.done();
}
