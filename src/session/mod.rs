//! Line-oriented session: reads raw lines, hands them to a [`Protocol`] and
//! dispatches parsed requests to registered method handlers.
//!
//! Requests run concurrently. Responses are written in completion order, one
//! line each, and closing the input drains every in-flight request before
//! [`Session::start`] returns.

pub mod methods;


use crate::backend::Backend;
use crate::config::Config;
use crate::protocol::error_codes::{INTERNAL_ERROR, METHOD_NOT_FOUND};
use crate::protocol::{LocalContext, Parsed, Protocol, Request};
use futures_util::FutureExt;
use log::{debug, error, trace, warn};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinError, JoinSet};

pub use methods::{handler, MethodError, MethodHandler, MethodResult};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Method name must not be empty")]
    EmptyMethodName,
}

/// Asks a running session to stop reading input. In-flight requests still
/// complete and are written before `start` returns.
#[derive(Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

/// Counters reported when a session finishes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub lines: usize,
    pub dispatched: usize,
    pub stopped: bool,
}

type SharedWriter<W> = Arc<Mutex<W>>;

pub struct Session {
    protocol: Arc<dyn Protocol>,
    backend: Arc<dyn Backend>,
    config: Arc<Config>,
    methods: HashMap<String, MethodHandler>,
    stop: Arc<watch::Sender<bool>>,
    in_flight: Arc<AtomicUsize>,
}

/// Decrements the in-flight counter however the handler task ends.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Session {
    /// New session with the built-in methods registered.
    pub fn new(
        protocol: Arc<dyn Protocol>,
        backend: Arc<dyn Backend>,
        config: Arc<Config>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        let mut session = Self {
            protocol,
            backend,
            config,
            methods: HashMap::new(),
            stop: Arc::new(stop),
            in_flight: Arc::new(AtomicUsize::new(0)),
        };
        for (name, method) in methods::builtins() {
            session.methods.insert(name.to_string(), method);
        }
        session
    }

    /// Register (or replace) a method handler.
    pub fn register(&mut self, method: &str, handler: MethodHandler) -> Result<(), SessionError> {
        if method.trim().is_empty() {
            return Err(SessionError::EmptyMethodName);
        }
        if self.methods.insert(method.to_string(), handler).is_some() {
            debug!("Replaced handler for method '{}'", method);
        }
        Ok(())
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn protocol_name(&self) -> &'static str {
        self.protocol.name()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    /// Requests dispatched but not yet answered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Process `input` until it closes or the session is stopped, then wait
    /// for every in-flight request to be answered on `output`.
    pub async fn start<R, W>(&self, input: R, output: W) -> SessionSummary
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer: SharedWriter<W> = Arc::new(Mutex::new(output));
        let method_names = self.method_names();
        let mut stop_rx = self.stop.subscribe();
        let mut reader = BufReader::new(input);
        let mut buf = Vec::new();
        let mut tasks = JoinSet::new();
        let mut summary = SessionSummary::default();

        debug!("Starting {} session", self.protocol.name());

        loop {
            if *stop_rx.borrow_and_update() {
                summary.stopped = true;
                break;
            }

            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                read = reader.read_until(b'\n', &mut buf) => match read {
                    Ok(0) => break,
                    Ok(_) => {
                        // Undecodable bytes still reach the parser and get an error reply.
                        let line = decode_line(&buf);
                        buf.clear();
                        summary.lines += 1;
                        self.handle_line(&line, &method_names, &writer, &mut tasks, &mut summary)
                            .await;
                    }
                    Err(e) => {
                        warn!("Failed to read session input: {}", e);
                        break;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
            }
        }

        if !tasks.is_empty() {
            debug!("Input closed, draining {} in-flight request(s)", tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }

        debug!(
            "{} session finished: {} line(s), {} request(s)",
            self.protocol.name(),
            summary.lines,
            summary.dispatched
        );
        summary
    }

    /// Run against the process's stdin and stdout.
    pub async fn run_stdio(&self) -> SessionSummary {
        self.start(tokio::io::stdin(), tokio::io::stdout()).await
    }

    async fn handle_line<W>(
        &self,
        line: &str,
        method_names: &[String],
        writer: &SharedWriter<W>,
        tasks: &mut JoinSet<()>,
        summary: &mut SessionSummary,
    ) where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (local, stop) = {
            let ctx = LocalContext::new(method_names);
            let local = self.protocol.handle_local(line, &ctx);
            (local, ctx.stop_requested())
        };
        if let Some(text) = local {
            write_output(writer, &text).await;
            if stop {
                self.stop_handle().stop();
            }
            return;
        }

        let request = match self.protocol.parse(line) {
            Parsed::Skip => return,
            Parsed::Error(err) => {
                trace!("Rejected input line: {}", err.message);
                let text = self.protocol.format_error(err.id.as_ref(), err.code, &err.message);
                write_output(writer, &text).await;
                return;
            }
            Parsed::Request(request) => request,
        };

        let Some(method) = self.methods.get(&request.method).cloned() else {
            let text = self.protocol.format_error(
                request.id.as_ref(),
                METHOD_NOT_FOUND,
                &format!("Method not found: {}", request.method),
            );
            write_output(writer, &text).await;
            return;
        };

        summary.dispatched += 1;
        let guard = InFlight::enter(&self.in_flight);
        let protocol = self.protocol.clone();
        let backend = self.backend.clone();
        let config = self.config.clone();
        let writer = writer.clone();

        tasks.spawn(async move {
            let _guard = guard;
            let text = run_request(protocol.as_ref(), method, request, backend, config).await;
            write_output(&writer, &text).await;
        });
    }
}

async fn run_request(
    protocol: &dyn Protocol,
    method: MethodHandler,
    mut request: Request,
    backend: Arc<dyn Backend>,
    config: Arc<Config>,
) -> String {
    let params = std::mem::take(&mut request.params);
    let outcome = AssertUnwindSafe(method(params, backend, config))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(value)) => protocol.format_result(&request, value.as_ref()),
        Ok(Err(err)) => {
            debug!("Method '{}' failed: {}", request.method, err);
            protocol.format_error(request.id.as_ref(), err.code(), &err.to_string())
        }
        Err(_) => {
            error!("Handler for method '{}' panicked", request.method);
            protocol.format_error(request.id.as_ref(), INTERNAL_ERROR, "Internal error")
        }
    }
}

async fn write_output<W>(writer: &SharedWriter<W>, text: &str)
where
    W: AsyncWrite + Unpin,
{
    // Undefined REPL results render as nothing.
    if text.is_empty() {
        return;
    }
    let mut out = writer.lock().await;
    let result = async {
        out.write_all(text.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await
    }
    .await;
    if let Err(e) = result {
        warn!("Failed to write session output: {}", e);
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!("Request task failed: {}", e);
    }
}

/// Strip the line terminator and decode, replacing invalid UTF-8.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
