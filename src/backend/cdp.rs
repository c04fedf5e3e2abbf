use crate::backend::{find_page, Backend, BackendError, BackendResult, PageInfo};
use futures_util::future::BoxFuture;
use futures_util::stream::SplitSink;
use futures_util::{FutureExt, SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// Entry of the DevTools `/json/list` endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetInfo {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    web_socket_debugger_url: Option<String>,
}

impl TargetInfo {
    fn page_info(&self) -> PageInfo {
        PageInfo {
            id: self.id.clone(),
            title: self.title.clone(),
            url: self.url.clone(),
        }
    }
}

/// WebSocket session attached to one page target.
struct PageConnection {
    page: PageInfo,
    sink: Mutex<WsSink>,
    pending: PendingMap,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl PageConnection {
    async fn open(page: PageInfo, ws_url: &str) -> BackendResult<Self> {
        debug!("Attaching to tab {} via {}", page.id, ws_url);
        let (ws_stream, _) = connect_async(ws_url).await?;
        let (sink, mut stream) = ws_stream.split();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        let page_id = page.id.clone();

        // Route responses back to their callers; events have no id and are dropped.
        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        trace!("[CDP RX] {}", text);
                        let Ok(response) = serde_json::from_str::<Value>(&text) else {
                            warn!("Ignoring malformed CDP message from tab {}", page_id);
                            continue;
                        };
                        if let Some(id) = response.get("id").and_then(Value::as_u64) {
                            if let Some(sender) = reader_pending.lock().await.remove(&id) {
                                let _ = sender.send(response);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("CDP connection to tab {} failed: {}", page_id, e);
                        break;
                    }
                }
            }
            debug!("CDP reader for tab {} finished", page_id);
            // Dropping the senders wakes every waiter with a closed channel.
            reader_pending.lock().await.clear();
        });

        Ok(Self {
            page,
            sink: Mutex::new(sink),
            pending,
            next_id: AtomicU64::new(1),
            reader,
        })
    }

    async fn call(&self, method: &str, params: Value, timeout: Duration) -> BackendResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let payload = json!({ "id": id, "method": method, "params": params }).to_string();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        trace!("[CDP TX] {}", payload);
        if let Err(e) = self.sink.lock().await.send(Message::Text(payload)).await {
            self.pending.lock().await.remove(&id);
            return Err(e.into());
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(BackendError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(BackendError::Timeout(timeout.as_millis() as u64));
            }
        };

        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(BackendError::Protocol(format!("{}: {}", method, message)));
        }

        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
        self.reader.abort();
    }
}

impl Drop for PageConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Chrome DevTools Protocol backend.
///
/// Tabs are discovered through the HTTP endpoint of the remote debugging
/// port; commands go over the selected tab's WebSocket.
pub struct CdpBackend {
    host: String,
    port: u16,
    http: reqwest::Client,
    timeout: Duration,
    connection: RwLock<Option<Arc<PageConnection>>>,
}

fn http_base(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("http://[{}]:{}", host, port)
    } else {
        format!("http://{}:{}", host, port)
    }
}

/// Expression that appends a `<script>` tag and settles once it has loaded.
fn inject_expression(url: &str) -> String {
    let url = Value::String(url.to_string()).to_string();
    format!(
        "new Promise((resolve, reject) => {{ \
            const script = document.createElement('script'); \
            script.src = {url}; \
            script.onload = () => resolve(true); \
            script.onerror = () => reject(new Error('Failed to load script ' + {url})); \
            (document.head || document.documentElement).appendChild(script); \
        }})",
        url = url
    )
}

/// Convert a `Runtime.evaluate` result into a value, or the thrown exception
/// into an evaluation error.
fn evaluation_result(result: &Value) -> BackendResult<Option<Value>> {
    if let Some(details) = result.get("exceptionDetails") {
        let message = details
            .pointer("/exception/description")
            .and_then(Value::as_str)
            .or_else(|| details.get("text").and_then(Value::as_str))
            .unwrap_or("Uncaught exception");
        return Err(BackendError::Evaluation(message.to_string()));
    }

    let remote = result.get("result").unwrap_or(&Value::Null);
    if remote.get("type").and_then(Value::as_str) == Some("undefined") {
        return Ok(None);
    }
    Ok(Some(
        remote
            .get("value")
            .or_else(|| remote.get("description"))
            .cloned()
            .unwrap_or(Value::Null),
    ))
}

impl CdpBackend {
    /// Connect to the debugging endpoint at `host:port` and attach to the
    /// first open tab, if any.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> BackendResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let backend = Self {
            host: host.to_string(),
            port,
            http,
            timeout,
            connection: RwLock::new(None),
        };

        let targets = backend.targets().await?;
        match targets.first() {
            Some(target) => {
                backend.attach(target).await?;
            }
            None => warn!("Browser at {}:{} has no open tabs", host, port),
        }

        info!("Connected to browser at {}:{}", host, port);
        Ok(backend)
    }

    async fn targets(&self) -> BackendResult<Vec<TargetInfo>> {
        let url = format!("{}/json/list", http_base(&self.host, self.port));
        let targets: Vec<TargetInfo> = self.http.get(&url).send().await?.json().await?;
        Ok(targets
            .into_iter()
            .filter(|target| target.kind == "page")
            .collect())
    }

    async fn attach(&self, target: &TargetInfo) -> BackendResult<PageInfo> {
        let ws_url = target.web_socket_debugger_url.as_deref().ok_or_else(|| {
            BackendError::Protocol(format!(
                "tab {} is already being debugged by another client",
                target.id
            ))
        })?;
        let page = target.page_info();
        let connection = Arc::new(PageConnection::open(page.clone(), ws_url).await?);

        let previous = self.connection.write().await.replace(connection);
        if let Some(previous) = previous {
            previous.close().await;
        }
        info!("Selected tab: {} ({})", page.title, page.url);
        Ok(page)
    }

    async fn call(&self, method: &str, params: Value) -> BackendResult<Value> {
        let connection = self
            .connection
            .read()
            .await
            .clone()
            .ok_or(BackendError::NoPage)?;
        connection.call(method, params, self.timeout).await
    }

    async fn run_evaluate(&self, code: &str) -> BackendResult<Option<Value>> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": code,
                    "returnByValue": true,
                    "awaitPromise": true,
                    "replMode": true,
                }),
            )
            .await?;
        evaluation_result(&result)
    }
}

impl Backend for CdpBackend {
    fn disconnect(&self) -> BoxFuture<'_, BackendResult<()>> {
        async move {
            if let Some(connection) = self.connection.write().await.take() {
                connection.close().await;
            }
            info!("Disconnected from browser at {}:{}", self.host, self.port);
            Ok(())
        }
        .boxed()
    }

    fn is_running(&self) -> BoxFuture<'_, bool> {
        async move {
            let url = format!("{}/json/version", http_base(&self.host, self.port));
            match self.http.get(&url).send().await {
                Ok(response) => response.status().is_success(),
                Err(e) => {
                    debug!("Browser health check failed: {}", e);
                    false
                }
            }
        }
        .boxed()
    }

    fn pages(&self) -> BoxFuture<'_, BackendResult<Vec<PageInfo>>> {
        async move {
            let targets = self.targets().await?;
            Ok(targets.iter().map(TargetInfo::page_info).collect())
        }
        .boxed()
    }

    fn current_page(&self) -> BoxFuture<'_, Option<PageInfo>> {
        async move {
            self.connection
                .read()
                .await
                .as_ref()
                .map(|connection| connection.page.clone())
        }
        .boxed()
    }

    fn select_page<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, BackendResult<PageInfo>> {
        async move {
            let targets = self.targets().await?;
            let pages: Vec<PageInfo> = targets.iter().map(TargetInfo::page_info).collect();
            let index = find_page(&pages, pattern)
                .ok_or_else(|| BackendError::NoMatchingPage(pattern.to_string()))?;
            self.attach(&targets[index]).await
        }
        .boxed()
    }

    fn select_page_by_index(&self, index: usize) -> BoxFuture<'_, BackendResult<PageInfo>> {
        async move {
            let targets = self.targets().await?;
            let target = targets
                .get(index)
                .ok_or_else(|| BackendError::NoMatchingPage(index.to_string()))?;
            self.attach(target).await
        }
        .boxed()
    }

    fn evaluate<'a>(&'a self, code: &'a str) -> BoxFuture<'a, BackendResult<Option<Value>>> {
        self.run_evaluate(code).boxed()
    }

    fn inject_script<'a>(&'a self, url: &'a str) -> BoxFuture<'a, BackendResult<()>> {
        async move {
            self.run_evaluate(&inject_expression(url)).await?;
            debug!("Injected script {}", url);
            Ok(())
        }
        .boxed()
    }

    fn reload(&self) -> BoxFuture<'_, BackendResult<()>> {
        async move {
            self.call("Page.reload", json!({})).await?;
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_base_brackets_ipv6_hosts() {
        assert_eq!(http_base("127.0.0.1", 9222), "http://127.0.0.1:9222");
        assert_eq!(http_base("::1", 9222), "http://[::1]:9222");
    }

    #[test]
    fn targets_deserialize_from_devtools_listing() {
        let listing = r#"[
            {"id": "A1", "type": "page", "title": "Docs", "url": "https://docs.example.com",
             "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/A1"},
            {"id": "W1", "type": "service_worker", "url": "https://docs.example.com/sw.js"}
        ]"#;
        let targets: Vec<TargetInfo> = serde_json::from_str(listing).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].kind, "page");
        assert_eq!(
            targets[0].web_socket_debugger_url.as_deref(),
            Some("ws://127.0.0.1:9222/devtools/page/A1")
        );
        assert_eq!(targets[1].title, "");
        assert!(targets[1].web_socket_debugger_url.is_none());
    }

    #[test]
    fn evaluation_result_maps_undefined_values_and_exceptions() {
        let undefined = json!({"result": {"type": "undefined"}});
        assert_eq!(evaluation_result(&undefined).unwrap(), None);

        let number = json!({"result": {"type": "number", "value": 2, "description": "2"}});
        assert_eq!(evaluation_result(&number).unwrap(), Some(json!(2)));

        let symbol = json!({"result": {"type": "symbol", "description": "Symbol(x)"}});
        assert_eq!(evaluation_result(&symbol).unwrap(), Some(json!("Symbol(x)")));

        let thrown = json!({
            "result": {"type": "object", "subtype": "error"},
            "exceptionDetails": {
                "text": "Uncaught",
                "exception": {"description": "ReferenceError: nope is not defined"}
            }
        });
        match evaluation_result(&thrown) {
            Err(BackendError::Evaluation(message)) => {
                assert_eq!(message, "ReferenceError: nope is not defined")
            }
            other => panic!("expected evaluation error, got {:?}", other),
        }
    }

    #[test]
    fn inject_expression_escapes_url() {
        let expression = inject_expression("https://cdn.example.com/a\"b.js");
        assert!(expression.contains(r#"script.src = "https://cdn.example.com/a\"b.js";"#));
        assert!(expression.starts_with("new Promise"));
    }
}
