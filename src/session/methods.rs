use crate::backend::{Backend, BackendError, PageInfo};
use crate::compiler::{compile_and_evaluate, EvalError};
use crate::config::Config;
use crate::protocol::error_codes::{EVALUATION_ERROR, INTERNAL_ERROR, INVALID_PARAMS};
use crate::protocol::Params;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Failure of a method handler. Converted to a formatted error response by
/// the session, never propagated past it.
#[derive(Debug, Error)]
pub enum MethodError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl MethodError {
    /// JSON-RPC error code reported for this failure.
    pub fn code(&self) -> i32 {
        match self {
            MethodError::InvalidParams(_) => INVALID_PARAMS,
            MethodError::Eval(EvalError::UnsupportedLanguage(_)) => INVALID_PARAMS,
            MethodError::Eval(EvalError::Compile(_)) => EVALUATION_ERROR,
            MethodError::Eval(EvalError::Backend(BackendError::Evaluation(_)))
            | MethodError::Backend(BackendError::Evaluation(_)) => EVALUATION_ERROR,
            MethodError::Eval(EvalError::Backend(BackendError::NoMatchingPage(_)))
            | MethodError::Backend(BackendError::NoMatchingPage(_)) => INVALID_PARAMS,
            MethodError::Eval(EvalError::Backend(_)) | MethodError::Backend(_) => INTERNAL_ERROR,
        }
    }
}

pub type MethodResult = Result<Option<Value>, MethodError>;

/// `(params, backend, config) -> value`, shared by every in-flight request.
pub type MethodHandler = Arc<
    dyn Fn(Params, Arc<dyn Backend>, Arc<Config>) -> BoxFuture<'static, MethodResult>
        + Send
        + Sync,
>;

/// Wrap an async function as a [`MethodHandler`].
pub fn handler<F, Fut>(f: F) -> MethodHandler
where
    F: Fn(Params, Arc<dyn Backend>, Arc<Config>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MethodResult> + Send + 'static,
{
    Arc::new(move |params, backend, config| f(params, backend, config).boxed())
}

fn required_str<'a>(params: &'a Params, key: &str) -> Result<&'a str, MethodError> {
    match params.get(key) {
        Some(Value::String(value)) if !value.trim().is_empty() => Ok(value),
        Some(_) => Err(MethodError::InvalidParams(format!(
            "'{}' must be a non-empty string",
            key
        ))),
        None => Err(MethodError::InvalidParams(format!("missing '{}'", key))),
    }
}

fn page_line(index: usize, page: &PageInfo, selected: bool) -> String {
    let marker = if selected { "*" } else { " " };
    format!("{} [{}] {}  {}", marker, index, page.title, page.url)
}

/// Built-in methods every session starts with.
pub fn builtins() -> Vec<(&'static str, MethodHandler)> {
    vec![
        ("eval", handler(eval)),
        ("tabs", handler(tabs)),
        ("select_tab", handler(select_tab)),
        ("inject", handler(inject)),
        ("reload", handler(reload)),
        ("status", handler(status)),
    ]
}

async fn eval(params: Params, backend: Arc<dyn Backend>, config: Arc<Config>) -> MethodResult {
    let code = required_str(&params, "code")?;
    let language = match params.get("lang") {
        None | Some(Value::Null) => config.default_language.as_str(),
        Some(Value::String(lang)) => lang.as_str(),
        Some(_) => return Err(MethodError::InvalidParams("'lang' must be a string".to_string())),
    };
    Ok(compile_and_evaluate(backend.as_ref(), language, code).await?)
}

async fn tabs(_params: Params, backend: Arc<dyn Backend>, _config: Arc<Config>) -> MethodResult {
    let pages = backend.pages().await?;
    let current = backend.current_page().await;

    let mut lines = Vec::with_capacity(pages.len());
    let mut entries = Vec::with_capacity(pages.len());
    for (index, page) in pages.iter().enumerate() {
        let selected = current.as_ref().is_some_and(|c| c.id == page.id);
        lines.push(page_line(index, page, selected));
        entries.push(json!({
            "index": index,
            "id": page.id,
            "title": page.title,
            "url": page.url,
            "selected": selected,
        }));
    }
    let formatted = if lines.is_empty() {
        "No open tabs".to_string()
    } else {
        lines.join("\n")
    };

    Ok(Some(json!({ "tabs": entries, "formatted": formatted })))
}

async fn select_tab(
    params: Params,
    backend: Arc<dyn Backend>,
    _config: Arc<Config>,
) -> MethodResult {
    let page = match (params.get("index"), params.get("pattern")) {
        (Some(index), _) => {
            let index = index.as_u64().ok_or_else(|| {
                MethodError::InvalidParams("'index' must be a non-negative integer".to_string())
            })?;
            backend.select_page_by_index(index as usize).await?
        }
        (None, Some(_)) => {
            let pattern = required_str(&params, "pattern")?;
            backend.select_page(pattern).await?
        }
        (None, None) => {
            return Err(MethodError::InvalidParams(
                "missing 'pattern' or 'index'".to_string(),
            ))
        }
    };

    Ok(Some(json!({
        "tab": page,
        "formatted": format!("Selected: {}  {}", page.title, page.url),
    })))
}

async fn inject(params: Params, backend: Arc<dyn Backend>, config: Arc<Config>) -> MethodResult {
    let reference = required_str(&params, "script")?;
    let url = config
        .resolve_script(reference)
        .map_err(|e| MethodError::InvalidParams(e.to_string()))?;
    backend.inject_script(&url).await?;
    Ok(Some(json!({
        "script": url,
        "formatted": format!("Injected {}", url),
    })))
}

async fn reload(_params: Params, backend: Arc<dyn Backend>, _config: Arc<Config>) -> MethodResult {
    backend.reload().await?;
    Ok(Some(json!({ "reloaded": true, "formatted": "Reloaded" })))
}

async fn status(_params: Params, backend: Arc<dyn Backend>, config: Arc<Config>) -> MethodResult {
    let running = backend.is_running().await;
    let current = backend.current_page().await;
    let formatted = match (&current, running) {
        (_, false) => format!("Browser at {}:{} is not responding", config.host, config.port),
        (Some(page), true) => format!(
            "Connected to {}:{}\nTab: {}  {}",
            config.host, config.port, page.title, page.url
        ),
        (None, true) => format!("Connected to {}:{}\nNo tab selected", config.host, config.port),
    };
    Ok(Some(json!({
        "running": running,
        "tab": current,
        "formatted": formatted,
    })))
}
