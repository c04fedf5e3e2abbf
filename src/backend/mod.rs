/// Browser backend used by session handlers and the nREPL server
///
/// The dispatcher only ever talks to [`Backend`]; `cdp` provides the concrete
/// Chrome DevTools Protocol implementation the binary connects with.
pub mod cdp;

#[cfg(test)]
pub mod fake;

use crate::resilience::ConnectError;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use cdp::CdpBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("{0}")]
    Evaluation(String),

    #[error("No tab matches '{0}'")]
    NoMatchingPage(String),

    #[error("No tab selected")]
    NoPage,

    #[error("Browser error: {0}")]
    Protocol(String),

    #[error("Browser connection closed")]
    Disconnected,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A browser tab as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub id: String,
    pub title: String,
    pub url: String,
}

/// Capabilities the session needs from a live browser link.
///
/// Handlers share one backend concurrently. Implementations must tolerate
/// interleaved calls, but nothing stops one handler from switching the
/// selected tab while another is awaiting; callers that care about tab state
/// must not hold assumptions across an await.
pub trait Backend: Send + Sync {
    fn disconnect(&self) -> BoxFuture<'_, BackendResult<()>>;

    fn is_running(&self) -> BoxFuture<'_, bool>;

    fn pages(&self) -> BoxFuture<'_, BackendResult<Vec<PageInfo>>>;

    fn current_page(&self) -> BoxFuture<'_, Option<PageInfo>>;

    fn select_page<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, BackendResult<PageInfo>>;

    fn select_page_by_index(&self, index: usize) -> BoxFuture<'_, BackendResult<PageInfo>>;

    /// Evaluate JavaScript in the selected tab. `Ok(None)` means the script
    /// produced `undefined`; a thrown exception is an error.
    fn evaluate<'a>(&'a self, code: &'a str) -> BoxFuture<'a, BackendResult<Option<Value>>>;

    fn inject_script<'a>(&'a self, url: &'a str) -> BoxFuture<'a, BackendResult<()>>;

    fn reload(&self) -> BoxFuture<'_, BackendResult<()>>;
}

/// Find the tab a user pattern refers to: a bare number is an index,
/// anything else is a case-insensitive title or URL substring.
pub fn find_page(pages: &[PageInfo], pattern: &str) -> Option<usize> {
    let pattern = pattern.trim();
    if let Ok(index) = pattern.parse::<usize>() {
        return (index < pages.len()).then_some(index);
    }
    let needle = pattern.to_lowercase();
    pages.iter().position(|page| {
        page.title.to_lowercase().contains(&needle) || page.url.to_lowercase().contains(&needle)
    })
}
