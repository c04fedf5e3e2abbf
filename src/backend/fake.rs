//! In-memory backend for tests.

use crate::backend::{find_page, Backend, BackendError, BackendResult, PageInfo};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Duration;

/// Evaluates a tiny script vocabulary:
/// - `sleep:<ms>:<value>` resolves to `<value>` (JSON) after `<ms>` milliseconds
/// - `throw:<message>` fails with an evaluation error
/// - `undefined` resolves to undefined
/// - anything else parses as JSON, falling back to the source string
pub struct FakeBackend {
    pages: Vec<PageInfo>,
    selected: Mutex<Option<usize>>,
    pub evaluated: Mutex<Vec<String>>,
    pub injected: Mutex<Vec<String>>,
    pub reloads: Mutex<usize>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::with_pages(vec![
            PageInfo {
                id: "A".to_string(),
                title: "Inbox".to_string(),
                url: "https://mail.example.com".to_string(),
            },
            PageInfo {
                id: "B".to_string(),
                title: "Docs".to_string(),
                url: "https://docs.example.com".to_string(),
            },
        ])
    }

    pub fn with_pages(pages: Vec<PageInfo>) -> Self {
        let selected = if pages.is_empty() { None } else { Some(0) };
        Self {
            pages,
            selected: Mutex::new(selected),
            evaluated: Mutex::new(Vec::new()),
            injected: Mutex::new(Vec::new()),
            reloads: Mutex::new(0),
        }
    }

    fn select(&self, index: Option<usize>, pattern: &str) -> BackendResult<PageInfo> {
        let index = index.ok_or_else(|| BackendError::NoMatchingPage(pattern.to_string()))?;
        let page = self
            .pages
            .get(index)
            .cloned()
            .ok_or_else(|| BackendError::NoMatchingPage(pattern.to_string()))?;
        *self.selected.lock().unwrap() = Some(index);
        Ok(page)
    }
}

impl Backend for FakeBackend {
    fn disconnect(&self) -> BoxFuture<'_, BackendResult<()>> {
        async { Ok(()) }.boxed()
    }

    fn is_running(&self) -> BoxFuture<'_, bool> {
        async { true }.boxed()
    }

    fn pages(&self) -> BoxFuture<'_, BackendResult<Vec<PageInfo>>> {
        async move { Ok(self.pages.clone()) }.boxed()
    }

    fn current_page(&self) -> BoxFuture<'_, Option<PageInfo>> {
        async move {
            let selected = *self.selected.lock().unwrap();
            selected.and_then(|index| self.pages.get(index).cloned())
        }
        .boxed()
    }

    fn select_page<'a>(&'a self, pattern: &'a str) -> BoxFuture<'a, BackendResult<PageInfo>> {
        async move { self.select(find_page(&self.pages, pattern), pattern) }.boxed()
    }

    fn select_page_by_index(&self, index: usize) -> BoxFuture<'_, BackendResult<PageInfo>> {
        async move { self.select(Some(index), &index.to_string()) }.boxed()
    }

    fn evaluate<'a>(&'a self, code: &'a str) -> BoxFuture<'a, BackendResult<Option<Value>>> {
        async move {
            self.evaluated.lock().unwrap().push(code.to_string());
            if let Some(rest) = code.strip_prefix("sleep:") {
                let (ms, value) = rest.split_once(':').unwrap_or((rest, "null"));
                tokio::time::sleep(Duration::from_millis(ms.parse().unwrap_or(0))).await;
                return Ok(Some(serde_json::from_str(value).unwrap_or(json!(value))));
            }
            if let Some(message) = code.strip_prefix("throw:") {
                return Err(BackendError::Evaluation(message.to_string()));
            }
            if code == "undefined" {
                return Ok(None);
            }
            Ok(Some(serde_json::from_str(code).unwrap_or(json!(code))))
        }
        .boxed()
    }

    fn inject_script<'a>(&'a self, url: &'a str) -> BoxFuture<'a, BackendResult<()>> {
        async move {
            self.injected.lock().unwrap().push(url.to_string());
            Ok(())
        }
        .boxed()
    }

    fn reload(&self) -> BoxFuture<'_, BackendResult<()>> {
        async move {
            *self.reloads.lock().unwrap() += 1;
            Ok(())
        }
        .boxed()
    }
}
