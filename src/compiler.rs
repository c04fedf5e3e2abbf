//! Language front end: turns source in some language into JavaScript the
//! backend can evaluate.

use crate::backend::{Backend, BackendError};
use log::debug;
use serde_json::Value;
use thiserror::Error;

/// Result of compiling one source snippet.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileOutput {
    pub success: bool,
    pub js: Option<String>,
    pub error: Option<String>,
}

impl CompileOutput {
    pub fn ok(js: impl Into<String>) -> Self {
        Self {
            success: true,
            js: Some(js.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            js: None,
            error: Some(error.into()),
        }
    }
}

/// Synchronous source-to-JavaScript compiler. Never touches the backend.
pub trait Compiler: Send + Sync {
    fn language(&self) -> &'static str;
    fn compile(&self, source: &str) -> CompileOutput;
}

/// JavaScript needs no compilation.
pub struct JavaScript;

impl Compiler for JavaScript {
    fn language(&self) -> &'static str {
        "js"
    }

    fn compile(&self, source: &str) -> CompileOutput {
        CompileOutput::ok(source)
    }
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("No compiler available for language '{0}'")]
    UnsupportedLanguage(String),

    #[error("Compile error: {0}")]
    Compile(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Look up the compiler for a language tag (case-insensitive).
pub fn compiler_for(language: &str) -> Option<Box<dyn Compiler>> {
    match language.trim().to_lowercase().as_str() {
        "js" | "javascript" => Some(Box::new(JavaScript)),
        _ => None,
    }
}

/// Compile `source` as `language`, then evaluate it in the selected tab.
pub async fn compile_and_evaluate(
    backend: &dyn Backend,
    language: &str,
    source: &str,
) -> Result<Option<Value>, EvalError> {
    let compiler =
        compiler_for(language).ok_or_else(|| EvalError::UnsupportedLanguage(language.to_string()))?;
    evaluate_with(backend, compiler.as_ref(), source).await
}

/// Compile `source` with `compiler` and evaluate the result. A failed
/// compile never reaches the backend.
pub async fn evaluate_with(
    backend: &dyn Backend,
    compiler: &dyn Compiler,
    source: &str,
) -> Result<Option<Value>, EvalError> {
    let output = compiler.compile(source);
    let js = match output {
        CompileOutput {
            success: true,
            js: Some(js),
            ..
        } => js,
        CompileOutput { error, .. } => {
            return Err(EvalError::Compile(
                error.unwrap_or_else(|| "compiler produced no output".to_string()),
            ))
        }
    };

    debug!("Evaluating {} bytes of {} as JavaScript", js.len(), compiler.language());
    Ok(backend.evaluate(&js).await?)
}
