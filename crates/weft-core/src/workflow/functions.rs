//! Registry of functions invokable by `call` tasks.
//!
//! Handlers are registered by name. Arguments arrive already evaluated; a
//! handler fails by returning structured `ErrorDetails`.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;
use weft_types::error::ErrorDetails;

/// A function callable from a workflow.
pub trait FunctionHandler: Send + Sync {
    fn call(&self, arguments: Value) -> BoxFuture<'static, Result<Value, ErrorDetails>>;
}

impl<F, Fut> FunctionHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ErrorDetails>> + Send + 'static,
{
    fn call(&self, arguments: Value) -> BoxFuture<'static, Result<Value, ErrorDetails>> {
        Box::pin((self)(arguments))
    }
}

/// Name to handler map shared by every `call` task of a runtime.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: Arc<DashMap<String, Arc<dyn FunctionHandler>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `echo` and `log` functions.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("echo", |arguments: Value| async move {
            Ok::<_, ErrorDetails>(arguments)
        });
        registry.register("log", |arguments: Value| async move {
            tracing::info!(%arguments, "workflow log");
            Ok::<_, ErrorDetails>(arguments)
        });
        registry
    }

    pub fn register(&self, name: impl Into<String>, handler: impl FunctionHandler + 'static) {
        self.functions.insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FunctionHandler>> {
        self.functions.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.functions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}
