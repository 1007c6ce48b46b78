//! 闭包工具：把 `async |args, ctx| ...` 包装成 ToolHandler

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::A2AContext;
use crate::tools::ToolHandler;

pub struct FnHandler<F> {
    description: String,
    f: F,
}

/// 由异步闭包构造 handler
///
/// ```ignore
/// registry.register("upper", handler_fn(|args, _ctx| async move {
///     Ok(json!(args["text"].as_str().unwrap_or("").to_uppercase()))
/// }), ToolPolicy::new("read"))?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value, A2AContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, String>> + Send,
{
    FnHandler {
        description: String::new(),
        f,
    }
}

impl<F> FnHandler<F> {
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value, A2AContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, String>> + Send,
{
    fn description(&self) -> &str {
        &self.description
    }

    async fn call(&self, args: Value, ctx: A2AContext) -> Result<Value, String> {
        (self.f)(args, ctx).await
    }
}
