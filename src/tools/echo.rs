//! Echo 工具（测试与演示用）

use async_trait::async_trait;
use serde_json::Value;

use crate::context::A2AContext;
use crate::tools::ToolHandler;

/// Echo 工具：原样返回参数，并附带调用深度
pub struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    fn description(&self) -> &str {
        "Echo args back (for testing). Args: any JSON object"
    }

    async fn call(&self, args: Value, ctx: A2AContext) -> Result<Value, String> {
        Ok(serde_json::json!({
            "echo": args,
            "depth": ctx.depth(),
        }))
    }
}
