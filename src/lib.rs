//! A2A 工具编排核心
//!
//! 模块划分：
//! - **config**: 编排配置加载（TOML + 环境变量）
//! - **context**: 调用上下文（correlation id、深度、权限白名单、共享事件日志）
//! - **core**: 错误类型与编排门面（命名模板）
//! - **observability**: 日志初始化
//! - **tools**: 工具注册表、并发闸门、在途去重与调用器
//! - **trace**: 调用 span 记录、调用树渲染与 JSON 导出
//! - **workflow**: 执行计划模型、校验、执行控制器与常用编排模式

pub mod config;
pub mod context;
pub mod core;
pub mod observability;
pub mod tools;
pub mod trace;
pub mod workflow;

pub use crate::context::{A2AContext, ContextManager};
pub use crate::core::{A2AError, AgentOrchestrator, FailureKind, ToolFailure};
pub use crate::tools::{handler_fn, InvocationOptions, ToolHandler, ToolPolicy, ToolRegistry};
pub use crate::trace::{TraceLogger, TraceSpan};
pub use crate::workflow::{ExecutionPlan, ExecutionStep, PlanBuilder, PlanResult};
