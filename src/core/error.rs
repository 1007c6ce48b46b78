//! 编排错误类型与失败分类
//!
//! A2AError 只用于配置 / 校验类错误（注册冲突、计划非法、深度超限等），以 `Err` 返回；
//! 单步执行失败以数据形式（ToolFailure）挂在 InvocationResult 上，不会中断调用方。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 编排过程中可能出现的错误
#[derive(Error, Debug)]
pub enum A2AError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Permission denied: tool '{tool}' requires '{permission}'")]
    PermissionDenied { tool: String, permission: String },

    #[error("Tool timeout: {tool} after {after_ms}ms")]
    Timeout { tool: String, after_ms: u64 },

    #[error("Tool execution failed: {tool}: {message}")]
    ToolError { tool: String, message: String },

    #[error("Cyclic dependency detected among steps: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("Tool already registered: {0}")]
    DuplicateRegistration(String),

    #[error("Call depth exceeded: {depth} > {max}")]
    DepthExceeded { depth: u32, max: u32 },

    /// 首次调用后注册表被锁定，需显式 reopen 才能继续注册
    #[error("Registry locked, cannot register '{0}'")]
    RegistryLocked(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid tool policy: {0}")]
    InvalidPolicy(String),

    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}

/// 失败类别（可序列化，随 InvocationResult 输出）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    UnknownTool,
    PermissionDenied,
    Timeout,
    ToolError,
    CyclicDependency,
    DuplicateRegistration,
    DepthExceeded,
    RegistryLocked,
    InvalidPlan,
    InvalidPolicy,
    UnknownTemplate,
    Config,
}

impl FailureKind {
    /// 仅超时与工具自身报错值得重试；权限 / 未知工具等重试也不会改变结果
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Timeout | FailureKind::ToolError)
    }
}

impl A2AError {
    pub fn kind(&self) -> FailureKind {
        match self {
            A2AError::UnknownTool(_) => FailureKind::UnknownTool,
            A2AError::PermissionDenied { .. } => FailureKind::PermissionDenied,
            A2AError::Timeout { .. } => FailureKind::Timeout,
            A2AError::ToolError { .. } => FailureKind::ToolError,
            A2AError::CyclicDependency(_) => FailureKind::CyclicDependency,
            A2AError::DuplicateRegistration(_) => FailureKind::DuplicateRegistration,
            A2AError::DepthExceeded { .. } => FailureKind::DepthExceeded,
            A2AError::RegistryLocked(_) => FailureKind::RegistryLocked,
            A2AError::InvalidPlan(_) => FailureKind::InvalidPlan,
            A2AError::InvalidPolicy(_) => FailureKind::InvalidPolicy,
            A2AError::UnknownTemplate(_) => FailureKind::UnknownTemplate,
            A2AError::Config(_) => FailureKind::Config,
        }
    }
}

/// 单步失败详情：类别 + 消息 + 来源工具，足以让调用方渲染诊断信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub kind: FailureKind,
    pub message: String,
    pub tool: String,
}

impl ToolFailure {
    pub fn new(kind: FailureKind, tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            tool: tool.into(),
        }
    }

    /// 由 A2AError 构造（例如子上下文深度超限时）
    pub fn from_error(tool: impl Into<String>, err: &A2AError) -> Self {
        Self::new(err.kind(), tool, err.to_string())
    }
}

impl std::fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}: {}", self.kind, self.tool, self.message)
    }
}
