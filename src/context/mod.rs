//! 调用上下文：correlation id、调用深度、共享事件日志
//!
//! A2AContext 约定为不可变值：克隆廉价，子上下文共享父上下文的事件日志并深度 +1，
//! 父引用只是 Weak 回指。日志追加走互斥锁，读取得到一致快照。

use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ContextSection;
use crate::core::A2AError;
use crate::trace::TraceLogger;

/// 上下文日志中的一条事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEvent {
    pub timestamp: DateTime<Utc>,
    pub step_id: Option<String>,
    pub message: String,
}

impl ContextEvent {
    pub fn new(step_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            step_id: step_id.map(str::to_string),
            message: message.into(),
        }
    }
}

type SharedLog = Arc<Mutex<Vec<ContextEvent>>>;

struct ContextFrame {
    correlation_id: String,
    depth: u32,
    caller: String,
    permissions: Vec<String>,
    log: SharedLog,
    parent: Option<Weak<ContextFrame>>,
    /// tracing 关闭时为 None
    trace: Option<Arc<TraceLogger>>,
}

/// 一次顶层调用链中的执行上下文
#[derive(Clone)]
pub struct A2AContext {
    frame: Arc<ContextFrame>,
}

impl std::fmt::Debug for A2AContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("A2AContext")
            .field("correlation_id", &self.frame.correlation_id)
            .field("depth", &self.frame.depth)
            .field("caller", &self.frame.caller)
            .finish()
    }
}

impl A2AContext {
    pub fn correlation_id(&self) -> &str {
        &self.frame.correlation_id
    }

    pub fn depth(&self) -> u32 {
        self.frame.depth
    }

    pub fn caller(&self) -> &str {
        &self.frame.caller
    }

    pub fn permissions(&self) -> &[String] {
        &self.frame.permissions
    }

    /// 白名单含 "*" 或精确包含该标签
    pub fn allows(&self, permission: &str) -> bool {
        self.frame
            .permissions
            .iter()
            .any(|p| p == "*" || p == permission)
    }

    pub fn tracing_enabled(&self) -> bool {
        self.frame.trace.is_some()
    }

    /// 父上下文（若仍存活）
    pub fn parent(&self) -> Option<A2AContext> {
        self.frame
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|frame| A2AContext { frame })
    }

    /// 去重作用域：同一调用链、同一深度的调用互相合并
    pub fn dedup_scope(&self) -> String {
        format!("{}:{}", self.frame.correlation_id, self.frame.depth)
    }

    /// 追加事件；开启追踪时同时转发到 TraceLogger
    pub fn append_event(&self, event: ContextEvent) {
        if let Some(trace) = &self.frame.trace {
            trace.record_event(&self.frame.correlation_id, event.clone());
        }
        self.frame
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub fn log(&self, step_id: Option<&str>, message: impl Into<String>) {
        self.append_event(ContextEvent::new(step_id, message));
    }

    /// 当前日志快照（插入顺序）
    pub fn events(&self) -> Vec<ContextEvent> {
        self.frame
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// 上下文管理器：分配 correlation id、派生子上下文并检查深度上限
#[derive(Clone)]
pub struct ContextManager {
    max_depth: u32,
    default_caller: String,
    default_permissions: Vec<String>,
    trace: Option<Arc<TraceLogger>>,
}

impl ContextManager {
    pub fn new(config: &ContextSection, trace: Arc<TraceLogger>) -> Self {
        Self {
            max_depth: config.max_depth,
            default_caller: config.caller.clone(),
            default_permissions: config.default_permissions.clone(),
            trace: config.tracing_enabled.then_some(trace),
        }
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// 无 parent 时分配新 correlation id；否则派生子上下文（共享日志、深度 +1、继承调用方与权限）
    pub fn create_context(&self, parent: Option<&A2AContext>) -> Result<A2AContext, A2AError> {
        match parent {
            None => Ok(self.create_root_with(
                self.default_caller.clone(),
                self.default_permissions.clone(),
            )),
            Some(parent) => {
                let depth = parent.depth() + 1;
                if depth > self.max_depth {
                    return Err(A2AError::DepthExceeded {
                        depth,
                        max: self.max_depth,
                    });
                }
                Ok(A2AContext {
                    frame: Arc::new(ContextFrame {
                        correlation_id: parent.frame.correlation_id.clone(),
                        depth,
                        caller: parent.frame.caller.clone(),
                        permissions: parent.frame.permissions.clone(),
                        log: Arc::clone(&parent.frame.log),
                        parent: Some(Arc::downgrade(&parent.frame)),
                        trace: parent.frame.trace.clone(),
                    }),
                })
            }
        }
    }

    /// 以指定调用方与权限白名单创建根上下文
    pub fn create_root_with(&self, caller: impl Into<String>, permissions: Vec<String>) -> A2AContext {
        let correlation_id = format!("a2a_{}", uuid::Uuid::new_v4());
        let ctx = A2AContext {
            frame: Arc::new(ContextFrame {
                correlation_id,
                depth: 0,
                caller: caller.into(),
                permissions,
                log: Arc::new(Mutex::new(Vec::new())),
                parent: None,
                trace: self.trace.clone(),
            }),
        };
        tracing::debug!(correlation_id = %ctx.correlation_id(), caller = %ctx.caller(), "context created");
        ctx
    }
}
