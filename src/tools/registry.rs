//! 工具注册表
//!
//! 所有工具实现 ToolHandler trait（description / call），由 ToolRegistry 按名注册并附带调用策略
//! （权限标签、最大并发、默认超时）。同名重复注册是配置错误；首次调用后注册表锁定，
//! 之后注册返回 RegistryLocked，除非显式 reopen。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::A2AContext;
use crate::core::A2AError;

/// 工具处理函数：接收 JSON 参数与调用上下文，返回 JSON 结果或错误消息
///
/// handler 无需区分失败类别，超时 / 报错 / panic 的归类由 ToolInvoker 统一完成。
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// 工具描述（用于列表展示）
    fn description(&self) -> &str {
        ""
    }

    async fn call(&self, args: Value, ctx: A2AContext) -> Result<Value, String>;
}

/// 注册时附带的调用策略
#[derive(Debug, Clone)]
pub struct ToolPolicy {
    /// 权限标签，调用方上下文白名单须包含该标签
    pub permission: String,
    /// 最大并发数（None 表示不限）
    pub max_concurrency: Option<usize>,
    pub default_timeout: Option<Duration>,
}

impl ToolPolicy {
    pub fn new(permission: impl Into<String>) -> Self {
        Self {
            permission: permission.into(),
            max_concurrency: None,
            default_timeout: None,
        }
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_timeout_ms(self, ms: u64) -> Self {
        self.with_timeout(Duration::from_millis(ms))
    }
}

/// 注册项：注册后不可变
#[derive(Clone)]
pub struct ToolRegistration {
    pub name: String,
    pub handler: Arc<dyn ToolHandler>,
    pub policy: ToolPolicy,
}

impl std::fmt::Debug for ToolRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistration")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish()
    }
}

/// 工具注册表：按名称存储 ToolRegistration，支持 register / lookup / list_by_permission
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<ToolRegistration>>>,
    locked: AtomicBool,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        handler: impl ToolHandler + 'static,
        policy: ToolPolicy,
    ) -> Result<(), A2AError> {
        self.register_arc(name, Arc::new(handler), policy)
    }

    pub fn register_arc(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
        policy: ToolPolicy,
    ) -> Result<(), A2AError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(A2AError::InvalidPolicy("tool name must not be empty".to_string()));
        }
        if policy.max_concurrency == Some(0) {
            return Err(A2AError::InvalidPolicy(format!(
                "max_concurrency for '{name}' must be >= 1"
            )));
        }
        if self.is_locked() {
            return Err(A2AError::RegistryLocked(name));
        }

        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        if tools.contains_key(&name) {
            return Err(A2AError::DuplicateRegistration(name));
        }
        tracing::info!(tool = %name, permission = %policy.permission, "tool registered");
        tools.insert(
            name.clone(),
            Arc::new(ToolRegistration {
                name,
                handler,
                policy,
            }),
        );
        Ok(())
    }

    /// 按名查找；未注册返回 UnknownTool，由调用方决定如何处理
    pub fn lookup(&self, name: &str) -> Result<Arc<ToolRegistration>, A2AError> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| A2AError::UnknownTool(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_ok()
    }

    /// 某权限标签下的全部工具名（排序），仅供模板筛选，不作为鉴权依据
    pub fn list_by_permission(&self, permission: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.policy.permission == permission)
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// 返回 (name, description, permission) 列表
    pub fn describe(&self) -> Vec<(String, String, String)> {
        let mut rows: Vec<_> = self
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|r| {
                (
                    r.name.clone(),
                    r.handler.description().to_string(),
                    r.policy.permission.clone(),
                )
            })
            .collect();
        rows.sort();
        rows
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 锁定注册（ToolInvoker 首次调用时触发）
    pub fn lock(&self) {
        if !self.locked.swap(true, Ordering::SeqCst) {
            tracing::debug!("tool registry locked");
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// 显式重新开放注册；调用方须保证此时没有计划在执行
    pub fn reopen(&self) {
        self.locked.store(false, Ordering::SeqCst);
        tracing::warn!("tool registry reopened for registration");
    }
}
