//! 编排门面：对外暴露 create_context / invoke_tool / run_plan 与命名模板
//!
//! 负责按配置装配 Registry、TraceLogger、ContextManager、ToolInvoker 与 ExecutionController，
//! 所有组件显式构造、以 Arc 共享，不存在全局单例。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use crate::config::{load_config, OrchestratorConfig};
use crate::context::{A2AContext, ContextManager};
use crate::core::A2AError;
use crate::tools::{InvocationOptions, ToolHandler, ToolInvoker, ToolPolicy, ToolRegistry};
use crate::trace::TraceLogger;
use crate::workflow::{
    ErrorPolicy, ExecutionController, ExecutionPlan, ExecutionStep, InvocationResult, PlanGraph,
    PlanResult, RetryConfig, Strategy,
};

pub const QUALITY_AUDIT: &str = "quality-audit";
pub const SECURITY_SCAN: &str = "security-scan";

/// 编排器：一个进程通常只构造一次，以引用传给需要的地方
pub struct AgentOrchestrator {
    config: OrchestratorConfig,
    registry: Arc<ToolRegistry>,
    trace: Arc<TraceLogger>,
    contexts: ContextManager,
    invoker: ToolInvoker,
    controller: ExecutionController,
    templates: RwLock<BTreeMap<String, ExecutionPlan>>,
}

impl AgentOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let registry = Arc::new(ToolRegistry::new());
        let trace = Arc::new(TraceLogger::with_capacity(config.trace.capacity()));
        let contexts = ContextManager::new(&config.context, Arc::clone(&trace));
        let invoker = ToolInvoker::new(Arc::clone(&registry), Arc::clone(&trace), &config.invoker);
        let controller = ExecutionController::new(
            invoker.clone(),
            contexts.clone(),
            RetryConfig::from(&config.retry),
        );
        let templates = builtin_templates()
            .into_iter()
            .map(|plan| (plan.name.clone(), plan))
            .collect();

        tracing::info!(
            max_depth = config.context.max_depth,
            default_timeout_ms = config.invoker.default_timeout_ms,
            dedup = config.invoker.dedup,
            "orchestrator initialized"
        );
        Self {
            config,
            registry,
            trace,
            contexts,
            invoker,
            controller,
            templates: RwLock::new(templates),
        }
    }

    /// 从配置文件（可选）与环境变量构造
    pub fn from_config_file(path: Option<PathBuf>) -> Result<Self, A2AError> {
        Ok(Self::new(load_config(path)?))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn trace(&self) -> &Arc<TraceLogger> {
        &self.trace
    }

    pub fn contexts(&self) -> &ContextManager {
        &self.contexts
    }

    pub fn invoker(&self) -> &ToolInvoker {
        &self.invoker
    }

    pub fn controller(&self) -> &ExecutionController {
        &self.controller
    }

    pub fn register_tool(
        &self,
        name: impl Into<String>,
        handler: impl ToolHandler + 'static,
        policy: ToolPolicy,
    ) -> Result<(), A2AError> {
        self.registry.register(name, handler, policy)
    }

    pub fn create_context(&self, parent: Option<&A2AContext>) -> Result<A2AContext, A2AError> {
        self.contexts.create_context(parent)
    }

    pub fn create_root_with(&self, caller: impl Into<String>, permissions: Vec<String>) -> A2AContext {
        self.contexts.create_root_with(caller, permissions)
    }

    pub async fn invoke_tool(
        &self,
        name: &str,
        args: Value,
        ctx: &A2AContext,
        options: InvocationOptions,
    ) -> InvocationResult {
        self.invoker.invoke(name, args, ctx, options).await
    }

    pub fn validate_plan(&self, plan: &ExecutionPlan) -> Result<(), A2AError> {
        PlanGraph::build(plan).map(|_| ())
    }

    pub async fn run_plan(
        &self,
        plan: &ExecutionPlan,
        root: &A2AContext,
    ) -> Result<PlanResult, A2AError> {
        self.controller.run_plan(plan, root).await
    }

    pub fn template(&self, name: &str) -> Option<ExecutionPlan> {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn template_names(&self) -> Vec<String> {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// 注册模板（与调用方提交的计划走同一校验）
    pub fn register_template(&self, plan: ExecutionPlan) -> Result<(), A2AError> {
        if plan.name.trim().is_empty() {
            return Err(A2AError::InvalidPlan("template name must not be empty".to_string()));
        }
        PlanGraph::build(&plan)?;
        let mut templates = self.templates.write().unwrap_or_else(PoisonError::into_inner);
        if templates.contains_key(&plan.name) {
            return Err(A2AError::InvalidPlan(format!(
                "template '{}' already registered",
                plan.name
            )));
        }
        tracing::info!(template = %plan.name, steps = plan.steps.len(), "template registered");
        templates.insert(plan.name.clone(), plan);
        Ok(())
    }

    /// 所用工具全部以该权限注册的模板
    pub fn templates_for_permission(&self, permission: &str) -> Vec<String> {
        let tools = self.registry.list_by_permission(permission);
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|plan| plan.tools().iter().all(|t| tools.iter().any(|name| name == t)))
            .map(|plan| plan.name.clone())
            .collect()
    }

    /// 运行模板；input 为对象时合并进每个步骤的参数（同名键以 input 为准）
    pub async fn run_template(
        &self,
        name: &str,
        input: Value,
        root: &A2AContext,
    ) -> Result<PlanResult, A2AError> {
        let mut plan = self
            .template(name)
            .ok_or_else(|| A2AError::UnknownTemplate(name.to_string()))?;
        if let Value::Object(input) = input {
            for step in &mut plan.steps {
                merge_args(&mut step.args, &input);
            }
        }
        self.run_plan(&plan, root).await
    }
}

fn merge_args(args: &mut Value, input: &serde_json::Map<String, Value>) {
    match args {
        Value::Object(map) => {
            for (k, v) in input {
                map.insert(k.clone(), v.clone());
            }
        }
        other => *other = Value::Object(input.clone()),
    }
}

/// 内置模板：质量审计（并发，失败跳过）与安全扫描（顺序，失败终止）
pub fn builtin_templates() -> Vec<ExecutionPlan> {
    vec![
        ExecutionPlan {
            name: QUALITY_AUDIT.to_string(),
            steps: vec![
                ExecutionStep::new("lint", "code-lint", Value::Null),
                ExecutionStep::new("complexity", "complexity-analyze", Value::Null),
                ExecutionStep::new("coverage", "test-coverage", Value::Null),
                ExecutionStep::new("report", "quality-report", Value::Null)
                    .depends_on(["lint", "complexity", "coverage"]),
            ],
            strategy: Strategy::Parallel,
            error_policy: ErrorPolicy::Skip,
            timeout_ms: None,
            retry: None,
        },
        ExecutionPlan {
            name: SECURITY_SCAN.to_string(),
            steps: vec![
                ExecutionStep::new("dependencies", "dependency-audit", Value::Null),
                ExecutionStep::new("secrets", "secret-scan", Value::Null)
                    .depends_on(["dependencies"]),
                ExecutionStep::new("static-analysis", "static-analysis", Value::Null)
                    .depends_on(["secrets"]),
                ExecutionStep::new("report", "security-report", Value::Null)
                    .depends_on(["static-analysis"]),
            ],
            strategy: Strategy::Sequential,
            error_policy: ErrorPolicy::Abort,
            timeout_ms: None,
            retry: None,
        },
    ]
}
