//! 执行计划类型定义
//!
//! 定义执行计划、步骤、策略、错误策略、条件谓词以及单步 / 整体执行结果。
//! ExecutionPlan 与 PlanResult 均可直接序列化为 JSON（camelCase 字段）。

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ToolFailure;
use crate::trace::TraceSpan;

pub type StepId = String;

/// 调度策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// 按列表顺序逐个执行
    #[default]
    Sequential,
    /// 依赖驱动的并发调度
    Parallel,
    /// 逐个执行，条件为假的步骤直接跳过
    Conditional,
    /// 逐个执行，可重试的失败按指数退避重试
    Retry,
}

impl Strategy {
    /// 是否同一时刻只允许一个步骤在途
    pub fn is_serial(self) -> bool {
        !matches!(self, Strategy::Parallel)
    }
}

/// 失败处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// 首个失败即终止整个计划，未开始的步骤全部跳过
    #[default]
    Abort,
    /// 记录失败，依赖它的步骤跳过，独立分支继续
    Skip,
    /// 先尝试步骤的备用工具一次，仍失败则按 skip 处理
    Fallback,
}

/// 条件谓词（可序列化的条件定义），引用的步骤视为隐式依赖
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepCondition {
    /// 指定步骤成功
    Succeeded(StepId),
    /// 指定步骤失败
    Failed(StepId),
    /// 指定步骤被跳过
    Skipped(StepId),
    /// 指定步骤输出（JSON 文本）包含给定文本
    OutputContains { step: StepId, text: String },
    /// 指定步骤输出在 JSON pointer 处等于给定值
    OutputEquals {
        step: StepId,
        pointer: String,
        value: Value,
    },
    All(Vec<StepCondition>),
    Any(Vec<StepCondition>),
    Not(Box<StepCondition>),
}

impl StepCondition {
    /// 条件中引用的全部步骤
    pub fn referenced_steps(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            StepCondition::Succeeded(id)
            | StepCondition::Failed(id)
            | StepCondition::Skipped(id) => out.push(id),
            StepCondition::OutputContains { step, .. } | StepCondition::OutputEquals { step, .. } => {
                out.push(step)
            }
            StepCondition::All(items) | StepCondition::Any(items) => {
                for item in items {
                    item.collect_refs(out);
                }
            }
            StepCondition::Not(inner) => inner.collect_refs(out),
        }
    }

    /// 针对已有结果求值；lookup 返回引用步骤的结果
    pub fn evaluate<'a>(&self, lookup: &impl Fn(&str) -> Option<&'a InvocationResult>) -> bool {
        match self {
            StepCondition::Succeeded(id) => {
                lookup(id).is_some_and(|r| r.status == StepStatus::Success)
            }
            StepCondition::Failed(id) => lookup(id).is_some_and(|r| r.status == StepStatus::Failed),
            StepCondition::Skipped(id) => {
                lookup(id).is_some_and(|r| r.status == StepStatus::Skipped)
            }
            StepCondition::OutputContains { step, text } => lookup(step)
                .and_then(|r| r.output.as_ref())
                .is_some_and(|out| match out {
                    Value::String(s) => s.contains(text.as_str()),
                    other => other.to_string().contains(text.as_str()),
                }),
            StepCondition::OutputEquals {
                step,
                pointer,
                value,
            } => lookup(step)
                .and_then(|r| r.output.as_ref())
                .and_then(|out| out.pointer(pointer))
                .is_some_and(|v| v == value),
            StepCondition::All(items) => items.iter().all(|c| c.evaluate(lookup)),
            StepCondition::Any(items) => items.iter().any(|c| c.evaluate(lookup)),
            StepCondition::Not(inner) => !inner.evaluate(lookup),
        }
    }
}

/// 失败时的备用调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FallbackSpec {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// 重试参数：第 n 次失败后等待 min(base × 2^(n-1), max)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryConfig {
    /// 第 attempt 次（从 1 开始）失败后的退避时长
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        std::time::Duration::from_millis(delay)
    }
}

impl From<&crate::config::RetrySection> for RetryConfig {
    fn from(section: &crate::config::RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            base_delay_ms: section.base_delay_ms,
            max_delay_ms: section.max_delay_ms,
        }
    }
}

/// 计划中的一个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStep {
    pub id: StepId,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_policy: Option<ErrorPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// 单次调用超时，覆盖工具注册的默认值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ExecutionStep {
    pub fn new(id: impl Into<StepId>, tool: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            args,
            dependencies: Vec::new(),
            error_policy: None,
            condition: None,
            fallback: None,
            retry: None,
            timeout_ms: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    /// 显式依赖 + 条件引用的步骤
    pub fn all_dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = self.dependencies.iter().map(String::as_str).collect();
        if let Some(cond) = &self.condition {
            for id in cond.referenced_steps() {
                if !deps.contains(&id) {
                    deps.push(id);
                }
            }
        }
        deps
    }
}

/// 执行计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    #[serde(default)]
    pub name: String,
    pub steps: Vec<ExecutionStep>,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
    /// 整个计划的截止时长
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// retry 策略使用的重试参数（缺省时取配置）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

impl ExecutionPlan {
    pub fn step(&self, id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn tools(&self) -> Vec<&str> {
        let mut tools: Vec<&str> = Vec::new();
        for step in &self.steps {
            for tool in std::iter::once(step.tool.as_str())
                .chain(step.fallback.as_ref().map(|f| f.tool.as_str()))
            {
                if !tools.contains(&tool) {
                    tools.push(tool);
                }
            }
        }
        tools
    }
}

/// 单步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Failed | StepStatus::Skipped)
    }
}

/// 跳过原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    /// 条件为假
    ConditionFalse,
    /// 依赖步骤未成功
    DependencyUnsatisfied { step: StepId },
    /// 计划已终止
    Aborted,
}

/// 单步执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResult {
    pub step_id: StepId,
    pub tool: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// 实际调用次数（含重试；跳过为 0）
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub fallback_used: bool,
    /// 结果来自合并的在途调用
    #[serde(default)]
    pub deduplicated: bool,
}

impl InvocationResult {
    pub fn skipped(step_id: impl Into<StepId>, tool: impl Into<String>, reason: SkipReason) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            tool: tool.into(),
            status: StepStatus::Skipped,
            output: None,
            error: None,
            skip_reason: Some(reason),
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            attempts: 0,
            fallback_used: false,
            deduplicated: false,
        }
    }

    /// 未进入 handler 即失败（如子上下文创建失败）
    pub fn failed_now(step_id: impl Into<StepId>, failure: ToolFailure) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            tool: failure.tool.clone(),
            status: StepStatus::Failed,
            output: None,
            error: Some(failure),
            skip_reason: None,
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            attempts: 0,
            fallback_used: false,
            deduplicated: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    pub fn failure_kind(&self) -> Option<crate::core::FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// 计划整体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    /// 全部成功或按条件跳过
    Success,
    /// 有失败被错误策略吸收，或由备用工具恢复
    Partial,
    /// 触发 abort、计划超时
    Failed,
}

/// 计划执行结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResult {
    pub plan: String,
    pub correlation_id: String,
    pub overall_status: OverallStatus,
    /// 按计划顺序排列的单步结果
    pub results: Vec<InvocationResult>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub trace: Vec<TraceSpan>,
}

impl PlanResult {
    pub fn result(&self, step_id: &str) -> Option<&InvocationResult> {
        self.results.iter().find(|r| r.step_id == step_id)
    }

    pub fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.result(step_id).map(|r| r.status)
    }

    pub fn is_success(&self) -> bool {
        self.overall_status == OverallStatus::Success
    }
}
