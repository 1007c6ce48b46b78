//! 执行计划构建器
//!
//! 提供流畅的 API 来构建执行计划，build 时做完整校验（与执行前校验一致）

use serde_json::Value;

use crate::core::A2AError;
use crate::workflow::graph::PlanGraph;
use crate::workflow::types::*;

/// 执行计划构建器
pub struct PlanBuilder {
    name: String,
    strategy: Strategy,
    error_policy: ErrorPolicy,
    timeout_ms: Option<u64>,
    retry: Option<RetryConfig>,
    steps: Vec<ExecutionStep>,
    /// 引用了不存在步骤的修饰调用，build 时报错
    dangling: Vec<String>,
}

impl PlanBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            strategy: Strategy::default(),
            error_policy: ErrorPolicy::default(),
            timeout_ms: None,
            retry: None,
            steps: Vec::new(),
            dangling: Vec::new(),
        }
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// 整个计划的截止时长
    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// retry 策略的重试参数
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// 添加步骤（按添加顺序排列）
    pub fn step(mut self, id: impl Into<StepId>, tool: impl Into<String>, args: Value) -> Self {
        self.steps.push(ExecutionStep::new(id, tool, args));
        self
    }

    /// 添加已构造好的步骤
    pub fn push(mut self, step: ExecutionStep) -> Self {
        self.steps.push(step);
        self
    }

    /// 设置依赖（所有前置步骤成功后才执行）
    pub fn depends_on<I, S>(self, step_id: &str, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.modify(step_id, |step| {
            step.dependencies.extend(deps.into_iter().map(Into::into))
        })
    }

    /// 设置顺序依赖 from → to
    pub fn sequential(self, from: &str, to: &str) -> Self {
        let from = from.to_string();
        self.modify(to, |step| step.dependencies.push(from))
    }

    pub fn when(self, step_id: &str, condition: StepCondition) -> Self {
        self.modify(step_id, |step| step.condition = Some(condition))
    }

    pub fn on_error(self, step_id: &str, policy: ErrorPolicy) -> Self {
        self.modify(step_id, |step| step.error_policy = Some(policy))
    }

    /// 设置失败备用工具（同时把该步骤的错误策略设为 fallback）
    pub fn fallback(self, step_id: &str, tool: impl Into<String>, args: Value) -> Self {
        let fallback = FallbackSpec {
            tool: tool.into(),
            args,
        };
        self.modify(step_id, |step| {
            step.fallback = Some(fallback);
            step.error_policy = Some(ErrorPolicy::Fallback);
        })
    }

    pub fn step_retry(self, step_id: &str, retry: RetryConfig) -> Self {
        self.modify(step_id, |step| step.retry = Some(retry))
    }

    pub fn step_timeout_ms(self, step_id: &str, ms: u64) -> Self {
        self.modify(step_id, |step| step.timeout_ms = Some(ms))
    }

    fn modify(mut self, step_id: &str, f: impl FnOnce(&mut ExecutionStep)) -> Self {
        match self.steps.iter_mut().find(|s| s.id == step_id) {
            Some(step) => f(step),
            None => self.dangling.push(step_id.to_string()),
        }
        self
    }

    /// 构建执行计划
    pub fn build(self) -> Result<ExecutionPlan, A2AError> {
        if let Some(id) = self.dangling.first() {
            return Err(A2AError::InvalidPlan(format!(
                "step '{id}' configured before it was added"
            )));
        }
        let plan = ExecutionPlan {
            name: self.name,
            steps: self.steps,
            strategy: self.strategy,
            error_policy: self.error_policy,
            timeout_ms: self.timeout_ms,
            retry: self.retry,
        };
        PlanGraph::build(&plan)?;
        Ok(plan)
    }
}
