//! 常用异步编排模式：map-reduce、pipeline、fan-out
//!
//! 都是 ToolInvoker / ExecutionController 之上的薄封装，本身不持有状态。

use serde::Serialize;
use serde_json::Value;

use crate::context::A2AContext;
use crate::core::{A2AError, ToolFailure};
use crate::tools::{InvocationOptions, ToolInvoker};
use crate::workflow::engine::ExecutionController;
use crate::workflow::types::*;

/// map 阶段单个元素的失败
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub index: usize,
    pub item: Value,
    pub failure: ToolFailure,
}

/// map-reduce 结果：归约值与失败列表并列返回
#[derive(Debug, Clone, Serialize)]
pub struct MapReduceOutcome<R> {
    pub value: R,
    pub failures: Vec<ItemFailure>,
}

impl<R> MapReduceOutcome<R> {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// 对每个元素并发调用同一工具（并发度受该工具的 max_concurrency 限制），
/// 成功的输出按元素顺序交给 reduce，失败单独收集
pub async fn map_reduce<R>(
    invoker: &ToolInvoker,
    items: Vec<Value>,
    tool: &str,
    context_factory: impl Fn(usize) -> A2AContext,
    reduce: impl FnOnce(Vec<Value>) -> R,
) -> MapReduceOutcome<R> {
    tracing::debug!(tool = %tool, items = items.len(), "map-reduce started");
    let calls: Vec<_> = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let ctx = context_factory(i);
            invoker.invoke(
                tool,
                item.clone(),
                &ctx,
                InvocationOptions::default().for_step(format!("{tool}[{i}]")),
            )
        })
        .collect();
    let results = futures_util::future::join_all(calls).await;

    let mut outputs = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    for ((index, item), result) in items.into_iter().enumerate().zip(results) {
        match (result.output, result.error) {
            (Some(output), None) => outputs.push(output),
            (_, error) => failures.push(ItemFailure {
                index,
                item,
                failure: error.unwrap_or_else(|| {
                    ToolFailure::new(
                        crate::core::FailureKind::ToolError,
                        tool,
                        "no output produced",
                    )
                }),
            }),
        }
    }
    if !failures.is_empty() {
        tracing::warn!(tool = %tool, failed = failures.len(), "map-reduce finished with failures");
    }

    MapReduceOutcome {
        value: reduce(outputs),
        failures,
    }
}

/// 把步骤串成 sequential 计划：每步依赖前一步
pub fn pipeline_plan(name: impl Into<String>, steps: Vec<ExecutionStep>) -> ExecutionPlan {
    let mut previous: Option<StepId> = None;
    let steps = steps
        .into_iter()
        .map(|mut step| {
            if let Some(prev) = previous.replace(step.id.clone()) {
                if !step.dependencies.contains(&prev) {
                    step.dependencies.push(prev);
                }
            }
            step
        })
        .collect();
    ExecutionPlan {
        name: name.into(),
        steps,
        strategy: Strategy::Sequential,
        error_policy: ErrorPolicy::Abort,
        timeout_ms: None,
        retry: None,
    }
}

/// 以 pipeline 方式执行一组步骤
pub async fn pipeline(
    controller: &ExecutionController,
    name: impl Into<String>,
    steps: Vec<ExecutionStep>,
    root: &A2AContext,
) -> Result<PlanResult, A2AError> {
    let plan = pipeline_plan(name, steps);
    controller.run_plan(&plan, root).await
}

/// 并发调用一组（可不同的）工具，结果按输入顺序返回
pub async fn fan_out(
    invoker: &ToolInvoker,
    calls: Vec<(String, Value)>,
    ctx: &A2AContext,
) -> Vec<InvocationResult> {
    let futures: Vec<_> = calls
        .into_iter()
        .map(|(tool, args)| invoker.invoke(&tool, args, ctx, InvocationOptions::default()))
        .collect();
    futures_util::future::join_all(futures).await
}
