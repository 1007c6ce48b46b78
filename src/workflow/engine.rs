//! 执行计划引擎
//!
//! ExecutionController 把一份声明式计划驱动到所有步骤终结：每步状态只会沿
//! pending → running → {success, failed, skipped} 前进。同时就绪的步骤按计划顺序派发；
//! parallel 策略并发执行全部就绪步骤，其余策略同一时刻只有一个步骤在途。
//! 失败按步骤 / 计划的错误策略处理（abort / skip / fallback），可重试的失败按指数退避重试。

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;

use crate::context::{A2AContext, ContextManager};
use crate::core::{A2AError, FailureKind, ToolFailure};
use crate::tools::{InvocationOptions, ToolInvoker};
use crate::workflow::graph::PlanGraph;
use crate::workflow::types::*;

/// 执行计划控制器
#[derive(Clone)]
pub struct ExecutionController {
    invoker: ToolInvoker,
    contexts: ContextManager,
    default_retry: RetryConfig,
}

impl ExecutionController {
    pub fn new(invoker: ToolInvoker, contexts: ContextManager, default_retry: RetryConfig) -> Self {
        Self {
            invoker,
            contexts,
            default_retry,
        }
    }

    pub fn invoker(&self) -> &ToolInvoker {
        &self.invoker
    }

    /// 校验计划（无环、引用的步骤存在），返回依赖图
    pub fn validate(&self, plan: &ExecutionPlan) -> Result<PlanGraph, A2AError> {
        PlanGraph::build(plan)
    }

    /// 执行计划；计划非法时在任何步骤执行前返回 Err
    pub async fn run_plan(
        &self,
        plan: &ExecutionPlan,
        root: &A2AContext,
    ) -> Result<PlanResult, A2AError> {
        let graph = self.validate(plan)?;
        let trace_floor = self.invoker.trace().next_sequence();
        let started_at = Utc::now();
        let n = plan.steps.len();

        tracing::info!(
            plan = %plan.name,
            correlation_id = %root.correlation_id(),
            strategy = ?plan.strategy,
            steps = n,
            "plan started"
        );
        root.log(
            None,
            format!("plan '{}' started ({:?}, {} steps)", plan.name, plan.strategy, n),
        );

        let mut states = vec![StepStatus::Pending; n];
        let mut results: Vec<Option<InvocationResult>> = vec![None; n];
        let mut aborted = false;
        let mut deadline_hit = false;
        let deadline = plan
            .timeout_ms
            .map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));
        let mut in_flight = FuturesUnordered::new();

        loop {
            // 跳过会让后继步骤就绪，重复扫描直到本轮没有新的跳过
            while !aborted {
                let mut skipped_any = false;
                for i in graph.ready(&states) {
                    if plan.strategy.is_serial() && !in_flight.is_empty() {
                        break;
                    }
                    let step = &plan.steps[i];

                    if let Some(dep) = unsatisfied_dependency(step, &graph, &states) {
                        tracing::debug!(step = %step.id, dependency = %dep, "dependency unsatisfied, skipping");
                        root.log(Some(&step.id), format!("skipped: dependency '{dep}' not satisfied"));
                        results[i] = Some(InvocationResult::skipped(
                            &step.id,
                            &step.tool,
                            SkipReason::DependencyUnsatisfied { step: dep },
                        ));
                        states[i] = StepStatus::Skipped;
                        skipped_any = true;
                        continue;
                    }

                    if let Some(cond) = &step.condition {
                        if !condition_holds(cond, &graph, &results) {
                            tracing::debug!(step = %step.id, "condition false, skipping");
                            root.log(Some(&step.id), "skipped: condition evaluated false");
                            results[i] = Some(InvocationResult::skipped(
                                &step.id,
                                &step.tool,
                                SkipReason::ConditionFalse,
                            ));
                            states[i] = StepStatus::Skipped;
                            skipped_any = true;
                            continue;
                        }
                    }

                    tracing::debug!(step = %step.id, tool = %step.tool, "step dispatched");
                    states[i] = StepStatus::Running;
                    in_flight.push(self.run_step(plan, step, root).map(move |r| (i, r)));
                }
                if !skipped_any {
                    break;
                }
            }

            if in_flight.is_empty() {
                break;
            }

            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, in_flight.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        deadline_hit = true;
                        break;
                    }
                },
                None => in_flight.next().await,
            };
            let Some((i, result)) = next else {
                break;
            };

            let step = &plan.steps[i];
            states[i] = result.status;
            if result.status == StepStatus::Failed {
                let policy = step.error_policy.unwrap_or(plan.error_policy);
                if policy == ErrorPolicy::Abort {
                    tracing::warn!(
                        plan = %plan.name,
                        step = %step.id,
                        error = ?result.error,
                        "step failed, aborting plan"
                    );
                    root.log(Some(&step.id), "step failed, plan aborted");
                    aborted = true;
                } else {
                    tracing::warn!(
                        plan = %plan.name,
                        step = %step.id,
                        policy = ?policy,
                        error = ?result.error,
                        "step failed, continuing"
                    );
                }
            }
            results[i] = Some(result);
        }

        // 截止时间到：在途步骤判定超时（其 handler 被放弃，未完成的调用在 drop 时补记 span），计划终止
        drop(in_flight);
        if deadline_hit {
            let limit = plan.timeout_ms.unwrap_or_default();
            tracing::warn!(plan = %plan.name, timeout_ms = limit, "plan deadline exceeded");
            root.log(None, format!("plan deadline of {limit}ms exceeded"));
            for (i, state) in states.iter_mut().enumerate() {
                if *state == StepStatus::Running {
                    let step = &plan.steps[i];
                    results[i] = Some(InvocationResult::failed_now(
                        &step.id,
                        ToolFailure::new(
                            FailureKind::Timeout,
                            &step.tool,
                            format!("plan deadline of {limit}ms exceeded"),
                        ),
                    ));
                    *state = StepStatus::Failed;
                }
            }
            aborted = true;
        }

        let results: Vec<InvocationResult> = results
            .into_iter()
            .zip(&plan.steps)
            .map(|(r, step)| {
                r.unwrap_or_else(|| {
                    InvocationResult::skipped(&step.id, &step.tool, SkipReason::Aborted)
                })
            })
            .collect();

        let overall_status = if aborted {
            OverallStatus::Failed
        } else if results.iter().any(|r| {
            r.status == StepStatus::Failed
                || r.fallback_used
                || matches!(r.skip_reason, Some(SkipReason::DependencyUnsatisfied { .. }))
        }) {
            OverallStatus::Partial
        } else {
            OverallStatus::Success
        };

        let trace = self
            .invoker
            .trace()
            .spans_by_dispatch(root.correlation_id())
            .into_iter()
            .filter(|s| s.sequence > trace_floor)
            .collect();

        tracing::info!(
            plan = %plan.name,
            correlation_id = %root.correlation_id(),
            status = ?overall_status,
            "plan finished"
        );
        root.log(
            None,
            format!("plan '{}' finished: {:?}", plan.name, overall_status),
        );

        Ok(PlanResult {
            plan: plan.name.clone(),
            correlation_id: root.correlation_id().to_string(),
            overall_status,
            results,
            started_at,
            ended_at: Utc::now(),
            trace,
        })
    }

    /// 派发单个步骤：同步派生子上下文并发起首次调用（派发序号在此分配），
    /// 返回的 future 负责按需重试与备用工具
    fn run_step<'a>(
        &'a self,
        plan: &'a ExecutionPlan,
        step: &'a ExecutionStep,
        root: &A2AContext,
    ) -> impl Future<Output = InvocationResult> + 'a {
        let retry = step.retry.or_else(|| {
            (plan.strategy == Strategy::Retry).then(|| plan.retry.unwrap_or(self.default_retry))
        });
        let max_attempts = retry.map(|r| r.max_attempts.max(1)).unwrap_or(1);
        let options = InvocationOptions {
            timeout: step.timeout_ms.map(Duration::from_millis),
            step_id: Some(step.id.clone()),
            dedup: None,
        };
        let dispatched = self.contexts.create_context(Some(root)).map(|ctx| {
            ctx.log(Some(&step.id), format!("step started: {}", step.tool));
            let first = self
                .invoker
                .invoke(&step.tool, step.args.clone(), &ctx, options.clone());
            (ctx, first)
        });

        async move {
            let (ctx, first) = match dispatched {
                Ok(dispatched) => dispatched,
                Err(err) => {
                    return InvocationResult::failed_now(
                        &step.id,
                        ToolFailure::from_error(&step.tool, &err),
                    )
                }
            };

            let mut result = first.await;
            let first_started = result.started_at;
            let mut attempt = 1;
            while let Some(cfg) = retry {
                let Some(reason) = result
                    .error
                    .as_ref()
                    .filter(|f| f.kind.is_retryable())
                    .map(ToString::to_string)
                else {
                    break;
                };
                if attempt >= max_attempts {
                    break;
                }
                let delay = cfg.backoff(attempt);
                tracing::warn!(
                    step = %step.id,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "step failed, retrying"
                );
                ctx.log(
                    Some(&step.id),
                    format!("attempt {attempt} failed ({reason}), retrying in {}ms", delay.as_millis()),
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                result = self
                    .invoker
                    .invoke(&step.tool, step.args.clone(), &ctx, options.clone())
                    .await;
            }
            if attempt > 1 {
                result.started_at = first_started;
                result.duration_ms = duration_ms(&result);
            }
            result.attempts = attempt;

            let policy = step.error_policy.unwrap_or(plan.error_policy);
            if result.status == StepStatus::Failed && policy == ErrorPolicy::Fallback {
                if let Some(fallback) = &step.fallback {
                    tracing::warn!(step = %step.id, fallback = %fallback.tool, "step failed, trying fallback");
                    let alt = self
                        .invoker
                        .invoke(&fallback.tool, fallback.args.clone(), &ctx, options.clone())
                        .await;
                    result.attempts += 1;
                    result.ended_at = alt.ended_at;
                    result.duration_ms = duration_ms(&result);
                    if alt.is_success() {
                        ctx.log(Some(&step.id), format!("recovered by fallback '{}'", fallback.tool));
                        result.status = StepStatus::Success;
                        result.output = alt.output;
                        result.error = None;
                        result.fallback_used = true;
                    } else {
                        ctx.log(
                            Some(&step.id),
                            format!("fallback '{}' failed too", fallback.tool),
                        );
                    }
                }
            }

            ctx.log(Some(&step.id), format!("step finished: {:?}", result.status));
            result
        }
    }
}

fn duration_ms(result: &InvocationResult) -> u64 {
    (result.ended_at - result.started_at).num_milliseconds().max(0) as u64
}

/// 第一个未成功的显式依赖（条件引用的步骤只需终结，不要求成功）
fn unsatisfied_dependency(
    step: &ExecutionStep,
    graph: &PlanGraph,
    states: &[StepStatus],
) -> Option<StepId> {
    step.dependencies
        .iter()
        .find(|dep| {
            graph
                .index_of(dep)
                .is_some_and(|j| states[j] != StepStatus::Success)
        })
        .cloned()
}

fn condition_holds(
    cond: &StepCondition,
    graph: &PlanGraph,
    results: &[Option<InvocationResult>],
) -> bool {
    let lookup = |id: &str| graph.index_of(id).and_then(|j| results[j].as_ref());
    cond.evaluate(&lookup)
}
