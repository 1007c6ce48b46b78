//! 工具调用器：所有工具调用的唯一入口
//!
//! 依次执行：查找注册 → 权限校验 → 在途去重 → 并发闸门 → 超时 → 记录 span → 错误归一化。
//! 超时从进入执行开始计算，覆盖排队等待并发许可的时间。handler 在独立任务中运行；超时后调用器不再等待并判定 Timeout，
//! handler 本身被放弃而非强制取消，其后续结果丢弃，并发许可在 handler 真正结束时归还。
//! 每次调用输出结构化审计日志（JSON）；调用方中途放弃的调用同样留下一条 span。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde_json::Value;

use crate::config::InvokerSection;
use crate::context::A2AContext;
use crate::core::{FailureKind, ToolFailure};
use crate::tools::dedup::{fingerprint, InFlight};
use crate::tools::gate::ConcurrencyGate;
use crate::tools::registry::{ToolRegistration, ToolRegistry};
use crate::trace::{SpanStatus, TraceLogger, TraceSpan};
use crate::workflow::types::{InvocationResult, StepStatus};

/// 单次调用选项
#[derive(Debug, Clone, Default)]
pub struct InvocationOptions {
    /// 覆盖注册策略与全局默认的超时
    ///
    /// 合并到在途调用时，handler 的执行超时由首个调用者决定；后加入者以自己的超时限制等待时间，
    /// 到期即得到自己的 Timeout，不影响其他调用者。
    pub timeout: Option<Duration>,
    /// 所属步骤（计划外调用默认用工具名）
    pub step_id: Option<String>,
    /// 为 false 时跳过在途去重
    pub dedup: Option<bool>,
}

impl InvocationOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn without_dedup(mut self) -> Self {
        self.dedup = Some(false);
        self
    }
}

/// 一次 handler 执行的结果，在合并的调用者之间共享
#[derive(Debug, Clone)]
struct CallOutcome {
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    result: Result<Value, ToolFailure>,
}

impl CallOutcome {
    fn failed_now(failure: ToolFailure) -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            ended_at: now,
            result: Err(failure),
        }
    }
}

/// 待写入的 span；调用完成时以真实结果记录，未完成即被丢弃时记为 Timeout
struct SpanGuard {
    trace: Arc<TraceLogger>,
    pending: Option<TraceSpan>,
}

impl SpanGuard {
    fn new(
        trace: Arc<TraceLogger>,
        sequence: u64,
        ctx: &A2AContext,
        tool: &str,
        step_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let pending = TraceSpan {
            sequence,
            correlation_id: ctx.correlation_id().to_string(),
            step_id,
            tool: tool.to_string(),
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            status: SpanStatus::Failed,
            failure: Some(FailureKind::Timeout),
            depth: ctx.depth(),
            deduplicated: false,
        };
        Self {
            trace,
            pending: Some(pending),
        }
    }

    fn record(mut self, outcome: &CallOutcome, deduplicated: bool) {
        if let Some(mut span) = self.pending.take() {
            span.started_at = outcome.started_at;
            span.ended_at = outcome.ended_at;
            span.duration_ms = duration_ms(outcome.started_at, outcome.ended_at);
            match &outcome.result {
                Ok(_) => {
                    span.status = SpanStatus::Success;
                    span.failure = None;
                }
                Err(failure) => span.failure = Some(failure.kind),
            }
            span.deduplicated = deduplicated;
            self.trace.record_span(span);
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(mut span) = self.pending.take() {
            span.ended_at = Utc::now();
            span.duration_ms = duration_ms(span.started_at, span.ended_at);
            tracing::debug!(
                tool = %span.tool,
                step = span.step_label(),
                sequence = span.sequence,
                "invocation abandoned before completion"
            );
            self.trace.record_span(span);
        }
    }
}

struct InvokerInner {
    registry: Arc<ToolRegistry>,
    trace: Arc<TraceLogger>,
    gate: ConcurrencyGate,
    inflight: InFlight<CallOutcome>,
    default_timeout: Duration,
    dedup: bool,
}

/// 工具调用器（克隆廉价，内部共享状态）
#[derive(Clone)]
pub struct ToolInvoker {
    inner: Arc<InvokerInner>,
}

impl ToolInvoker {
    pub fn new(registry: Arc<ToolRegistry>, trace: Arc<TraceLogger>, config: &InvokerSection) -> Self {
        Self {
            inner: Arc::new(InvokerInner {
                registry,
                trace,
                gate: ConcurrencyGate::new(),
                inflight: InFlight::new(),
                default_timeout: config.default_timeout(),
                dedup: config.dedup,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.inner.registry
    }

    pub fn trace(&self) -> &Arc<TraceLogger> {
        &self.inner.trace
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// 当前在途（未完成）的去重调用数
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.in_flight()
    }

    /// 调用工具；派发序号在此同步分配，保证 span 顺序与调用顺序一致
    ///
    /// 返回的 future 未完成即被丢弃时，仍会记录一条 Timeout span。
    pub fn invoke(
        &self,
        name: &str,
        args: Value,
        ctx: &A2AContext,
        options: InvocationOptions,
    ) -> impl Future<Output = InvocationResult> + Send + 'static {
        let sequence = self.inner.trace.next_sequence();
        let span = SpanGuard::new(
            Arc::clone(&self.inner.trace),
            sequence,
            ctx,
            name,
            options.step_id.clone(),
        );
        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        let ctx = ctx.clone();
        async move { inner.invoke(span, name, args, ctx, options).await }
    }
}

impl InvokerInner {
    async fn invoke(
        self: Arc<Self>,
        span: SpanGuard,
        name: String,
        args: Value,
        ctx: A2AContext,
        options: InvocationOptions,
    ) -> InvocationResult {
        self.registry.lock();
        let step_id = options.step_id.clone().unwrap_or_else(|| name.clone());

        let (outcome, deduplicated) = match self.registry.lookup(&name) {
            Err(err) => (
                CallOutcome::failed_now(ToolFailure::from_error(&name, &err)),
                false,
            ),
            Ok(reg) if !ctx.allows(&reg.policy.permission) => (
                CallOutcome::failed_now(ToolFailure::new(
                    FailureKind::PermissionDenied,
                    &name,
                    format!(
                        "caller '{}' lacks permission '{}'",
                        ctx.caller(),
                        reg.policy.permission
                    ),
                )),
                false,
            ),
            Ok(reg) => {
                let timeout = options
                    .timeout
                    .or(reg.policy.default_timeout)
                    .unwrap_or(self.default_timeout);
                if options.dedup.unwrap_or(self.dedup) {
                    Self::invoke_shared(&self, reg, &name, &step_id, args, &ctx, timeout).await
                } else {
                    (
                        Arc::clone(&self)
                            .execute(reg, args, ctx.clone(), timeout, None)
                            .await,
                        false,
                    )
                }
            }
        };

        span.record(&outcome, deduplicated);

        let (status, output, error) = match outcome.result {
            Ok(value) => (StepStatus::Success, Some(value), None),
            Err(failure) => (StepStatus::Failed, None, Some(failure)),
        };
        InvocationResult {
            step_id,
            tool: name,
            status,
            output,
            error,
            skip_reason: None,
            started_at: outcome.started_at,
            ended_at: outcome.ended_at,
            duration_ms: duration_ms(outcome.started_at, outcome.ended_at),
            attempts: 1,
            fallback_used: false,
            deduplicated,
        }
    }

    /// 去重路径：首个调用者在独立任务中执行并在结束时移出在途表，后加入者以自己的超时等待共享结果
    async fn invoke_shared(
        this: &Arc<Self>,
        reg: Arc<ToolRegistration>,
        name: &str,
        step_id: &str,
        args: Value,
        ctx: &A2AContext,
        timeout: Duration,
    ) -> (CallOutcome, bool) {
        let key = fingerprint(&ctx.dedup_scope(), name, &args);
        let (call, leader) = this.inflight.join_or_start(&key, |id| {
            let task = tokio::spawn(Arc::clone(this).execute(
                reg,
                args,
                ctx.clone(),
                timeout,
                Some((key.clone(), id)),
            ));
            let tool = name.to_string();
            async move {
                task.await.unwrap_or_else(|err| {
                    CallOutcome::failed_now(ToolFailure::new(
                        FailureKind::ToolError,
                        &tool,
                        format!("invocation task failed: {err}"),
                    ))
                })
            }
            .boxed()
        });
        if leader {
            return (call.await, false);
        }

        tracing::debug!(tool = %name, step = %step_id, "joined in-flight call");
        let joined_at = Utc::now();
        match tokio::time::timeout(timeout, call).await {
            Ok(outcome) => (outcome, true),
            Err(_) => (
                CallOutcome {
                    started_at: joined_at,
                    ended_at: Utc::now(),
                    result: Err(timed_out(name, timeout, "no shared result")),
                },
                true,
            ),
        }
    }

    /// 实际执行 handler 并写审计日志；dedup_key 为在途表中的 (键, 代号)
    async fn execute(
        self: Arc<Self>,
        reg: Arc<ToolRegistration>,
        args: Value,
        ctx: A2AContext,
        timeout: Duration,
        dedup_key: Option<(String, u64)>,
    ) -> CallOutcome {
        let args_preview = args_preview(&args);
        let started_at = Utc::now();
        let (result, outcome) = self.run_handler(&reg, args, ctx, timeout).await;
        let ended_at = Utc::now();

        if let Some((key, id)) = dedup_key {
            self.inflight.finish(&key, id);
        }

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": reg.name,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": duration_ms(started_at, ended_at),
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        CallOutcome {
            started_at,
            ended_at,
            result,
        }
    }

    /// 闸门 → 独立任务 → 超时竞争，排队与执行共用同一截止时间
    async fn run_handler(
        &self,
        reg: &ToolRegistration,
        args: Value,
        ctx: A2AContext,
        timeout: Duration,
    ) -> (Result<Value, ToolFailure>, &'static str) {
        let deadline = tokio::time::Instant::now() + timeout;
        let acquire = self.gate.acquire(&reg.name, reg.policy.max_concurrency);
        let Ok(permit) = tokio::time::timeout_at(deadline, acquire).await else {
            tracing::warn!(tool = %reg.name, timeout_ms = timeout.as_millis() as u64, "tool timed out waiting for a concurrency slot");
            return (
                Err(timed_out(&reg.name, timeout, "no concurrency slot")),
                "timeout",
            );
        };

        let handler = Arc::clone(&reg.handler);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            handler.call(args, ctx).await
        });

        match tokio::time::timeout_at(deadline, handle).await {
            Ok(Ok(Ok(value))) => (Ok(value), "ok"),
            Ok(Ok(Err(message))) => (
                Err(ToolFailure::new(FailureKind::ToolError, &reg.name, message)),
                "error",
            ),
            Ok(Err(join_err)) => {
                let message = if join_err.is_panic() {
                    "handler panicked".to_string()
                } else {
                    format!("handler task aborted: {join_err}")
                };
                (
                    Err(ToolFailure::new(FailureKind::ToolError, &reg.name, message)),
                    "error",
                )
            }
            Err(_) => {
                tracing::warn!(tool = %reg.name, timeout_ms = timeout.as_millis() as u64, "tool timed out, handler abandoned");
                (Err(timed_out(&reg.name, timeout, "no result")), "timeout")
            }
        }
    }
}

fn timed_out(tool: &str, timeout: Duration, what: &str) -> ToolFailure {
    ToolFailure::new(
        FailureKind::Timeout,
        tool,
        format!("{what} within {}ms", timeout.as_millis()),
    )
}

fn duration_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
