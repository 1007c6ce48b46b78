//! 调用链路追踪
//!
//! TraceLogger 以 correlation id 为键追加记录 span（每次工具调用一条）与上下文事件，只追加不修改；
//! 缓冲区有上限时淘汰最旧记录并累加 dropped 计数，绝不静默丢弃。
//! 提供按派发序排序、缩进树形时间线与 JSON 三种导出视图。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ContextEvent;
use crate::core::FailureKind;

/// span 的最终状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Success,
    Failed,
}

/// 单次工具调用的追踪记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSpan {
    /// 派发序号：invoke 被调用时分配，全局单调递增
    pub sequence: u64,
    pub correlation_id: String,
    /// 所属步骤；计划外的直接调用为 None（视作 root）
    pub step_id: Option<String>,
    pub tool: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: SpanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// 调用时上下文的嵌套深度
    pub depth: u32,
    /// 由合并的相同调用共享结果时为 true（未实际执行 handler）
    #[serde(default)]
    pub deduplicated: bool,
}

impl TraceSpan {
    pub fn step_label(&self) -> &str {
        self.step_id.as_deref().unwrap_or("root")
    }
}

#[derive(Default)]
struct TraceStore {
    spans: VecDeque<TraceSpan>,
    events: VecDeque<(String, ContextEvent)>,
    dropped_spans: u64,
    dropped_events: u64,
}

/// 追踪记录器（可在多个调用链之间共享）
pub struct TraceLogger {
    capacity: Option<usize>,
    next_sequence: AtomicU64,
    store: Mutex<TraceStore>,
}

impl Default for TraceLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceLogger {
    /// 不限容量
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// capacity 为 span 与事件各自的缓冲上限
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            next_sequence: AtomicU64::new(0),
            store: Mutex::new(TraceStore::default()),
        }
    }

    /// 分配下一个派发序号
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn store(&self) -> std::sync::MutexGuard<'_, TraceStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_span(&self, span: TraceSpan) {
        tracing::debug!(
            correlation_id = %span.correlation_id,
            sequence = span.sequence,
            step = span.step_label(),
            tool = %span.tool,
            status = ?span.status,
            duration_ms = span.duration_ms,
            "span recorded"
        );
        let mut store = self.store();
        if let Some(cap) = self.capacity.filter(|c| *c > 0) {
            while store.spans.len() >= cap {
                store.spans.pop_front();
                store.dropped_spans += 1;
            }
        }
        store.spans.push_back(span);
    }

    pub fn record_event(&self, correlation_id: &str, event: ContextEvent) {
        let mut store = self.store();
        if let Some(cap) = self.capacity.filter(|c| *c > 0) {
            while store.events.len() >= cap {
                store.events.pop_front();
                store.dropped_events += 1;
            }
        }
        store.events.push_back((correlation_id.to_string(), event));
    }

    /// 返回该 correlation id 的全部 span，按完成（追加）顺序
    ///
    /// 嵌套调用先于外层调用完成，因此子调用排在父调用之前；需要派发 / 因果顺序时用 `spans_by_dispatch`。
    pub fn export_trace(&self, correlation_id: &str) -> Vec<TraceSpan> {
        self.store()
            .spans
            .iter()
            .filter(|s| s.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    /// 按派发序返回 span；相同输入的并行计划多次运行得到相同顺序
    pub fn spans_by_dispatch(&self, correlation_id: &str) -> Vec<TraceSpan> {
        let mut spans = self.export_trace(correlation_id);
        spans.sort_by_key(|s| s.sequence);
        spans
    }

    pub fn export_events(&self, correlation_id: &str) -> Vec<ContextEvent> {
        self.store()
            .events
            .iter()
            .filter(|(id, _)| id == correlation_id)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn dropped_span_count(&self) -> u64 {
        self.store().dropped_spans
    }

    pub fn dropped_event_count(&self) -> u64 {
        self.store().dropped_events
    }

    pub fn span_count(&self) -> usize {
        self.store().spans.len()
    }

    /// 渲染缩进时间线：按派发序，每层深度缩进两格
    pub fn render_tree(&self, correlation_id: &str) -> String {
        let spans = self.spans_by_dispatch(correlation_id);
        let base = spans.iter().map(|s| s.depth).min().unwrap_or(0);
        let mut out = format!("trace {}\n", correlation_id);
        for span in &spans {
            let indent = "  ".repeat((span.depth - base) as usize + 1);
            let status = match (span.status, span.failure) {
                (SpanStatus::Success, _) => "ok".to_string(),
                (SpanStatus::Failed, Some(kind)) => format!("failed:{:?}", kind),
                (SpanStatus::Failed, None) => "failed".to_string(),
            };
            out.push_str(&format!(
                "{}#{} {} [{}] {}ms {}{}\n",
                indent,
                span.sequence,
                span.tool,
                span.step_label(),
                span.duration_ms,
                status,
                if span.deduplicated { " (shared)" } else { "" },
            ));
        }
        let dropped = self.dropped_span_count();
        if dropped > 0 {
            out.push_str(&format!("  ... {} older spans evicted\n", dropped));
        }
        out
    }

    /// JSON 视图：span、事件与淘汰计数
    pub fn export_json(&self, correlation_id: &str) -> serde_json::Value {
        serde_json::json!({
            "correlationId": correlation_id,
            "spans": self.spans_by_dispatch(correlation_id),
            "events": self.export_events(correlation_id),
            "droppedSpanCount": self.dropped_span_count(),
            "droppedEventCount": self.dropped_event_count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(logger: &TraceLogger, correlation_id: &str, tool: &str, depth: u32) -> TraceSpan {
        let now = Utc::now();
        TraceSpan {
            sequence: logger.next_sequence(),
            correlation_id: correlation_id.to_string(),
            step_id: None,
            tool: tool.to_string(),
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            status: SpanStatus::Success,
            failure: None,
            depth,
            deduplicated: false,
        }
    }

    #[test]
    fn test_export_filters_by_correlation() {
        let logger = TraceLogger::new();
        logger.record_span(span(&logger, "c1", "a", 0));
        logger.record_span(span(&logger, "c2", "b", 0));
        logger.record_span(span(&logger, "c1", "c", 1));

        let spans = logger.export_trace("c1");
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].tool, "a");
        assert_eq!(spans[1].tool, "c");
    }

    #[test]
    fn test_nested_call_completes_before_parent() {
        let logger = TraceLogger::new();
        let parent = span(&logger, "c1", "outer", 0);
        let child = span(&logger, "c1", "inner", 1);
        logger.record_span(child);
        logger.record_span(parent);

        let completed: Vec<_> = logger.export_trace("c1").into_iter().map(|s| s.tool).collect();
        assert_eq!(completed, vec!["inner", "outer"]);
        let dispatched: Vec<_> = logger
            .spans_by_dispatch("c1")
            .into_iter()
            .map(|s| s.tool)
            .collect();
        assert_eq!(dispatched, vec!["outer", "inner"]);
    }

    #[test]
    fn test_bounded_store_counts_evictions() {
        let logger = TraceLogger::with_capacity(Some(2));
        for tool in ["a", "b", "c"] {
            logger.record_span(span(&logger, "c1", tool, 0));
        }
        assert_eq!(logger.span_count(), 2);
        assert_eq!(logger.dropped_span_count(), 1);
        let tools: Vec<_> = logger.export_trace("c1").into_iter().map(|s| s.tool).collect();
        assert_eq!(tools, vec!["b", "c"]);
    }

    #[test]
    fn test_spans_by_dispatch_orders_by_sequence() {
        let logger = TraceLogger::new();
        let first = span(&logger, "c1", "first", 0);
        let second = span(&logger, "c1", "second", 0);
        logger.record_span(second);
        logger.record_span(first);

        let tools: Vec<_> = logger
            .spans_by_dispatch("c1")
            .into_iter()
            .map(|s| s.tool)
            .collect();
        assert_eq!(tools, vec!["first", "second"]);
    }

    #[test]
    fn test_render_tree_indents_by_depth() {
        let logger = TraceLogger::new();
        logger.record_span(span(&logger, "c1", "parent", 1));
        logger.record_span(span(&logger, "c1", "child", 2));

        let tree = logger.render_tree("c1");
        let lines: Vec<_> = tree.lines().collect();
        assert_eq!(lines[0], "trace c1");
        assert!(lines[1].starts_with("  #0 parent"));
        assert!(lines[2].starts_with("    #1 child"));
    }
}
