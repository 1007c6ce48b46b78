//! 在途调用合并
//!
//! 以 (作用域, 工具名, 规范化参数) 计算指纹；同一指纹已有调用在途时，后来者拿到同一个共享 future，
//! 保证作用域内同一指纹至多一次并发执行。执行结束即从表中移除，不做跨调用的结果缓存。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;

/// 递归按键排序对象，得到与键顺序无关的规范 JSON 文本
pub fn canonicalize(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                Value::Object(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k.clone(), sorted(v)))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

/// 调用指纹
pub fn fingerprint(scope: &str, tool: &str, args: &Value) -> String {
    format!("{}|{}|{}", scope, tool, canonicalize(args))
}

pub type SharedCall<T> = Shared<BoxFuture<'static, T>>;

/// 在途调用表；每个条目带代号，结束时只移除自己登记的那一条
pub struct InFlight<T: Clone> {
    calls: Mutex<HashMap<String, (u64, SharedCall<T>)>>,
    next_id: AtomicU64,
}

impl<T: Clone> Default for InFlight<T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> InFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已有未完成的在途调用则返回 (共享 future, false)；否则用 start 创建、登记并返回 (共享 future, true)
    ///
    /// start 收到本条目的代号，创建的 future 须在结束前调用 `finish(key, id)` 将自身移出表，
    /// 且不应依赖调用方持续 poll（例如放进独立任务）。已产出结果的残留条目不会被加入。
    pub fn join_or_start(
        &self,
        key: &str,
        start: impl FnOnce(u64) -> BoxFuture<'static, T>,
    ) -> (SharedCall<T>, bool) {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, existing)) = calls.get(key) {
            if existing.peek().is_none() {
                return (existing.clone(), false);
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let call = start(id).shared();
        calls.insert(key.to_string(), (id, call.clone()));
        (call, true)
    }

    pub fn finish(&self, key: &str, id: u64) {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        if calls.get(key).is_some_and(|(current, _)| *current == id) {
            calls.remove(key);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
