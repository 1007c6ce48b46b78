//! 并发闸门：按工具名维护计数信号量
//!
//! 注册策略带 max_concurrency 的工具，超出的并发调用在此排队等待空闲许可；未设上限的工具直接放行。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Default)]
pub struct ConcurrencyGate {
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ConcurrencyGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn semaphore(&self, tool: &str, max: usize) -> Arc<Semaphore> {
        let mut map = self.semaphores.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            map.entry(tool.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(max.max(1)))),
        )
    }

    /// 获取工具执行许可；max 为 None 时返回 None（不限流）
    pub async fn acquire(&self, tool: &str, max: Option<usize>) -> Option<OwnedSemaphorePermit> {
        let max = max?;
        let semaphore = self.semaphore(tool, max);
        // 信号量从不 close，acquire_owned 只会成功
        semaphore.acquire_owned().await.ok()
    }

    /// 当前空闲许可数（未建立信号量时为 None）
    pub fn available(&self, tool: &str) -> Option<usize> {
        self.semaphores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tool)
            .map(|s| s.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unlimited_tool_has_no_permit() {
        let gate = ConcurrencyGate::new();
        assert!(gate.acquire("free", None).await.is_none());
        assert_eq!(gate.available("free"), None);
    }

    #[tokio::test]
    async fn test_excess_calls_wait_for_a_slot() {
        let gate = Arc::new(ConcurrencyGate::new());
        let first = gate.acquire("slow", Some(1)).await;
        assert!(first.is_some());
        assert_eq!(gate.available("slow"), Some(0));

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire("slow", Some(1)).await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        assert!(waiter.await.unwrap());
    }
}
