//! 编排集成测试：通过公开 API 端到端驱动计划执行

#[cfg(test)]
mod tests {
    use a2a_orchestrator::config::OrchestratorConfig;
    use a2a_orchestrator::core::{AgentOrchestrator, QUALITY_AUDIT, SECURITY_SCAN};
    use a2a_orchestrator::workflow::*;
    use a2a_orchestrator::{handler_fn, A2AError, FailureKind, InvocationOptions, ToolPolicy};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn orchestrator() -> AgentOrchestrator {
        AgentOrchestrator::new(OrchestratorConfig::default())
    }

    /// 休眠 args.ms 毫秒后回显参数
    fn register_sleeper(orch: &AgentOrchestrator, name: &str) {
        orch.register_tool(
            name,
            handler_fn(|args: Value, _| async move {
                let ms = args["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(args)
            }),
            ToolPolicy::new("read"),
        )
        .unwrap();
    }

    fn register_failing(orch: &AgentOrchestrator, name: &str, calls: Arc<AtomicUsize>) {
        orch.register_tool(
            name,
            handler_fn(move |_, _| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("always fails".to_string())
                }
            }),
            ToolPolicy::new("read"),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_parallel_join_waits_for_all_dependencies() {
        let orch = orchestrator();
        register_sleeper(&orch, "sleep");
        let root = orch.create_context(None).unwrap();

        let plan = PlanBuilder::new("join")
            .strategy(Strategy::Parallel)
            .step("A", "sleep", json!({"ms": 10, "id": "A"}))
            .step("B", "sleep", json!({"ms": 20, "id": "B"}))
            .step("C", "sleep", json!({"ms": 5, "id": "C"}))
            .depends_on("C", ["A", "B"])
            .build()
            .unwrap();

        let result = orch.run_plan(&plan, &root).await.unwrap();
        assert_eq!(result.overall_status, OverallStatus::Success);
        let (a, b, c) = (
            result.result("A").unwrap(),
            result.result("B").unwrap(),
            result.result("C").unwrap(),
        );
        assert!(c.started_at >= a.ended_at.max(b.ended_at));
        // A 与 B 并发执行
        assert!(b.started_at < a.ended_at);
    }

    #[tokio::test]
    async fn test_concurrent_identical_invocations_collapse() {
        let orch = orchestrator();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        orch.register_tool(
            "analyze",
            handler_fn(move |args: Value, _| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    Ok(json!({"analyzed": args["path"]}))
                }
            }),
            ToolPolicy::new("read"),
        )
        .unwrap();
        let ctx = orch.create_context(None).unwrap();

        let futures: Vec<_> = (0..8)
            .map(|_| {
                orch.invoke_tool(
                    "analyze",
                    json!({"path": "src/lib.rs"}),
                    &ctx,
                    InvocationOptions::default(),
                )
            })
            .collect();
        let results = futures_util::future::join_all(futures).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.output == results[0].output));
        assert!(results.iter().all(|r| r.status == StepStatus::Success));
    }

    #[tokio::test]
    async fn test_dispatch_order_is_stable_across_runs() {
        let orch = orchestrator();
        register_sleeper(&orch, "sleep");

        let plan = PlanBuilder::new("fanout")
            .strategy(Strategy::Parallel)
            .step("w", "sleep", json!({"ms": 40, "id": "w"}))
            .step("x", "sleep", json!({"ms": 30, "id": "x"}))
            .step("y", "sleep", json!({"ms": 20, "id": "y"}))
            .step("z", "sleep", json!({"ms": 10, "id": "z"}))
            .build()
            .unwrap();

        let mut dispatch_orders = Vec::new();
        for _ in 0..2 {
            let root = orch.create_context(None).unwrap();
            let result = orch.run_plan(&plan, &root).await.unwrap();
            let order: Vec<String> = result
                .trace
                .iter()
                .map(|s| s.step_label().to_string())
                .collect();
            dispatch_orders.push(order);

            // 完成顺序与派发顺序相反
            let completion: Vec<String> = orch
                .trace()
                .export_trace(root.correlation_id())
                .iter()
                .map(|s| s.step_label().to_string())
                .collect();
            assert_eq!(completion, vec!["z", "y", "x", "w"]);
        }
        assert_eq!(dispatch_orders[0], vec!["w", "x", "y", "z"]);
        assert_eq!(dispatch_orders[0], dispatch_orders[1]);
    }

    #[tokio::test]
    async fn test_abort_policy_skips_later_steps() {
        let orch = orchestrator();
        register_sleeper(&orch, "sleep");
        let calls = Arc::new(AtomicUsize::new(0));
        register_failing(&orch, "broken", Arc::clone(&calls));
        let root = orch.create_context(None).unwrap();

        let plan = PlanBuilder::new("abort")
            .error_policy(ErrorPolicy::Abort)
            .step("s0", "sleep", json!({"id": 0}))
            .step("s1", "broken", json!({}))
            .step("s2", "sleep", json!({"id": 2}))
            .step("s3", "sleep", json!({"id": 3}))
            .build()
            .unwrap();

        let result = orch.run_plan(&plan, &root).await.unwrap();
        assert_eq!(result.overall_status, OverallStatus::Failed);
        assert_eq!(result.status_of("s0"), Some(StepStatus::Success));
        assert_eq!(result.status_of("s1"), Some(StepStatus::Failed));
        for id in ["s2", "s3"] {
            let r = result.result(id).unwrap();
            assert_eq!(r.status, StepStatus::Skipped);
            assert_eq!(r.skip_reason, Some(SkipReason::Aborted));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_makes_exactly_max_attempts_with_backoff() {
        let orch = orchestrator();
        let calls = Arc::new(AtomicUsize::new(0));
        register_failing(&orch, "flaky", Arc::clone(&calls));
        let root = orch.create_context(None).unwrap();

        let retry = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 20,
            max_delay_ms: 100,
        };
        let plan = PlanBuilder::new("retry")
            .strategy(Strategy::Retry)
            .retry(retry)
            .step("fetch", "flaky", json!({}))
            .build()
            .unwrap();

        let result = orch.run_plan(&plan, &root).await.unwrap();
        let fetch = result.result("fetch").unwrap();
        assert_eq!(fetch.status, StepStatus::Failed);
        assert_eq!(fetch.failure_kind(), Some(FailureKind::ToolError));
        assert_eq!(fetch.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let spans = &result.trace;
        assert_eq!(spans.len(), 3);
        assert!(spans.iter().all(|s| s.failure == Some(FailureKind::ToolError)));
        for n in 1..spans.len() {
            let floor = chrono::Duration::from_std(retry.backoff(n as u32)).unwrap();
            assert!(spans[n].started_at - spans[n - 1].ended_at >= floor);
        }
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_any_step_runs() {
        let orch = orchestrator();
        let calls = Arc::new(AtomicUsize::new(0));
        register_failing(&orch, "counted", Arc::clone(&calls));
        let root = orch.create_context(None).unwrap();

        let plan = ExecutionPlan {
            name: "cycle".to_string(),
            steps: vec![
                ExecutionStep::new("A", "counted", json!({})).depends_on(["B"]),
                ExecutionStep::new("B", "counted", json!({})).depends_on(["A"]),
            ],
            strategy: Strategy::Parallel,
            error_policy: ErrorPolicy::Skip,
            timeout_ms: None,
            retry: None,
        };
        let err = orch.run_plan(&plan, &root).await.unwrap_err();
        assert!(matches!(err, A2AError::CyclicDependency(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_and_duplicate_registration() {
        let orch = orchestrator();
        register_sleeper(&orch, "sleep");
        let err = orch
            .register_tool("sleep", a2a_orchestrator::tools::EchoTool, ToolPolicy::new("read"))
            .unwrap_err();
        assert!(matches!(err, A2AError::DuplicateRegistration(name) if name == "sleep"));

        let ctx = orch.create_context(None).unwrap();
        let result = orch
            .invoke_tool("nonexistent-tool", json!({}), &ctx, InvocationOptions::default())
            .await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.failure_kind(), Some(FailureKind::UnknownTool));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["kind"], "UnknownTool");
    }

    #[tokio::test]
    async fn test_registry_locks_after_first_invocation() {
        let orch = orchestrator();
        register_sleeper(&orch, "sleep");
        let ctx = orch.create_context(None).unwrap();
        orch.invoke_tool("sleep", json!({}), &ctx, InvocationOptions::default())
            .await;

        let err = orch
            .register_tool("late", a2a_orchestrator::tools::EchoTool, ToolPolicy::new("read"))
            .unwrap_err();
        assert!(matches!(err, A2AError::RegistryLocked(_)));

        orch.registry().reopen();
        orch.register_tool("late", a2a_orchestrator::tools::EchoTool, ToolPolicy::new("read"))
            .unwrap();
    }

    #[tokio::test]
    async fn test_recursive_tool_hits_depth_limit() {
        let mut config = OrchestratorConfig::default();
        config.context.max_depth = 3;
        let orch = AgentOrchestrator::new(config);

        let invoker = orch.invoker().clone();
        let contexts = orch.contexts().clone();
        orch.register_tool(
            "recurse",
            handler_fn(move |args: Value, ctx| {
                let invoker = invoker.clone();
                let contexts = contexts.clone();
                async move {
                    let child = contexts.create_context(Some(&ctx)).map_err(|e| e.to_string())?;
                    let result = invoker
                        .invoke("recurse", args, &child, InvocationOptions::default())
                        .await;
                    match result.error {
                        Some(failure) => Err(failure.message),
                        None => Ok(result.output.unwrap_or(Value::Null)),
                    }
                }
            }),
            ToolPolicy::new("read"),
        )
        .unwrap();

        let root = orch.create_context(None).unwrap();
        let result = orch
            .invoke_tool("recurse", json!({"n": 1}), &root, InvocationOptions::default())
            .await;
        assert_eq!(result.failure_kind(), Some(FailureKind::ToolError));
        assert!(result.error.unwrap().message.contains("depth"));

        let depths: Vec<u32> = orch
            .trace()
            .spans_by_dispatch(root.correlation_id())
            .iter()
            .map(|s| s.depth)
            .collect();
        assert_eq!(depths, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_quality_audit_absorbs_failure() {
        let orch = orchestrator();
        let calls = Arc::new(AtomicUsize::new(0));
        register_failing(&orch, "code-lint", Arc::clone(&calls));
        for tool in ["complexity-analyze", "test-coverage", "quality-report"] {
            register_sleeper(&orch, tool);
        }
        let root = orch.create_context(None).unwrap();

        let result = orch
            .run_template(QUALITY_AUDIT, json!({"target": "."}), &root)
            .await
            .unwrap();
        assert_eq!(result.overall_status, OverallStatus::Partial);
        assert_eq!(result.status_of("lint"), Some(StepStatus::Failed));
        assert_eq!(result.status_of("complexity"), Some(StepStatus::Success));
        assert_eq!(result.status_of("coverage"), Some(StepStatus::Success));
        assert_eq!(
            result.result("report").unwrap().skip_reason,
            Some(SkipReason::DependencyUnsatisfied {
                step: "lint".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_security_scan_aborts_on_failure() {
        let orch = orchestrator();
        let calls = Arc::new(AtomicUsize::new(0));
        register_failing(&orch, "secret-scan", Arc::clone(&calls));
        for tool in ["dependency-audit", "static-analysis", "security-report"] {
            register_sleeper(&orch, tool);
        }
        let root = orch.create_context(None).unwrap();

        let result = orch
            .run_template(SECURITY_SCAN, json!({}), &root)
            .await
            .unwrap();
        assert_eq!(result.overall_status, OverallStatus::Failed);
        assert_eq!(result.status_of("dependencies"), Some(StepStatus::Success));
        assert_eq!(result.status_of("secrets"), Some(StepStatus::Failed));
        assert_eq!(result.status_of("static-analysis"), Some(StepStatus::Skipped));
        assert_eq!(result.status_of("report"), Some(StepStatus::Skipped));

        let tree = orch.trace().render_tree(root.correlation_id());
        assert!(tree.contains("secret-scan"));
    }

    #[tokio::test]
    async fn test_plan_result_serializes_to_json() {
        let orch = orchestrator();
        register_sleeper(&orch, "sleep");
        let root = orch.create_context(None).unwrap();

        let plan: ExecutionPlan = serde_json::from_value(json!({
            "name": "from-json",
            "strategy": "sequential",
            "steps": [
                {"id": "one", "tool": "sleep", "args": {"ms": 1}},
                {"id": "two", "tool": "sleep", "args": {"ms": 1}, "dependencies": ["one"]}
            ]
        }))
        .unwrap();

        let result = orch.run_plan(&plan, &root).await.unwrap();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["overallStatus"], "success");
        assert_eq!(json["results"][1]["stepId"], "two");
        assert_eq!(json["results"][1]["status"], "success");
        assert!(json["results"][0]["startedAt"].is_string());
        assert!(json["results"][0]["endedAt"].is_string());
    }

    #[tokio::test]
    async fn test_rerun_after_deadline_executes_again() {
        let orch = orchestrator();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        orch.register_tool(
            "crawl",
            handler_fn(move |args: Value, _| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(args)
                }
            }),
            ToolPolicy::new("read"),
        )
        .unwrap();
        let root = orch.create_context(None).unwrap();

        let plan = PlanBuilder::new("crawl")
            .timeout_ms(20)
            .step("a", "crawl", json!({"url": "https://example.com"}))
            .build()
            .unwrap();
        let first = orch.run_plan(&plan, &root).await.unwrap();
        assert_eq!(first.result("a").unwrap().failure_kind(), Some(FailureKind::Timeout));

        // 被放弃的 handler 结束后不留在途记录
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(orch.invoker().in_flight(), 0);

        let relaxed = PlanBuilder::new("crawl")
            .step("a", "crawl", json!({"url": "https://example.com"}))
            .build()
            .unwrap();
        let second = orch.run_plan(&relaxed, &root).await.unwrap();
        let a = second.result("a").unwrap();
        assert_eq!(a.status, StepStatus::Success);
        assert!(!a.deduplicated);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
