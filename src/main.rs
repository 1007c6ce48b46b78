//! A2A 编排演示
//!
//! 用法：`a2a-orchestrator [template] [config.toml]`
//! 为模板用到的每个工具注册回显 handler，运行模板并打印 PlanResult 与调用树。

use std::path::PathBuf;

use a2a_orchestrator::{
    core::{AgentOrchestrator, QUALITY_AUDIT},
    handler_fn, observability, ToolPolicy,
};
use anyhow::Context;
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args = std::env::args().skip(1);
    let template = args.next().unwrap_or_else(|| QUALITY_AUDIT.to_string());
    let config_path = args.next().map(PathBuf::from);

    let orch = AgentOrchestrator::from_config_file(config_path).context("Failed to load config")?;
    let plan = orch
        .template(&template)
        .with_context(|| format!("unknown template '{template}', available: {:?}", orch.template_names()))?;

    for tool in plan.tools() {
        let name = tool.to_string();
        orch.register_tool(
            tool,
            handler_fn(move |args, ctx| {
                let name = name.clone();
                async move {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    Ok(json!({ "tool": name, "input": args, "depth": ctx.depth() }))
                }
            }),
            ToolPolicy::new("read"),
        )
        .with_context(|| format!("Failed to register '{tool}'"))?;
    }

    let root = orch.create_context(None).context("Failed to create root context")?;
    let result = orch
        .run_template(&template, json!({ "target": "." }), &root)
        .await
        .context("Plan execution failed")?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    println!();
    print!("{}", orch.trace().render_tree(root.correlation_id()));
    Ok(())
}
