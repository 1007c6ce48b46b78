//! 执行计划：数据模型、校验、执行控制器与常用编排模式

pub mod builder;
pub mod engine;
pub mod graph;
pub mod patterns;
pub mod schema;
pub mod types;

pub use builder::PlanBuilder;
pub use engine::ExecutionController;
pub use graph::PlanGraph;
pub use patterns::{fan_out, map_reduce, pipeline, pipeline_plan, ItemFailure, MapReduceOutcome};
pub use schema::plan_schema_json;
pub use types::*;
