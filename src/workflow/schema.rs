//! 执行计划 JSON Schema 生成（schemars）
//!
//! 供上游规划器生成计划前参考，或在接收外部计划前做结构校验。

use schemars::schema_for;

use crate::workflow::types::ExecutionPlan;

/// 返回执行计划的 JSON Schema 字符串
pub fn plan_schema_json() -> String {
    let schema = schema_for!(ExecutionPlan);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}
