//! 执行计划依赖图
//!
//! 使用邻接表和入度表做 DAG 校验与拓扑排序；同时就绪的步骤总按计划列表顺序返回，
//! 保证相同输入的派发顺序可复现。条件中引用的步骤按隐式依赖处理。

use std::collections::{BTreeSet, HashMap};

use crate::core::A2AError;
use crate::workflow::types::*;

/// 计划依赖图（步骤以其在计划中的下标标识）
#[derive(Debug)]
pub struct PlanGraph {
    ids: Vec<StepId>,
    index: HashMap<StepId, usize>,
    /// 下标 -> 它依赖的步骤
    dependencies: Vec<Vec<usize>>,
    /// 邻接表：下标 -> 依赖它的步骤
    adjacency: Vec<Vec<usize>>,
}

impl PlanGraph {
    /// 校验并构建依赖图：步骤 id 唯一、工具名非空、依赖存在且无环
    pub fn build(plan: &ExecutionPlan) -> Result<Self, A2AError> {
        let mut index = HashMap::new();
        for (i, step) in plan.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(A2AError::InvalidPlan(format!("step #{i} has an empty id")));
            }
            if step.tool.trim().is_empty() {
                return Err(A2AError::InvalidPlan(format!(
                    "step '{}' has an empty tool name",
                    step.id
                )));
            }
            if index.insert(step.id.clone(), i).is_some() {
                return Err(A2AError::InvalidPlan(format!("duplicate step id '{}'", step.id)));
            }
        }

        let mut dependencies = vec![Vec::new(); plan.steps.len()];
        let mut adjacency = vec![Vec::new(); plan.steps.len()];
        for (i, step) in plan.steps.iter().enumerate() {
            for dep in step.all_dependencies() {
                let j = *index.get(dep).ok_or_else(|| {
                    A2AError::InvalidPlan(format!(
                        "step '{}' references unknown step '{}'",
                        step.id, dep
                    ))
                })?;
                dependencies[i].push(j);
                adjacency[j].push(i);
            }
        }

        let graph = Self {
            ids: plan.steps.iter().map(|s| s.id.clone()).collect(),
            index,
            dependencies,
            adjacency,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn check_acyclic(&self) -> Result<(), A2AError> {
        let order = self.kahn();
        if order.len() == self.ids.len() {
            return Ok(());
        }
        let mut remaining: Vec<bool> = vec![true; self.ids.len()];
        for i in order {
            remaining[i] = false;
        }
        let cyclic: Vec<StepId> = self
            .ids
            .iter()
            .enumerate()
            .filter(|(i, _)| remaining[*i])
            .map(|(_, id)| id.clone())
            .collect();
        Err(A2AError::CyclicDependency(cyclic))
    }

    /// Kahn 拓扑排序；入度为 0 的候选按计划下标从小到大取出
    fn kahn(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.ids.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &dependent in &self.adjacency[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }
        order
    }

    /// 稳定拓扑序（步骤 id）
    pub fn topological_order(&self) -> Vec<StepId> {
        self.kahn().into_iter().map(|i| self.ids[i].clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn id(&self, i: usize) -> &str {
        &self.ids[i]
    }

    pub fn dependencies(&self, i: usize) -> &[usize] {
        &self.dependencies[i]
    }

    pub fn dependents(&self, i: usize) -> &[usize] {
        &self.adjacency[i]
    }

    /// 获取可执行的步骤：仍为 Pending 且全部依赖已终结，按计划顺序
    pub fn ready(&self, states: &[StepStatus]) -> Vec<usize> {
        (0..self.ids.len())
            .filter(|&i| {
                states[i] == StepStatus::Pending
                    && self.dependencies[i].iter().all(|&d| states[d].is_terminal())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(steps: Vec<ExecutionStep>) -> ExecutionPlan {
        ExecutionPlan {
            name: "test".to_string(),
            steps,
            strategy: Strategy::Parallel,
            error_policy: ErrorPolicy::Abort,
            timeout_ms: None,
            retry: None,
        }
    }

    fn step(id: &str, deps: &[&str]) -> ExecutionStep {
        ExecutionStep::new(id, "echo", json!({})).depends_on(deps.iter().copied())
    }

    #[test]
    fn test_graph_construction() {
        let p = plan(vec![step("a", &[]), step("b", &[]), step("c", &["a", "b"])]);
        let graph = PlanGraph::build(&p).unwrap();
        assert_eq!(graph.dependencies(2), &[0, 1]);
        assert_eq!(graph.dependents(0), &[2]);
        assert_eq!(graph.topological_order(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let p = plan(vec![step("a", &["b"]), step("b", &["a"]), step("c", &[])]);
        let err = PlanGraph::build(&p).unwrap_err();
        match err {
            A2AError::CyclicDependency(ids) => assert_eq!(ids, vec!["a", "b"]),
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let p = plan(vec![step("a", &["a"])]);
        assert!(matches!(
            PlanGraph::build(&p),
            Err(A2AError::CyclicDependency(_))
        ));
    }

    #[test]
    fn test_malformed_plans() {
        let p = plan(vec![step("a", &[]), step("a", &[])]);
        assert!(matches!(PlanGraph::build(&p), Err(A2AError::InvalidPlan(_))));

        let p = plan(vec![step("a", &["ghost"])]);
        assert!(matches!(PlanGraph::build(&p), Err(A2AError::InvalidPlan(_))));

        let p = plan(vec![ExecutionStep::new("a", "", json!({}))]);
        assert!(matches!(PlanGraph::build(&p), Err(A2AError::InvalidPlan(_))));
    }

    #[test]
    fn test_forward_dependency_allowed() {
        let p = plan(vec![step("report", &["scan"]), step("scan", &[])]);
        let graph = PlanGraph::build(&p).unwrap();
        assert_eq!(graph.topological_order(), vec!["scan", "report"]);
    }

    #[test]
    fn test_ready_in_plan_order() {
        let p = plan(vec![step("a", &[]), step("b", &["a"]), step("c", &[]), step("d", &["a"])]);
        let graph = PlanGraph::build(&p).unwrap();

        let mut states = vec![StepStatus::Pending; 4];
        assert_eq!(graph.ready(&states), vec![0, 2]);

        states[0] = StepStatus::Running;
        states[2] = StepStatus::Running;
        assert!(graph.ready(&states).is_empty());

        states[0] = StepStatus::Failed;
        assert_eq!(graph.ready(&states), vec![1, 3]);
    }
}
