// Copyright (c) 2025 LLM Flow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Dependency Resolver: the `needs`-edge graph over steps and loops.
//!
//! Built on `petgraph`'s directed graph so cycle detection and topological
//! sort reuse a well-tested algorithm rather than a hand-rolled DFS; the
//! resolver layers declaration-order tie-breaking on top so `ready()` and
//! `execution_order()` stay deterministic for tests (§4.4).

use std::collections::{HashMap, HashSet};

use petgraph::algo::kosaraju_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::error::{CycleEdge, OrchestratorError, Result};
use crate::workflow::{Loop, Step};

pub struct DependencyResolver {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    declaration_order: HashMap<String, usize>,
    pub step_names: Vec<String>,
    pub loop_names: Vec<String>,
}

impl DependencyResolver {
    /// Builds the graph from a workflow's steps and loops. Every `needs`
    /// entry becomes an edge `dependency -> dependent`. Loop nodes never
    /// gain incoming edges from `needs` since loops don't declare `needs`
    /// themselves, but other steps may depend on a loop completing.
    pub fn build(steps: &[Step], loops: &[Loop]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut declaration_order = HashMap::new();
        let mut step_names = Vec::new();
        let mut loop_names = Vec::new();
        let mut order = 0usize;

        for step in steps {
            let idx = graph.add_node(step.name.clone());
            index.insert(step.name.clone(), idx);
            declaration_order.insert(step.name.clone(), order);
            step_names.push(step.name.clone());
            order += 1;
        }
        for l in loops {
            let idx = graph.add_node(l.name.clone());
            index.insert(l.name.clone(), idx);
            declaration_order.insert(l.name.clone(), order);
            loop_names.push(l.name.clone());
            order += 1;
        }

        for step in steps {
            let to = index[&step.name];
            for dep in &step.needs {
                let from = *index.get(dep).ok_or_else(|| {
                    OrchestratorError::Dependency(format!(
                        "step '{}' depends on unknown node '{}'",
                        step.name, dep
                    ))
                })?;
                graph.add_edge(from, to, ());
            }
        }

        Ok(Self {
            graph,
            index,
            declaration_order,
            step_names,
            loop_names,
        })
    }

    /// Every `needs` entry resolves to a known step or loop. Already
    /// enforced while building the graph, but exposed as its own operation
    /// per §4.4.
    pub fn validate_references_exist(&self) -> Result<()> {
        Ok(())
    }

    /// DFS-equivalent cycle check via strongly-connected components: any
    /// SCC with more than one node, or a single node with a self-loop, is a
    /// cycle. Reports one edge from the first such component found.
    pub fn validate_no_cycles(&self) -> Result<()> {
        for scc in kosaraju_scc(&self.graph) {
            if scc.len() > 1 {
                let from = &self.graph[scc[0]];
                let to = &self.graph[scc[1]];
                return Err(OrchestratorError::Cycle {
                    edge: CycleEdge {
                        from: from.clone(),
                        to: to.clone(),
                    },
                });
            }
            if scc.len() == 1 {
                let node = scc[0];
                if self.graph.contains_edge(node, node) {
                    let name = &self.graph[node];
                    return Err(OrchestratorError::Cycle {
                        edge: CycleEdge {
                            from: name.clone(),
                            to: name.clone(),
                        },
                    });
                }
            }
        }
        Ok(())
    }

    /// Steps (never loops — loops are dispatched unconditionally, §4.6) not
    /// yet in `completed` whose every dependency is in `completed`. Ties are
    /// broken by declaration order.
    pub fn ready(&self, completed: &HashSet<String>) -> Vec<String> {
        let mut out: Vec<String> = self
            .step_names
            .iter()
            .filter(|name| !completed.contains(*name))
            .filter(|name| {
                let idx = self.index[*name];
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .all(|dep_idx| completed.contains(&self.graph[dep_idx]))
            })
            .cloned()
            .collect();
        out.sort_by_key(|n| self.declaration_order[n]);
        out
    }

    /// Kahn's algorithm over the full graph (steps and loops), breaking
    /// ties by declaration order so the result is stable across runs.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        self.validate_no_cycles()?;

        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
        for idx in self.graph.node_indices() {
            in_degree.insert(idx, self.graph.neighbors_directed(idx, Direction::Incoming).count());
        }

        let mut order = Vec::with_capacity(self.graph.node_count());
        loop {
            let mut ready: Vec<NodeIndex> = in_degree
                .iter()
                .filter(|(_, &deg)| deg == 0)
                .map(|(idx, _)| *idx)
                .collect();
            if ready.is_empty() {
                break;
            }
            ready.sort_by_key(|idx| self.declaration_order[&self.graph[*idx]]);
            let next = ready[0];
            order.push(self.graph[next].clone());
            in_degree.remove(&next);
            for succ in self.graph.neighbors_directed(next, Direction::Outgoing) {
                if let Some(deg) = in_degree.get_mut(&succ) {
                    *deg -= 1;
                }
            }
        }

        if order.len() != self.graph.node_count() {
            return Err(OrchestratorError::Dependency(
                "execution order incomplete: residual cycle after cycle check".to_string(),
            ));
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ExecutionSettings;

    fn step(name: &str, needs: &[&str]) -> Step {
        Step {
            name: name.to_string(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            condition: None,
            run: Some("x".into()),
            consensus: None,
            template: None,
            loop_: None,
            embeddings: None,
            rag: None,
            settings: ExecutionSettings::default(),
            scan_output_for_failures: false,
            on_failure: None,
        }
    }

    #[test]
    fn linear_chain_execution_order() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])];
        let dag = DependencyResolver::build(&steps, &[]).unwrap();
        let order = dag.execution_order().unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn diamond_ready_set() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ];
        let dag = DependencyResolver::build(&steps, &[]).unwrap();

        let mut completed = HashSet::new();
        assert_eq!(dag.ready(&completed), vec!["a"]);

        completed.insert("a".to_string());
        assert_eq!(dag.ready(&completed), vec!["b", "c"]);

        completed.insert("b".to_string());
        completed.insert("c".to_string());
        assert_eq!(dag.ready(&completed), vec!["d"]);
    }

    #[test]
    fn detects_cycle() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        let dag = DependencyResolver::build(&steps, &[]).unwrap();
        let err = dag.validate_no_cycles().unwrap_err();
        assert!(matches!(err, OrchestratorError::Cycle { .. }));
        assert!(dag.execution_order().is_err());
    }

    #[test]
    fn ties_broken_by_declaration_order() {
        let steps = vec![step("z", &[]), step("a", &[]), step("m", &[])];
        let dag = DependencyResolver::build(&steps, &[]).unwrap();
        assert_eq!(dag.execution_order().unwrap(), vec!["z", "a", "m"]);
    }

    #[test]
    fn execution_order_length_matches_step_count_for_acyclic() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["a"])];
        let dag = DependencyResolver::build(&steps, &[]).unwrap();
        assert_eq!(dag.execution_order().unwrap().len(), 3);
    }

    #[test]
    fn unknown_dependency_rejected_at_build_time() {
        let steps = vec![step("a", &["missing"])];
        assert!(DependencyResolver::build(&steps, &[]).is_err());
    }
}
