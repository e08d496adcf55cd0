// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! DAG: the step dependency graph.

use crate::error::{OrchestratorError, Result};
use crate::step::StepDefinition;
use std::collections::{BTreeMap, HashSet, VecDeque};

/// Directed acyclic graph of step definitions connected by `depends_on`
/// edges. `steps` maps step name -> definition; adjacency is derived on
/// demand rather than stored, since `depends_on` already encodes the
/// reverse edges.
#[derive(Debug, Clone, Default)]
pub struct DAG {
    pub name: String,
    pub description: String,
    pub steps: BTreeMap<String, StepDefinition>,
}

impl DAG {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds a step; errors if the name already exists.
    pub fn add(&mut self, step: StepDefinition) -> Result<()> {
        if self.steps.contains_key(&step.name) {
            return Err(OrchestratorError::DuplicateStep { name: step.name });
        }
        self.steps.insert(step.name.clone(), step);
        Ok(())
    }

    pub fn add_many(&mut self, steps: impl IntoIterator<Item = StepDefinition>) -> Result<()> {
        for step in steps {
            self.add(step)?;
        }
        Ok(())
    }

    /// The forward edge set: dep name -> names of steps that depend on it.
    pub fn forward_adjacency(&self) -> BTreeMap<String, Vec<String>> {
        let mut adjacency: BTreeMap<String, Vec<String>> =
            self.steps.keys().map(|name| (name.clone(), Vec::new())).collect();
        for step in self.steps.values() {
            for dep in &step.depends_on {
                adjacency.entry(dep.clone()).or_default().push(step.name.clone());
            }
        }
        adjacency
    }

    pub fn get_dependents(&self, name: &str) -> Vec<String> {
        self.forward_adjacency().get(name).cloned().unwrap_or_default()
    }

    /// Non-empty (unless `allow_empty`), all deps exist, no cycle via DFS
    /// three-color.
    pub fn validate(&self, allow_empty: bool) -> Result<()> {
        if self.steps.is_empty() && !allow_empty {
            return Err(OrchestratorError::Validation("no steps".to_string()));
        }

        for step in self.steps.values() {
            for dep in &step.depends_on {
                if !self.steps.contains_key(dep) {
                    return Err(OrchestratorError::MissingDependency {
                        from: step.name.clone(),
                        to: dep.clone(),
                    });
                }
            }
        }

        self.detect_cycle()
    }

    fn detect_cycle(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: BTreeMap<&str, Color> =
            self.steps.keys().map(|k| (k.as_str(), Color::White)).collect();
        let mut path: Vec<String> = Vec::new();

        fn visit<'a>(
            dag: &'a DAG,
            node: &'a str,
            colors: &mut BTreeMap<&'a str, Color>,
            path: &mut Vec<String>,
        ) -> Result<()> {
            colors.insert(node, Color::Gray);
            path.push(node.to_string());

            if let Some(step) = dag.steps.get(node) {
                for dep in &step.depends_on {
                    match colors.get(dep.as_str()).copied().unwrap_or(Color::White) {
                        Color::Gray => {
                            let mut cycle_path = path.clone();
                            cycle_path.push(dep.clone());
                            return Err(OrchestratorError::CycleDetected { path: cycle_path });
                        }
                        Color::White => visit(dag, dep.as_str(), colors, path)?,
                        Color::Black => {}
                    }
                }
            }

            path.pop();
            colors.insert(node, Color::Black);
            Ok(())
        }

        let names: Vec<&str> = self.steps.keys().map(|s| s.as_str()).collect();
        for name in names {
            if colors.get(name).copied().unwrap_or(Color::White) == Color::White {
                visit(self, name, &mut colors, &mut path)?;
            }
        }
        Ok(())
    }

    /// Kahn topological sort with a FIFO ready queue, so iteration order is
    /// deterministic for equally-ready steps.
    pub fn get_execution_order(&self) -> Result<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .steps
            .values()
            .map(|s| (s.name.as_str(), s.depends_on.len()))
            .collect();
        let adjacency = self.forward_adjacency();

        let mut ready: VecDeque<String> = self
            .steps
            .values()
            .filter(|s| s.depends_on.is_empty())
            .map(|s| s.name.clone())
            .collect();

        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(name) = ready.pop_front() {
            order.push(name.clone());
            if let Some(dependents) = adjacency.get(&name) {
                for dependent in dependents {
                    if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.push_back(dependent.clone());
                        }
                    }
                }
            }
        }

        if order.len() != self.steps.len() {
            self.detect_cycle()?;
            return Err(OrchestratorError::Validation(
                "execution order is incomplete despite no cycle detected".to_string(),
            ));
        }
        Ok(order)
    }

    /// Names whose dependencies are all contained in `completed`.
    pub fn get_ready_steps(&self, completed: &HashSet<String>) -> Vec<String> {
        self.steps
            .values()
            .filter(|s| !completed.contains(&s.name))
            .filter(|s| s.depends_on.iter().all(|d| completed.contains(d)))
            .map(|s| s.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepDefinition;

    fn step(name: &str, deps: &[&str]) -> StepDefinition {
        StepDefinition::new(name).with_depends_on(deps.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn validate_rejects_empty_dag_unless_experimental() {
        let dag = DAG::new("wf");
        assert!(dag.validate(false).is_err());
        assert!(dag.validate(true).is_ok());
    }

    #[test]
    fn validate_rejects_missing_dependency() {
        let mut dag = DAG::new("wf");
        dag.add(step("a", &["missing"])).unwrap();
        let err = dag.validate(false).unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingDependency { .. }));
    }

    #[test]
    fn validate_rejects_self_cycle() {
        let mut dag = DAG::new("wf");
        dag.add(step("a", &["a"])).unwrap();
        let err = dag.validate(false).unwrap_err();
        match err {
            OrchestratorError::CycleDetected { path } => {
                assert_eq!(path, vec!["a".to_string(), "a".to_string()]);
            }
            other => panic!("expected CycleDetected, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_step_name_is_rejected() {
        let mut dag = DAG::new("wf");
        dag.add(step("a", &[])).unwrap();
        let err = dag.add(step("a", &[])).unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateStep { .. }));
    }

    #[test]
    fn execution_order_respects_dependencies_and_is_deterministic() {
        let mut dag = DAG::new("wf");
        dag.add(step("a", &[])).unwrap();
        dag.add(step("b", &["a"])).unwrap();
        dag.add(step("c", &["a"])).unwrap();
        dag.add(step("d", &["b", "c"])).unwrap();
        let order = dag.get_execution_order().unwrap();
        assert_eq!(order[0], "a");
        assert_eq!(order[3], "d");
        assert!(order.iter().position(|s| s == "b").unwrap() < order.iter().position(|s| s == "d").unwrap());
    }

    #[test]
    fn get_ready_steps_only_returns_steps_with_satisfied_deps() {
        let mut dag = DAG::new("wf");
        dag.add(step("a", &[])).unwrap();
        dag.add(step("b", &["a"])).unwrap();
        let completed = HashSet::new();
        assert_eq!(dag.get_ready_steps(&completed), vec!["a".to_string()]);
        let mut completed = HashSet::new();
        completed.insert("a".to_string());
        assert_eq!(dag.get_ready_steps(&completed), vec!["b".to_string()]);
    }

    #[test]
    fn get_dependents_returns_forward_edges() {
        let mut dag = DAG::new("wf");
        dag.add(step("a", &[])).unwrap();
        dag.add(step("b", &["a"])).unwrap();
        dag.add(step("c", &["a"])).unwrap();
        let mut dependents = dag.get_dependents("a");
        dependents.sort();
        assert_eq!(dependents, vec!["b".to_string(), "c".to_string()]);
    }
}
