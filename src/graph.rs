use crate::cycle_check::find_cycle;
use crate::error::GraphError;
use crate::task::{Task, TaskKind};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Write as _;

/// Immutable, validated set of tasks and their dependency edges.
#[derive(Debug, Clone)]
pub struct Graph {
    tasks: BTreeMap<String, Task>,
    downstream: BTreeMap<String, BTreeSet<String>>,
    order: Vec<String>,
}

impl Graph {
    /// Validates and freezes a task set. `edges` are `(upstream, downstream)`
    /// pairs merged with each task's declared upstream ids. Nothing is kept
    /// if any check fails.
    pub fn build<T, E>(tasks: T, edges: E) -> Result<Self, GraphError>
    where
        T: IntoIterator<Item = Task>,
        E: IntoIterator<Item = (String, String)>,
    {
        let mut by_id: BTreeMap<String, Task> = BTreeMap::new();
        for task in tasks {
            validate_task_id(task.id())?;
            if by_id.contains_key(task.id()) {
                return Err(GraphError::DuplicateTask(task.id().to_string()));
            }
            by_id.insert(task.id().to_string(), task);
        }
        if by_id.is_empty() {
            return Err(GraphError::Empty);
        }

        for (upstream, downstream) in edges {
            let task = by_id
                .get_mut(&downstream)
                .ok_or_else(|| GraphError::UnknownDependency {
                    task: downstream.clone(),
                    upstream: upstream.clone(),
                })?;
            task.add_upstream(upstream);
        }

        let mut downstream: BTreeMap<String, BTreeSet<String>> = by_id
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        for (id, task) in &by_id {
            for upstream in task.upstream_ids() {
                let children =
                    downstream
                        .get_mut(upstream)
                        .ok_or_else(|| GraphError::UnknownDependency {
                            task: id.clone(),
                            upstream: upstream.clone(),
                        })?;
                children.insert(id.clone());
            }
        }

        let upstreams: BTreeMap<String, BTreeSet<String>> = by_id
            .iter()
            .map(|(id, task)| (id.clone(), task.upstream_ids().clone()))
            .collect();
        if let Some(cycle) = find_cycle(&upstreams) {
            return Err(GraphError::Cycle(cycle));
        }

        let order = topological_sort(&by_id, &downstream)?;
        Ok(Self {
            tasks: by_id,
            downstream,
            order,
        })
    }

    /// Builds from tasks whose dependencies are all declared on the tasks.
    pub fn from_tasks<T>(tasks: T) -> Result<Self, GraphError>
    where
        T: IntoIterator<Item = Task>,
    {
        Self::build(tasks, std::iter::empty())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Tasks in id order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn upstreams(&self, id: &str) -> impl Iterator<Item = &str> {
        self.tasks
            .get(id)
            .into_iter()
            .flat_map(|task| task.upstream_ids().iter().map(String::as_str))
    }

    pub fn downstreams(&self, id: &str) -> impl Iterator<Item = &str> {
        self.downstream
            .get(id)
            .into_iter()
            .flat_map(|children| children.iter().map(String::as_str))
    }

    pub fn in_degree(&self, id: &str) -> usize {
        self.tasks
            .get(id)
            .map_or(0, |task| task.upstream_ids().len())
    }

    /// A deterministic schedule: upstreams always precede downstreams, ties
    /// are broken by task id.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    pub fn roots(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| self.in_degree(id) == 0)
            .map(String::as_str)
            .collect()
    }

    pub fn sinks(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| self.downstreams(id).next().is_none())
            .map(String::as_str)
            .collect()
    }

    /// Every task reachable downstream of `id`, excluding `id` itself.
    pub fn descendants(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = self.downstreams(id).collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.to_string()) {
                queue.extend(self.downstreams(next));
            }
        }
        seen
    }

    /// Tasks with more than one downstream, mapped to those downstreams.
    pub fn fan_out_groups(&self) -> BTreeMap<&str, Vec<&str>> {
        self.downstream
            .iter()
            .filter(|(_, children)| children.len() > 1)
            .map(|(id, children)| (id.as_str(), children.iter().map(String::as_str).collect()))
            .collect()
    }

    /// Tasks with more than one upstream, mapped to those upstreams. These are
    /// the join points that wait for every upstream to succeed.
    pub fn fan_in_groups(&self) -> BTreeMap<&str, Vec<&str>> {
        self.tasks
            .iter()
            .filter(|(_, task)| task.upstream_ids().len() > 1)
            .map(|(id, task)| {
                (
                    id.as_str(),
                    task.upstream_ids().iter().map(String::as_str).collect(),
                )
            })
            .collect()
    }

    /// Checks that exactly one quality check exists, that it is the only sink,
    /// and that it joins directly on every load task.
    pub fn validate_quality_gate(&self) -> Result<(), GraphError> {
        let gates: Vec<&Task> = self
            .tasks()
            .filter(|task| matches!(task.kind(), TaskKind::QualityCheck(_)))
            .collect();
        let [gate] = gates.as_slice() else {
            return Err(GraphError::QualityGate(format!(
                "expected exactly one quality check task, found {}",
                gates.len()
            )));
        };

        let sinks = self.sinks();
        if sinks != [gate.id()] {
            return Err(GraphError::QualityGate(format!(
                "quality check {} must be the only sink, sinks are {sinks:?}",
                gate.id()
            )));
        }

        let loads: BTreeSet<&str> = self
            .tasks()
            .filter(|task| task.kind().is_load())
            .map(Task::id)
            .collect();
        let gate_upstreams: BTreeSet<&str> = self.upstreams(gate.id()).collect();
        if gate_upstreams != loads {
            return Err(GraphError::QualityGate(format!(
                "quality check {} must depend on exactly the load tasks {loads:?}, has {gate_upstreams:?}",
                gate.id()
            )));
        }
        Ok(())
    }

    /// Indented dependency tree starting at the roots.
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        for root in self.roots() {
            let _ = writeln!(out, "{root}");
            self.render_chain(&mut out, root, "  ");
        }
        out
    }

    fn render_chain(&self, out: &mut String, id: &str, prefix: &str) {
        for child in self.downstreams(id) {
            let _ = writeln!(out, "{prefix}└─> {child}");
            self.render_chain(out, child, &format!("{prefix}    "));
        }
    }
}

fn topological_sort(
    tasks: &BTreeMap<String, Task>,
    downstream: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, GraphError> {
    let mut in_degree: BTreeMap<&str, usize> = tasks
        .iter()
        .map(|(id, task)| (id.as_str(), task.upstream_ids().len()))
        .collect();
    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter_map(|(id, degree)| (*degree == 0).then_some(*id))
        .collect();
    let mut order = Vec::with_capacity(tasks.len());

    while let Some(id) = ready.pop_first() {
        order.push(id.to_string());
        for child in downstream.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(child.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(child.as_str());
                }
            }
        }
    }

    if order.len() != tasks.len() {
        let stuck = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        return Err(GraphError::Cycle(stuck));
    }
    Ok(order)
}

fn validate_task_id(task_id: &str) -> Result<(), GraphError> {
    let valid = !task_id.is_empty()
        && task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(GraphError::InvalidTaskId(task_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{LoadConfig, QualityCheckConfig};
    use crate::statement::Identifier;

    fn barrier(id: &str, deps: &[&str]) -> Task {
        Task::barrier(id).depends_on(deps.iter().copied())
    }

    fn diamond() -> Graph {
        Graph::from_tasks([
            barrier("a", &[]),
            barrier("b", &["a"]),
            barrier("c", &["a"]),
            barrier("d", &["b", "c"]),
        ])
        .expect("diamond builds")
    }

    #[test]
    fn builds_diamond_with_fan_groups() {
        let graph = diamond();
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.roots(), vec!["a"]);
        assert_eq!(graph.sinks(), vec!["d"]);
        assert_eq!(graph.in_degree("d"), 2);
        assert_eq!(graph.fan_out_groups()["a"], vec!["b", "c"]);
        assert_eq!(graph.fan_in_groups()["d"], vec!["b", "c"]);
        assert_eq!(graph.topological_order(), ["a", "b", "c", "d"]);
    }

    #[test]
    fn explicit_edges_merge_with_declared_upstreams() {
        let graph = Graph::build(
            [barrier("a", &[]), barrier("b", &[]), barrier("c", &["a"])],
            [("b".to_string(), "c".to_string())],
        )
        .unwrap();
        assert_eq!(graph.upstreams("c").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(graph.roots(), vec!["a", "b"]);
    }

    #[test]
    fn descendants_are_transitive() {
        let graph = diamond();
        let got: Vec<String> = graph.descendants("b").into_iter().collect();
        assert_eq!(got, vec!["d".to_string()]);
        assert_eq!(graph.descendants("a").len(), 3);
        assert!(graph.descendants("d").is_empty());
    }

    #[test]
    fn rejects_cycles_wherever_they_are() {
        let cases: Vec<Vec<Task>> = vec![
            vec![barrier("a", &["a"])],
            vec![barrier("a", &["b"]), barrier("b", &["a"])],
            vec![
                barrier("root", &[]),
                barrier("x", &["root", "z"]),
                barrier("y", &["x"]),
                barrier("z", &["y"]),
            ],
            vec![
                barrier("a", &[]),
                barrier("b", &["a"]),
                barrier("c", &["b", "d"]),
                barrier("d", &["c"]),
                barrier("sink", &["c"]),
            ],
        ];

        for tasks in cases {
            let err = Graph::from_tasks(tasks).expect_err("cycle should be rejected");
            assert!(matches!(err, GraphError::Cycle(_)), "got {err:?}");
        }
    }

    #[test]
    fn cycle_through_explicit_edge_is_rejected() {
        let err = Graph::build(
            [barrier("a", &[]), barrier("b", &["a"])],
            [("b".to_string(), "a".to_string())],
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = Graph::from_tasks([barrier("a", &["ghost"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                task: "a".to_string(),
                upstream: "ghost".to_string()
            }
        );

        let err = Graph::build(
            [barrier("a", &[])],
            [("a".to_string(), "ghost".to_string())],
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { .. }));
    }

    #[test]
    fn rejects_duplicates_empty_and_invalid_ids() {
        assert_eq!(
            Graph::from_tasks([barrier("a", &[]), barrier("a", &[])]).unwrap_err(),
            GraphError::DuplicateTask("a".to_string())
        );
        assert_eq!(
            Graph::from_tasks(Vec::<Task>::new()).unwrap_err(),
            GraphError::Empty
        );
        assert_eq!(
            Graph::from_tasks([barrier("a b", &[])]).unwrap_err(),
            GraphError::InvalidTaskId("a b".to_string())
        );
    }

    #[test]
    fn renders_tree_from_roots() {
        let tree = diamond().render_tree();
        assert!(tree.starts_with("a\n"));
        assert!(tree.contains("  └─> b\n"));
        assert!(tree.contains("      └─> d\n"));
    }

    fn load(id: &str, deps: &[&str]) -> Task {
        Task::load_dimension(
            id,
            LoadConfig::dimension(Identifier::new("t").unwrap(), "SELECT 1"),
        )
        .depends_on(deps.iter().copied())
    }

    fn gate(deps: &[&str]) -> Task {
        Task::quality_check("qc", QualityCheckConfig::non_empty(Vec::new())).depends_on(deps.iter().copied())
    }

    #[test]
    fn quality_gate_must_join_every_load() {
        let ok = Graph::from_tasks([load("l1", &[]), load("l2", &["l1"]), gate(&["l1", "l2"])])
            .unwrap();
        assert_eq!(ok.validate_quality_gate(), Ok(()));

        let missing_load =
            Graph::from_tasks([load("l1", &[]), load("l2", &["l1"]), gate(&["l2"])]).unwrap();
        assert!(matches!(
            missing_load.validate_quality_gate(),
            Err(GraphError::QualityGate(_))
        ));

        let extra_sink = Graph::from_tasks([
            load("l1", &[]),
            gate(&["l1"]),
            barrier("after", &["qc"]),
        ])
        .unwrap();
        assert!(matches!(
            extra_sink.validate_quality_gate(),
            Err(GraphError::QualityGate(_))
        ));

        let no_gate = Graph::from_tasks([load("l1", &[])]).unwrap();
        assert!(no_gate.validate_quality_gate().is_err());
    }
}
