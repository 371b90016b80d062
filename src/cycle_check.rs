use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Depth-first search over `task -> upstreams`. Returns the first cycle found
/// as a closed path (`[a, b, c, a]`), or `None` when the relation is acyclic.
/// Traversal order is deterministic so the reported cycle is stable.
pub fn find_cycle(upstreams: &BTreeMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut path: Vec<String> = Vec::new();
    let mut on_path = HashSet::new();

    fn dfs(
        task_id: &str,
        upstreams: &BTreeMap<String, BTreeSet<String>>,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
        on_path: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        if on_path.contains(task_id) {
            let start = path.iter().position(|id| id == task_id).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(task_id.to_string());
            return Some(cycle);
        }
        if visited.contains(task_id) {
            return None;
        }

        visited.insert(task_id.to_string());
        on_path.insert(task_id.to_string());
        path.push(task_id.to_string());

        if let Some(deps) = upstreams.get(task_id) {
            for dep in deps {
                if let Some(cycle) = dfs(dep, upstreams, visited, path, on_path) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        on_path.remove(task_id);
        None
    }

    for task_id in upstreams.keys() {
        if !visited.contains(task_id) {
            if let Some(cycle) = dfs(task_id, upstreams, &mut visited, &mut path, &mut on_path) {
                return Some(cycle);
            }
        }
    }

    None
}
