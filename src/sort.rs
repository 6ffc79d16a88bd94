//! Generic topological sort over an abstract successor relation.
//!
//! Grounded on the dependents-map / in-degree-counting shape of
//! `run_tasks_parallel` in the teacher's executor, adapted here from a
//! parallel Kahn's-algorithm scheduler into a sequential reverse-postorder
//! DFS that, unlike `petgraph::algo::toposort`, reports the actual cycle
//! path on failure.

use std::collections::HashSet;
use std::hash::Hash;

/// A node is in one of three states during the DFS: unvisited, currently on
/// the recursion stack (`InProgress`), or fully processed (`Done`).
#[derive(PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Topologically sort every node reachable from `seeds` under `successors`.
///
/// Returns nodes ordered so that every node precedes all of its successors.
/// Nodes with no entry in `successors` are treated as having none. On a
/// cycle, returns the cycle path (seed-to-repeat) rather than the full order.
pub fn topo_sort<N, F, I>(seeds: impl IntoIterator<Item = N>, mut successors: F) -> Result<Vec<N>, Vec<N>>
where
    N: Clone + Eq + Hash,
    F: FnMut(&N) -> I,
    I: IntoIterator<Item = N>,
{
    let mut marks: std::collections::HashMap<N, Mark> = std::collections::HashMap::new();
    let mut order = Vec::new();
    let mut stack_path: Vec<N> = Vec::new();
    let mut seen_seeds = HashSet::new();

    for seed in seeds {
        if !seen_seeds.insert(seed.clone()) {
            continue;
        }
        if let Err(cycle) = visit(&seed, &mut successors, &mut marks, &mut order, &mut stack_path) {
            return Err(cycle);
        }
    }

    order.reverse();
    Ok(order)
}

fn visit<N, F, I>(
    node: &N,
    successors: &mut F,
    marks: &mut std::collections::HashMap<N, Mark>,
    order: &mut Vec<N>,
    stack_path: &mut Vec<N>,
) -> Result<(), Vec<N>>
where
    N: Clone + Eq + Hash,
    F: FnMut(&N) -> I,
    I: IntoIterator<Item = N>,
{
    match marks.get(node) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::InProgress) => {
            let mut path: Vec<N> = stack_path
                .iter()
                .skip_while(|n| *n != node)
                .cloned()
                .collect();
            path.push(node.clone());
            return Err(path);
        }
        None => {}
    }

    marks.insert(node.clone(), Mark::InProgress);
    stack_path.push(node.clone());

    for succ in successors(node) {
        visit(&succ, successors, marks, order, stack_path)?;
    }

    stack_path.pop();
    marks.insert(node.clone(), Mark::Done);
    order.push(node.clone());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn relation(edges: &[(i32, i32)]) -> HashMap<i32, Vec<i32>> {
        let mut map: HashMap<i32, Vec<i32>> = HashMap::new();
        for &(a, b) in edges {
            map.entry(a).or_default().push(b);
        }
        map
    }

    #[test]
    fn linear_chain_orders_before_successors() {
        let rel = relation(&[(1, 2), (2, 3)]);
        let order = topo_sort([1], |n| rel.get(n).cloned().unwrap_or_default()).unwrap();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn diamond_visits_each_node_once() {
        let rel = relation(&[(1, 2), (1, 3), (2, 4), (3, 4)]);
        let order = topo_sort([1], |n| rel.get(n).cloned().unwrap_or_default()).unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(order.last(), Some(&4));
        assert_eq!(order.first(), Some(&1));
    }

    #[test]
    fn cycle_is_detected_with_path() {
        let rel = relation(&[(1, 2), (2, 1)]);
        let err = topo_sort([1], |n| rel.get(n).cloned().unwrap_or_default()).unwrap_err();
        assert_eq!(err, vec![1, 2, 1]);
    }
}
