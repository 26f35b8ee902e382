//! Deadlock detection over the wait-for graph.

use crate::lock::manager::LockState;
use crate::types::TransactionId;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

type WaitGraph = HashMap<TransactionId, Vec<TransactionId>>;

/// Builds the wait-for graph: an edge `a -> b` means `a` waits for a lock
/// `b` holds or is queued ahead for. Lockers already chosen as victims are
/// left out.
fn build_graph(st: &LockState) -> WaitGraph {
    let mut graph: WaitGraph = HashMap::new();
    for entry in st.objects.values() {
        for (pos, waiter) in entry.waiting.iter().enumerate() {
            if st.is_victim(waiter.txid) {
                continue;
            }
            let edges = graph.entry(waiter.txid).or_default();
            for grant in &entry.granted {
                if grant.txid != waiter.txid && !grant.mode.compatible(waiter.mode) {
                    edges.push(grant.txid);
                }
            }
            if !waiter.upgrade {
                for ahead in entry.waiting.iter().take(pos) {
                    if ahead.txid != waiter.txid && !ahead.mode.compatible(waiter.mode) {
                        edges.push(ahead.txid);
                    }
                }
            }
        }
    }
    graph
}

fn find_cycle(graph: &WaitGraph) -> Option<Vec<TransactionId>> {
    fn visit(
        node: TransactionId,
        graph: &WaitGraph,
        done: &mut HashSet<TransactionId>,
        path: &mut Vec<TransactionId>,
    ) -> Option<Vec<TransactionId>> {
        if let Some(at) = path.iter().position(|&t| t == node) {
            return Some(path[at..].to_vec());
        }
        if done.contains(&node) {
            return None;
        }
        path.push(node);
        if let Some(next) = graph.get(&node) {
            for &n in next {
                if let Some(cycle) = visit(n, graph, done, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        done.insert(node);
        None
    }

    let mut done = HashSet::new();
    let mut starts: Vec<TransactionId> = graph.keys().copied().collect();
    starts.sort_unstable();
    for start in starts {
        let mut path = Vec::new();
        if let Some(cycle) = visit(start, graph, &mut done, &mut path) {
            return Some(cycle);
        }
    }
    None
}

/// Picks one victim per cycle until the graph is acyclic.
///
/// The victim is the unprotected locker with the least log activity, the
/// youngest (highest ID) on ties. A cycle of protected lockers only is
/// broken without a victim.
pub(crate) fn find_victims(st: &LockState) -> Vec<TransactionId> {
    let mut graph = build_graph(st);
    let mut victims = Vec::new();
    while let Some(cycle) = find_cycle(&graph) {
        let victim = cycle
            .iter()
            .copied()
            .filter(|&t| !st.is_protected(t))
            .min_by_key(|&t| (st.activity(t), Reverse(t)));
        match victim {
            Some(v) => {
                graph.remove(&v);
                victims.push(v);
            }
            None => {
                tracing::warn!(?cycle, "deadlock among protected lockers");
                if let Some(first) = cycle.first() {
                    graph.remove(first);
                }
            }
        }
    }
    victims
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: u64) -> TransactionId {
        TransactionId::new(n)
    }

    #[test]
    fn finds_simple_cycle() {
        let mut graph = WaitGraph::new();
        graph.insert(t(1), vec![t(2)]);
        graph.insert(t(2), vec![t(3)]);
        graph.insert(t(3), vec![t(1)]);
        let mut cycle = find_cycle(&graph).unwrap();
        cycle.sort_unstable();
        assert_eq!(cycle, vec![t(1), t(2), t(3)]);
    }

    #[test]
    fn acyclic_graph() {
        let mut graph = WaitGraph::new();
        graph.insert(t(1), vec![t(2), t(3)]);
        graph.insert(t(2), vec![t(3)]);
        assert!(find_cycle(&graph).is_none());
    }

    #[test]
    fn cycle_excludes_tail() {
        let mut graph = WaitGraph::new();
        graph.insert(t(1), vec![t(2)]);
        graph.insert(t(2), vec![t(3)]);
        graph.insert(t(3), vec![t(2)]);
        let mut cycle = find_cycle(&graph).unwrap();
        cycle.sort_unstable();
        assert_eq!(cycle, vec![t(2), t(3)]);
    }
}
