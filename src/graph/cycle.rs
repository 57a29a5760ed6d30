//! Deterministic topological ordering with minimal-cycle reporting.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};

/// Orders `0..preds.len()` so every node comes after its predecessors.
///
/// Among nodes that are ready at the same time the one with the smallest
/// `rank` wins, which makes the order reproducible. When no order exists the
/// error holds one shortest cycle, listed so each element depends on the
/// next and the last depends on the first.
pub(crate) fn topological_order<K: Ord + Copy>(
    preds: &[Vec<usize>],
    rank: impl Fn(usize) -> K,
) -> Result<Vec<usize>, Vec<usize>> {
    let n = preds.len();
    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut waiting: Vec<usize> = vec![0; n];
    for (node, node_preds) in preds.iter().enumerate() {
        for &p in node_preds {
            succs[p].push(node);
            waiting[node] += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<(K, usize)>> = (0..n)
        .filter(|&i| waiting[i] == 0)
        .map(|i| Reverse((rank(i), i)))
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(Reverse((_, node))) = ready.pop() {
        order.push(node);
        for &s in &succs[node] {
            waiting[s] -= 1;
            if waiting[s] == 0 {
                ready.push(Reverse((rank(s), s)));
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }

    let emitted: HashSet<usize> = order.into_iter().collect();
    let mut remaining: Vec<usize> = (0..n).filter(|i| !emitted.contains(i)).collect();
    remaining.sort_by_key(|&i| (rank(i), i));
    Err(shortest_cycle(preds, &remaining))
}

/// Finds a shortest cycle among `remaining` following predecessor edges.
fn shortest_cycle(preds: &[Vec<usize>], remaining: &[usize]) -> Vec<usize> {
    let within: HashSet<usize> = remaining.iter().copied().collect();
    let mut best: Option<Vec<usize>> = None;

    for &start in remaining {
        let mut parent: Vec<Option<usize>> = vec![None; preds.len()];
        let mut seen: HashSet<usize> = HashSet::new();
        let mut queue = VecDeque::from([start]);
        seen.insert(start);
        let mut closing = None;

        'bfs: while let Some(node) = queue.pop_front() {
            for &next in &preds[node] {
                if !within.contains(&next) {
                    continue;
                }
                if next == start {
                    closing = Some(node);
                    break 'bfs;
                }
                if seen.insert(next) {
                    parent[next] = Some(node);
                    queue.push_back(next);
                }
            }
        }

        let Some(mut node) = closing else {
            continue;
        };
        let mut path = vec![node];
        while let Some(p) = parent[node] {
            path.push(p);
            node = p;
        }
        path.reverse();

        if best.as_ref().is_none_or(|b| path.len() < b.len()) {
            best = Some(path);
        }
    }

    best.unwrap_or_else(|| remaining.to_vec())
}
