//! The explored graph: every basic block the target has ever visited, the
//! transitions between them, and a learned embedding per block.
//!
//! Traces are walks over this graph. Embeddings are trained online with
//! Node2Vec-style biased random walks and Skip-gram with negative sampling,
//! so that the distance between two traces' mean embeddings reflects how
//! structurally different the executions were.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use speedy::{Readable, Writable};

use crate::error::Error;
use crate::HashMap;

pub(crate) type Embedding = Vec<f64>;

/// Node2Vec / Skip-gram hyperparameters. Immutable once the graph exists.
#[derive(Debug, Clone, PartialEq, Readable, Writable)]
pub(crate) struct GraphParams {
    pub dim: u32,
    /// Return bias: weight 1/p for stepping back to the previous node.
    pub p: f64,
    /// In-out bias: weight 1/q for stepping outside the previous node's
    /// neighborhood.
    pub q: f64,
    pub walk_length: u32,
    pub walks_per_node: u32,
    pub window: u32,
    pub learning_rate: f64,
    pub negative_samples: u32,
    pub rng_seed: u64,
}

impl Default for GraphParams {
    fn default() -> Self {
        Self {
            dim: 4,
            p: 1.0,
            q: 1.0,
            walk_length: 10,
            walks_per_node: 5,
            window: 3,
            learning_rate: 0.025,
            negative_samples: 5,
            rng_seed: 42,
        }
    }
}

/// Deep copy of the graph without its lock or RNG. This is what crash
/// records and checkpoints persist. Entries are sorted by node id so two
/// snapshots of equal graphs compare equal.
#[derive(Debug, Clone, PartialEq, Readable, Writable)]
pub(crate) struct GraphSnapshot {
    pub params: GraphParams,
    pub nodes: Vec<(u32, Vec<u32>)>,
    pub embeddings: Vec<(u32, Embedding)>,
    pub zero_embedding: Embedding,
}

struct GraphState {
    adjacency: HashMap<u32, Vec<u32>>,
    embeddings: HashMap<u32, Embedding>,
    rng: StdRng,
}

pub(crate) struct ExploredGraph {
    params: GraphParams,
    zero: Embedding,
    state: Mutex<GraphState>,
}

impl ExploredGraph {
    pub(crate) fn new(params: GraphParams) -> Self {
        let zero = vec![0.0; params.dim as usize];
        let rng = StdRng::seed_from_u64(params.rng_seed);
        Self {
            params,
            zero,
            state: Mutex::new(GraphState {
                adjacency: HashMap::default(),
                embeddings: HashMap::default(),
                rng,
            }),
        }
    }

    pub(crate) fn node_count(&self) -> usize {
        self.state.lock().unwrap().adjacency.len()
    }

    /// Add every node and adjacent-pair edge of a trace. New nodes get an
    /// embedding initialized uniformly in (-0.1, 0.1) per component.
    /// Neighbor lists stay duplicate-free; insertion order is retained.
    pub(crate) fn update_from_trace(&self, trace: &[u32]) {
        let GraphState {
            adjacency,
            embeddings,
            rng,
        } = &mut *self.state.lock().unwrap();
        let dim = self.params.dim as usize;
        for (i, &node) in trace.iter().enumerate() {
            adjacency.entry(node).or_default();
            embeddings
                .entry(node)
                .or_insert_with(|| (0..dim).map(|_| rng.random_range(-0.1..0.1)).collect());
            if let Some(&next) = trace.get(i + 1) {
                let neighbors = adjacency.get_mut(&node).unwrap();
                if !neighbors.contains(&next) {
                    neighbors.push(next);
                }
            }
        }
    }

    /// One full training round: `walks_per_node` passes where every
    /// non-isolated node seeds one biased walk that is fed to Skip-gram.
    pub(crate) fn update_embeddings(&self) {
        let state = &mut *self.state.lock().unwrap();
        if state.adjacency.is_empty() || state.embeddings.is_empty() {
            return;
        }
        let starts: Vec<u32> = state
            .adjacency
            .iter()
            .filter(|(_, neighbors)| !neighbors.is_empty())
            .map(|(&node, _)| node)
            .collect();
        for _ in 0..self.params.walks_per_node {
            for &start in &starts {
                let GraphState {
                    adjacency,
                    embeddings,
                    rng,
                } = &mut *state;
                let walk = biased_walk(adjacency, rng, &self.params, start);
                if walk.len() >= 2 {
                    train_skip_gram(embeddings, rng, &self.params, &walk);
                }
            }
        }
    }

    /// Mean of the embeddings of the trace's nodes, divided by the number of
    /// nodes that actually have an embedding. All-unknown traces map to the
    /// origin.
    pub(crate) fn mean_embedding(&self, trace: &[u32]) -> Embedding {
        assert!(!trace.is_empty(), "mean_embedding: empty trace");
        let state = self.state.lock().unwrap();
        let mut sum = vec![0.0; self.params.dim as usize];
        let mut contributing = 0usize;
        for node in trace {
            if let Some(embedding) = state.embeddings.get(node) {
                for (acc, value) in sum.iter_mut().zip(embedding) {
                    *acc += value;
                }
                contributing += 1;
            }
        }
        if contributing == 0 {
            return self.zero.clone();
        }
        for value in &mut sum {
            *value /= contributing as f64;
        }
        sum
    }

    pub(crate) fn embedding_of(&self, node: u32) -> Embedding {
        let state = self.state.lock().unwrap();
        state
            .embeddings
            .get(&node)
            .cloned()
            .unwrap_or_else(|| self.zero.clone())
    }

    pub(crate) fn node_distance(&self, a: u32, b: u32) -> f64 {
        embedding_distance(&self.embedding_of(a), &self.embedding_of(b))
    }

    pub(crate) fn node_distance_from_origin(&self, node: u32) -> f64 {
        embedding_distance(&self.embedding_of(node), &self.zero)
    }

    pub(crate) fn snapshot(&self) -> GraphSnapshot {
        let state = self.state.lock().unwrap();
        let mut nodes: Vec<(u32, Vec<u32>)> = state
            .adjacency
            .iter()
            .map(|(&node, neighbors)| (node, neighbors.clone()))
            .collect();
        nodes.sort_unstable_by_key(|(node, _)| *node);
        let mut embeddings: Vec<(u32, Embedding)> = state
            .embeddings
            .iter()
            .map(|(&node, embedding)| (node, embedding.clone()))
            .collect();
        embeddings.sort_unstable_by_key(|(node, _)| *node);
        GraphSnapshot {
            params: self.params.clone(),
            nodes,
            embeddings,
            zero_embedding: self.zero.clone(),
        }
    }

    /// Rebuild a graph from a snapshot. The RNG is reseeded from the stored
    /// seed; walk randomness is not part of the persisted state.
    pub(crate) fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self, Error> {
        let dim = snapshot.params.dim as usize;
        if snapshot.zero_embedding.len() != dim {
            return Err(Error::Corrupt(format!(
                "zero embedding has {} components, expected {dim}",
                snapshot.zero_embedding.len()
            )));
        }
        let graph = Self::new(snapshot.params);
        {
            let state = &mut *graph.state.lock().unwrap();
            for (node, neighbors) in snapshot.nodes {
                state.adjacency.insert(node, neighbors);
            }
            for (node, embedding) in snapshot.embeddings {
                if embedding.len() != dim {
                    return Err(Error::Corrupt(format!(
                        "embedding for node {node:#x} has {} components, expected {dim}",
                        embedding.len()
                    )));
                }
                state.embeddings.insert(node, embedding);
            }
            for node in state.adjacency.keys() {
                if !state.embeddings.contains_key(node) {
                    return Err(Error::Corrupt(format!(
                        "node {node:#x} has no embedding"
                    )));
                }
            }
        }
        Ok(graph)
    }
}

/// Euclidean distance, treating components past either vector's end as zero.
pub(crate) fn embedding_distance(a: &[f64], b: &[f64]) -> f64 {
    let dim = a.len().max(b.len());
    let mut sum = 0.0;
    for i in 0..dim {
        let diff = b.get(i).copied().unwrap_or(0.0) - a.get(i).copied().unwrap_or(0.0);
        sum += diff * diff;
    }
    sum.sqrt()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Second-order biased random walk. Starts at `start`; the second step is
/// uniform, later steps are weighted 1/p back to the previous node, 1 for
/// common neighbors of the previous node, 1/q otherwise. Stops early at
/// sinks.
fn biased_walk(
    adjacency: &HashMap<u32, Vec<u32>>,
    rng: &mut StdRng,
    params: &GraphParams,
    start: u32,
) -> Vec<u32> {
    if params.walk_length == 0 {
        return Vec::new();
    }
    let mut walk = vec![start];
    if params.walk_length == 1 {
        return walk;
    }
    let Some(neighbors) = adjacency.get(&start) else {
        return walk;
    };
    if neighbors.is_empty() {
        return walk;
    }

    let mut prev = start;
    let mut curr = neighbors[rng.random_range(0..neighbors.len())];
    walk.push(curr);

    for _ in 2..params.walk_length {
        let Some(neighbors) = adjacency.get(&curr) else {
            break;
        };
        if neighbors.is_empty() {
            break;
        }

        let mut weights = Vec::with_capacity(neighbors.len());
        let mut total = 0.0;
        for &next in neighbors {
            let w = if next == prev {
                1.0 / params.p
            } else if adjacency
                .get(&prev)
                .is_some_and(|prev_neighbors| prev_neighbors.contains(&next))
            {
                1.0
            } else {
                1.0 / params.q
            };
            weights.push(w);
            total += w;
        }
        if total > 0.0 {
            for w in &mut weights {
                *w /= total;
            }
        } else {
            let uniform = 1.0 / neighbors.len() as f64;
            for w in &mut weights {
                *w = uniform;
            }
        }

        // Inverse-CDF sampling.
        let draw = rng.random::<f64>();
        let mut cumulative = 0.0;
        let mut next = neighbors[0];
        for (j, &candidate) in neighbors.iter().enumerate() {
            cumulative += weights[j];
            if draw <= cumulative {
                next = candidate;
                break;
            }
        }

        prev = curr;
        curr = next;
        walk.push(curr);
    }
    walk
}

/// Skip-gram SGD over one walk, with negative sampling. Positive pairs share
/// one gradient factor and each side is updated from the other's pre-update
/// vector; negative updates write the center first, so the negative's update
/// sees the new center. This in-place formulation is intentional.
fn train_skip_gram(
    embeddings: &mut HashMap<u32, Embedding>,
    rng: &mut StdRng,
    params: &GraphParams,
    walk: &[u32],
) {
    if walk.len() < 2 {
        return;
    }

    let in_walk: crate::HashSet<u32> = walk.iter().copied().collect();
    let mut negative_pool: Vec<u32> = embeddings
        .keys()
        .filter(|node| !in_walk.contains(node))
        .copied()
        .collect();
    if negative_pool.is_empty() {
        negative_pool = embeddings.keys().copied().collect();
    }

    let dim = params.dim as usize;
    let window = params.window as usize;
    for (i, &center) in walk.iter().enumerate() {
        if !embeddings.contains_key(&center) {
            continue;
        }
        let lo = i.saturating_sub(window);
        let hi = walk.len().min(i + window + 1);
        for j in lo..hi {
            if j == i {
                continue;
            }
            let context = walk[j];
            if !embeddings.contains_key(&context) {
                continue;
            }

            let center_old = embeddings[&center].clone();
            let context_old = embeddings[&context].clone();
            let g = params.learning_rate * (1.0 - sigmoid(dot(&center_old, &context_old)));
            {
                let c = embeddings.get_mut(&center).unwrap();
                for d in 0..dim {
                    c[d] += g * context_old[d];
                }
            }
            {
                let o = embeddings.get_mut(&context).unwrap();
                for d in 0..dim {
                    o[d] += g * center_old[d];
                }
            }

            for _ in 0..params.negative_samples {
                let negative = negative_pool[rng.random_range(0..negative_pool.len())];
                if negative == center || negative == context {
                    continue;
                }
                let Some(negative_old) = embeddings.get(&negative).cloned() else {
                    continue;
                };
                let center_current = embeddings[&center].clone();
                let g = -params.learning_rate * sigmoid(dot(&center_current, &negative_old));
                {
                    let c = embeddings.get_mut(&center).unwrap();
                    for d in 0..dim {
                        c[d] += g * negative_old[d];
                    }
                }
                let center_updated = embeddings[&center].clone();
                {
                    let n = embeddings.get_mut(&negative).unwrap();
                    for d in 0..dim {
                        n[d] += g * center_updated[d];
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_graph() -> ExploredGraph {
        ExploredGraph::new(GraphParams::default())
    }

    #[test]
    fn trace_builds_nodes_edges_and_embeddings() {
        let graph = small_graph();
        graph.update_from_trace(&[10, 20, 10, 30]);

        let snapshot = graph.snapshot();
        assert_eq!(
            snapshot.nodes,
            vec![(10, vec![20, 30]), (20, vec![10]), (30, vec![])]
        );
        assert_eq!(snapshot.embeddings.len(), 3);
        for (_, embedding) in &snapshot.embeddings {
            assert_eq!(embedding.len(), 4);
            assert!(embedding.iter().all(|v| (-0.1..0.1).contains(v)));
        }
    }

    #[test]
    fn repeated_edges_are_not_duplicated() {
        let graph = small_graph();
        graph.update_from_trace(&[1, 2, 1, 2, 1, 2]);
        let snapshot = graph.snapshot();
        assert_eq!(snapshot.nodes, vec![(1, vec![2]), (2, vec![1])]);
    }

    #[test]
    fn walk_from_sink_is_single_element() {
        let graph = small_graph();
        graph.update_from_trace(&[1, 2]);
        let state = &mut *graph.state.lock().unwrap();
        let GraphState {
            adjacency, rng, ..
        } = &mut *state;
        // node 2 has no out-neighbors
        assert_eq!(biased_walk(adjacency, rng, &graph.params, 2), vec![2]);
    }

    #[test]
    fn walk_respects_length_limits() {
        let mut params = GraphParams::default();
        params.walk_length = 0;
        let graph = ExploredGraph::new(params);
        graph.update_from_trace(&[1, 2, 3]);
        {
            let state = &mut *graph.state.lock().unwrap();
            let GraphState {
                adjacency, rng, ..
            } = &mut *state;
            assert!(biased_walk(adjacency, rng, &graph.params, 1).is_empty());
        }

        let mut params = GraphParams::default();
        params.walk_length = 1;
        let graph = ExploredGraph::new(params);
        graph.update_from_trace(&[1, 2, 3]);
        let state = &mut *graph.state.lock().unwrap();
        let GraphState {
            adjacency, rng, ..
        } = &mut *state;
        assert_eq!(biased_walk(adjacency, rng, &graph.params, 1), vec![1]);
    }

    #[test]
    fn walks_stay_on_edges() {
        let graph = small_graph();
        graph.update_from_trace(&[1, 2, 3, 1, 4, 2]);
        let state = &mut *graph.state.lock().unwrap();
        let GraphState {
            adjacency, rng, ..
        } = &mut *state;
        for _ in 0..50 {
            let walk = biased_walk(adjacency, rng, &graph.params, 1);
            assert!(walk.len() <= graph.params.walk_length as usize);
            for pair in walk.windows(2) {
                assert!(adjacency[&pair[0]].contains(&pair[1]));
            }
        }
    }

    #[test]
    fn update_embeddings_moves_connected_nodes() {
        let graph = small_graph();
        graph.update_from_trace(&[1, 2, 3, 4, 1]);
        let before = graph.embedding_of(1);
        graph.update_embeddings();
        let after = graph.embedding_of(1);
        assert_eq!(after.len(), 4);
        assert_ne!(before, after);
    }

    #[test]
    fn mean_embedding_of_unknown_nodes_is_origin() {
        let graph = small_graph();
        graph.update_from_trace(&[1, 2]);
        assert_eq!(graph.mean_embedding(&[999, 1000]), vec![0.0; 4]);
    }

    #[test]
    fn mean_embedding_divides_by_contributing_nodes() {
        let graph = small_graph();
        graph.update_from_trace(&[1, 2]);
        let e1 = graph.embedding_of(1);
        let e2 = graph.embedding_of(2);
        // 999 is unknown and must not dilute the mean
        let mean = graph.mean_embedding(&[1, 2, 999]);
        for d in 0..4 {
            assert!((mean[d] - (e1[d] + e2[d]) / 2.0).abs() < 1e-12);
        }
    }

    #[test]
    fn distance_to_self_is_zero() {
        let graph = small_graph();
        graph.update_from_trace(&[1, 2]);
        assert_eq!(graph.node_distance(1, 1), 0.0);
        let e = graph.embedding_of(2);
        assert_eq!(embedding_distance(&e, &e), 0.0);
    }

    #[test]
    fn origin_distance_of_missing_node_is_zero() {
        let graph = small_graph();
        assert_eq!(graph.node_distance_from_origin(12345), 0.0);
    }

    #[test]
    fn snapshot_roundtrip_preserves_graph() {
        let graph = small_graph();
        graph.update_from_trace(&[10, 20, 30, 10]);
        graph.update_embeddings();
        let snapshot = graph.snapshot();
        let restored = ExploredGraph::from_snapshot(snapshot.clone()).unwrap();
        assert_eq!(restored.snapshot(), snapshot);
    }

    #[test]
    fn snapshot_with_bad_dimension_is_rejected() {
        let graph = small_graph();
        graph.update_from_trace(&[10, 20]);
        let mut snapshot = graph.snapshot();
        snapshot.embeddings[0].1.push(0.5);
        assert!(ExploredGraph::from_snapshot(snapshot).is_err());
    }
}
