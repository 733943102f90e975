//! Loss and gradients for directional mutation.
//!
//! The loss between a forbidden trace and the current trace is the cosine
//! similarity of their mean embeddings remapped to [0, 1]: 1 means "the
//! current execution behaves like the one we want to get away from". The
//! chain rule dL/dx = (dy/dx)^T * dL/dy turns that into a per-byte update
//! direction for the next input.
//!
//! dL/dy[i] = loss / dy[i] is not the analytic derivative of anything; it is
//! the scheme this fuzzer is built around and is kept exactly as is.

use crate::graph::ExploredGraph;
use crate::knowledge::FuzzExecution;

pub(crate) fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let len = a.len().max(b.len());
    let mut dot = 0.0;
    let mut mag_a = 0.0;
    let mut mag_b = 0.0;
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0.0);
        let y = b.get(i).copied().unwrap_or(0.0);
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b).sqrt()
}

/// Similarity of the two traces in embedding space, in [0, 1]. Both traces
/// are folded into the graph and embeddings are retrained first, so the loss
/// is always computed against the freshest embedding of both walks.
pub(crate) fn embedding_loss(graph: &ExploredGraph, forbidden: &[u32], current: &[u32]) -> f64 {
    assert!(!forbidden.is_empty(), "embedding_loss: empty forbidden trace");
    assert!(!current.is_empty(), "embedding_loss: empty current trace");

    graph.update_from_trace(current);
    graph.update_from_trace(forbidden);
    graph.update_embeddings();

    let mean_current = graph.mean_embedding(current);
    let mean_forbidden = graph.mean_embedding(forbidden);
    let similarity = cosine_similarity(&mean_current, &mean_forbidden);
    (similarity + 1.0) / 2.0
}

/// Per-position embedding distance between the two traces. Positions past
/// the end of one trace use the other node's distance to the origin.
fn position_distances(graph: &ExploredGraph, forbidden: &[u32], current: &[u32]) -> Vec<f64> {
    let len = forbidden.len().max(current.len());
    let mut distances = vec![0.0; len];
    for (i, slot) in distances.iter_mut().enumerate() {
        *slot = match (forbidden.get(i), current.get(i)) {
            (Some(&a), Some(&b)) => graph.node_distance(a, b),
            (Some(&a), None) => graph.node_distance_from_origin(a),
            (None, Some(&b)) => graph.node_distance_from_origin(b),
            (None, None) => unreachable!(),
        };
    }
    distances
}

/// dL/dy: how the loss responds at each trace position. Where the traces are
/// equidistant (dy = 0) the raw loss is used as the gradient signal.
pub(crate) fn trace_loss_gradient(
    graph: &ExploredGraph,
    forbidden: &[u32],
    current: &[u32],
) -> Vec<f64> {
    let loss = embedding_loss(graph, forbidden, current);
    position_distances(graph, forbidden, current)
        .into_iter()
        .map(|dy| if dy != 0.0 { loss / dy } else { loss })
        .collect()
}

/// dy/dx: the n x m Jacobian of trace positions with respect to input bytes.
/// Missing bytes count as 0; columns where the inputs agree are zeroed.
pub(crate) fn behavioral_gradient(
    graph: &ExploredGraph,
    forbidden: &FuzzExecution,
    current: &FuzzExecution,
) -> Vec<Vec<f64>> {
    graph.update_from_trace(&forbidden.trace);
    graph.update_from_trace(&current.trace);
    graph.update_embeddings();

    let dy = position_distances(graph, &forbidden.trace, &current.trace);

    let dim_x = forbidden.input.len().max(current.input.len());
    let mut dx = vec![0.0; dim_x];
    for (j, slot) in dx.iter_mut().enumerate() {
        let a = forbidden.input.get(j).copied().unwrap_or(0) as f64;
        let b = current.input.get(j).copied().unwrap_or(0) as f64;
        *slot = b - a;
    }

    dy.iter()
        .map(|&dy_i| {
            dx.iter()
                .map(|&dx_j| if dx_j != 0.0 { dy_i / dx_j } else { 0.0 })
                .collect()
        })
        .collect()
}

/// One gradient-descent step in input space, away from the forbidden
/// execution. Frozen bytes (exploration speed <= 0) are copied unchanged;
/// live bytes move by their own learning rate, clamped below at 0 and
/// wrapped modulo 256 above 255.
pub(crate) fn generate_new_input(
    graph: &ExploredGraph,
    forbidden: &FuzzExecution,
    current: &FuzzExecution,
    exploration_speed: &[f64],
) -> Vec<u8> {
    let dl_dy = trace_loss_gradient(graph, &forbidden.trace, &current.trace);
    let jacobian = behavioral_gradient(graph, forbidden, current);

    assert!(!jacobian.is_empty(), "generate_new_input: empty jacobian");
    let dim_y = jacobian.len();
    let dim_x = jacobian[0].len();
    assert_eq!(
        dim_y,
        dl_dy.len(),
        "generate_new_input: jacobian rows do not match dL/dy"
    );
    assert_eq!(
        exploration_speed.len(),
        dim_x,
        "generate_new_input: exploration speed does not match input size"
    );

    // dL/dx = J^T * dL/dy
    let mut dl_dx = vec![0.0; dim_x];
    for (i, row) in jacobian.iter().enumerate() {
        for (j, &value) in row.iter().enumerate() {
            dl_dx[j] += value * dl_dy[i];
        }
    }

    let mut output = vec![0u8; dim_x];
    for j in 0..dim_x {
        let byte = current.input.get(j).copied().unwrap_or(0);
        let eta = exploration_speed[j];
        output[j] = if eta <= 0.0 {
            byte
        } else {
            descend_byte(byte, eta, dl_dx[j])
        };
    }
    output
}

/// x - eta * dL/dx, clamped below at 0 and wrapped modulo 256 above 255.
fn descend_byte(byte: u8, eta: f64, gradient: f64) -> u8 {
    let mut updated = byte as f64 - eta * gradient;
    if updated < 0.0 {
        updated = 0.0;
    } else if updated > 255.0 {
        updated %= 256.0;
    }
    updated.round() as u8
}
