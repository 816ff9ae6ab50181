//! WF-003: Layer order resolution.
//!
//! Builds the strictly-before graph over every layer of every registered
//! class and linearizes it with Kahn's algorithm. Ties among ready layers are
//! broken by the class's first-seen key. Two ready layers of different
//! classes sharing the smallest key cannot be ordered and fail the run, as
//! does a cycle.

use super::diagnostics::{Diagnostic, DiagnosticCode, DiagnosticSink};
use super::error::WeaveError;
use super::registry::{AspectLayer, AspectRegistry, ClassId, OrderedAspectLayer};
use rustc_hash::FxHashMap;

/// Tie-break key: invoked classes by first-seen position, then the rest in
/// registration order.
fn class_key(class: ClassId, first_seen: &FxHashMap<ClassId, u32>) -> (u8, u32) {
    match first_seen.get(&class) {
        Some(pos) => (0, *pos),
        None => (1, class.0),
    }
}

struct Node {
    layer: AspectLayer,
    class: ClassId,
    /// Index of the layer within its class.
    rank: usize,
}

/// Compute the total layer order. Fatal problems are reported to `sink` and
/// returned as [`WeaveError::Ordering`].
pub fn build_layer_order(
    registry: &AspectRegistry,
    first_seen: &FxHashMap<ClassId, u32>,
    sink: &dyn DiagnosticSink,
) -> Result<Vec<OrderedAspectLayer>, WeaveError> {
    let mut nodes: Vec<Node> = Vec::new();
    let mut index: FxHashMap<AspectLayer, usize> = FxHashMap::default();
    for class in registry.classes() {
        for (rank, layer) in class.aspect_layers().into_iter().enumerate() {
            index.insert(layer.clone(), nodes.len());
            nodes.push(Node {
                layer,
                class: class.id,
                rank,
            });
        }
    }

    let mut in_degree = vec![0usize; nodes.len()];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut add_edge = |from: usize, to: usize| {
        if !adjacency[from].contains(&to) {
            adjacency[from].push(to);
            in_degree[to] += 1;
        }
    };

    // Primary precedes its sub-layers, which follow in declaration order.
    for pair in nodes.windows(2) {
        if pair[0].class == pair[1].class {
            let from = index[&pair[0].layer];
            let to = index[&pair[1].layer];
            add_edge(from, to);
        }
    }
    for (before, after) in registry.layer_edges() {
        let (Some(&from), Some(&to)) = (index.get(before), index.get(after)) else {
            return Err(WeaveError::internal(format!(
                "ordering edge {} -> {} names an unregistered layer",
                before, after
            )));
        };
        add_edge(from, to);
    }

    let sort_key = |n: usize| {
        let node = &nodes[n];
        (class_key(node.class, first_seen), node.class, node.rank)
    };

    let mut ready: Vec<usize> = (0..nodes.len()).filter(|&n| in_degree[n] == 0).collect();
    let mut order: Vec<OrderedAspectLayer> = Vec::with_capacity(nodes.len());
    while !ready.is_empty() {
        ready.sort_by_key(|&n| sort_key(n));
        let current = ready.remove(0);
        if let Some(&next) = ready.first() {
            let (a, b) = (&nodes[current], &nodes[next]);
            if a.class != b.class && class_key(a.class, first_seen) == class_key(b.class, first_seen) {
                let message = format!(
                    "order of layers {} and {} is not determined; declare a relationship between them",
                    a.layer, b.layer
                );
                sink.report(Diagnostic::error(DiagnosticCode::UndeterminedOrder, message.clone()));
                return Err(WeaveError::Ordering(message));
            }
        }

        order.push(OrderedAspectLayer {
            layer: nodes[current].layer.clone(),
            order: order.len() as u32,
        });
        for &neighbor in &adjacency[current] {
            in_degree[neighbor] -= 1;
            if in_degree[neighbor] == 0 {
                ready.push(neighbor);
            }
        }
    }

    if order.len() != nodes.len() {
        let cycle: Vec<String> = nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, n)| n.layer.to_string())
            .collect();
        let message = format!("layer ordering cycle involving: {}", cycle.join(", "));
        sink.report(Diagnostic::error(DiagnosticCode::OrderCycle, message.clone()));
        return Err(WeaveError::Ordering(message));
    }

    tracing::debug!(layers = order.len(), "layer order resolved");
    Ok(order)
}
