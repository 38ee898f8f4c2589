//! Dependency DAG construction and layering (spec §4.2).
//!
//! Derives file-level read/write sets per call, builds WAR/WAW edges, and
//! layers the resulting graph with Kahn's algorithm so the scheduler can
//! run each layer as a bounded-parallel batch.

use std::collections::{HashMap, HashSet, VecDeque};

use agentloop_types::ToolCall;

use crate::{ToolRegistry, resolve_arguments};

/// A call's derived file-level effect set, used only to build DAG edges.
#[derive(Debug, Default, Clone)]
struct CallFiles {
    reads: HashSet<String>,
    writes: HashSet<String>,
}

fn derive_files(registry: &ToolRegistry, call: &ToolCall) -> CallFiles {
    let Some(tool) = registry.get(&call.name) else {
        return CallFiles::default();
    };
    let Ok(arguments) = resolve_arguments(call) else {
        return CallFiles::default();
    };
    CallFiles {
        reads: tool.reads(arguments).into_iter().collect(),
        writes: tool.writes(arguments).into_iter().collect(),
    }
}

/// Layered execution plan: each inner `Vec<usize>` is the set of original
/// indices that may run concurrently, and layers must run in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub layers: Vec<Vec<usize>>,
    /// True if the DAG had at least one non-trivial WAR/WAW edge. When
    /// false, the scheduler takes the classification fast path instead
    /// (spec §4.2 "Fast path").
    pub has_dependencies: bool,
}

/// Builds the dependency DAG for a batch of tool calls and layers it.
///
/// Edges:
/// - **WAR**: a write to path P depends on any earlier read of P within
///   the same batch.
/// - **WAW**: concurrent writes to P are serialized in original order.
///
/// On a cycle (which file-level WAR/WAW edges alone cannot actually
/// produce, but a future edge kind might), remaining nodes are placed in
/// one final layer and a warning is logged, per spec §4.2.
pub fn build_plan(registry: &ToolRegistry, calls: &[ToolCall]) -> ExecutionPlan {
    let n = calls.len();
    let files: Vec<CallFiles> = calls.iter().map(|c| derive_files(registry, c)).collect();

    let mut last_reader: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut last_writer: HashMap<&str, usize> = HashMap::new();

    let mut edges: Vec<HashSet<usize>> = vec![HashSet::new(); n]; // edges[i] = predecessors of i
    let mut has_dependencies = false;

    for i in 0..n {
        for path in &files[i].reads {
            last_reader.entry(path.as_str()).or_default().push(i);
        }
        for path in &files[i].writes {
            // WAR: this write depends on every earlier read of `path`.
            if let Some(readers) = last_reader.get(path.as_str()) {
                for &r in readers {
                    if r < i {
                        edges[i].insert(r);
                        has_dependencies = true;
                    }
                }
            }
            // WAW: this write depends on the previous writer of `path`.
            if let Some(&writer) = last_writer.get(path.as_str()) {
                if writer < i {
                    edges[i].insert(writer);
                    has_dependencies = true;
                }
            }
            last_writer.insert(path.as_str(), i);
        }
    }

    let layers = kahn_layers(n, &edges);

    ExecutionPlan {
        layers,
        has_dependencies,
    }
}

/// Kahn's algorithm, producing layers (batches of concurrently-ready
/// nodes) rather than a single flat topological order.
fn kahn_layers(n: usize, predecessors: &[HashSet<usize>]) -> Vec<Vec<usize>> {
    let mut indegree: Vec<usize> = predecessors.iter().map(|p| p.len()).collect();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (node, preds) in predecessors.iter().enumerate() {
        for &p in preds {
            successors[p].push(node);
        }
    }

    let mut layers = Vec::new();
    let mut remaining: HashSet<usize> = (0..n).collect();
    let mut ready: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();

    while !remaining.is_empty() {
        if ready.is_empty() {
            // Cycle (shouldn't arise from WAR/WAW edges alone, but guard
            // against it anyway): dump everything left into one final
            // layer in original order rather than deadlocking.
            tracing::warn!(
                remaining = remaining.len(),
                "tool dependency graph has a cycle; flushing remaining calls into one layer"
            );
            let mut rest: Vec<usize> = remaining.into_iter().collect();
            rest.sort_unstable();
            layers.push(rest);
            break;
        }

        let mut layer: Vec<usize> = ready.drain(..).collect();
        layer.sort_unstable();
        for &node in &layer {
            remaining.remove(&node);
            for &succ in &successors[node] {
                if remaining.contains(&succ) {
                    indegree[succ] -= 1;
                    if indegree[succ] == 0 {
                        ready.push_back(succ);
                    }
                }
            }
        }
        layers.push(layer);
    }

    layers
}
