use thiserror::Error;

/// Error values surfaced by the controller export session.
///
/// Only `CyclicDeformerChain` aborts a session; `UnresolvedTarget` is
/// contained by the orchestrator, which downgrades it to a report issue and
/// skips the affected controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExportError {
    /// Returned when the upstream deformer walk revisits a node it has
    /// already passed through. The scene graph is corrupt; nothing useful
    /// can be exported from it.
    #[error("cyclic deformer chain detected at node {node_index} ({node_name})")]
    CyclicDeformerChain {
        /// Arena index of the node that closed the cycle.
        node_index: u32,
        /// Name of the node that closed the cycle.
        node_name: String,
    },

    /// Returned when a controller's output shape or deformer data cannot be
    /// resolved (dangling connection, deleted node, unknown instance).
    #[error("failed to resolve controller target for '{controller}': {reason}")]
    UnresolvedTarget {
        /// Name of the controller whose export was abandoned.
        controller: String,
        /// Human-readable description of the broken link.
        reason: String,
    },
}
