//! Crate error hierarchy.
//!
//! One `ErrorKind` variant per distinguishable failure named in the
//! specification: callers match on `.kind()` rather than parsing a message.

error_chain! {
    errors {
        /// An identifier failed the `[A-Za-z_][A-Za-z0-9_]*` check, or
        /// duplicated another name passed in the same call.
        InvalidName(name: String) {
            description("invalid argument name")
            display("invalid argument name: '{}'", name)
        }

        /// `connect` was called with a descriptor or endpoint that doesn't
        /// match the slot it's being attached to.
        InvalidConnection(reason: String) {
            description("invalid connection")
            display("invalid connection: {}", reason)
        }

        /// `propagate_to_leaves` inferred two different dtypes for the same
        /// node from two different paths.
        TypePropagationError(node: String) {
            description("conflicting dtype inferred while propagating types to leaves")
            display("data type conflict in node '{}' while propagating types to leaves", node)
        }

        /// `propagate_to_base` found two array children of the same node
        /// with differing shapes.
        ShapeMismatch(node: String, children: Vec<String>) {
            description("array children of a node do not share a shape")
            display(
                "node '{}' has array children with mismatched shapes: {}",
                node, children.join(", ")
            )
        }

        /// The requested launch geometry doesn't fit the device, or the
        /// global/local ranks disagree.
        InvalidLaunchGeometry(reason: String) {
            description("invalid launch geometry")
            display("invalid launch geometry: {}", reason)
        }

        /// No grid decomposition could be found that satisfies the
        /// hardware's per-axis limits.
        InvalidFactoring(dimension: usize, value: usize) {
            description("no grid decomposition satisfies the hardware axes")
            display(
                "could not factor bounding grid dimension {} (value {}) to fit the device's grid axes",
                dimension, value
            )
        }
    }
}
