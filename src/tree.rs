//! The transformation tree: a forest of named nodes rooted at the kernel's
//! base arguments, each interior node attached to its children through one
//! `Transformation`.
//!
//! Grounded on `original_source/tigger/core/transformation.py`'s
//! `TransformationTree` for the exact traversal and propagation semantics,
//! adapted to the teacher's `util/tree.rs` idiom of storing nodes in a flat
//! owned collection addressed by a stable key — here a node's own name,
//! rather than the teacher's `u16` handle, since names are already this
//! tree's load-bearing identity (SPEC_FULL.md §9).

use std::collections::{HashMap, HashSet};

use crate::errors::Result;
use crate::transform::Transformation;
use crate::value::{ArrayValue, ElemType, ScalarValue, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Store,
    Load,
    Scalar,
}

#[derive(Clone)]
pub struct Node<D, L> {
    pub name: String,
    pub kind: NodeKind,
    pub value: Value<D, L>,
    pub children: Option<Vec<String>>,
    pub tr_to_children: Option<Transformation<D>>,
}

/// A forest of `TransformationTree` nodes, one tree per base argument.
/// `base_names` fixes the argument order the kernel is ultimately called
/// with; every other node is reached by walking `children` from a base.
pub struct TransformationTree<D, L> {
    nodes: HashMap<String, Node<D, L>>,
    pub base_names: Vec<String>,
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl<D: ElemType, L: Clone> TransformationTree<D, L> {
    /// Builds a tree with one leaf per name in `stores`, `loads` and
    /// `scalars`. Every name across all three must be a valid identifier
    /// and unique across the whole set.
    pub fn new(stores: Vec<String>, loads: Vec<String>, scalars: Vec<String>) -> Result<Self> {
        let base_names: Vec<String> = stores
            .iter()
            .cloned()
            .chain(loads.iter().cloned())
            .chain(scalars.iter().cloned())
            .collect();

        let mut seen = HashSet::new();
        for name in &base_names {
            if !valid_name(name) {
                return Err(crate::errors::ErrorKind::InvalidName(name.clone()).into());
            }
            if !seen.insert(name.clone()) {
                return Err(crate::errors::ErrorKind::InvalidName(name.clone()).into());
            }
        }

        let mut nodes = HashMap::new();
        for name in stores {
            nodes.insert(
                name.clone(),
                Node {
                    name,
                    kind: NodeKind::Store,
                    value: Value::Array(ArrayValue::empty()),
                    children: None,
                    tr_to_children: None,
                },
            );
        }
        for name in loads {
            nodes.insert(
                name.clone(),
                Node {
                    name,
                    kind: NodeKind::Load,
                    value: Value::Array(ArrayValue::empty()),
                    children: None,
                    tr_to_children: None,
                },
            );
        }
        for name in scalars {
            nodes.insert(
                name.clone(),
                Node {
                    name,
                    kind: NodeKind::Scalar,
                    value: Value::Scalar(ScalarValue::empty()),
                    children: None,
                    tr_to_children: None,
                },
            );
        }

        Ok(TransformationTree { nodes, base_names })
    }

    pub fn node(&self, name: &str) -> Option<&Node<D, L>> {
        self.nodes.get(name)
    }

    /// `true` if `name` is a currently-reachable array leaf, i.e. a node
    /// with no children that isn't a scalar. Every node in the tree is
    /// reachable from some base name (invariant 5), so this local check is
    /// equivalent to asking whether `name` shows up among the arrays in
    /// `leaf_signature()`.
    pub fn has_array_leaf(&self, name: &str) -> bool {
        match self.nodes.get(name) {
            Some(node) => node.children.is_none() && node.kind != NodeKind::Scalar,
            None => false,
        }
    }

    pub fn base_values(&self) -> Vec<&Value<D, L>> {
        self.base_names.iter().map(|name| &self.nodes[name.as_str()].value).collect()
    }

    /// All leaf names reachable below `name` (including `name` itself if
    /// it is already a leaf), in `leaf_signature` order.
    pub fn all_children(&self, name: &str) -> Vec<String> {
        self.leaf_signature(Some(&[name.to_string()]))
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }

    /// Walks the forest rooted at `base_names` (or the whole tree's own
    /// base names, if `None`) and returns `(name, value)` pairs in the
    /// order leaf arrays first, then scalars — base scalars before any
    /// scalar reached only through a transformation. See SPEC_FULL.md §4.2.
    pub fn leaf_signature(&self, base_names: Option<&[String]>) -> Vec<(String, Option<Value<D, L>>)> {
        let base_names = base_names.unwrap_or(&self.base_names);

        let mut arrays = Vec::new();
        let mut scalars: Vec<String> = base_names
            .iter()
            .filter(|name| self.nodes.get(name.as_str()).map_or(false, |n| n.kind == NodeKind::Scalar))
            .cloned()
            .collect();
        let mut visited: HashSet<String> = scalars.iter().cloned().collect();

        fn visit<D, L>(
            names: &[String],
            nodes: &HashMap<String, Node<D, L>>,
            visited: &mut HashSet<String>,
            arrays: &mut Vec<String>,
            scalars: &mut Vec<String>,
        ) {
            for name in names {
                if visited.contains(name) {
                    continue;
                }
                visited.insert(name.clone());

                match nodes.get(name) {
                    None => arrays.push(name.clone()),
                    Some(node) => match &node.children {
                        None => {
                            if node.kind == NodeKind::Scalar {
                                scalars.push(name.clone());
                            } else {
                                arrays.push(name.clone());
                            }
                        }
                        Some(children) => visit(children, nodes, visited, arrays, scalars),
                    },
                }
            }
        }

        visit(base_names, &self.nodes, &mut visited, &mut arrays, &mut scalars);

        arrays
            .into_iter()
            .chain(scalars.into_iter())
            .map(|name| {
                let value = self.nodes.get(&name).map(|n| n.value.clone());
                (name, value)
            })
            .collect()
    }

    /// Attaches `tr` below `endpoint`, an existing array leaf, creating
    /// whichever of `new_array_args`/`new_scalar_args` don't already exist
    /// as nodes. Validated atomically: either every precondition holds and
    /// the tree is mutated, or nothing changes.
    pub fn connect(
        &mut self,
        tr: Transformation<D>,
        endpoint: &str,
        new_array_args: Vec<String>,
        new_scalar_args: Vec<String>,
    ) -> Result<()> {
        if !self.has_array_leaf(endpoint) {
            return Err(crate::errors::ErrorKind::InvalidConnection(format!(
                "'{}' does not exist or is not suitable for connection",
                endpoint
            ))
            .into());
        }

        for name in new_array_args.iter().chain(new_scalar_args.iter()) {
            if !valid_name(name) {
                return Err(crate::errors::ErrorKind::InvalidName(name.clone()).into());
            }
        }

        let parent_kind = self.nodes[endpoint].kind;
        match parent_kind {
            NodeKind::Store => {
                if tr.load != 1 {
                    return Err(crate::errors::ErrorKind::InvalidConnection(
                        "a transformation for an output node must have exactly one input".into(),
                    )
                    .into());
                }
                if tr.store != new_array_args.len() {
                    return Err(crate::errors::ErrorKind::InvalidConnection(
                        "number of array argument names does not match the transformation".into(),
                    )
                    .into());
                }
            }
            NodeKind::Load => {
                if tr.store != 1 {
                    return Err(crate::errors::ErrorKind::InvalidConnection(
                        "a transformation for an input node must have exactly one output".into(),
                    )
                    .into());
                }
                if tr.load != new_array_args.len() {
                    return Err(crate::errors::ErrorKind::InvalidConnection(
                        "number of array argument names does not match the transformation".into(),
                    )
                    .into());
                }
            }
            NodeKind::Scalar => unreachable!("has_array_leaf excludes scalar nodes"),
        }
        if tr.parameters != new_scalar_args.len() {
            return Err(crate::errors::ErrorKind::InvalidConnection(
                "number of parameter argument names does not match the transformation".into(),
            )
            .into());
        }

        let mut new_nodes: Vec<(String, Node<D, L>)> = Vec::new();
        for name in &new_array_args {
            match self.nodes.get(name) {
                Some(existing) => {
                    if existing.kind == NodeKind::Scalar {
                        return Err(crate::errors::ErrorKind::InvalidConnection(format!(
                            "'{}' is a scalar, expected an array",
                            name
                        ))
                        .into());
                    }
                    if parent_kind == NodeKind::Store {
                        return Err(crate::errors::ErrorKind::InvalidConnection(format!(
                            "cannot connect to an existing output node '{}'",
                            name
                        ))
                        .into());
                    }
                }
                None => {
                    new_nodes.push((
                        name.clone(),
                        Node {
                            name: name.clone(),
                            kind: parent_kind,
                            value: Value::Array(ArrayValue::empty()),
                            children: None,
                            tr_to_children: None,
                        },
                    ));
                }
            }
        }
        for name in &new_scalar_args {
            match self.nodes.get(name) {
                Some(existing) => {
                    if existing.kind != NodeKind::Scalar {
                        return Err(crate::errors::ErrorKind::InvalidConnection(format!(
                            "'{}' is an array, expected a scalar",
                            name
                        ))
                        .into());
                    }
                }
                None => {
                    new_nodes.push((
                        name.clone(),
                        Node {
                            name: name.clone(),
                            kind: NodeKind::Scalar,
                            value: Value::Scalar(ScalarValue::empty()),
                            children: None,
                            tr_to_children: None,
                        },
                    ));
                }
            }
        }

        for (name, node) in new_nodes {
            self.nodes.insert(name, node);
        }
        let children: Vec<String> = new_array_args.into_iter().chain(new_scalar_args.into_iter()).collect();
        {
            let endpoint_node = self.nodes.get_mut(endpoint).expect("checked by has_array_leaf above");
            endpoint_node.children = Some(children);
            endpoint_node.tr_to_children = Some(tr);
        }
        Ok(())
    }

    fn clear_all_values(&mut self) {
        for node in self.nodes.values_mut() {
            node.value.clear();
        }
    }

    /// Infers dtype and shape from the leaves up to every base, given a
    /// value for each current leaf. Raises `ShapeMismatch` if two array
    /// children of the same node disagree on shape (SPEC_FULL.md §9, Open
    /// Question 3 — raised explicitly rather than asserted).
    pub fn propagate_to_base(&mut self, leaf_values: &HashMap<String, Value<D, L>>) -> Result<()> {
        self.clear_all_values();
        let base_names = self.base_names.clone();
        for name in &base_names {
            self.deduce(name, leaf_values)?;
        }
        Ok(())
    }

    fn deduce(&mut self, name: &str, leaf_values: &HashMap<String, Value<D, L>>) -> Result<()> {
        let children = self
            .nodes
            .get(name)
            .unwrap_or_else(|| panic!("node '{}' missing from tree", name))
            .children
            .clone();

        match children {
            None => {
                let leaf_value = leaf_values
                    .get(name)
                    .unwrap_or_else(|| panic!("no value supplied for leaf node '{}'", name));
                self.nodes.get_mut(name).expect("checked above").value.fill_with(leaf_value);
            }
            Some(children) => {
                for child in &children {
                    self.deduce(child, leaf_values)?;
                }

                let kind = self.nodes[name].kind;
                let tr = self.nodes[name]
                    .tr_to_children
                    .clone()
                    .expect("non-leaf node always has a transformation attached by connect()");
                let child_dtypes: Vec<D> = children
                    .iter()
                    .map(|c| {
                        self.nodes[c.as_str()]
                            .value
                            .dtype()
                            .cloned()
                            .expect("child dtype derived before its parent")
                    })
                    .collect();
                let derived = match kind {
                    NodeKind::Store => tr.derive_l_from_sp(&child_dtypes),
                    NodeKind::Load => tr.derive_s_from_lp(&child_dtypes),
                    NodeKind::Scalar => unreachable!("scalar nodes are always leaves"),
                };
                let dtype = derived
                    .into_iter()
                    .next()
                    .expect("a derivation always yields at least one dtype")
                    .normalize();

                let mut shapes: Vec<(String, Vec<usize>)> = Vec::new();
                for child in &children {
                    if let Some(array) = self.nodes[child.as_str()].value.as_array() {
                        if let Some(shape) = array.shape() {
                            shapes.push((child.clone(), shape.to_vec()));
                        }
                    }
                }

                let node = self.nodes.get_mut(name).expect("checked above");
                node.value.set_dtype(Some(dtype));
                if let Some((_, first_shape)) = shapes.first().cloned() {
                    let mismatched: Vec<String> =
                        shapes.iter().filter(|(_, s)| *s != first_shape).map(|(n, _)| n.clone()).collect();
                    if !mismatched.is_empty() {
                        return Err(crate::errors::ErrorKind::ShapeMismatch(name.to_string(), mismatched).into());
                    }
                    if let Some(array) = node.value.as_array_mut() {
                        array.set_shape(Some(first_shape));
                    }
                }
            }
        }
        Ok(())
    }

    /// Pushes dtype and shape down from each base to the leaves, given a
    /// value for each base. Raises `TypePropagationError` if two different
    /// paths disagree on a shared node's dtype.
    pub fn propagate_to_leaves(&mut self, root_values: &HashMap<String, Value<D, L>>) -> Result<()> {
        self.clear_all_values();
        let base_names = self.base_names.clone();
        for name in &base_names {
            let root_value = root_values
                .get(name)
                .unwrap_or_else(|| panic!("no value supplied for base node '{}'", name));
            self.nodes.get_mut(name.as_str()).expect("base name always present").value.fill_with(root_value);
            self.propagate(name)?;
        }
        Ok(())
    }

    fn propagate(&mut self, name: &str) -> Result<()> {
        let children = match self.nodes[name].children.clone() {
            None => return Ok(()),
            Some(children) => children,
        };

        let kind = self.nodes[name].kind;
        let tr = self.nodes[name]
            .tr_to_children
            .clone()
            .expect("non-leaf node always has a transformation attached by connect()");
        let dtype = self.nodes[name]
            .value
            .dtype()
            .cloned()
            .expect("node dtype filled in before propagating to its children");

        let (mut array_dtypes, scalar_dtypes) = match kind {
            NodeKind::Store => tr.derive_sp_from_l(dtype),
            NodeKind::Load => tr.derive_lp_from_s(dtype),
            NodeKind::Scalar => unreachable!("scalar nodes are always leaves"),
        };
        array_dtypes.extend(scalar_dtypes);

        let parent_shape = self.nodes[name].value.as_array().and_then(|a| a.shape().map(|s| s.to_vec()));

        for (child, child_dtype) in children.iter().zip(array_dtypes.into_iter()) {
            {
                let child_node = self.nodes.get_mut(child.as_str()).expect("connect() always creates children");
                match child_node.value.dtype() {
                    None => child_node.value.set_dtype(Some(child_dtype)),
                    Some(existing) => {
                        if *existing != child_dtype {
                            return Err(crate::errors::ErrorKind::TypePropagationError(child.clone()).into());
                        }
                    }
                }
                if let Some(array) = child_node.value.as_array_mut() {
                    array.set_shape(parent_shape.clone());
                }
            }
            self.propagate(child)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct F32;

    impl ElemType for F32 {
        fn promote(_types: &[Self]) -> Self {
            F32
        }
        fn ctype(&self) -> String {
            "float".to_string()
        }
    }

    fn bare_tree() -> TransformationTree<F32, f64> {
        TransformationTree::new(
            vec!["out".to_string()],
            vec!["a".to_string(), "b".to_string()],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn rejects_invalid_names() {
        let err = TransformationTree::<F32, f64>::new(vec!["1bad".to_string()], vec![], vec![]);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = TransformationTree::<F32, f64>::new(
            vec!["x".to_string()],
            vec!["x".to_string()],
            vec![],
        );
        assert!(err.is_err());
    }

    #[test]
    fn leaf_signature_on_bare_tree_is_base_names() {
        let tree = bare_tree();
        let sig: Vec<String> = tree.leaf_signature(None).into_iter().map(|(n, _)| n).collect();
        assert_eq!(sig, vec!["out", "a", "b"]);
    }

    #[test]
    fn connect_rejects_unknown_endpoint() {
        let mut tree = bare_tree();
        let tr = Transformation::<F32>::identity();
        let err = tree.connect(tr, "nope", vec!["x".to_string()], vec![]);
        assert!(err.is_err());
    }

    #[test]
    fn connect_extends_leaf_signature() {
        let mut tree = bare_tree();
        let tr = Transformation::<F32>::identity();
        tree.connect(tr, "a", vec!["a_inner".to_string()], vec![]).unwrap();
        let sig: Vec<String> = tree.leaf_signature(None).into_iter().map(|(n, _)| n).collect();
        assert_eq!(sig, vec!["out", "a_inner", "b"]);
    }

    #[test]
    fn connect_to_store_rejects_reusing_an_existing_array_node() {
        let mut tree = bare_tree();
        tree.connect(Transformation::<F32>::identity(), "out", vec!["out_inner".to_string()], vec![])
            .unwrap();
        // "a" already exists as an array node; an output node may not reuse it.
        let err = tree.connect(Transformation::<F32>::identity(), "out_inner", vec!["a".to_string()], vec![]);
        assert!(err.is_err());
    }

    #[test]
    fn propagate_to_base_then_to_leaves_round_trips_scalar_only_dtype() {
        let mut tree = bare_tree();
        let mut leaves = HashMap::new();
        leaves.insert("out".to_string(), Value::Array(ArrayValue::new(Some(vec![4]), Some(F32))));
        leaves.insert("a".to_string(), Value::Array(ArrayValue::new(Some(vec![4]), Some(F32))));
        leaves.insert("b".to_string(), Value::Array(ArrayValue::new(Some(vec![4]), Some(F32))));
        tree.propagate_to_base(&leaves).unwrap();
        assert_eq!(tree.node("out").unwrap().value.dtype(), Some(&F32));
    }

    #[test]
    fn identity_transformation_leaves_signature_types_unchanged_after_propagation() {
        let mut tree = bare_tree();
        tree.connect(Transformation::<F32>::identity(), "a", vec!["a_inner".to_string()], vec![]).unwrap();

        let mut leaves = HashMap::new();
        leaves.insert("out".to_string(), Value::Array(ArrayValue::new(Some(vec![4]), Some(F32))));
        leaves.insert("a_inner".to_string(), Value::Array(ArrayValue::new(Some(vec![4]), Some(F32))));
        leaves.insert("b".to_string(), Value::Array(ArrayValue::new(Some(vec![4]), Some(F32))));
        tree.propagate_to_base(&leaves).unwrap();

        for name in ["out", "a_inner", "b"] {
            assert_eq!(tree.node(name).unwrap().value.dtype(), Some(&F32));
        }

        let mut roots = HashMap::new();
        for name in tree.base_names.clone() {
            roots.insert(name.clone(), tree.node(&name).unwrap().value.clone());
        }
        tree.propagate_to_leaves(&roots).unwrap();
        for name in ["out", "a_inner", "b"] {
            assert_eq!(tree.node(name).unwrap().value.dtype(), Some(&F32));
        }
    }

    #[test]
    fn split_complex_attaches_two_array_children_to_one_load_root() {
        let mut tree = bare_tree();
        // "split_complex": re(a), im(a) replace a single complex load.
        let tr = Transformation::<F32>::new(2, 1, 0, "{{ store.s1 }}(({{ load.l1 }}, {{ load.l2 }}));");
        tree.connect(tr, "a", vec!["a_re".to_string(), "a_im".to_string()], vec![]).unwrap();

        let sig: Vec<String> = tree.leaf_signature(None).into_iter().map(|(n, _)| n).collect();
        assert_eq!(sig, vec!["out", "a_re", "a_im", "b"]);
    }

    #[derive(Clone, Debug, PartialEq)]
    enum Numeric {
        F32,
        F64,
    }

    impl ElemType for Numeric {
        fn promote(types: &[Self]) -> Self {
            types.iter().cloned().next().unwrap_or(Numeric::F32)
        }
        fn ctype(&self) -> String {
            match self {
                Numeric::F32 => "float".to_string(),
                Numeric::F64 => "double".to_string(),
            }
        }
    }

    #[test]
    fn propagate_to_leaves_raises_type_conflict_on_a_shared_scalar() {
        let mut tree =
            TransformationTree::<Numeric, f64>::new(vec!["out1".to_string(), "out2".to_string()], vec![], vec![])
                .unwrap();

        // Both outputs reuse the same scalar leaf "shared", but out1's
        // root is f32 and out2's is f64: propagating down must notice
        // they disagree on "shared"'s dtype.
        let tr = Transformation::<Numeric>::new(1, 1, 1, "{{ store.s1 }}({{ load.l1 }});");
        tree.connect(tr.clone(), "out1", vec!["out1_inner".to_string()], vec!["shared".to_string()]).unwrap();
        tree.connect(tr, "out2", vec!["out2_inner".to_string()], vec!["shared".to_string()]).unwrap();

        let mut roots = HashMap::new();
        roots.insert("out1".to_string(), Value::Array(ArrayValue::new(Some(vec![4]), Some(Numeric::F32))));
        roots.insert("out2".to_string(), Value::Array(ArrayValue::new(Some(vec![4]), Some(Numeric::F64))));
        let err = tree.propagate_to_leaves(&roots);
        assert!(err.is_err());
    }
}
