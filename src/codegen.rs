//! Turns a set of requested argument names into the load/store macros,
//! inline helper functions and `SIGNATURE` macro a kernel template needs.
//!
//! Grounded on `original_source/tigger/core/transformation.py`'s
//! `transformations_for`, kept close to its post-order walk and macro
//! naming; the assembly is still small named free functions the way that
//! file (and the teacher's own source-text helpers) keep it, rather than a
//! builder object.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tera::{Function, Tera, Value as TeraValue};

use crate::errors::{Result, ResultExt};
use crate::func_collector::FuncCollector;
use crate::tree::{NodeKind, TransformationTree};
use crate::value::ElemType;

const INDEX_NAME: &str = "idx";

fn load_macro_name(name: &str) -> String {
    format!("_LOAD_{}", name)
}

fn load_function_name(name: &str) -> String {
    format!("_load_{}", name)
}

fn store_macro_name(name: &str) -> String {
    format!("_STORE_{}", name)
}

fn store_function_name(name: &str) -> String {
    format!("_store_{}", name)
}

fn leaf_load_macro(name: &str) -> String {
    format!("#define {}({}) ({}[{}])", load_macro_name(name), INDEX_NAME, name, INDEX_NAME)
}

fn node_load_macro(name: &str, argnames: &[String]) -> String {
    format!(
        "#define {}({}) {}({}, {})",
        load_macro_name(name),
        INDEX_NAME,
        load_function_name(name),
        argnames.join(", "),
        INDEX_NAME
    )
}

/// Non-root store macro: takes only `val`, relying on a kernel-scope `idx`
/// already in context. Root stores (`base_leaf_store_macro` in the
/// original) take `idx` explicitly instead, since there is no enclosing
/// scope to capture it from — see `base_leaf_store_macro`/
/// `base_node_store_macro` below. Load macros have no such split: reading
/// always needs an explicit index on both forms.
fn leaf_store_macro(name: &str) -> String {
    format!("#define {}(val) {}[{}] = (val)", store_macro_name(name), name, INDEX_NAME)
}

fn node_store_macro(name: &str, argnames: &[String]) -> String {
    format!(
        "#define {}(val) {}({}, {}, val)",
        store_macro_name(name),
        store_function_name(name),
        argnames.join(", "),
        INDEX_NAME
    )
}

fn base_leaf_store_macro(name: &str) -> String {
    format!("#define {}({}, val) {}[{}] = (val)", store_macro_name(name), INDEX_NAME, name, INDEX_NAME)
}

fn base_node_store_macro(name: &str, argnames: &[String]) -> String {
    format!(
        "#define {}({}, val) {}({}, {}, val)",
        store_macro_name(name),
        INDEX_NAME,
        store_function_name(name),
        argnames.join(", "),
        INDEX_NAME
    )
}

fn load_macro_call_tr(name: &str) -> String {
    format!("{}({})", load_macro_name(name), INDEX_NAME)
}

fn signature_macro_name() -> &'static str {
    "SIGNATURE"
}

struct FuncNamespace {
    collector: Arc<Mutex<FuncCollector>>,
}

impl Function for FuncNamespace {
    fn call(&self, args: &HashMap<String, TeraValue>) -> tera::Result<TeraValue> {
        let op = args
            .get("op")
            .and_then(|v| v.as_str())
            .ok_or_else(|| tera::Error::msg("func(...) requires an `op` string argument"))?;
        let ctypes: Vec<String> = args
            .get("dtypes")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let call_args: Vec<String> = args
            .get("args")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let mut collector = self.collector.lock().expect("func collector mutex poisoned");
        Ok(TeraValue::String(collector.call(op, &ctypes, &call_args)))
    }
}

/// Renders one node's transformation body against its `load`/`store`/
/// `param`/`dtype`/`ctype` namespaces. `dtype.*` and `ctype.*` hold the
/// same C-type spelling: `ElemType` only exposes `ctype()` as a string,
/// so there is no richer `dtype` object to carry through a JSON-shaped
/// template context.
fn render_body(
    code: &str,
    load: &HashMap<String, String>,
    store: &HashMap<String, String>,
    param: &HashMap<String, String>,
    ctype: &HashMap<String, String>,
    func_collector: &Arc<Mutex<FuncCollector>>,
) -> Result<String> {
    let mut tera = Tera::default();
    tera.add_raw_template("body", code)
        .chain_err(|| "transformation body failed to parse as a template")?;
    tera.register_function("func", FuncNamespace { collector: Arc::clone(func_collector) });

    let mut ctx = tera::Context::new();
    ctx.insert("load", load);
    ctx.insert("store", store);
    ctx.insert("param", param);
    ctx.insert("dtype", ctype);
    ctx.insert("ctype", ctype);

    tera.render("body", &ctx).chain_err(|| "transformation body failed to render")
}

fn build_arglist<D: ElemType, L: Clone>(tree: &TransformationTree<D, L>, argnames: &[String]) -> String {
    argnames
        .iter()
        .map(|argname| {
            let node = tree.node(argname).expect("argument name always present in tree");
            let ctype = node.value.dtype().expect("dtype resolved before codegen").ctype();
            if node.value.is_array() {
                format!("GLOBAL_MEM {} *{}", ctype, argname)
            } else {
                format!(" {} {}", ctype, argname)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn signature_macro<D: ElemType, L: Clone>(tree: &TransformationTree<D, L>, argnames: &[String]) -> String {
    format!("#define {} {}", signature_macro_name(), build_arglist(tree, argnames))
}

/// Generates all macros, helper functions and the final `SIGNATURE` macro
/// needed to use `names` inside a kernel template. Names not present in
/// the tree are treated as plain temporary arrays: a bare load/store macro
/// pair is emitted for them with no backing function.
pub fn transformations_for<D: ElemType, L: Clone>(
    tree: &TransformationTree<D, L>,
    names: &[String],
) -> Result<String> {
    let mut visited = HashSet::new();
    let mut code_list: Vec<String> = Vec::new();
    let func_collector = Arc::new(Mutex::new(FuncCollector::new("tr", |op, ctypes| {
        // Synthesizing an operator body for an arbitrary dtype tuple is the
        // out-of-scope "numerical-type helpers" concern; templates that use
        // `func(...)` must be paired with a body provider supplied by the
        // crate's consumer. The in-tree default documents the contract with
        // an explicit marker rather than guessing at arithmetic.
        warn!("func(\"{}\", {:?}) called with no body provider registered; emitting a stub definition", op, ctypes);
        format!("/* helper body for {}({}) not supplied */", op, ctypes.join(", "))
    })));

    for name in names {
        if tree.base_names.contains(name) {
            process(tree, name, &mut visited, &mut code_list, &func_collector)?;
        } else {
            code_list.push(leaf_load_macro(name));
            code_list.push(leaf_store_macro(name));
        }
    }

    let leaf_names: Vec<String> = tree.leaf_signature(None).into_iter().map(|(name, _)| name).collect();

    let rendered_funcs = func_collector.lock().expect("func collector mutex poisoned").render();
    Ok(format!(
        "{}\n\n{}\n\n{}",
        rendered_funcs,
        code_list.join("\n\n"),
        signature_macro(tree, &leaf_names)
    ))
}

fn process<D: ElemType, L: Clone>(
    tree: &TransformationTree<D, L>,
    name: &str,
    visited: &mut HashSet<String>,
    code_list: &mut Vec<String>,
    func_collector: &Arc<Mutex<FuncCollector>>,
) -> Result<()> {
    if visited.contains(name) {
        return Ok(());
    }
    visited.insert(name.to_string());

    let node = tree.node(name).expect("process() is only called on names already known to be in the tree");
    if node.kind == NodeKind::Scalar {
        return Ok(());
    }

    let is_base = tree.base_names.contains(&name.to_string());

    if node.children.is_none() {
        let macro_text = match node.kind {
            NodeKind::Load => leaf_load_macro(name),
            NodeKind::Store if is_base => base_leaf_store_macro(name),
            NodeKind::Store => leaf_store_macro(name),
            NodeKind::Scalar => unreachable!(),
        };
        code_list.push(format!("// leaf node {}\n{}", name, macro_text));
        return Ok(());
    }

    let children = node.children.clone().expect("checked above");
    for child in &children {
        process(tree, child, visited, code_list, func_collector)?;
    }

    let all_children = tree.all_children(name);
    let tr = node.tr_to_children.clone().expect("non-leaf node always has a transformation");
    let own_ctype = node.value.dtype().expect("dtype resolved before codegen").ctype();

    let mut load = HashMap::new();
    let mut store = HashMap::new();
    let mut param = HashMap::new();
    let mut ctype = HashMap::new();

    let code_src = match node.kind {
        NodeKind::Load => {
            let load_names = &children[..tr.load];
            let param_names = &children[tr.load..];
            for (i, child_name) in load_names.iter().enumerate() {
                let label = format!("l{}", i + 1);
                load.insert(label.clone(), load_macro_call_tr(child_name));
                let child_ctype = tree.node(child_name).unwrap().value.dtype().unwrap().ctype();
                ctype.insert(label, child_ctype);
            }
            for (i, child_name) in param_names.iter().enumerate() {
                let label = format!("p{}", i + 1);
                param.insert(label.clone(), child_name.clone());
                let child_ctype = tree.node(child_name).unwrap().value.dtype().unwrap().ctype();
                ctype.insert(label, child_ctype);
            }
            store.insert("s1".to_string(), "return".to_string());
            ctype.insert("s1".to_string(), own_ctype.clone());

            let definition = format!(
                "INLINE WITHIN_KERNEL {} {}({}, int {})",
                own_ctype,
                load_function_name(name),
                build_arglist(tree, &all_children),
                INDEX_NAME
            );
            let body = render_body(&tr.code, &load, &store, &param, &ctype, func_collector)?;
            format!(
                "// node {}\n{}\n{{\n{}\n}}\n{}",
                name,
                definition,
                body,
                node_load_macro(name, &all_children)
            )
        }
        NodeKind::Store => {
            let store_names = &children[..tr.store];
            let param_names = &children[tr.store..];
            for (i, child_name) in store_names.iter().enumerate() {
                let label = format!("s{}", i + 1);
                store.insert(label.clone(), store_macro_name(child_name));
                let child_ctype = tree.node(child_name).unwrap().value.dtype().unwrap().ctype();
                ctype.insert(label, child_ctype);
            }
            for (i, child_name) in param_names.iter().enumerate() {
                let label = format!("p{}", i + 1);
                param.insert(label.clone(), child_name.clone());
                let child_ctype = tree.node(child_name).unwrap().value.dtype().unwrap().ctype();
                ctype.insert(label, child_ctype);
            }
            load.insert("l1".to_string(), "val".to_string());
            ctype.insert("l1".to_string(), own_ctype.clone());

            let definition = format!(
                "INLINE WITHIN_KERNEL void {}({}, int {}, {} val)",
                store_function_name(name),
                build_arglist(tree, &all_children),
                INDEX_NAME,
                own_ctype
            );
            let body = render_body(&tr.code, &load, &store, &param, &ctype, func_collector)?;
            let macro_text = if is_base {
                base_node_store_macro(name, &all_children)
            } else {
                node_store_macro(name, &all_children)
            };
            format!("// node {}\n{}\n{{\n{}\n}}\n{}", name, definition, body, macro_text)
        }
        NodeKind::Scalar => unreachable!(),
    };

    code_list.push(code_src);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::transform::Transformation;
    use crate::value::{ArrayValue, Value};

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

    fn filled_bare_tree() -> TransformationTree<F32, f64> {
        let mut tree =
            TransformationTree::new(vec!["out".to_string()], vec!["a".to_string(), "b".to_string()], vec![])
                .unwrap();
        let mut leaves: HashMap<String, Value<F32, f64>> = HashMap::new();
        for name in ["out", "a", "b"] {
            leaves.insert(name.to_string(), Value::Array(ArrayValue::new(Some(vec![4]), Some(F32))));
        }
        tree.propagate_to_base(&leaves).unwrap();
        tree
    }

    #[test]
    fn bare_tree_codegen_emits_one_macro_pair_per_base() {
        let tree = filled_bare_tree();
        let names: Vec<String> = tree.base_names.clone();
        let code = transformations_for(&tree, &names).unwrap();
        assert!(code.contains("_STORE_out"));
        assert!(code.contains("_LOAD_a"));
        assert!(code.contains("_LOAD_b"));
        assert!(code.contains("#define SIGNATURE"));
    }

    #[test]
    fn scale_by_constant_emits_an_inline_helper_and_hides_the_inner_leaf() {
        let mut tree = filled_bare_tree();
        let tr = Transformation::<F32>::new(1, 1, 1, "{{ store.s1 }}(({{ load.l1 }}) * ({{ param.p1 }}));");
        tree.connect(tr, "a", vec!["a_inner".to_string()], vec!["scale".to_string()]).unwrap();

        let mut leaves: HashMap<String, Value<F32, f64>> = HashMap::new();
        for name in ["out", "a_inner", "b"] {
            leaves.insert(name.to_string(), Value::Array(ArrayValue::new(Some(vec![4]), Some(F32))));
        }
        leaves.insert("scale".to_string(), Value::Scalar(crate::value::ScalarValue::new(Some(2.0), Some(F32))));
        tree.propagate_to_base(&leaves).unwrap();

        let code = transformations_for(&tree, &tree.base_names.clone()).unwrap();
        assert!(code.contains("_load_a"));
        assert!(code.contains("_LOAD_a_inner"));
        assert!(code.contains("#define _LOAD_a(idx) _load_a(a_inner, scale, idx)"));
    }

    #[test]
    fn transformation_body_calling_func_routes_through_the_collector() {
        let mut tree = filled_bare_tree();
        let tr = Transformation::<F32>::new(
            1,
            1,
            1,
            "{{ store.s1 }}({{ func(op=\"scale\", dtypes=[ctype.l1, ctype.p1], args=[load.l1, param.p1]) }});",
        );
        tree.connect(tr, "a", vec!["a_inner".to_string()], vec!["scale".to_string()]).unwrap();

        let mut leaves: HashMap<String, Value<F32, f64>> = HashMap::new();
        for name in ["out", "a_inner", "b"] {
            leaves.insert(name.to_string(), Value::Array(ArrayValue::new(Some(vec![4]), Some(F32))));
        }
        leaves.insert("scale".to_string(), Value::Scalar(crate::value::ScalarValue::new(Some(2.0), Some(F32))));
        tree.propagate_to_base(&leaves).unwrap();

        let code = transformations_for(&tree, &tree.base_names.clone()).unwrap();
        // the call site is rewritten into a call to the deterministically
        // named, deduplicated helper...
        assert!(code.contains("tr_scale_float_float(_LOAD_a_inner(idx), scale)"));
        // ...whose (stub) definition is emitted once, ahead of the macros.
        assert!(code.contains("/* helper body for scale(float, float) not supplied */"));
    }

    #[test]
    fn temporary_array_not_in_tree_gets_a_direct_macro_pair() {
        let tree = filled_bare_tree();
        let code = transformations_for(&tree, &["tmp".to_string()]).unwrap();
        assert!(code.contains("_LOAD_tmp"));
        assert!(code.contains("_STORE_tmp"));
    }
}
