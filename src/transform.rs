//! The transformation descriptor: an immutable, user-authored record
//! describing one node's fan-in/fan-out and how its dtypes relate.

use std::sync::Arc;

use crate::value::ElemType;

/// `derive_s_from_lp` / `derive_l_from_sp`: given the dtypes flowing into
/// one side, produce the dtypes on the other side. Either a user closure,
/// or the `Promote` sentinel meaning "promote across all inputs, use that
/// for every output" (the spec's default derivation).
#[derive(Clone)]
pub enum Derive1<D> {
    Promote,
    Custom(Arc<dyn Fn(&[D]) -> Vec<D> + Send + Sync>),
}

/// `derive_lp_from_s` / `derive_sp_from_l`: given a single dtype, produce
/// the (array dtypes, scalar dtypes) flowing the other way.
#[derive(Clone)]
pub enum Derive2<D> {
    Promote,
    Custom(Arc<dyn Fn(D) -> (Vec<D>, Vec<D>) + Send + Sync>),
}

/// One user-supplied transformation. Immutable once built; the same
/// `Transformation` can be attached at many points in a tree.
#[derive(Clone)]
pub struct Transformation<D> {
    pub load: usize,
    pub store: usize,
    pub parameters: usize,
    derive_s_from_lp: Derive1<D>,
    derive_lp_from_s: Derive2<D>,
    derive_l_from_sp: Derive1<D>,
    derive_sp_from_l: Derive2<D>,
    pub code: String,
}

impl<D: ElemType> Transformation<D> {
    /// The identity transformation used in the round-trip test in
    /// SPEC_FULL.md §8: one load, one store, no parameters, and a body
    /// that just forwards its input to its output.
    pub fn identity() -> Self {
        Transformation {
            load: 1,
            store: 1,
            parameters: 0,
            derive_s_from_lp: Derive1::Promote,
            derive_lp_from_s: Derive2::Promote,
            derive_l_from_sp: Derive1::Promote,
            derive_sp_from_l: Derive2::Promote,
            code: "{{ store.s1 }}({{ load.l1 }});".to_string(),
        }
    }

    pub fn new(load: usize, store: usize, parameters: usize, code: impl Into<String>) -> Self {
        Transformation {
            load,
            store,
            parameters,
            derive_s_from_lp: Derive1::Promote,
            derive_lp_from_s: Derive2::Promote,
            derive_l_from_sp: Derive1::Promote,
            derive_sp_from_l: Derive2::Promote,
            code: code.into(),
        }
    }

    pub fn with_derive_s_from_lp(
        mut self,
        f: impl Fn(&[D]) -> Vec<D> + Send + Sync + 'static,
    ) -> Self {
        self.derive_s_from_lp = Derive1::Custom(Arc::new(f));
        self
    }

    pub fn with_derive_lp_from_s(
        mut self,
        f: impl Fn(D) -> (Vec<D>, Vec<D>) + Send + Sync + 'static,
    ) -> Self {
        self.derive_lp_from_s = Derive2::Custom(Arc::new(f));
        self
    }

    pub fn with_derive_l_from_sp(
        mut self,
        f: impl Fn(&[D]) -> Vec<D> + Send + Sync + 'static,
    ) -> Self {
        self.derive_l_from_sp = Derive1::Custom(Arc::new(f));
        self
    }

    pub fn with_derive_sp_from_l(
        mut self,
        f: impl Fn(D) -> (Vec<D>, Vec<D>) + Send + Sync + 'static,
    ) -> Self {
        self.derive_sp_from_l = Derive2::Custom(Arc::new(f));
        self
    }

    /// load/param dtypes -> store dtypes (used by `propagate_to_base` at a
    /// Load node).
    pub fn derive_s_from_lp(&self, load_param_dtypes: &[D]) -> Vec<D> {
        eval1(&self.derive_s_from_lp, load_param_dtypes, self.store)
    }

    /// store/param dtypes -> load dtypes (used by `propagate_to_base` at a
    /// Store node).
    pub fn derive_l_from_sp(&self, store_param_dtypes: &[D]) -> Vec<D> {
        eval1(&self.derive_l_from_sp, store_param_dtypes, self.load)
    }

    /// store dtype -> (load dtypes, param dtypes) (used by
    /// `propagate_to_leaves` at a Store node).
    pub fn derive_sp_from_l(&self, store_dtype: D) -> (Vec<D>, Vec<D>) {
        eval2(&self.derive_sp_from_l, store_dtype, self.load, self.parameters)
    }

    /// load dtype -> (store dtypes, param dtypes) (used by
    /// `propagate_to_leaves` at a Load node).
    pub fn derive_lp_from_s(&self, load_dtype: D) -> (Vec<D>, Vec<D>) {
        eval2(&self.derive_lp_from_s, load_dtype, self.store, self.parameters)
    }
}

fn eval1<D: ElemType>(which: &Derive1<D>, inputs: &[D], out_count: usize) -> Vec<D> {
    match which {
        Derive1::Promote => vec![D::promote(inputs); out_count],
        Derive1::Custom(f) => f(inputs),
    }
}

fn eval2<D: ElemType>(
    which: &Derive2<D>,
    input: D,
    array_count: usize,
    param_count: usize,
) -> (Vec<D>, Vec<D>) {
    match which {
        Derive2::Promote => (vec![input.clone(); array_count], vec![input; param_count]),
        Derive2::Custom(f) => f(input),
    }
}
