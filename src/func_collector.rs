//! Deduplicating collector for the `func` namespace used inside
//! transformation bodies.
//!
//! Grounded on the teacher's `util::uniq::UniqueNamer<T>`: both map an
//! arbitrary key to a name, remembering it so a repeated key gets back the
//! same name. The difference is that `UniqueNamer` invents a fresh name on
//! collision (`"A"`, `"A1"`, `"A2"`, ...) while this collector's whole point
//! is determinism (SPEC_FULL.md §8 invariant 4): the same `(op, dtypes)` key
//! must always produce the *same* canonical name, never a renamed one.
//!
//! The key is the dtype's C-type spelling rather than the dtype value
//! itself: two dtypes that render the same `ctype` are indistinguishable
//! for code-generation purposes, and using plain strings here keeps this
//! collector decoupled from the crate's generic `ElemType` parameter, which
//! matters because it is driven from inside a Tera `Function` (see
//! `codegen.rs`), where only JSON-shaped values are available.

/// One distinct `(operation, ctype-tuple)` combination seen so far, in
/// first-call order.
struct Entry {
    op: String,
    ctypes: Vec<String>,
}

/// Collects calls into the `func` namespace during code generation, and
/// emits one deduplicated helper definition per distinct key at the end.
/// The actual helper *bodies* are supplied by the caller's body-provider
/// closure — synthesizing correct arithmetic for a given dtype is the
/// out-of-scope "numerical-type helpers" concern; this type only owns
/// registration, deterministic naming, and emit-time deduplication.
pub struct FuncCollector {
    prefix: String,
    body_provider: Box<dyn Fn(&str, &[String]) -> String + Send>,
    seen: Vec<Entry>,
}

impl FuncCollector {
    pub fn new(
        prefix: impl Into<String>,
        body_provider: impl Fn(&str, &[String]) -> String + Send + 'static,
    ) -> Self {
        FuncCollector {
            prefix: prefix.into(),
            body_provider: Box::new(body_provider),
            seen: Vec::new(),
        }
    }

    /// Registers a call to `op` over `ctypes` (if not already registered)
    /// and returns the fully-applied call expression, e.g.
    /// `tr_mul_float_float(a, b)`.
    pub fn call(&mut self, op: &str, ctypes: &[String], args: &[String]) -> String {
        let name = self.register(op, ctypes);
        format!("{}({})", name, args.join(", "))
    }

    /// Registers a call to `op` over `ctypes` (if not already registered)
    /// and returns just the canonical helper name, with no call syntax.
    pub fn register(&mut self, op: &str, ctypes: &[String]) -> String {
        if !self.seen.iter().any(|e| e.op == op && e.ctypes == ctypes) {
            self.seen.push(Entry { op: op.to_string(), ctypes: ctypes.to_vec() });
        }
        helper_name(&self.prefix, op, ctypes)
    }

    /// Renders the deduplicated set of helper definitions, in first-call
    /// order, ready to be prepended to the rest of the generated source.
    pub fn render(&self) -> String {
        self.seen
            .iter()
            .map(|e| (self.body_provider)(&e.op, &e.ctypes))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn helper_name(prefix: &str, op: &str, ctypes: &[String]) -> String {
    let mut name = format!("{}_{}", prefix, op);
    for ctype in ctypes {
        name.push('_');
        name.push_str(&sanitize(ctype));
    }
    name
}

/// Turns a C type spelling (`"unsigned int"`, `"float2 *"`, ...) into
/// something safe to splice into an identifier.
fn sanitize(ctype: &str) -> String {
    ctype
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[test]
fn repeated_calls_share_one_definition() {
    let mut fc = FuncCollector::new("tr", |op, _ctypes| format!("/* {} body */", op));
    let call1 = fc.call("mul", &["float".into(), "float".into()], &["a".into(), "b".into()]);
    let call2 = fc.call("mul", &["float".into(), "float".into()], &["c".into(), "d".into()]);
    assert_eq!(call1, "tr_mul_float_float(a, b)");
    assert_eq!(call2, "tr_mul_float_float(c, d)");
    assert_eq!(fc.render(), "/* mul body */");
}

#[test]
fn distinct_ops_get_distinct_definitions() {
    let mut fc = FuncCollector::new("tr", |op, _ctypes| format!("/* {} */", op));
    fc.call("mul", &["float".into()], &["a".into()]);
    fc.call("add", &["float".into()], &["a".into()]);
    assert_eq!(fc.render(), "/* mul */\n\n/* add */");
}

#[test]
fn distinct_ctypes_get_distinct_definitions() {
    let mut fc = FuncCollector::new("tr", |op, ctypes| format!("/* {} {:?} */", op, ctypes));
    fc.call("mul", &["float".into()], &["a".into()]);
    fc.call("mul", &["double".into()], &["a".into()]);
    assert_eq!(fc.render(), "/* mul [\"float\"] */\n\n/* mul [\"double\"] */");
}
