use crate::arith::{self, ArithOp};
use crate::symbol::{NameId, SymbolStore};
use hashbrown::HashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Unique identifier for a term in the term store.
/// TermIds are stable, cheap to copy, and compare equal iff the
/// underlying terms are structurally equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TermId(u32);

impl TermId {
    /// Get the raw u32 value (for debugging/display).
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Lexical type of a constant, decided once at interning time.
///
/// Floats store their bit pattern so the enum stays `Eq + Hash` for
/// hashconsing; use [`ConstKind::as_f64`] to get the value back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstKind {
    Int(i64),
    Float(u64),
    Atom,
}

impl ConstKind {
    pub fn as_f64(self) -> Option<f64> {
        match self {
            ConstKind::Int(i) => Some(i as f64),
            ConstKind::Float(bits) => Some(f64::from_bits(bits)),
            ConstKind::Atom => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, ConstKind::Atom)
    }
}

/// A term is a variable, a constant, or a compound (functor + arguments).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    /// An unbound variable, identified by its interned name.
    Var(NameId),
    /// A 0-arity symbol, lexically typed as int, float, or atom.
    Const(NameId, ConstKind),
    /// A functor applied to one or more argument terms.
    App(NameId, SmallVec<[TermId; 4]>),
}

/// Per-term record: the term itself plus facts computed once at interning.
struct NodeInfo {
    term: Term,
    ground: bool,
    arith: Option<ArithOp>,
    footprint: u32,
}

struct Inner {
    nodes: Vec<NodeInfo>,
    map: HashMap<Term, TermId>,
}

/// The term factory: interns terms by structural identity.
///
/// Two terms constructed with equal name and equal (interned) arguments get
/// the same `TermId` and so compare equal in O(1). The store also tracks an
/// approximate dynamic memory footprint and carries the out-of-memory flag
/// the planner and resolver set when a budget is exceeded.
pub struct TermStore {
    symbols: SymbolStore,
    inner: RwLock<Inner>,
    dynamic_size: AtomicI64,
    out_of_memory: AtomicBool,
    fresh: AtomicU64,
}

impl TermStore {
    pub fn new() -> Self {
        Self {
            symbols: SymbolStore::new(),
            inner: RwLock::new(Inner {
                nodes: Vec::new(),
                map: HashMap::new(),
            }),
            dynamic_size: AtomicI64::new(0),
            out_of_memory: AtomicBool::new(false),
            fresh: AtomicU64::new(0),
        }
    }

    pub fn symbols(&self) -> &SymbolStore {
        &self.symbols
    }

    fn intern(&self, term: Term, ground: bool, arith: Option<ArithOp>, name_len: usize) -> TermId {
        {
            let inner = self.inner.read();
            if let Some(&id) = inner.map.get(&term) {
                return id;
            }
        }

        let mut inner = self.inner.write();
        // Double-check after acquiring the write lock
        if let Some(&id) = inner.map.get(&term) {
            return id;
        }

        let arg_count = match &term {
            Term::App(_, args) => args.len(),
            _ => 0,
        };
        let footprint =
            (std::mem::size_of::<NodeInfo>() + arg_count * std::mem::size_of::<TermId>() + name_len)
                as u32;
        let id = TermId(inner.nodes.len() as u32);
        inner.nodes.push(NodeInfo {
            term: term.clone(),
            ground,
            arith,
            footprint,
        });
        inner.map.insert(term, id);
        self.dynamic_size
            .fetch_add(footprint as i64, Ordering::Relaxed);
        id
    }

    /// Create a variable term `?name`.
    ///
    /// A don't-care variable `_` gets a fresh generated name per call, so two
    /// `_`s never co-refer.
    pub fn var(&self, name: &str) -> TermId {
        if name == "_" {
            let n = self.fresh.fetch_add(1, Ordering::Relaxed);
            let fresh = format!("_G{}", n);
            let id = self.symbols.intern(&fresh);
            return self.intern(Term::Var(id), false, None, fresh.len());
        }
        let id = self.symbols.intern(name);
        self.intern(Term::Var(id), false, None, name.len())
    }

    pub(crate) fn var_id(&self, name: NameId) -> TermId {
        self.intern(Term::Var(name), false, None, 0)
    }

    /// Create a constant, classifying its lexical form as int, float or atom.
    pub fn constant(&self, text: &str) -> TermId {
        let kind = classify_const(text);
        let id = self.symbols.intern(text);
        self.intern(Term::Const(id, kind), true, None, text.len())
    }

    /// Create an atom constant (no numeric classification).
    pub fn atom(&self, text: &str) -> TermId {
        self.constant(text)
    }

    pub fn int(&self, value: i64) -> TermId {
        self.constant(&value.to_string())
    }

    pub fn float(&self, value: f64) -> TermId {
        self.constant(&value.to_string())
    }

    /// Create a compound term `name(args...)`.
    pub fn app(&self, name: &str, args: impl IntoIterator<Item = TermId>) -> TermId {
        let args: SmallVec<[TermId; 4]> = args.into_iter().collect();
        let name_id = self.symbols.intern(name);
        self.app_id(name_id, args)
    }

    pub fn app_id(&self, name: NameId, args: SmallVec<[TermId; 4]>) -> TermId {
        debug_assert!(!args.is_empty(), "compound terms require arguments");
        let ground = args.iter().all(|a| self.is_ground(*a));
        let arith = self
            .symbols
            .resolve(name)
            .and_then(|n| arith::classify(n, args.len()));
        self.intern(Term::App(name, args), ground, arith, 0)
    }

    /// Resolve a TermId to its term. Panics on an id from another store.
    pub fn resolve(&self, id: TermId) -> Term {
        self.inner.read().nodes[id.0 as usize].term.clone()
    }

    pub fn is_var(&self, id: TermId) -> Option<NameId> {
        match &self.inner.read().nodes[id.0 as usize].term {
            Term::Var(n) => Some(*n),
            _ => None,
        }
    }

    pub fn const_kind(&self, id: TermId) -> Option<ConstKind> {
        match &self.inner.read().nodes[id.0 as usize].term {
            Term::Const(_, k) => Some(*k),
            _ => None,
        }
    }

    /// The functor/constant/variable name of a term.
    pub fn name_id(&self, id: TermId) -> NameId {
        match &self.inner.read().nodes[id.0 as usize].term {
            Term::Var(n) | Term::Const(n, _) | Term::App(n, _) => *n,
        }
    }

    pub fn name_str(&self, id: TermId) -> String {
        self.symbols
            .resolve(self.name_id(id))
            .unwrap_or_default()
            .to_string()
    }

    pub fn arity(&self, id: TermId) -> usize {
        match &self.inner.read().nodes[id.0 as usize].term {
            Term::App(_, args) => args.len(),
            _ => 0,
        }
    }

    pub fn args(&self, id: TermId) -> SmallVec<[TermId; 4]> {
        match &self.inner.read().nodes[id.0 as usize].term {
            Term::App(_, args) => args.clone(),
            _ => SmallVec::new(),
        }
    }

    /// True iff the term contains no variables. Computed once at interning.
    pub fn is_ground(&self, id: TermId) -> bool {
        self.inner.read().nodes[id.0 as usize].ground
    }

    /// The arithmetic op-code resolved at construction, if this compound's
    /// functor is an arithmetic operator of matching arity.
    pub fn arith_op(&self, id: TermId) -> Option<ArithOp> {
        self.inner.read().nodes[id.0 as usize].arith
    }

    pub fn term_footprint(&self, id: TermId) -> i64 {
        self.inner.read().nodes[id.0 as usize].footprint as i64
    }

    // List terms use '.'(Head, Tail) cells with [] as nil.

    pub fn nil(&self) -> TermId {
        self.constant("[]")
    }

    pub fn cons(&self, head: TermId, tail: TermId) -> TermId {
        self.app(".", [head, tail])
    }

    pub fn make_list(&self, items: &[TermId]) -> TermId {
        let mut list = self.nil();
        for &item in items.iter().rev() {
            list = self.cons(item, list);
        }
        list
    }

    /// Decompose a proper list term into its items. Returns None if the term
    /// is not a proper list (ends in something other than `[]`).
    pub fn list_items(&self, id: TermId) -> Option<Vec<TermId>> {
        let mut items = Vec::new();
        let mut current = id;
        let nil_name = self.symbols.intern("[]");
        let cons_name = self.symbols.intern(".");
        loop {
            match self.resolve(current) {
                Term::Const(n, _) if n == nil_name => return Some(items),
                Term::App(n, args) if n == cons_name && args.len() == 2 => {
                    items.push(args[0]);
                    current = args[1];
                }
                _ => return None,
            }
        }
    }

    pub fn true_term(&self) -> TermId {
        self.constant("true")
    }

    pub fn false_term(&self) -> TermId {
        self.constant("false")
    }

    /// A monotone counter used to scope clause variables per invocation.
    pub fn fresh_scope(&self) -> u64 {
        self.fresh.fetch_add(1, Ordering::Relaxed)
    }

    /// Approximate bytes held by all interned terms.
    pub fn dynamic_size(&self) -> i64 {
        self.dynamic_size.load(Ordering::Relaxed)
    }

    /// The out-of-memory flag. Set when a memory budget is exceeded; callers
    /// of the planner must check it to tell partial results from complete
    /// ones.
    pub fn out_of_memory(&self) -> bool {
        self.out_of_memory.load(Ordering::Relaxed)
    }

    pub fn set_out_of_memory(&self, value: bool) {
        self.out_of_memory.store(value, Ordering::Relaxed);
    }

    /// Format a term the way the surface syntax writes it: `?X` for
    /// variables, `name` for constants, `name(a,b)` for compounds, and
    /// bracket form for proper lists.
    pub fn format(&self, id: TermId) -> String {
        let mut out = String::new();
        self.render(id, &mut out);
        out
    }

    fn render(&self, id: TermId, out: &mut String) {
        if let Some(items) = self.list_items(id) {
            if self.arity(id) > 0 || self.name_str(id) == "[]" {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    self.render(*item, out);
                }
                out.push(']');
                return;
            }
        }
        match self.resolve(id) {
            Term::Var(n) => {
                out.push('?');
                out.push_str(self.symbols.resolve(n).unwrap_or("?"));
            }
            Term::Const(n, _) => {
                out.push_str(self.symbols.resolve(n).unwrap_or("?"));
            }
            Term::App(n, args) => {
                out.push_str(self.symbols.resolve(n).unwrap_or("?"));
                out.push('(');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    self.render(*arg, out);
                }
                out.push(')');
            }
        }
    }

    /// Format a term list as `(a, b, c)`.
    pub fn format_terms(&self, ids: &[TermId]) -> String {
        let mut out = String::from("(");
        for (i, id) in ids.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            self.render(*id, &mut out);
        }
        out.push(')');
        out
    }
}

impl Default for TermStore {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_const(text: &str) -> ConstKind {
    let looks_numeric = text
        .chars()
        .next()
        .map(|c| c.is_ascii_digit() || c == '-' || c == '.')
        .unwrap_or(false)
        && text.chars().any(|c| c.is_ascii_digit());
    if !looks_numeric {
        return ConstKind::Atom;
    }
    if let Ok(i) = text.parse::<i64>() {
        return ConstKind::Int(i);
    }
    if let Ok(f) = text.parse::<f64>() {
        return ConstKind::Float(f.to_bits());
    }
    ConstKind::Atom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_interning_gives_same_id() {
        let store = TermStore::new();
        let a1 = store.app("at", [store.atom("home")]);
        let a2 = store.app("at", [store.atom("home")]);
        assert_eq!(a1, a2);

        let b = store.app("at", [store.atom("work")]);
        assert_ne!(a1, b);
    }

    #[test]
    fn constants_classify_lexically() {
        let store = TermStore::new();
        assert_eq!(store.const_kind(store.constant("42")), Some(ConstKind::Int(42)));
        assert_eq!(
            store.const_kind(store.constant("-7")),
            Some(ConstKind::Int(-7))
        );
        assert!(matches!(
            store.const_kind(store.constant("1.5")),
            Some(ConstKind::Float(_))
        ));
        assert_eq!(store.const_kind(store.constant("taxi")), Some(ConstKind::Atom));
        // Leading dash alone is not a number
        assert_eq!(store.const_kind(store.constant("-")), Some(ConstKind::Atom));
    }

    #[test]
    fn ground_flag_computed_once() {
        let store = TermStore::new();
        let v = store.var("X");
        let c = store.atom("a");
        assert!(!store.is_ground(v));
        assert!(store.is_ground(c));
        assert!(!store.is_ground(store.app("f", [v, c])));
        assert!(store.is_ground(store.app("f", [c, c])));
    }

    #[test]
    fn dont_care_vars_are_distinct() {
        let store = TermStore::new();
        let a = store.var("_");
        let b = store.var("_");
        assert_ne!(a, b);
    }

    #[test]
    fn named_vars_are_shared() {
        let store = TermStore::new();
        assert_eq!(store.var("X"), store.var("X"));
        assert_ne!(store.var("X"), store.var("Y"));
    }

    #[test]
    fn formats_like_the_surface_syntax() {
        let store = TermStore::new();
        let t = store.app("at", [store.var("Who"), store.atom("home")]);
        assert_eq!(store.format(t), "at(?Who,home)");
        let list = store.make_list(&[store.int(1), store.int(2), store.int(3)]);
        assert_eq!(store.format(list), "[1,2,3]");
        assert_eq!(store.format(store.nil()), "[]");
    }

    #[test]
    fn list_roundtrip() {
        let store = TermStore::new();
        let items = vec![store.int(1), store.atom("b")];
        let list = store.make_list(&items);
        assert_eq!(store.list_items(list), Some(items));
        // An improper list is rejected
        let improper = store.cons(store.int(1), store.atom("x"));
        assert_eq!(store.list_items(improper), None);
    }

    #[test]
    fn footprint_accumulates() {
        let store = TermStore::new();
        let before = store.dynamic_size();
        store.app("somewhere", [store.atom("else")]);
        assert!(store.dynamic_size() > before);
        // Interning the same term again does not grow the store
        let mid = store.dynamic_size();
        store.app("somewhere", [store.atom("else")]);
        assert_eq!(store.dynamic_size(), mid);
    }
}
