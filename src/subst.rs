use crate::term::{Term, TermId, TermStore};
use hashbrown::HashSet;
use smallvec::SmallVec;

/// An ordered list of (variable, term) bindings: a substitution.
///
/// Order is preserved so a unifier serializes deterministically as
/// `(?X = a, ?Y = b)`; the empty substitution serializes as `()` and means
/// "true". "No solution" is represented by `Option::None` at the call sites,
/// never by a `Bindings` value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    items: SmallVec<[(TermId, TermId); 8]>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// The binding for a variable term, if any.
    pub fn get(&self, var: TermId) -> Option<TermId> {
        self.items
            .iter()
            .find(|(v, _)| *v == var)
            .map(|(_, t)| *t)
    }

    /// Bind a variable to a term, replacing any existing binding.
    pub fn bind(&mut self, var: TermId, term: TermId) {
        if let Some(slot) = self.items.iter_mut().find(|(v, _)| *v == var) {
            slot.1 = term;
        } else {
            self.items.push((var, term));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (TermId, TermId)> + '_ {
        self.items.iter().copied()
    }

    /// Compose this substitution with a more recent one: every bound value
    /// is rewritten through `other`, then bindings of `other` for variables
    /// not yet bound here are appended.
    pub fn compose(&self, other: &Bindings, store: &TermStore) -> Bindings {
        let mut result = Bindings::new();
        for (var, term) in self.iter() {
            result.items.push((var, apply_bindings(store, other, term)));
        }
        for (var, term) in other.iter() {
            if result.get(var).is_none() {
                result.items.push((var, term));
            }
        }
        result
    }

    /// Restrict to the given variables, in their order, resolving each value
    /// fully. Variables whose value is themselves are dropped.
    pub fn project(&self, store: &TermStore, vars: &[TermId]) -> Bindings {
        let mut result = Bindings::new();
        for &var in vars {
            let value = apply_bindings(store, self, var);
            if value != var {
                result.items.push((var, value));
            }
        }
        result
    }

    /// True iff every bound value is ground.
    pub fn is_ground(&self, store: &TermStore) -> bool {
        self.items.iter().all(|(_, t)| store.is_ground(*t))
    }

    /// Serialize as `(?X = a, ?Y = b)`; the empty substitution is `()`.
    pub fn format(&self, store: &TermStore) -> String {
        let mut out = String::from("(");
        for (i, (var, term)) in self.items.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&store.format(*var));
            out.push_str(" = ");
            out.push_str(&store.format(*term));
        }
        out.push(')');
        out
    }
}

/// Serialize a solution list as `((?X = a), (?X = b))`, or `null` for none.
pub fn format_solutions(store: &TermStore, solutions: Option<&[Bindings]>) -> String {
    match solutions {
        None => "null".to_string(),
        Some(list) => {
            let mut out = String::from("(");
            for (i, b) in list.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&b.format(store));
            }
            out.push(')');
            out
        }
    }
}

/// Apply a substitution to a term, following binding chains to a fixed
/// point. Uses explicit stacks so deeply nested terms cannot overflow the
/// host stack.
pub fn apply_bindings(store: &TermStore, bindings: &Bindings, term: TermId) -> TermId {
    if bindings.is_empty() || store.is_ground(term) {
        return term;
    }

    // (term, children_done) work stack with a parallel result stack.
    let mut work: Vec<(TermId, bool)> = vec![(term, false)];
    let mut results: Vec<TermId> = Vec::new();

    while let Some((id, children_done)) = work.pop() {
        if children_done {
            match store.resolve(id) {
                Term::App(name, args) => {
                    let n = args.len();
                    let new_args: SmallVec<[TermId; 4]> =
                        results.drain(results.len() - n..).collect();
                    results.push(store.app_id(name, new_args));
                }
                _ => unreachable!("only compounds are revisited"),
            }
        } else {
            match store.resolve(id) {
                Term::Var(_) => {
                    let resolved = follow_chain(bindings, id);
                    if resolved == id || store.is_var(resolved).is_some() {
                        results.push(resolved);
                    } else if store.is_ground(resolved) {
                        results.push(resolved);
                    } else {
                        // Bound to a non-ground term: substitute inside it too
                        work.push((resolved, false));
                    }
                }
                Term::Const(_, _) => results.push(id),
                Term::App(_, args) => {
                    if store.is_ground(id) {
                        results.push(id);
                    } else {
                        work.push((id, true));
                        for &arg in args.iter().rev() {
                            work.push((arg, false));
                        }
                    }
                }
            }
        }
    }

    debug_assert_eq!(results.len(), 1);
    results.pop().unwrap()
}

/// Follow a variable's binding chain until it reaches an unbound variable
/// or a non-variable term. The occurs check in unification guarantees the
/// chain is acyclic, but a visited set guards against malformed input.
fn follow_chain(bindings: &Bindings, var: TermId) -> TermId {
    let mut current = var;
    let mut seen: Option<HashSet<TermId>> = None;
    let mut hops = 0usize;
    while let Some(next) = bindings.get(current) {
        current = next;
        hops += 1;
        if hops > 64 {
            let set = seen.get_or_insert_with(HashSet::new);
            if !set.insert(current) {
                break;
            }
        }
        if bindings.get(current).is_none() {
            break;
        }
    }
    current
}

/// Collect the variables of a term in first-occurrence order.
pub fn collect_vars(store: &TermStore, term: TermId, out: &mut Vec<TermId>) {
    if store.is_ground(term) {
        return;
    }
    match store.resolve(term) {
        Term::Var(_) => {
            if !out.contains(&term) {
                out.push(term);
            }
        }
        Term::Const(_, _) => {}
        Term::App(_, args) => {
            for &arg in args.iter() {
                collect_vars(store, arg, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_replaces_bound_vars() {
        let store = TermStore::new();
        let x = store.var("X");
        let a = store.atom("a");
        let mut b = Bindings::new();
        b.bind(x, a);

        let t = store.app("f", [x, store.atom("b")]);
        let applied = apply_bindings(&store, &b, t);
        assert_eq!(store.format(applied), "f(a,b)");
    }

    #[test]
    fn apply_follows_chains_to_fixed_point() {
        let store = TermStore::new();
        let x = store.var("X");
        let y = store.var("Y");
        let a = store.atom("a");
        let mut b = Bindings::new();
        b.bind(x, y);
        b.bind(y, a);

        assert_eq!(apply_bindings(&store, &b, x), a);
        let t = store.app("f", [x]);
        assert_eq!(store.format(apply_bindings(&store, &b, t)), "f(a)");
    }

    #[test]
    fn apply_substitutes_inside_bound_values() {
        let store = TermStore::new();
        let x = store.var("X");
        let y = store.var("Y");
        let mut b = Bindings::new();
        b.bind(x, store.app("g", [y]));
        b.bind(y, store.atom("a"));

        assert_eq!(store.format(apply_bindings(&store, &b, x)), "g(a)");
    }

    #[test]
    fn unbound_vars_stay() {
        let store = TermStore::new();
        let x = store.var("X");
        let t = store.app("f", [x]);
        assert_eq!(apply_bindings(&store, &Bindings::new(), t), t);
    }

    #[test]
    fn compose_rewrites_existing_values() {
        let store = TermStore::new();
        let x = store.var("X");
        let y = store.var("Y");
        let a = store.atom("a");

        let mut first = Bindings::new();
        first.bind(x, y);
        let mut second = Bindings::new();
        second.bind(y, a);

        let composed = first.compose(&second, &store);
        assert_eq!(composed.get(x), Some(a));
        assert_eq!(composed.get(y), Some(a));
    }

    #[test]
    fn project_keeps_query_var_order_and_drops_self_maps() {
        let store = TermStore::new();
        let x = store.var("X");
        let y = store.var("Y");
        let z = store.var("Z");
        let a = store.atom("a");
        let mut b = Bindings::new();
        b.bind(y, a);
        b.bind(x, store.int(1));

        let projected = b.project(&store, &[x, y, z]);
        assert_eq!(projected.format(&store), "(?X = 1, ?Y = a)");
    }

    #[test]
    fn formats_bindings_and_solution_lists() {
        let store = TermStore::new();
        assert_eq!(Bindings::new().format(&store), "()");
        let mut b = Bindings::new();
        b.bind(store.var("X"), store.atom("a"));
        b.bind(store.var("Y"), store.int(2));
        assert_eq!(b.format(&store), "(?X = a, ?Y = 2)");
        assert_eq!(format_solutions(&store, None), "null");
        assert_eq!(
            format_solutions(&store, Some(&[Bindings::new()])),
            "(())"
        );
    }

    #[test]
    fn collect_vars_first_occurrence_order() {
        let store = TermStore::new();
        let x = store.var("X");
        let y = store.var("Y");
        let t = store.app("f", [y, store.app("g", [x, y])]);
        let mut vars = Vec::new();
        collect_vars(&store, t, &mut vars);
        assert_eq!(vars, vec![y, x]);
    }
}
