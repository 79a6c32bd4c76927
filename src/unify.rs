use crate::subst::{apply_bindings, Bindings};
use crate::term::{Term, TermId, TermStore};
use smallvec::SmallVec;

/// Unify two terms, returning a most general unifier if one exists.
///
/// Robinson's algorithm with an occurs check, over an explicit worklist so
/// deep terms cannot overflow the host stack. A variable-to-variable binding
/// is normalized to a stable direction (the higher TermId is bound to the
/// lower), and the returned bindings are fully resolved: no bound value
/// contains a variable that the unifier also binds.
pub fn unify(t1: TermId, t2: TermId, store: &TermStore) -> Option<Bindings> {
    let mut bindings = Bindings::new();
    let mut worklist: SmallVec<[(TermId, TermId); 16]> = SmallVec::new();
    worklist.push((t1, t2));

    while let Some((a, b)) = worklist.pop() {
        let a = deref(a, &bindings, store);
        let b = deref(b, &bindings, store);

        if a == b {
            continue;
        }

        match (store.resolve(a), store.resolve(b)) {
            (Term::Var(_), Term::Var(_)) => {
                // Bind the younger variable to the older for a stable
                // canonical direction.
                if a < b {
                    bindings.bind(b, a);
                } else {
                    bindings.bind(a, b);
                }
            }
            (Term::Var(_), _) => {
                if occurs(a, b, &bindings, store) {
                    return None;
                }
                bindings.bind(a, b);
            }
            (_, Term::Var(_)) => {
                if occurs(b, a, &bindings, store) {
                    return None;
                }
                bindings.bind(b, a);
            }
            (Term::Const(n1, _), Term::Const(n2, _)) => {
                if n1 != n2 {
                    return None;
                }
            }
            (Term::App(f1, args1), Term::App(f2, args2)) => {
                if f1 != f2 || args1.len() != args2.len() {
                    return None;
                }
                // Reversed so argument pairs are solved left to right,
                // which keeps binding order deterministic.
                for (c1, c2) in args1.iter().zip(args2.iter()).rev() {
                    worklist.push((*c1, *c2));
                }
            }
            // Constant vs compound never unifies
            _ => return None,
        }
    }

    Some(resolve_bindings(bindings, store))
}

/// Rewrite every bound value through the full substitution so the returned
/// unifier has no internal chains.
fn resolve_bindings(bindings: Bindings, store: &TermStore) -> Bindings {
    let mut resolved = Bindings::new();
    for (var, term) in bindings.iter() {
        resolved.bind(var, apply_bindings(store, &bindings, term));
    }
    resolved
}

/// Dereference a variable through the partial substitution.
fn deref(term: TermId, bindings: &Bindings, store: &TermStore) -> TermId {
    let mut current = term;
    while store.is_var(current).is_some() {
        match bindings.get(current) {
            Some(next) => current = next,
            None => break,
        }
    }
    current
}

/// Does `var` occur inside `term` (after substitution)?
fn occurs(var: TermId, term: TermId, bindings: &Bindings, store: &TermStore) -> bool {
    let mut stack: SmallVec<[TermId; 16]> = SmallVec::new();
    stack.push(term);

    while let Some(t) = stack.pop() {
        let t = deref(t, bindings, store);
        match store.resolve(t) {
            Term::Var(_) => {
                if t == var {
                    return true;
                }
            }
            Term::Const(_, _) => {}
            Term::App(_, args) => {
                for &arg in args.iter() {
                    stack.push(arg);
                }
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mgu_str(store: &TermStore, a: TermId, b: TermId) -> String {
        match unify(a, b, store) {
            Some(u) => u.format(store),
            None => "null".to_string(),
        }
    }

    #[test]
    fn fresh_variables_unify() {
        let store = TermStore::new();
        let x = store.var("X");
        let y = store.var("Y");
        let u = unify(x, y, &store).expect("vars unify");
        assert_eq!(u.len(), 1);
        // Canonical direction: one side is bound, deterministically
        assert!(u.get(x).is_some() || u.get(y).is_some());
        // Symmetric call binds the same way
        let u2 = unify(y, x, &store).unwrap();
        assert_eq!(u, u2);
    }

    #[test]
    fn same_constant_unifies_empty() {
        let store = TermStore::new();
        let a = store.atom("a");
        assert_eq!(mgu_str(&store, a, a), "()");
    }

    #[test]
    fn different_constants_fail() {
        let store = TermStore::new();
        assert_eq!(mgu_str(&store, store.atom("a"), store.atom("b")), "null");
    }

    #[test]
    fn constant_vs_compound_fails() {
        let store = TermStore::new();
        let c = store.atom("f");
        let t = store.app("f", [store.atom("a")]);
        assert_eq!(mgu_str(&store, c, t), "null");
    }

    #[test]
    fn arity_mismatch_fails() {
        let store = TermStore::new();
        let a = store.atom("a");
        let one = store.app("f", [a]);
        let two = store.app("f", [a, a]);
        assert_eq!(mgu_str(&store, one, two), "null");
    }

    #[test]
    fn shared_var_cannot_take_two_values() {
        let store = TermStore::new();
        let x = store.var("X");
        let lhs = store.app("foo", [x, x]);
        let rhs = store.app("foo", [store.atom("a"), store.atom("b")]);
        assert_eq!(mgu_str(&store, lhs, rhs), "null");
    }

    #[test]
    fn shared_var_with_equal_values_unifies() {
        let store = TermStore::new();
        let x = store.var("X");
        let a = store.atom("a");
        let lhs = store.app("foo", [x, x]);
        let rhs = store.app("foo", [a, a]);
        assert_eq!(mgu_str(&store, lhs, rhs), "(?X = a)");
    }

    #[test]
    fn textbook_nested_case() {
        let store = TermStore::new();
        let x = store.var("X");
        let y = store.var("Y");
        let z = store.var("Z");
        let a = store.atom("a");
        let b = store.atom("b");

        // f(g(X,h(X,b)),Z) = f(g(a,Z),Y)
        let lhs = store.app("f", [store.app("g", [x, store.app("h", [x, b])]), z]);
        let rhs = store.app("f", [store.app("g", [a, z]), y]);

        let u = unify(lhs, rhs, &store).expect("unifies");
        let h_a_b = store.app("h", [a, b]);
        assert_eq!(u.get(x), Some(a));
        assert_eq!(u.get(z), Some(h_a_b));
        assert_eq!(u.get(y), Some(h_a_b));
    }

    #[test]
    fn occurs_check_rejects_infinite_terms() {
        let store = TermStore::new();
        let x = store.var("X");
        let fx = store.app("father", [x]);
        assert_eq!(mgu_str(&store, fx, x), "null");
        // Nested occurs through a substitution
        let y = store.var("Y");
        let lhs = store.app("f", [x, y]);
        let rhs = store.app("f", [y, store.app("g", [x])]);
        assert_eq!(mgu_str(&store, lhs, rhs), "null");
    }

    #[test]
    fn substituting_the_mgu_makes_both_sides_equal() {
        let store = TermStore::new();
        let x = store.var("X");
        let y = store.var("Y");
        let lhs = store.app("pair", [x, store.atom("a")]);
        let rhs = store.app("pair", [store.atom("a"), y]);

        let u = unify(lhs, rhs, &store).unwrap();
        let applied_l = apply_bindings(&store, &u, lhs);
        let applied_r = apply_bindings(&store, &u, rhs);
        assert_eq!(applied_l, applied_r);
    }

    #[test]
    fn deep_nesting_unifies_without_recursion() {
        let store = TermStore::new();
        let mut lhs = store.atom("z");
        let x = store.var("X");
        let mut rhs = x;
        for _ in 0..500 {
            lhs = store.app("s", [lhs]);
            rhs = store.app("s", [rhs]);
        }
        let u = unify(lhs, rhs, &store).unwrap();
        assert_eq!(u.get(x), Some(store.atom("z")));
    }
}
