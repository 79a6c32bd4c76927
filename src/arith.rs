//! Arithmetic sub-language: op-codes resolved at term construction and an
//! evaluator over ground arithmetic terms.
//!
//! Type discipline follows the surface language: `int op int -> int` for
//! `+ - * mod min max abs`, anything mixed (or `/`, `float/1`) promotes to
//! float. Comparison operators evaluate to the constants `true`/`false`.
//! Division (and `mod`) by zero yields integer 0.

use crate::term::{ConstKind, Term, TermId, TermStore};
use smallvec::SmallVec;

/// Arithmetic operator, resolved once when a compound term is interned so
/// evaluation never string-compares functor names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Abs,
    Min,
    Max,
    Float,
    Integer,
    Less,
    Greater,
    LessEq,
    GreaterEq,
    NumEq,
    NumNe,
}

impl ArithOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            ArithOp::Less
                | ArithOp::Greater
                | ArithOp::LessEq
                | ArithOp::GreaterEq
                | ArithOp::NumEq
                | ArithOp::NumNe
        )
    }
}

/// Map a functor name + arity to its op-code, if it is arithmetic.
pub fn classify(name: &str, arity: usize) -> Option<ArithOp> {
    let op = match (name, arity) {
        ("+", 2) => ArithOp::Add,
        ("-", 2) => ArithOp::Sub,
        ("*", 2) => ArithOp::Mul,
        ("/", 2) => ArithOp::Div,
        ("mod", 2) => ArithOp::Mod,
        ("abs", 1) => ArithOp::Abs,
        ("min", 2) => ArithOp::Min,
        ("max", 2) => ArithOp::Max,
        ("float", 1) => ArithOp::Float,
        ("integer", 1) => ArithOp::Integer,
        ("<", 2) => ArithOp::Less,
        (">", 2) => ArithOp::Greater,
        ("=<", 2) => ArithOp::LessEq,
        (">=", 2) => ArithOp::GreaterEq,
        ("=:=", 2) => ArithOp::NumEq,
        ("=\\=", 2) => ArithOp::NumNe,
        _ => return None,
    };
    Some(op)
}

/// A numeric value mid-evaluation, before being interned back into a term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn to_term(self, store: &TermStore) -> TermId {
        match self {
            Num::Int(i) => store.int(i),
            Num::Float(f) => store.float(f),
        }
    }
}

/// Evaluate a term to a numeric value. Fails (None) on variables,
/// non-numeric atoms, and compounds that are not arithmetic.
pub fn eval_num(store: &TermStore, id: TermId) -> Option<Num> {
    match store.resolve(id) {
        Term::Var(_) => None,
        Term::Const(_, ConstKind::Int(i)) => Some(Num::Int(i)),
        Term::Const(_, ConstKind::Float(bits)) => Some(Num::Float(f64::from_bits(bits))),
        Term::Const(_, ConstKind::Atom) => None,
        Term::App(_, args) => {
            let op = store.arith_op(id)?;
            eval_op(store, op, &args)
        }
    }
}

fn eval_op(store: &TermStore, op: ArithOp, args: &[TermId]) -> Option<Num> {
    match op {
        ArithOp::Abs => {
            let v = eval_num(store, args[0])?;
            Some(match v {
                Num::Int(i) => Num::Int(i.abs()),
                Num::Float(f) => Num::Float(f.abs()),
            })
        }
        ArithOp::Float => Some(Num::Float(eval_num(store, args[0])?.as_f64())),
        ArithOp::Integer => Some(Num::Int(eval_num(store, args[0])?.as_f64() as i64)),
        _ => {
            let left = eval_num(store, args[0])?;
            let right = eval_num(store, args[1])?;
            eval_binary(op, left, right)
        }
    }
}

fn eval_binary(op: ArithOp, left: Num, right: Num) -> Option<Num> {
    use Num::{Float, Int};
    let result = match (op, left, right) {
        (ArithOp::Add, Int(a), Int(b)) => Int(a.wrapping_add(b)),
        (ArithOp::Add, a, b) => Float(a.as_f64() + b.as_f64()),
        (ArithOp::Sub, Int(a), Int(b)) => Int(a.wrapping_sub(b)),
        (ArithOp::Sub, a, b) => Float(a.as_f64() - b.as_f64()),
        (ArithOp::Mul, Int(a), Int(b)) => Int(a.wrapping_mul(b)),
        (ArithOp::Mul, a, b) => Float(a.as_f64() * b.as_f64()),
        // Division by zero yields 0, not an error
        (ArithOp::Div, Int(_), Int(0)) => Int(0),
        (ArithOp::Div, Int(a), Int(b)) => Int(a / b),
        (ArithOp::Div, a, b) => {
            if b.as_f64() == 0.0 {
                Int(0)
            } else {
                Float(a.as_f64() / b.as_f64())
            }
        }
        (ArithOp::Mod, Int(_), Int(0)) => Int(0),
        (ArithOp::Mod, Int(a), Int(b)) => Int(a % b),
        (ArithOp::Mod, a, b) => {
            if b.as_f64() == 0.0 {
                Int(0)
            } else {
                Float(a.as_f64() % b.as_f64())
            }
        }
        (ArithOp::Min, Int(a), Int(b)) => Int(a.min(b)),
        (ArithOp::Min, a, b) => Float(a.as_f64().min(b.as_f64())),
        (ArithOp::Max, Int(a), Int(b)) => Int(a.max(b)),
        (ArithOp::Max, a, b) => Float(a.as_f64().max(b.as_f64())),
        _ => return None,
    };
    Some(result)
}

/// Evaluate a comparison operator to a boolean.
pub fn eval_compare(op: ArithOp, left: Num, right: Num) -> Option<bool> {
    let result = match op {
        ArithOp::Less => left.as_f64() < right.as_f64(),
        ArithOp::Greater => left.as_f64() > right.as_f64(),
        ArithOp::LessEq => left.as_f64() <= right.as_f64(),
        ArithOp::GreaterEq => left.as_f64() >= right.as_f64(),
        ArithOp::NumEq => match (left, right) {
            (Num::Int(a), Num::Int(b)) => a == b,
            (a, b) => a.as_f64() == b.as_f64(),
        },
        ArithOp::NumNe => match (left, right) {
            (Num::Int(a), Num::Int(b)) => a != b,
            (a, b) => a.as_f64() != b.as_f64(),
        },
        _ => return None,
    };
    Some(result)
}

/// Full `Eval`: arithmetic compounds become numeric constants, comparisons
/// become the `true`/`false` constants, any other ground term evaluates to
/// itself, and anything containing a variable fails.
pub fn eval(store: &TermStore, id: TermId) -> Option<TermId> {
    if let Some(op) = store.arith_op(id) {
        if op.is_comparison() {
            let args = store.args(id);
            let left = eval_num(store, args[0])?;
            let right = eval_num(store, args[1])?;
            return Some(if eval_compare(op, left, right)? {
                store.true_term()
            } else {
                store.false_term()
            });
        }
        return Some(eval_num(store, id)?.to_term(store));
    }
    if store.is_ground(id) {
        Some(id)
    } else {
        None
    }
}

/// Evaluate every evaluable arithmetic subterm of a task, bottom-up, so
/// `travel(-(1,2))` becomes `travel(-1)` before dispatch.
pub fn resolve_arithmetic(store: &TermStore, id: TermId) -> TermId {
    match store.resolve(id) {
        Term::Var(_) | Term::Const(_, _) => id,
        Term::App(name, args) => {
            let new_args: SmallVec<[TermId; 4]> = args
                .iter()
                .map(|a| resolve_arithmetic(store, *a))
                .collect();
            let rebuilt = store.app_id(name, new_args);
            if store.arith_op(rebuilt).is_some() {
                if let Some(value) = eval(store, rebuilt) {
                    return value;
                }
            }
            rebuilt
        }
    }
}
