//! SLD resolution over a conjunction of goals, with the planner's built-in
//! predicate catalog.
//!
//! The resolver returns either `None` (no solution, logical false) or a
//! non-empty list of unifiers, each a complete solution projected onto the
//! variables of the query. Built-in dispatch is table-driven; clause
//! variables are renamed to a fresh scope per invocation; cut is handled
//! with clause-frame levels so `!` prunes exactly the alternatives of the
//! clause that contains it.

use crate::arith::{self, Num};
use crate::rules::RuleSet;
use crate::subst::{apply_bindings, collect_vars, Bindings};
use crate::symbol::NameId;
use crate::term::{Term, TermId, TermStore};
use crate::trace::trace;
use crate::unify::unify;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::sync::Arc;

type FxHashMap<K, V> = HashMap<K, V, BuildHasherDefault<FxHasher>>;

/// Where the write-family built-ins send their output.
pub trait OutputSink: Send + Sync {
    fn emit(&self, text: &str);
}

/// Default sink: standard output.
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn emit(&self, text: &str) {
        print!("{}", text);
    }
}

/// Sink that collects output into a buffer, for tests and embedders.
#[derive(Default)]
pub struct CaptureSink {
    buffer: Mutex<String>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything written so far, clearing the buffer.
    pub fn take(&self) -> String {
        std::mem::take(&mut *self.buffer.lock())
    }
}

impl OutputSink for CaptureSink {
    fn emit(&self, text: &str) {
        self.buffer.lock().push_str(text);
    }
}

/// The outcome of a `resolve_all` call.
pub struct ResolveResult {
    /// None means no solution (logical false); otherwise non-empty, in
    /// discovery order, each projected onto the query's variables.
    pub solutions: Option<Vec<Bindings>>,
    /// Index into the goal conjunction of the furthest failure seen.
    pub furthest_failure_index: i32,
    /// Terms recorded by `failureContext` at the deepest failure point.
    pub failure_context: Vec<TermId>,
    /// High-water of bytes attributable to this resolution.
    pub memory_used: i64,
}

/// The goal resolver. Stateless apart from its output sink; all per-query
/// state lives on the call.
pub struct Resolver {
    sink: Arc<dyn OutputSink>,
}

impl Resolver {
    pub fn new() -> Self {
        Self {
            sink: Arc::new(StdoutSink),
        }
    }

    pub fn with_sink(sink: Arc<dyn OutputSink>) -> Self {
        Self { sink }
    }

    /// Resolve a goal conjunction against a rule set, returning every
    /// solution in discovery order.
    ///
    /// `depth` seeds failure-depth accounting (the planner passes its stack
    /// height); `budget` is the remaining memory budget in bytes. If the
    /// budget is exceeded the factory's out-of-memory flag is set and
    /// whatever solutions were already found are returned.
    pub fn resolve_all(
        &self,
        store: &TermStore,
        state: &mut RuleSet,
        goals: &[TermId],
        depth: usize,
        budget: i64,
    ) -> ResolveResult {
        let mut query_vars = Vec::new();
        for &g in goals {
            collect_vars(store, g, &mut query_vars);
        }
        // Don't-care variables are never reported in solutions
        query_vars.retain(|&v| !store.name_str(v).starts_with('_'));

        let entries: Vec<GoalEntry> = goals
            .iter()
            .enumerate()
            .map(|(i, &t)| GoalEntry {
                term: t,
                top_idx: i as u32,
                cut_level: 0,
            })
            .collect();

        let mut solve = Solve {
            store,
            state,
            sink: self.sink.as_ref(),
            next_frame: 0,
            budget,
            base_size: store.dynamic_size(),
            highest: 0,
            fail_depth: 0,
            fail_index: -1,
            fail_context: Vec::new(),
            active_context: Vec::new(),
        };

        let mut raw = Vec::new();
        solve.solve(&entries, &Bindings::new(), depth, &mut raw, usize::MAX);

        let solutions: Vec<Bindings> = raw
            .iter()
            .map(|s| s.project(store, &query_vars))
            .collect();
        ResolveResult {
            solutions: if solutions.is_empty() {
                None
            } else {
                Some(solutions)
            },
            furthest_failure_index: solve.fail_index,
            failure_context: solve.fail_context,
            memory_used: solve.highest,
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

/// One goal in the conjunction being solved, annotated with the index of
/// the top-level goal it descends from (for failure reporting) and the
/// clause frame a cut at this position commits to.
#[derive(Clone, Copy)]
struct GoalEntry {
    term: TermId,
    top_idx: u32,
    cut_level: u64,
}

/// Control flow out of a solve step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ctl {
    /// Keep exploring alternatives.
    More,
    /// A cut fired; stop alternatives up to (and including) this frame.
    Cut(u64),
    /// The solution cap was reached; unwind without failing.
    Halt,
    /// The memory budget was exceeded; unwind immediately.
    Oom,
}

/// The closed catalog of built-in predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    True,
    False,
    Unify,
    Identical,
    NotIdentical,
    Is,
    Compare,
    Not,
    First,
    FindAll,
    ForAll,
    Distinct,
    Count,
    AggMin,
    AggMax,
    AggSum,
    SortBy,
    Atomic,
    AtomConcat,
    AtomChars,
    DowncaseAtom,
    Write,
    WriteLn,
    Nl,
    Print,
    AssertZ,
    AssertA,
    Retract,
    RetractAll,
    Cut,
    FailureContext,
}

/// Map a predicate name + arity to its built-in, if it is one.
/// `min`/`max` at arity 2 are arithmetic, at arity 3+ aggregates.
fn builtin_of(name: &str, arity: usize) -> Option<Builtin> {
    use Builtin::*;
    let b = match (name, arity) {
        ("true", 0) => True,
        ("false", 0) | ("fail", 0) => False,
        ("=", 2) => Unify,
        ("==", 2) => Identical,
        ("\\==", 2) => NotIdentical,
        ("is", 2) => Is,
        ("<", 2) | (">", 2) | ("=<", 2) | (">=", 2) | ("=:=", 2) | ("=\\=", 2) => Compare,
        ("not", n) | ("\\+", n) if n >= 1 => Not,
        ("first", n) if n >= 1 => First,
        ("findall", 3) => FindAll,
        ("forall", 2) => ForAll,
        ("distinct", n) if n >= 1 => Distinct,
        ("count", n) if n >= 2 => Count,
        ("min", n) if n >= 3 => AggMin,
        ("max", n) if n >= 3 => AggMax,
        ("sum", n) if n >= 3 => AggSum,
        ("sortBy", 2) => SortBy,
        ("atomic", 1) => Atomic,
        ("atom_concat", 3) => AtomConcat,
        ("atom_chars", 2) => AtomChars,
        ("downcase_atom", 2) => DowncaseAtom,
        ("write", n) if n >= 1 => Write,
        ("writeln", n) if n >= 1 => WriteLn,
        ("nl", 0) => Nl,
        ("print", n) if n >= 1 => Print,
        ("assert", 1) | ("assertz", 1) => AssertZ,
        ("asserta", 1) => AssertA,
        ("retract", 1) => Retract,
        ("retractall", 1) => RetractAll,
        ("!", 0) => Cut,
        ("failureContext", _) => FailureContext,
        _ => return None,
    };
    Some(b)
}

/// True if the name is reserved for a built-in predicate (at any arity;
/// `min`/`max`/`sum` count even though their arity-2 forms are arithmetic).
/// Rules under these names are silently shadowed: built-in dispatch always
/// wins, so [`crate::rules::RuleSet::add_rule`] flags them at insertion.
pub fn is_builtin_name(name: &str) -> bool {
    matches!(
        name,
        "true"
            | "false"
            | "fail"
            | "="
            | "=="
            | "\\=="
            | "is"
            | "<"
            | ">"
            | "=<"
            | ">="
            | "=:="
            | "=\\="
            | "not"
            | "\\+"
            | "first"
            | "findall"
            | "forall"
            | "distinct"
            | "count"
            | "min"
            | "max"
            | "sum"
            | "sortBy"
            | "atomic"
            | "atom_concat"
            | "atom_chars"
            | "downcase_atom"
            | "write"
            | "writeln"
            | "nl"
            | "print"
            | "assert"
            | "asserta"
            | "assertz"
            | "retract"
            | "retractall"
            | "!"
            | "failureContext"
    )
}

/// Rough bytes per held solution, for budget accounting.
const SOLUTION_FOOTPRINT: i64 = 96;

struct Solve<'a> {
    store: &'a TermStore,
    state: &'a mut RuleSet,
    sink: &'a dyn OutputSink,
    next_frame: u64,
    budget: i64,
    base_size: i64,
    highest: i64,
    fail_depth: usize,
    fail_index: i32,
    fail_context: Vec<TermId>,
    active_context: Vec<TermId>,
}

impl<'a> Solve<'a> {
    fn new_frame(&mut self) -> u64 {
        self.next_frame += 1;
        self.next_frame
    }

    /// Sample memory attributable to this resolution; returns true when the
    /// budget is blown (and sets the factory's out-of-memory flag).
    fn check_budget(&mut self, held_solutions: usize) -> bool {
        let used = (self.store.dynamic_size() - self.base_size)
            + self.state.exclusive_size()
            + held_solutions as i64 * SOLUTION_FOOTPRINT;
        if used > self.highest {
            self.highest = used;
        }
        if used > self.budget {
            self.store.set_out_of_memory(true);
            return true;
        }
        false
    }

    /// Remember the deepest (then furthest) failure, with the context terms
    /// active at that point.
    fn record_failure(&mut self, depth: usize, index: u32) {
        let index = index as i32;
        if depth > self.fail_depth || (depth == self.fail_depth && index > self.fail_index) {
            self.fail_depth = depth;
            self.fail_index = index;
            self.fail_context = self.active_context.clone();
        }
    }

    fn solve(
        &mut self,
        goals: &[GoalEntry],
        binds: &Bindings,
        depth: usize,
        out: &mut Vec<Bindings>,
        stop_at: usize,
    ) -> Ctl {
        if self.check_budget(out.len()) {
            return Ctl::Oom;
        }

        let Some((entry, rest)) = goals.split_first() else {
            out.push(binds.clone());
            return if out.len() >= stop_at {
                Ctl::Halt
            } else {
                Ctl::More
            };
        };

        let goal = apply_bindings(self.store, binds, entry.term);
        assert!(
            self.store.is_var(goal).is_none(),
            "resolver invoked on an unbound variable goal"
        );

        let name = self.store.name_str(goal);
        let arity = self.store.arity(goal);
        if let Some(builtin) = builtin_of(&name, arity) {
            return self.builtin(builtin, *entry, goal, rest, binds, depth, out, stop_at);
        }
        self.user_goal(*entry, goal, rest, binds, depth, out, stop_at)
    }

    /// Resolve a goal against the user rule database: rename each candidate
    /// clause to a fresh scope, unify the head, and recurse on the body
    /// conjoined with the remaining goals.
    #[allow(clippy::too_many_arguments)]
    fn user_goal(
        &mut self,
        entry: GoalEntry,
        goal: TermId,
        rest: &[GoalEntry],
        binds: &Bindings,
        depth: usize,
        out: &mut Vec<Bindings>,
        stop_at: usize,
    ) -> Ctl {
        let rules = self.state.rules_for_term(self.store, goal);
        if rules.is_empty() {
            trace!(goal = %self.store.format(goal), "no rules for goal");
            self.record_failure(depth, entry.top_idx);
            return Ctl::More;
        }

        let frame = self.new_frame();
        let mut any_unified = false;
        for rule in rules {
            let scope = self.store.fresh_scope();
            let mut renames = FxHashMap::default();
            let head = rename_term(self.store, rule.head, scope, &mut renames);
            let Some(mgu) = unify(goal, head, self.store) else {
                continue;
            };
            any_unified = true;
            let new_binds = binds.compose(&mgu, self.store);

            let mut next: Vec<GoalEntry> = Vec::with_capacity(rule.tail.len() + rest.len());
            for &body_term in &rule.tail {
                next.push(GoalEntry {
                    term: rename_term(self.store, body_term, scope, &mut renames),
                    top_idx: entry.top_idx,
                    cut_level: frame,
                });
            }
            next.extend_from_slice(rest);

            match self.solve(&next, &new_binds, depth + 1, out, stop_at) {
                Ctl::More => {}
                Ctl::Cut(level) if level == frame => return Ctl::More,
                other => return other,
            }
        }

        if !any_unified {
            self.record_failure(depth, entry.top_idx);
        }
        Ctl::More
    }

    /// Run a sub-enumeration of `inner` as its own query: cuts inside are
    /// consumed at the enumeration boundary, solutions extend `base`.
    /// Returns None on out-of-memory.
    fn enumerate(
        &mut self,
        inner: &[TermId],
        base: &Bindings,
        depth: usize,
        top_idx: u32,
        stop_at: usize,
    ) -> Option<Vec<Bindings>> {
        let frame = self.new_frame();
        let entries: Vec<GoalEntry> = inner
            .iter()
            .map(|&t| GoalEntry {
                term: t,
                top_idx,
                cut_level: frame,
            })
            .collect();
        let mut solutions = Vec::new();
        match self.solve(&entries, base, depth + 1, &mut solutions, stop_at) {
            Ctl::Oom => None,
            _ => Some(solutions),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn builtin(
        &mut self,
        builtin: Builtin,
        entry: GoalEntry,
        goal: TermId,
        rest: &[GoalEntry],
        binds: &Bindings,
        depth: usize,
        out: &mut Vec<Bindings>,
        stop_at: usize,
    ) -> Ctl {
        let args = self.store.args(goal);
        match builtin {
            Builtin::True => self.solve(rest, binds, depth, out, stop_at),
            Builtin::False => {
                self.record_failure(depth, entry.top_idx);
                Ctl::More
            }
            Builtin::Unify => match unify(args[0], args[1], self.store) {
                Some(mgu) => {
                    let next = binds.compose(&mgu, self.store);
                    self.solve(rest, &next, depth, out, stop_at)
                }
                None => {
                    self.record_failure(depth, entry.top_idx);
                    Ctl::More
                }
            },
            Builtin::Identical => {
                if args[0] == args[1] {
                    self.solve(rest, binds, depth, out, stop_at)
                } else {
                    self.record_failure(depth, entry.top_idx);
                    Ctl::More
                }
            }
            Builtin::NotIdentical => {
                if args[0] != args[1] {
                    self.solve(rest, binds, depth, out, stop_at)
                } else {
                    self.record_failure(depth, entry.top_idx);
                    Ctl::More
                }
            }
            Builtin::Is => {
                let value = eval_strict(self.store, args[1]);
                match value.and_then(|v| unify(args[0], v, self.store)) {
                    Some(mgu) => {
                        let next = binds.compose(&mgu, self.store);
                        self.solve(rest, &next, depth, out, stop_at)
                    }
                    None => {
                        self.record_failure(depth, entry.top_idx);
                        Ctl::More
                    }
                }
            }
            Builtin::Compare => {
                let op = self.store.arith_op(goal).expect("comparison goal");
                let outcome = arith::eval_num(self.store, args[0])
                    .zip(arith::eval_num(self.store, args[1]))
                    .and_then(|(l, r)| arith::eval_compare(op, l, r));
                if outcome == Some(true) {
                    self.solve(rest, binds, depth, out, stop_at)
                } else {
                    self.record_failure(depth, entry.top_idx);
                    Ctl::More
                }
            }
            Builtin::Not => {
                let inner = flatten_conjunction(self.store, &args);
                match self.enumerate(&inner, binds, depth, entry.top_idx, 1) {
                    None => Ctl::Oom,
                    Some(solutions) if solutions.is_empty() => {
                        // Negation-as-failure: succeed, binding nothing
                        self.solve(rest, binds, depth, out, stop_at)
                    }
                    Some(_) => {
                        self.record_failure(depth, entry.top_idx);
                        Ctl::More
                    }
                }
            }
            Builtin::First => {
                let inner = flatten_conjunction(self.store, &args);
                match self.enumerate(&inner, binds, depth, entry.top_idx, 1) {
                    None => Ctl::Oom,
                    Some(solutions) => match solutions.into_iter().next() {
                        Some(first) => self.solve(rest, &first, depth, out, stop_at),
                        None => {
                            self.record_failure(depth, entry.top_idx);
                            Ctl::More
                        }
                    },
                }
            }
            Builtin::FindAll => {
                let template = args[0];
                let inner = flatten_conjunction(self.store, &args[1..2]);
                let Some(solutions) =
                    self.enumerate(&inner, binds, depth, entry.top_idx, usize::MAX)
                else {
                    return Ctl::Oom;
                };
                let instances: Vec<TermId> = solutions
                    .iter()
                    .map(|s| apply_bindings(self.store, s, template))
                    .collect();
                let list = self.store.make_list(&instances);
                match unify(args[2], list, self.store) {
                    Some(mgu) => {
                        let next = binds.compose(&mgu, self.store);
                        self.solve(rest, &next, depth, out, stop_at)
                    }
                    None => {
                        self.record_failure(depth, entry.top_idx);
                        Ctl::More
                    }
                }
            }
            Builtin::ForAll => {
                let cond = flatten_conjunction(self.store, &args[0..1]);
                let action = flatten_conjunction(self.store, &args[1..2]);
                let Some(cond_solutions) =
                    self.enumerate(&cond, binds, depth, entry.top_idx, usize::MAX)
                else {
                    return Ctl::Oom;
                };
                for solution in &cond_solutions {
                    match self.enumerate(&action, solution, depth, entry.top_idx, 1) {
                        None => return Ctl::Oom,
                        Some(found) if found.is_empty() => {
                            self.record_failure(depth, entry.top_idx);
                            return Ctl::More;
                        }
                        Some(_) => {}
                    }
                }
                // Vacuously true on an empty condition; binds nothing
                self.solve(rest, binds, depth, out, stop_at)
            }
            Builtin::Distinct => {
                let (key, inner) = if args.len() >= 2 {
                    (Some(args[0]), flatten_conjunction(self.store, &args[1..]))
                } else {
                    (None, flatten_conjunction(self.store, &args))
                };
                let Some(solutions) =
                    self.enumerate(&inner, binds, depth, entry.top_idx, usize::MAX)
                else {
                    return Ctl::Oom;
                };
                if solutions.is_empty() {
                    self.record_failure(depth, entry.top_idx);
                    return Ctl::More;
                }
                let mut inner_vars = Vec::new();
                for &g in &inner {
                    collect_vars(self.store, g, &mut inner_vars);
                }
                let mut seen: HashSet<Vec<TermId>> = HashSet::new();
                for solution in &solutions {
                    let dedupe_key: Vec<TermId> = match key {
                        Some(k) => vec![apply_bindings(self.store, solution, k)],
                        None => inner_vars
                            .iter()
                            .map(|&v| apply_bindings(self.store, solution, v))
                            .collect(),
                    };
                    if !seen.insert(dedupe_key) {
                        continue;
                    }
                    match self.solve(rest, solution, depth, out, stop_at) {
                        Ctl::More => {}
                        other => return other,
                    }
                }
                Ctl::More
            }
            Builtin::Count => {
                let inner = flatten_conjunction(self.store, &args[1..]);
                let Some(solutions) =
                    self.enumerate(&inner, binds, depth, entry.top_idx, usize::MAX)
                else {
                    return Ctl::Oom;
                };
                let count = self.store.int(solutions.len() as i64);
                match unify(args[0], count, self.store) {
                    Some(mgu) => {
                        let next = binds.compose(&mgu, self.store);
                        self.solve(rest, &next, depth, out, stop_at)
                    }
                    None => {
                        self.record_failure(depth, entry.top_idx);
                        Ctl::More
                    }
                }
            }
            Builtin::AggMin | Builtin::AggMax | Builtin::AggSum => {
                self.aggregate(builtin, entry, &args, rest, binds, depth, out, stop_at)
            }
            Builtin::SortBy => self.sort_by(entry, &args, rest, binds, depth, out, stop_at),
            Builtin::Atomic => {
                if self.store.const_kind(args[0]).is_some() {
                    self.solve(rest, binds, depth, out, stop_at)
                } else {
                    self.record_failure(depth, entry.top_idx);
                    Ctl::More
                }
            }
            Builtin::AtomConcat => {
                let (left, right) = (
                    self.store.const_kind(args[0]).map(|_| self.store.name_str(args[0])),
                    self.store.const_kind(args[1]).map(|_| self.store.name_str(args[1])),
                );
                match (left, right) {
                    (Some(a), Some(b)) => {
                        let joined = self.store.constant(&format!("{}{}", a, b));
                        match unify(args[2], joined, self.store) {
                            Some(mgu) => {
                                let next = binds.compose(&mgu, self.store);
                                self.solve(rest, &next, depth, out, stop_at)
                            }
                            None => {
                                self.record_failure(depth, entry.top_idx);
                                Ctl::More
                            }
                        }
                    }
                    // Reverse modes are not supported; fail softly
                    _ => {
                        self.record_failure(depth, entry.top_idx);
                        Ctl::More
                    }
                }
            }
            Builtin::AtomChars => {
                if self.store.const_kind(args[0]).is_some() {
                    let text = self.store.name_str(args[0]);
                    let chars: Vec<TermId> = text
                        .chars()
                        .map(|c| self.store.constant(&c.to_string()))
                        .collect();
                    let list = self.store.make_list(&chars);
                    match unify(args[1], list, self.store) {
                        Some(mgu) => {
                            let next = binds.compose(&mgu, self.store);
                            return self.solve(rest, &next, depth, out, stop_at);
                        }
                        None => {
                            self.record_failure(depth, entry.top_idx);
                            return Ctl::More;
                        }
                    }
                }
                // Reverse direction: list of single-character atoms -> atom
                let items = self.store.list_items(args[1]).filter(|items| {
                    items.iter().all(|&i| self.store.const_kind(i).is_some())
                });
                match items {
                    Some(items) => {
                        let joined: String =
                            items.iter().map(|&i| self.store.name_str(i)).collect();
                        let atom = self.store.constant(&joined);
                        match unify(args[0], atom, self.store) {
                            Some(mgu) => {
                                let next = binds.compose(&mgu, self.store);
                                self.solve(rest, &next, depth, out, stop_at)
                            }
                            None => {
                                self.record_failure(depth, entry.top_idx);
                                Ctl::More
                            }
                        }
                    }
                    None => {
                        self.record_failure(depth, entry.top_idx);
                        Ctl::More
                    }
                }
            }
            Builtin::DowncaseAtom => {
                if self.store.const_kind(args[0]).is_some() {
                    let lowered = self.store.name_str(args[0]).to_lowercase();
                    let atom = self.store.constant(&lowered);
                    match unify(args[1], atom, self.store) {
                        Some(mgu) => {
                            let next = binds.compose(&mgu, self.store);
                            return self.solve(rest, &next, depth, out, stop_at);
                        }
                        None => {
                            self.record_failure(depth, entry.top_idx);
                            return Ctl::More;
                        }
                    }
                }
                self.record_failure(depth, entry.top_idx);
                Ctl::More
            }
            Builtin::Write => {
                // write never resolves variables: print the raw goal's args
                let raw_args = self.store.args(entry.term);
                self.sink.emit(&join_terms(self.store, &raw_args));
                self.solve(rest, binds, depth, out, stop_at)
            }
            Builtin::WriteLn => {
                let raw_args = self.store.args(entry.term);
                self.sink
                    .emit(&format!("{}\n", join_terms(self.store, &raw_args)));
                self.solve(rest, binds, depth, out, stop_at)
            }
            Builtin::Nl => {
                self.sink.emit("\n");
                self.solve(rest, binds, depth, out, stop_at)
            }
            Builtin::Print => {
                self.sink.emit(&join_terms(self.store, &args));
                self.solve(rest, binds, depth, out, stop_at)
            }
            Builtin::AssertZ => {
                self.state.add_fact(args[0]);
                self.solve(rest, binds, depth, out, stop_at)
            }
            Builtin::AssertA => {
                self.state.add_fact_front(args[0]);
                self.solve(rest, binds, depth, out, stop_at)
            }
            Builtin::Retract => match self.state.remove_matching(self.store, args[0]) {
                Some(fact) => {
                    let mgu = unify(args[0], fact, self.store)
                        .expect("retracted fact matched the pattern");
                    let next = binds.compose(&mgu, self.store);
                    self.solve(rest, &next, depth, out, stop_at)
                }
                None => {
                    self.record_failure(depth, entry.top_idx);
                    Ctl::More
                }
            },
            Builtin::RetractAll => {
                self.state.remove_all_matching(self.store, args[0]);
                self.solve(rest, binds, depth, out, stop_at)
            }
            Builtin::Cut => match self.solve(rest, binds, depth, out, stop_at) {
                Ctl::More => Ctl::Cut(entry.cut_level),
                other => other,
            },
            Builtin::FailureContext => {
                self.active_context = args.to_vec();
                self.solve(rest, binds, depth, out, stop_at)
            }
        }
    }

    /// `min/max/sum(Result, Var, Goal...)`: aggregate Var over every
    /// solution of the conjunction. Fails on zero solutions or when Var is
    /// not numeric in some solution; binds only Result.
    #[allow(clippy::too_many_arguments)]
    fn aggregate(
        &mut self,
        which: Builtin,
        entry: GoalEntry,
        args: &[TermId],
        rest: &[GoalEntry],
        binds: &Bindings,
        depth: usize,
        out: &mut Vec<Bindings>,
        stop_at: usize,
    ) -> Ctl {
        let result = args[0];
        let var = args[1];
        let inner = flatten_conjunction(self.store, &args[2..]);
        let Some(solutions) = self.enumerate(&inner, binds, depth, entry.top_idx, usize::MAX)
        else {
            return Ctl::Oom;
        };
        if solutions.is_empty() {
            self.record_failure(depth, entry.top_idx);
            return Ctl::More;
        }

        let mut values = Vec::with_capacity(solutions.len());
        for solution in &solutions {
            let resolved = apply_bindings(self.store, solution, var);
            match self.store.const_kind(resolved).and_then(|k| k.as_f64().map(|_| k)) {
                Some(kind) => values.push(match kind {
                    crate::term::ConstKind::Int(i) => Num::Int(i),
                    crate::term::ConstKind::Float(bits) => Num::Float(f64::from_bits(bits)),
                    crate::term::ConstKind::Atom => unreachable!(),
                }),
                None => {
                    self.record_failure(depth, entry.top_idx);
                    return Ctl::More;
                }
            }
        }

        let total = match which {
            Builtin::AggMin => values
                .iter()
                .copied()
                .reduce(|a, b| if b.as_f64() < a.as_f64() { b } else { a }),
            Builtin::AggMax => values
                .iter()
                .copied()
                .reduce(|a, b| if b.as_f64() > a.as_f64() { b } else { a }),
            Builtin::AggSum => values.iter().copied().reduce(|a, b| match (a, b) {
                (Num::Int(x), Num::Int(y)) => Num::Int(x + y),
                (x, y) => Num::Float(x.as_f64() + y.as_f64()),
            }),
            _ => unreachable!(),
        }
        .expect("non-empty values");

        let value_term = match total {
            Num::Int(i) => self.store.int(i),
            Num::Float(f) => self.store.float(f),
        };
        match unify(result, value_term, self.store) {
            Some(mgu) => {
                let next = binds.compose(&mgu, self.store);
                self.solve(rest, &next, depth, out, stop_at)
            }
            None => {
                self.record_failure(depth, entry.top_idx);
                Ctl::More
            }
        }
    }

    /// `sortBy(Key, <(Goal...))` / `sortBy(Key, >(Goal...))`: enumerate the
    /// conjunction, then yield its solutions ordered by Key.
    #[allow(clippy::too_many_arguments)]
    fn sort_by(
        &mut self,
        entry: GoalEntry,
        args: &[TermId],
        rest: &[GoalEntry],
        binds: &Bindings,
        depth: usize,
        out: &mut Vec<Bindings>,
        stop_at: usize,
    ) -> Ctl {
        let key = args[0];
        let descending = match self.store.name_str(args[1]).as_str() {
            "<" => false,
            ">" => true,
            _ => {
                self.record_failure(depth, entry.top_idx);
                return Ctl::More;
            }
        };
        let goal_args = self.store.args(args[1]);
        let inner = flatten_conjunction(self.store, &goal_args);
        let Some(solutions) = self.enumerate(&inner, binds, depth, entry.top_idx, usize::MAX)
        else {
            return Ctl::Oom;
        };
        if solutions.is_empty() {
            self.record_failure(depth, entry.top_idx);
            return Ctl::More;
        }

        let mut keyed: Vec<(SortKey, Bindings)> = solutions
            .into_iter()
            .map(|s| {
                let value = apply_bindings(self.store, &s, key);
                (sort_key(self.store, value), s)
            })
            .collect();
        keyed.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        if descending {
            keyed.reverse();
        }

        for (_, solution) in &keyed {
            match self.solve(rest, solution, depth, out, stop_at) {
                Ctl::More => {}
                other => return other,
            }
        }
        Ctl::More
    }
}

/// Sort key for sortBy: numbers before atoms, numbers numerically, atoms
/// lexically.
#[derive(Debug, PartialEq, PartialOrd)]
enum SortKey {
    Number(f64),
    Text(String),
}

fn sort_key(store: &TermStore, term: TermId) -> SortKey {
    match store.const_kind(term).and_then(|k| k.as_f64()) {
        Some(n) => SortKey::Number(n),
        None => SortKey::Text(store.format(term)),
    }
}

/// `is/2` evaluation: arithmetic compounds and numeric constants only.
/// Unbound variables and non-arithmetic atoms fail.
fn eval_strict(store: &TermStore, term: TermId) -> Option<TermId> {
    if store.arith_op(term).is_some() {
        return arith::eval(store, term);
    }
    match store.const_kind(term) {
        Some(kind) if kind.is_numeric() => Some(term),
        _ => None,
    }
}

/// Flatten `,`-compounds so a goal argument written as `(A, B)` becomes the
/// conjunction it denotes.
fn flatten_conjunction(store: &TermStore, terms: &[TermId]) -> Vec<TermId> {
    fn push(store: &TermStore, term: TermId, out: &mut Vec<TermId>) {
        if let Term::App(name, args) = store.resolve(term) {
            if store.symbols().resolve(name) == Some(",") && args.len() == 2 {
                push(store, args[0], out);
                push(store, args[1], out);
                return;
            }
        }
        out.push(term);
    }
    let mut out = Vec::new();
    for &t in terms {
        push(store, t, &mut out);
    }
    out
}

fn join_terms(store: &TermStore, terms: &[TermId]) -> String {
    terms
        .iter()
        .map(|&t| store.format(t))
        .collect::<Vec<_>>()
        .join(", ")
}

fn rename_term(
    store: &TermStore,
    term: TermId,
    scope: u64,
    renames: &mut FxHashMap<NameId, TermId>,
) -> TermId {
    match store.resolve(term) {
        Term::Var(name) => *renames.entry(name).or_insert_with(|| {
            let original = store.symbols().resolve(name).unwrap_or("").to_string();
            store.var(&format!("{}~{}", original, scope))
        }),
        Term::Const(_, _) => term,
        Term::App(name, args) => {
            if store.is_ground(term) {
                return term;
            }
            let renamed: smallvec::SmallVec<[TermId; 4]> = args
                .iter()
                .map(|&a| rename_term(store, a, scope, renames))
                .collect();
            store.app_id(name, renamed)
        }
    }
}

#[cfg(test)]
#[path = "tests/resolver.rs"]
mod tests;
