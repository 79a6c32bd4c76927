//! The HTN planner: an iterative, explicit-stack, depth-first task
//! decomposer.
//!
//! Every [`PlanNode`] resolves exactly one task; children are created by
//! pushing a new node, and a per-node continuation tag directs execution
//! when a child returns. No host-language recursion is used for the search
//! itself, so plans may recurse arbitrarily deep bounded only by the memory
//! budget.

use crate::arith;
use crate::domain::{Domain, MethodType};
use crate::metrics::MemoryTracker;
use crate::resolver::Resolver;
use crate::rules::RuleSet;
use crate::subst::{apply_bindings, Bindings};
use crate::term::{TermId, TermStore};
use crate::trace::{debug, trace};
use crate::tree::{term_to_json, tree_to_json, DecompTreeNode, TreeBuilder};
use crate::unify::unify;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A rule-set snapshot handle. Operator application mutates the node's
/// state in place and shares the handle with the pushed child; method and
/// try() children get an independent copy-on-write snapshot.
pub type StateHandle = Arc<RwLock<RuleSet>>;

/// Where a node resumes when the scheduler visits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContinuePoint {
    /// Terminal; never a legitimate continuation to execute.
    Fail,
    NextTask,
    ReturnFromCheckForOperator,
    NextMethodThatApplies,
    NextNormalMethodCondition,
    OutOfMemory,
    ReturnFromNextNormalMethodCondition,
    ReturnFromHandleTryTerm,
    ReturnFromSetOfConditions,
    Abort,
}

/// The planner's per-stack-frame record.
struct PlanNode {
    node_id: u32,
    state: StateHandle,
    tasks: VecDeque<TermId>,
    task: Option<TermId>,
    /// Accumulated (hidden-filtered, substituted) operator heads.
    operators: Vec<TermId>,
    /// Candidate (method id, head unifier) pairs still to try.
    unified_methods: VecDeque<(u32, Bindings)>,
    method: Option<(u32, Bindings)>,
    condition_resolutions: Option<Vec<Bindings>>,
    condition_index: isize,
    continue_point: ContinuePoint,
    method_had_solution: bool,
    at_least_one_method_had_solution: bool,
    retry: bool,
    try_any_of_success_count: u32,
    total_memory_at_push: i64,
    /// Sibling scopes for tree parenting: (scope owner node id, remaining
    /// sibling slots).
    sibling_stack: Vec<(u32, u32)>,
}

impl PlanNode {
    fn new(
        node_id: u32,
        state: StateHandle,
        tasks: VecDeque<TermId>,
        operators: Vec<TermId>,
        sibling_stack: Vec<(u32, u32)>,
    ) -> Self {
        Self {
            node_id,
            state,
            tasks,
            task: None,
            operators,
            unified_methods: VecDeque::new(),
            method: None,
            condition_resolutions: None,
            condition_index: -1,
            continue_point: ContinuePoint::NextTask,
            method_had_solution: false,
            at_least_one_method_had_solution: false,
            retry: false,
            try_any_of_success_count: 0,
            total_memory_at_push: 0,
            sibling_stack,
        }
    }

    fn pop_sibling_scope_if_matches(&mut self, scope_node_id: u32) {
        if self
            .sibling_stack
            .last()
            .is_some_and(|(owner, _)| *owner == scope_node_id)
        {
            self.sibling_stack.pop();
        }
    }

    fn scope_owner(&self) -> Option<u32> {
        self.sibling_stack.last().map(|(owner, _)| *owner)
    }

    /// Approximate bytes attributable to this node. Relatively expensive.
    fn dynamic_size(&self) -> i64 {
        let bindings_size = |b: &Bindings| (b.len() * 2 * std::mem::size_of::<TermId>()) as i64;
        let conditions: i64 = self
            .condition_resolutions
            .as_ref()
            .map(|list| list.iter().map(bindings_size).sum())
            .unwrap_or(0);
        let methods: i64 = self
            .unified_methods
            .iter()
            .map(|(_, b)| bindings_size(b) + 8)
            .sum();
        std::mem::size_of::<PlanNode>() as i64
            + conditions
            + methods
            + self.method.as_ref().map(|(_, b)| bindings_size(b)).unwrap_or(0)
            + (self.operators.len() * std::mem::size_of::<TermId>()) as i64
            + (self.tasks.len() * std::mem::size_of::<TermId>()) as i64
            + (self.sibling_stack.len() * 8) as i64
            + self.state.read().exclusive_size()
    }
}

/// The global search context for one planning problem. Create once, then
/// call [`Planner::find_next_plan`] repeatedly for more solutions.
pub struct PlanState {
    store: Arc<TermStore>,
    stack: Vec<PlanNode>,
    next_node_id: u32,
    return_value: bool,
    memory: MemoryTracker,
    deepest_task_failure: i32,
    furthest_criteria_failure: i32,
    furthest_failure_context: Vec<TermId>,
    start_time: Instant,
    current_solution_id: i32,
    tree: TreeBuilder,
    initial_state: StateHandle,
}

impl PlanState {
    pub fn new(
        store: Arc<TermStore>,
        initial_state: RuleSet,
        goals: &[TermId],
        memory_budget: i64,
    ) -> Self {
        let handle: StateHandle = Arc::new(RwLock::new(initial_state));
        let first_goal = goals
            .first()
            .map(|&g| store.format(g))
            .unwrap_or_default();
        let root = PlanNode::new(
            0,
            Arc::clone(&handle),
            goals.iter().copied().collect(),
            Vec::new(),
            Vec::new(),
        );
        Self {
            store,
            stack: vec![root],
            next_node_id: 1,
            return_value: false,
            memory: MemoryTracker::new(memory_budget),
            deepest_task_failure: -1,
            furthest_criteria_failure: -1,
            furthest_failure_context: Vec::new(),
            start_time: Instant::now(),
            current_solution_id: 0,
            tree: TreeBuilder::new(0, first_goal),
            initial_state: handle,
        }
    }

    /// Approximate bytes in use by the whole search. Samples the high-water
    /// mark as a side effect.
    fn dynamic_size(&mut self) -> i64 {
        let stack_size: i64 = self.stack.iter().map(|n| n.dynamic_size()).sum();
        let current = std::mem::size_of::<PlanState>() as i64
            + self.initial_state.read().shared_size()
            + self.store.dynamic_size()
            + (self.furthest_failure_context.len() * std::mem::size_of::<TermId>()) as i64
            + self.tree.dynamic_size()
            + stack_size;
        assert!(current >= 0, "dynamic size went negative");
        self.memory.sample(current);
        current
    }

    /// Keep the deepest (then furthest-in-condition) failure for
    /// diagnostics.
    fn record_failure(&mut self, furthest_criteria_failure: i32, context: Vec<TermId>) {
        let depth = self.stack.len() as i32;
        if (depth == self.deepest_task_failure
            && furthest_criteria_failure > self.furthest_criteria_failure)
            || depth > self.deepest_task_failure
        {
            self.deepest_task_failure = depth;
            self.furthest_criteria_failure = furthest_criteria_failure;
            self.furthest_failure_context = context;
        }
    }

    fn node_index_with_id(&self, id: u32) -> usize {
        self.stack
            .iter()
            .position(|n| n.node_id == id)
            .expect("node id not on the stack")
    }

    pub fn highest_memory(&self) -> i64 {
        self.memory.highest()
    }

    pub fn deepest_failure(&self) -> (i32, &[TermId]) {
        (self.deepest_task_failure, &self.furthest_failure_context)
    }

    /// The full decomposition tree built so far (all solutions and failed
    /// branches).
    pub fn decomposition_tree(&self) -> &[DecompTreeNode] {
        self.tree.nodes()
    }
}

/// One plan: the operator sequence, the state it induces, and how the
/// search found it.
pub struct Solution {
    /// Ground operator heads in execution order, hidden operators filtered.
    pub operators: Vec<TermId>,
    /// The world state after applying the plan.
    pub final_state: StateHandle,
    pub elapsed_seconds: f64,
    pub highest_memory: i64,
    /// The decomposition-tree slice for this solution.
    pub tree: Vec<DecompTreeNode>,
}

impl Solution {
    /// `(op1, op2, ...)`, the format the embedding API documents.
    pub fn plan_to_string(&self, store: &TermStore) -> String {
        store.format_terms(&self.operators)
    }

    /// JSON array of operator-head strings.
    pub fn plan_to_json(&self, store: &TermStore) -> String {
        let heads: Vec<String> = self.operators.iter().map(|&op| store.format(op)).collect();
        serde_json::to_string(&heads).expect("plan strings serialize")
    }

    pub fn tree_to_json(&self) -> String {
        tree_to_json(&self.tree)
    }
}

/// `[ { (a, b) } { (c) } ]` over all solutions, `null` when there are none.
pub fn format_solutions(store: &TermStore, solutions: Option<&[Solution]>) -> String {
    match solutions {
        None => "null".to_string(),
        Some(list) => {
            let mut out = String::from("[ ");
            for solution in list {
                out.push_str("{ ");
                out.push_str(&solution.plan_to_string(store));
                out.push_str(" } ");
            }
            out.push(']');
            out
        }
    }
}

/// Diagnostics from a full `find_all_plans` run.
pub struct PlanDiagnostics {
    pub highest_memory: i64,
    /// Stack depth of the deepest failure (-1 when a plan was found or
    /// nothing failed).
    pub furthest_failure_index: i32,
    /// `failureContext` terms active at that failure.
    pub failure_context: Vec<TermId>,
}

/// The planner: a domain catalog plus the goal resolver, with an abort flag
/// that may be set from another thread.
pub struct Planner {
    domain: Domain,
    resolver: Resolver,
    abort: Arc<AtomicBool>,
}

impl Planner {
    pub fn new() -> Self {
        Self {
            domain: Domain::new(),
            resolver: Resolver::new(),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_resolver(resolver: Resolver) -> Self {
        Self {
            domain: Domain::new(),
            resolver,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn domain_mut(&mut self) -> &mut Domain {
        &mut self.domain
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Request a clean partial return; checked once per dispatch iteration.
    /// Safe to call from another thread.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    pub fn reset_abort(&self) {
        self.abort.store(false, Ordering::Relaxed);
    }

    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Find the first plan, or None. Check the factory's out-of-memory flag
    /// afterwards: a partial plan may be returned when the budget blows.
    pub fn find_plan(
        &self,
        store: &Arc<TermStore>,
        initial_state: RuleSet,
        goals: &[TermId],
        memory_budget: i64,
    ) -> Option<Solution> {
        let mut plan_state =
            PlanState::new(Arc::clone(store), initial_state, goals, memory_budget);
        self.find_next_plan(&mut plan_state)
    }

    /// Find every plan. Returns None when there is no solution; on an
    /// out-of-memory break the plans found so far are returned and the
    /// factory's flag is set.
    pub fn find_all_plans(
        &self,
        store: &Arc<TermStore>,
        initial_state: RuleSet,
        goals: &[TermId],
        memory_budget: i64,
    ) -> (Option<Vec<Solution>>, PlanDiagnostics) {
        let mut plan_state =
            PlanState::new(Arc::clone(store), initial_state, goals, memory_budget);
        let mut solutions = Vec::new();
        while let Some(solution) = self.find_next_plan(&mut plan_state) {
            solutions.push(solution);
            if store.out_of_memory() || self.abort.load(Ordering::Relaxed) {
                // The caller decides whether to keep the partial result
                break;
            }
        }
        let diagnostics = PlanDiagnostics {
            highest_memory: plan_state.memory.highest(),
            furthest_failure_index: if solutions.is_empty() {
                plan_state.deepest_task_failure
            } else {
                -1
            },
            failure_context: plan_state.furthest_failure_context.clone(),
        };
        (
            if solutions.is_empty() {
                None
            } else {
                Some(solutions)
            },
            diagnostics,
        )
    }

    /// Resume the search and return the next solution, or None when the
    /// space is exhausted. The plan state is left ready for another call.
    pub fn find_next_plan(&self, ps: &mut PlanState) -> Option<Solution> {
        ps.start_time = Instant::now();
        while !ps.stack.is_empty() {
            let top = ps.stack.len() - 1;
            let mut continue_point = ps.stack[top].continue_point;
            if self.abort.load(Ordering::Relaxed) {
                continue_point = ContinuePoint::Abort;
            }

            match continue_point {
                ContinuePoint::Fail => {
                    unreachable!("Fail is never a legitimate continuation")
                }
                ContinuePoint::Abort => {
                    trace!("aborted; returning partial solution");
                    // The tree may not be consistent; refuse to continue
                    ps.stack[top].continue_point = ContinuePoint::Fail;
                    let solution = self.make_solution(ps, top);
                    return Some(solution);
                }
                ContinuePoint::OutOfMemory => {
                    trace!(budget = ps.memory.budget(), "out of memory");
                    ps.store.set_out_of_memory(true);
                    ps.stack[top].continue_point = ContinuePoint::Fail;
                    let solution = self.make_solution(ps, top);
                    return Some(solution);
                }
                ContinuePoint::NextTask => {
                    if let Some(solution) = self.next_task(ps) {
                        return Some(solution);
                    }
                }
                ContinuePoint::NextMethodThatApplies => self.next_method(ps),
                ContinuePoint::NextNormalMethodCondition => self.next_condition(ps),
                ContinuePoint::ReturnFromNextNormalMethodCondition => {
                    if ps.return_value {
                        ps.stack[top].method_had_solution = true;
                    }
                    ps.stack[top].continue_point = ContinuePoint::NextNormalMethodCondition;
                }
                ContinuePoint::ReturnFromCheckForOperator => {
                    // Operators have no alternatives: propagate the child's
                    // verdict
                    let value = ps.return_value;
                    self.pop(ps, value);
                }
                ContinuePoint::ReturnFromHandleTryTerm => self.return_from_try(ps),
                ContinuePoint::ReturnFromSetOfConditions => {
                    if ps.return_value {
                        ps.stack[top].method_had_solution = true;
                    }
                    ps.stack[top].continue_point = ContinuePoint::NextMethodThatApplies;
                }
            }
        }
        None
    }

    /// Take the next task off the top node's queue and dispatch it.
    /// Returns a solution when the queue is empty (a leaf).
    fn next_task(&self, ps: &mut PlanState) -> Option<Solution> {
        let top = ps.stack.len() - 1;
        let taken = ps.stack[top].tasks.pop_front();

        let Some(raw_task) = taken else {
            // No tasks remain: leaf, and a solution
            let leaf_id = ps.stack[top].node_id;
            trace!(node_id = leaf_id, "leaf reached; solution found");
            let stack_ids: Vec<u32> = ps.stack.iter().map(|n| n.node_id).collect();
            ps.tree
                .path_succeeded(leaf_id, &stack_ids, ps.current_solution_id);
            ps.current_solution_id += 1;
            let solution = self.make_solution(ps, top);
            self.pop(ps, true);
            return Some(solution);
        };

        // Evaluate arithmetic subterms before dispatch
        let task = arith::resolve_arithmetic(&ps.store, raw_task);
        ps.stack[top].task = Some(task);

        // Tree entry at resolution time, when the sibling scope is settled
        let node_id = ps.stack[top].node_id;
        let scope_owner = ps.stack[top].scope_owner().or_else(|| {
            (ps.stack.len() > 1).then(|| ps.stack[ps.stack.len() - 2].node_id)
        });
        let task_name = ps.store.name_str(task);
        if is_bookkeeping_task(&task_name) {
            ps.tree.note_bookkeeping_task(node_id, scope_owner);
        } else {
            ps.tree
                .task_resolved(node_id, ps.store.format(task), scope_owner);
        }

        trace!(node_id, task = %ps.store.format(task), "solve");

        if self.check_for_operator(ps, task) {
            return None;
        }
        if self.check_for_special_task(ps, task, &task_name) {
            return None;
        }

        // Compound task: gather candidate methods in document order
        let name = ps.store.name_id(task);
        let arity = ps.store.arity(task) as u32;
        let mut unified: VecDeque<(u32, Bindings)> = VecDeque::new();
        for &method_id in self.domain.methods_for(name, arity) {
            let method = self.domain.method(method_id);
            if let Some(mgu) = unify(method.head, task, &ps.store) {
                unified.push_back((method_id, mgu));
            }
        }

        let top = ps.stack.len() - 1;
        if unified.is_empty() {
            trace!(node_id, task = %ps.store.format(task), "no methods unify");
            self.pop(ps, false);
        } else {
            ps.stack[top].unified_methods = unified;
            ps.stack[top].continue_point = ContinuePoint::NextMethodThatApplies;
        }
        None
    }

    /// If the task names an operator, apply it (or fail the node when the
    /// unification is not ground). Returns true when the task was handled.
    fn check_for_operator(&self, ps: &mut PlanState, task: TermId) -> bool {
        let Some(op) = self.domain.operator(ps.store.name_id(task)) else {
            return false;
        };
        let top = ps.stack.len() - 1;
        let node_id = ps.stack[top].node_id;

        let mgu = unify(task, op.head, &ps.store).filter(|m| m.is_ground(&ps.store));
        let Some(mgu) = mgu else {
            // Operators require grounding; this is a node failure
            let reason = format!(
                "Operator did not unify: {} with {}",
                op.signature(&ps.store),
                ps.store.format(task)
            );
            debug!(node_id, %reason, "operator failure");
            ps.tree.node_failed(node_id, reason, -1, None);
            self.pop(ps, false);
            return true;
        };

        let substituted = apply_bindings(&ps.store, &mgu, op.head);
        let deletions: Vec<TermId> = op
            .deletions
            .iter()
            .map(|&d| apply_bindings(&ps.store, &mgu, d))
            .collect();
        let additions: Vec<TermId> = op
            .additions
            .iter()
            .map(|&a| apply_bindings(&ps.store, &mgu, a))
            .collect();

        // No alternatives to backtrack over: update the state in place
        ps.stack[top]
            .state
            .write()
            .update(&ps.store, &deletions, &additions);
        if !op.hidden {
            ps.stack[top].operators.push(substituted);
        }
        let signature = op.signature(&ps.store);
        let pairs = unifier_pairs(&ps.store, &mgu);
        ps.tree.operator_applied(node_id, signature, pairs);

        trace!(node_id, operator = %ps.store.format(substituted), "operator applied");
        self.push_plain(ps, ContinuePoint::ReturnFromCheckForOperator);
        true
    }

    /// Reserved task handling. Returns true when the task was handled.
    fn check_for_special_task(&self, ps: &mut PlanState, task: TermId, name: &str) -> bool {
        let top = ps.stack.len() - 1;
        match name {
            "try" => {
                // try() is a node with two alternatives: run the subtasks,
                // or skip them. tryEnd(id) clears the retry bit so failure
                // after the block is not retried.
                let node_id = ps.stack[top].node_id;
                let mut tasks: Vec<TermId> = ps.store.args(task).into_vec();
                tasks.push(ps.store.app("tryEnd", [ps.store.int(node_id as i64)]));
                self.push_backtrackable(ps, tasks, ContinuePoint::ReturnFromHandleTryTerm);
                let top = ps.stack.len() - 2;
                ps.stack[top].retry = true;
                true
            }
            "tryEnd" => {
                // Made it through the try() block: tell it not to retry
                let try_node_id = task_arg_id(&ps.store, task);
                let index = ps.node_index_with_id(try_node_id);
                ps.stack[index].retry = false;
                // The try() subtask scope is exhausted
                ps.stack[top].pop_sibling_scope_if_matches(try_node_id);
                ps.stack[top].continue_point = ContinuePoint::NextTask;
                true
            }
            "methodScopeEnd" => {
                // All subtasks of the method are done; outer-scope tasks
                // must parent to the outer scope
                let scope_node_id = task_arg_id(&ps.store, task);
                ps.stack[top].pop_sibling_scope_if_matches(scope_node_id);
                ps.stack[top].continue_point = ContinuePoint::NextTask;
                true
            }
            "countAnyOf" => {
                let any_of_id = task_arg_id(&ps.store, task);
                let index = ps.node_index_with_id(any_of_id);
                ps.stack[index].try_any_of_success_count += 1;
                ps.stack[top].continue_point = ContinuePoint::NextTask;
                true
            }
            "failIfNoneOf" => {
                let any_of_id = task_arg_id(&ps.store, task);
                let index = ps.node_index_with_id(any_of_id);
                if ps.stack[index].try_any_of_success_count == 0 {
                    trace!("anyOf had zero solutions");
                    self.pop(ps, false);
                } else {
                    ps.stack[top].continue_point = ContinuePoint::NextTask;
                }
                true
            }
            "parallel" => {
                // Expand in place; the markers carry no semantics here and
                // are extracted by an external post-processor
                let scope_id = ps.stack[top].node_id as i64;
                let mut expanded: VecDeque<TermId> = VecDeque::new();
                expanded.push_back(ps.store.app("beginParallel", [ps.store.int(scope_id)]));
                for arg in ps.store.args(task) {
                    expanded.push_back(arg);
                }
                expanded.push_back(ps.store.app("endParallel", [ps.store.int(scope_id)]));
                expanded.extend(ps.stack[top].tasks.iter().copied());
                ps.stack[top].tasks = expanded;
                ps.stack[top].continue_point = ContinuePoint::NextTask;
                true
            }
            "beginParallel" | "endParallel" => {
                ps.stack[top].operators.push(task);
                ps.stack[top].continue_point = ContinuePoint::NextTask;
                true
            }
            _ => false,
        }
    }

    /// Iterate to the next candidate method for the current task, skipping
    /// contiguous `else` methods after a solution, and evaluate its
    /// condition.
    fn next_method(&self, ps: &mut PlanState) {
        let top = ps.stack.len() - 1;

        // Reset per-method state and take the next candidate
        {
            let node = &mut ps.stack[top];
            node.condition_index = -1;
            node.condition_resolutions = None;
            node.method = node.unified_methods.pop_front();
        }

        if ps.stack[top].method_had_solution {
            ps.stack[top].at_least_one_method_had_solution = true;
            // Skip consecutive else methods; they only run when the group
            // before them had no solution
            loop {
                let is_default = match &ps.stack[top].method {
                    Some((method_id, _)) => self.domain.method(*method_id).is_default,
                    None => break,
                };
                if !is_default {
                    break;
                }
                trace!("skipping else method");
                ps.stack[top].method = ps.stack[top].unified_methods.pop_front();
            }
            // Reset so if()/else chains can interleave
            ps.stack[top].method_had_solution = false;
        }

        let Some((method_id, head_unifier)) = ps.stack[top].method.clone() else {
            let value = ps.stack[top].at_least_one_method_had_solution;
            self.pop(ps, value);
            return;
        };

        let node_id = ps.stack[top].node_id;
        let method = self.domain.method(method_id);
        trace!(node_id, method = %method.signature(&ps.store), "try method");
        ps.tree.method_chosen(
            node_id,
            method.signature(&ps.store),
            method.document_order as i32,
            method
                .condition
                .iter()
                .map(|&t| term_to_json(&ps.store, t))
                .collect(),
            unifier_pairs(&ps.store, &head_unifier),
        );

        if method.condition.is_empty() {
            // Empty condition: a single solution with the empty unifier
            ps.stack[top].condition_resolutions = Some(vec![Bindings::new()]);
        } else {
            let substituted: Vec<TermId> = method
                .condition
                .iter()
                .map(|&c| apply_bindings(&ps.store, &head_unifier, c))
                .collect();

            let current_memory = ps.dynamic_size();
            let remaining = ps.memory.remaining(current_memory);
            let state = Arc::clone(&ps.stack[top].state);
            let result = self.resolver.resolve_all(
                &ps.store,
                &mut state.write(),
                &substituted,
                ps.stack.len() + 1,
                remaining,
            );
            ps.memory.sample(current_memory + result.memory_used);
            if ps.store.out_of_memory() {
                ps.stack[top].continue_point = ContinuePoint::OutOfMemory;
                return;
            }

            match result.solutions {
                None => {
                    // Condition not met: record the failure and move on
                    let failed_term = usize::try_from(result.furthest_failure_index)
                        .ok()
                        .and_then(|i| substituted.get(i))
                        .map(|&t| term_to_json(&ps.store, t));
                    let reason = format!(
                        "Condition failed: {}",
                        ps.store.format_terms(&substituted)
                    );
                    debug!(node_id, %reason, "method condition failed");
                    ps.tree.node_failed(
                        node_id,
                        reason,
                        result.furthest_failure_index,
                        failed_term,
                    );
                    ps.record_failure(result.furthest_failure_index, result.failure_context);
                    ps.stack[top].continue_point = ContinuePoint::NextMethodThatApplies;
                    return;
                }
                Some(solutions) => {
                    ps.stack[top].condition_resolutions = Some(solutions);
                }
            }
        }

        match method.method_type {
            MethodType::Normal => {
                ps.stack[top].continue_point = ContinuePoint::NextNormalMethodCondition;
            }
            MethodType::AllSetOf => self.handle_all_of(ps),
            MethodType::AnySetOf => self.handle_any_of(ps),
        }
    }

    /// Push one backtrackable child per condition resolution, in order.
    fn next_condition(&self, ps: &mut PlanState) {
        let top = ps.stack.len() - 1;
        ps.stack[top].condition_index += 1;
        let index = ps.stack[top].condition_index as usize;

        let condition = ps.stack[top]
            .condition_resolutions
            .as_ref()
            .and_then(|list| list.get(index))
            .cloned();
        let Some(condition) = condition else {
            // Conditions exhausted: try the next method
            ps.stack[top].continue_point = ContinuePoint::NextMethodThatApplies;
            return;
        };

        let node_id = ps.stack[top].node_id;
        ps.tree
            .condition_chosen(node_id, unifier_pairs(&ps.store, &condition));

        let subtasks = self.bound_subtasks(ps, top, &condition);
        self.push_backtrackable(
            ps,
            subtasks,
            ContinuePoint::ReturnFromNextNormalMethodCondition,
        );
    }

    /// The method's subtasks with the head unifier applied, then the given
    /// condition unifier.
    fn bound_subtasks(&self, ps: &PlanState, top: usize, condition: &Bindings) -> Vec<TermId> {
        let (method_id, head_unifier) = ps.stack[top]
            .method
            .clone()
            .expect("a method is selected");
        let method = self.domain.method(method_id);
        method
            .subtasks
            .iter()
            .map(|&t| {
                let head_bound = apply_bindings(&ps.store, &head_unifier, t);
                apply_bindings(&ps.store, condition, head_bound)
            })
            .collect()
    }

    /// AllSetOf: concatenate the fully-substituted subtasks of every
    /// condition resolution into one list; all must succeed or the whole
    /// group backtracks.
    fn handle_all_of(&self, ps: &mut PlanState) {
        let top = ps.stack.len() - 1;
        let conditions = ps.stack[top]
            .condition_resolutions
            .clone()
            .expect("conditions resolved");
        let mut combined = Vec::new();
        for condition in &conditions {
            combined.extend(self.bound_subtasks(ps, top, condition));
        }
        trace!(tasks = combined.len(), "allOf: merged condition instances");
        self.push_backtrackable(ps, combined, ContinuePoint::ReturnFromSetOfConditions);
    }

    /// AnySetOf: wrap each condition instance's subtasks in try() with a
    /// countAnyOf marker, then failIfNoneOf fails the group iff no instance
    /// survived.
    fn handle_any_of(&self, ps: &mut PlanState) {
        let top = ps.stack.len() - 1;
        let conditions = ps.stack[top]
            .condition_resolutions
            .clone()
            .expect("conditions resolved");
        // The child created below gets this id; its counter (zeroed at
        // construction) tracks how many instances survived
        let any_of_id = ps.next_node_id as i64;
        let mut combined = Vec::new();
        for condition in &conditions {
            let mut group = self.bound_subtasks(ps, top, condition);
            group.push(ps.store.app("countAnyOf", [ps.store.int(any_of_id)]));
            combined.push(ps.store.app("try", group));
        }
        combined.push(ps.store.app("failIfNoneOf", [ps.store.int(any_of_id)]));
        trace!(groups = conditions.len(), "anyOf: merged condition instances");
        self.push_backtrackable(ps, combined, ContinuePoint::ReturnFromSetOfConditions);
    }

    /// A try() child returned. If nothing got past the block, skip it and
    /// continue with the remaining tasks; otherwise propagate the verdict.
    fn return_from_try(&self, ps: &mut PlanState) {
        let top = ps.stack.len() - 1;
        if !ps.return_value && ps.stack[top].retry {
            trace!("try block failed; skipping it");
            let node_id = ps.stack[top].node_id;
            ps.stack[top].pop_sibling_scope_if_matches(node_id);
            ps.stack[top].continue_point = ContinuePoint::NextTask;
        } else {
            let value = ps.return_value;
            self.pop(ps, value);
        }
    }

    /// Push a child sharing this node's state and remaining tasks (operator
    /// continuation).
    fn push_plain(&self, ps: &mut PlanState, return_point: ContinuePoint) {
        let top = ps.stack.len() - 1;
        let parent = &ps.stack[top];
        let state = Arc::clone(&parent.state);
        let tasks = parent.tasks.clone();
        let operators = parent.operators.clone();
        let mut sibling_stack = parent.sibling_stack.clone();
        let parent_memory = parent.total_memory_at_push;

        // Exhausted scopes are popped; this task consumes a sibling slot
        while sibling_stack.last().is_some_and(|(_, count)| *count == 0) {
            sibling_stack.pop();
        }
        if let Some((_, count)) = sibling_stack.last_mut() {
            if *count > 0 {
                *count -= 1;
            }
        }

        let node_id = ps.next_node_id;
        ps.next_node_id += 1;
        let mut child = PlanNode::new(node_id, state, tasks, operators, sibling_stack);
        self.check_memory_at_push(ps, &mut child, parent_memory);

        ps.stack[top].continue_point = return_point;
        trace!(child = child.node_id, parent = ps.stack[top].node_id, "push");
        ps.stack.push(child);
    }

    /// Push a backtrackable child: independent state copy, new tasks in
    /// front of the remaining ones, with a methodScopeEnd marker between
    /// them for tree parenting.
    fn push_backtrackable(
        &self,
        ps: &mut PlanState,
        additional_tasks: Vec<TermId>,
        return_point: ContinuePoint,
    ) {
        let top = ps.stack.len() - 1;
        let parent_id = ps.stack[top].node_id;
        let parent_memory = ps.stack[top].total_memory_at_push;

        let mut merged: VecDeque<TermId> = additional_tasks.iter().copied().collect();
        if !additional_tasks.is_empty() && !ps.stack[top].tasks.is_empty() {
            merged.push_back(
                ps.store
                    .app("methodScopeEnd", [ps.store.int(parent_id as i64)]),
            );
        }
        merged.extend(ps.stack[top].tasks.iter().copied());

        let state: StateHandle =
            Arc::new(RwLock::new(ps.stack[top].state.read().create_copy()));
        let operators = ps.stack[top].operators.clone();

        let mut sibling_stack = ps.stack[top].sibling_stack.clone();
        while sibling_stack.last().is_some_and(|(_, count)| *count == 0) {
            sibling_stack.pop();
        }
        if !additional_tasks.is_empty() {
            // New scope: the first subtask consumes its slot implicitly
            sibling_stack.push((parent_id, additional_tasks.len() as u32 - 1));
        } else if !merged.is_empty() {
            // Empty do(): continuing with outer-scope tasks consumes a slot
            if let Some((_, count)) = sibling_stack.last_mut() {
                if *count > 0 {
                    *count -= 1;
                }
            }
        }

        let node_id = ps.next_node_id;
        ps.next_node_id += 1;
        let mut child = PlanNode::new(node_id, state, merged, operators, sibling_stack);
        self.check_memory_at_push(ps, &mut child, parent_memory);

        ps.stack[top].continue_point = return_point;
        trace!(child = node_id, parent = parent_id, "push backtrackable");
        ps.stack.push(child);
    }

    /// Budget check at the only allocation point that matters: node push.
    fn check_memory_at_push(&self, ps: &mut PlanState, child: &mut PlanNode, parent_memory: i64) {
        child.total_memory_at_push = ps.dynamic_size();
        ps.memory
            .check_node_delta(child.node_id, child.total_memory_at_push - parent_memory);
        if child.total_memory_at_push > ps.memory.budget() {
            child.continue_point = ContinuePoint::OutOfMemory;
        }
    }

    fn pop(&self, ps: &mut PlanState, return_value: bool) {
        let _popped = ps.stack.pop().expect("pop on an empty stack");
        trace!(node_id = _popped.node_id, return_value, "pop");
        ps.return_value = return_value;
    }

    /// Build a Solution from the node at `index` (a leaf, or the top frame
    /// on abort/out-of-memory).
    fn make_solution(&self, ps: &PlanState, index: usize) -> Solution {
        let node = &ps.stack[index];
        let final_state = Arc::new(RwLock::new(node.state.read().create_copy()));
        Solution {
            operators: node.operators.clone(),
            final_state,
            elapsed_seconds: ps.start_time.elapsed().as_secs_f64(),
            highest_memory: ps.memory.highest(),
            tree: ps.tree.slice(ps.current_solution_id - 1),
        }
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}

fn is_bookkeeping_task(name: &str) -> bool {
    matches!(
        name,
        "tryEnd" | "methodScopeEnd" | "countAnyOf" | "failIfNoneOf" | "beginParallel"
            | "endParallel"
    )
}

/// The node id carried as the single integer argument of a bookkeeping task.
fn task_arg_id(store: &TermStore, task: TermId) -> u32 {
    let args = store.args(task);
    store
        .name_str(args[0])
        .parse::<u32>()
        .expect("bookkeeping task carries a node id")
}

fn unifier_pairs(store: &TermStore, bindings: &Bindings) -> Vec<(String, String)> {
    bindings
        .iter()
        .map(|(var, term)| (store.format(var), store.format(term)))
        .collect()
}

#[cfg(test)]
#[path = "tests/planner.rs"]
mod tests;
