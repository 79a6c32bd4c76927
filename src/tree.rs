//! The decomposition tree: a flat, append-only record of the search,
//! including failed branches, that survives stack unwinding.
//!
//! Tree nodes are created at task-resolution time (not node-push time) so
//! the sibling-scope discipline has already settled on the right parent.
//! Bookkeeping tasks (`tryEnd`, `methodScopeEnd`, ...) never get tree nodes;
//! instead the builder records which real node stands in as their parent so
//! the next real task can look up a real tree parent.

use crate::term::{Term, TermId, TermStore};
use hashbrown::HashMap;
use rustc_hash::FxHasher;
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use std::hash::BuildHasherDefault;

type FxHashMap<K, V> = HashMap<K, V, BuildHasherDefault<FxHasher>>;

/// One entry in the decomposition tree. Serializes with the exact key set
/// the embedding API documents; serde_json handles string escaping of
/// `" \ \n \r \t`.
#[derive(Debug, Clone, Serialize)]
pub struct DecompTreeNode {
    /// Unique id of this tree entry.
    #[serde(rename = "treeNodeID")]
    pub tree_node_id: i32,
    /// The plan node this entry was created for.
    #[serde(rename = "nodeID")]
    pub node_id: i32,
    /// Tree-node id of the parent entry; -1 for the root.
    #[serde(rename = "parentNodeID")]
    pub parent_node_id: i32,
    #[serde(rename = "childNodeIDs")]
    pub child_node_ids: Vec<i32>,
    #[serde(rename = "taskName")]
    pub task_name: String,
    /// Empty for operators.
    #[serde(rename = "methodSignature")]
    pub method_signature: String,
    /// Empty for methods.
    #[serde(rename = "operatorSignature")]
    pub operator_signature: String,
    /// Head bindings as (variable, value) strings.
    #[serde(serialize_with = "pairs_as_objects")]
    pub unifiers: Vec<(String, String)>,
    /// Condition bindings as (variable, value) strings.
    #[serde(rename = "conditionBindings", serialize_with = "pairs_as_objects")]
    pub condition_bindings: Vec<(String, String)>,
    #[serde(rename = "isOperator")]
    pub is_operator: bool,
    #[serde(rename = "isSuccess")]
    pub is_success: bool,
    #[serde(rename = "isFailed")]
    pub is_failed: bool,
    #[serde(rename = "failureReason")]
    pub failure_reason: String,
    /// Which solution this entry contributed to; -1 if none yet.
    #[serde(rename = "solutionID")]
    pub solution_id: i32,
    /// The method's document order; -1 for operators.
    #[serde(rename = "methodIndex")]
    pub method_index: i32,
    /// Each condition term, structured.
    #[serde(rename = "conditionTerms")]
    pub condition_terms: Vec<Value>,
    /// Which condition index failed; -1 if none.
    #[serde(rename = "failedConditionIndex")]
    pub failed_condition_index: i32,
    #[serde(rename = "failedConditionTerm")]
    pub failed_condition_term: Option<Value>,
}

/// `[{"?X": "a"}, {"?Y": "b"}]` instead of the tuple-array serde default.
fn pairs_as_objects<S: Serializer>(
    pairs: &[(String, String)],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut seq = serializer.serialize_seq(Some(pairs.len()))?;
    for (var, value) in pairs {
        let mut binding = serde_json::Map::new();
        binding.insert(var.clone(), Value::String(value.clone()));
        seq.serialize_element(&Value::Object(binding))?;
    }
    seq.end()
}

impl DecompTreeNode {
    fn new(tree_node_id: i32, node_id: i32, parent_node_id: i32, task_name: String) -> Self {
        Self {
            tree_node_id,
            node_id,
            parent_node_id,
            child_node_ids: Vec::new(),
            task_name,
            method_signature: String::new(),
            operator_signature: String::new(),
            unifiers: Vec::new(),
            condition_bindings: Vec::new(),
            is_operator: false,
            is_success: false,
            is_failed: false,
            failure_reason: String::new(),
            solution_id: -1,
            method_index: -1,
            condition_terms: Vec::new(),
            failed_condition_index: -1,
            failed_condition_term: None,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).expect("tree nodes serialize")
    }
}

/// Structured JSON form of a term: `{"var": "X"}` for variables, otherwise
/// `{"name": ..., "args": [...]}`.
pub fn term_to_json(store: &TermStore, term: TermId) -> Value {
    match store.resolve(term) {
        Term::Var(name) => json!({ "var": store.symbols().resolve(name).unwrap_or("") }),
        Term::Const(name, _) => {
            json!({ "name": store.symbols().resolve(name).unwrap_or(""), "args": [] })
        }
        Term::App(name, args) => json!({
            "name": store.symbols().resolve(name).unwrap_or(""),
            "args": args.iter().map(|&a| term_to_json(store, a)).collect::<Vec<_>>(),
        }),
    }
}

/// Builds the decomposition tree from planner events.
pub struct TreeBuilder {
    nodes: Vec<DecompTreeNode>,
    /// treeNodeID -> index into `nodes`.
    index: FxHashMap<i32, usize>,
    /// plan nodeID -> the most recent treeNodeID created for it.
    last_tree_node: FxHashMap<u32, i32>,
    /// plan nodeID of a bookkeeping task -> the real plan node standing in
    /// as its parent.
    bookkeeping_parents: FxHashMap<u32, Option<u32>>,
    next_tree_node_id: i32,
}

impl TreeBuilder {
    /// Start a tree with a root entry for the initial plan node.
    pub fn new(root_plan_node: u32, first_goal: String) -> Self {
        let mut builder = Self {
            nodes: Vec::new(),
            index: FxHashMap::default(),
            last_tree_node: FxHashMap::default(),
            bookkeeping_parents: FxHashMap::default(),
            next_tree_node_id: 0,
        };
        let root = DecompTreeNode::new(0, root_plan_node as i32, -1, first_goal);
        builder.next_tree_node_id = 1;
        builder.index.insert(0, 0);
        builder.last_tree_node.insert(root_plan_node, 0);
        builder.nodes.push(root);
        builder
    }

    fn node_mut(&mut self, plan_node: u32) -> Option<&mut DecompTreeNode> {
        let tree_id = *self.last_tree_node.get(&plan_node)?;
        let idx = *self.index.get(&tree_id)?;
        Some(&mut self.nodes[idx])
    }

    /// Walk the bookkeeping-parent chain until a plan node with a tree
    /// entry is found.
    fn real_parent(&self, mut plan_node: Option<u32>) -> Option<u32> {
        loop {
            let candidate = plan_node?;
            if self.last_tree_node.contains_key(&candidate) {
                return Some(candidate);
            }
            match self.bookkeeping_parents.get(&candidate) {
                Some(next) => plan_node = *next,
                None => return Some(candidate),
            }
        }
    }

    /// A bookkeeping task was dispatched on `plan_node`: it gets no tree
    /// entry, but the next real task needs to find a real parent through it.
    pub fn note_bookkeeping_task(&mut self, plan_node: u32, scope_parent: Option<u32>) {
        let parent = self.real_parent(scope_parent);
        self.bookkeeping_parents.insert(plan_node, parent);
    }

    /// A real task is about to be resolved on `plan_node`. `scope_parent`
    /// is the owner of the current sibling scope (falling back to the
    /// previous stack frame), already chosen by the planner.
    pub fn task_resolved(&mut self, plan_node: u32, task_name: String, scope_parent: Option<u32>) {
        // The same task seen again on the same plan node is not duplicated;
        // a different task on the same node (after a failed try) is.
        if let Some(&tree_id) = self.last_tree_node.get(&plan_node) {
            if let Some(&idx) = self.index.get(&tree_id) {
                if self.nodes[idx].task_name == task_name {
                    return;
                }
            }
        }

        let parent_plan = self.real_parent(scope_parent);
        let parent_tree = parent_plan
            .and_then(|p| self.last_tree_node.get(&p).copied())
            .unwrap_or(-1);

        let tree_id = self.next_tree_node_id;
        self.next_tree_node_id += 1;
        let node = DecompTreeNode::new(tree_id, plan_node as i32, parent_tree, task_name);
        self.index.insert(tree_id, self.nodes.len());
        self.last_tree_node.insert(plan_node, tree_id);
        self.nodes.push(node);

        if parent_tree >= 0 {
            if let Some(&idx) = self.index.get(&parent_tree) {
                if !self.nodes[idx].child_node_ids.contains(&tree_id) {
                    self.nodes[idx].child_node_ids.push(tree_id);
                }
            }
        }
    }

    /// A method was selected for the node's current task.
    pub fn method_chosen(
        &mut self,
        plan_node: u32,
        signature: String,
        document_order: i32,
        condition_terms: Vec<Value>,
        unifiers: Vec<(String, String)>,
    ) {
        if let Some(node) = self.node_mut(plan_node) {
            node.method_signature = signature;
            node.is_operator = false;
            node.method_index = document_order;
            node.condition_terms = condition_terms;
            // Reset failure info and bindings from earlier method attempts
            node.failed_condition_index = -1;
            node.failed_condition_term = None;
            node.unifiers = unifiers;
            node.condition_bindings.clear();
        }
    }

    /// A condition resolution was selected for the current method.
    pub fn condition_chosen(&mut self, plan_node: u32, bindings: Vec<(String, String)>) {
        if let Some(node) = self.node_mut(plan_node) {
            node.condition_bindings = bindings;
        }
    }

    /// The node's task matched an operator.
    pub fn operator_applied(
        &mut self,
        plan_node: u32,
        signature: String,
        unifiers: Vec<(String, String)>,
    ) {
        if let Some(node) = self.node_mut(plan_node) {
            node.operator_signature = signature;
            node.is_operator = true;
            node.unifiers = unifiers;
        }
    }

    /// The node failed: record why, and which condition term (if any).
    pub fn node_failed(
        &mut self,
        plan_node: u32,
        reason: String,
        failed_index: i32,
        failed_term: Option<Value>,
    ) {
        if let Some(node) = self.node_mut(plan_node) {
            node.is_failed = true;
            node.failure_reason = reason;
            node.failed_condition_index = failed_index;
            node.failed_condition_term = failed_term;
        }
    }

    /// A leaf succeeded: mark the path from the leaf to the root (and every
    /// explored descendant of path nodes) with the solution id. Entries
    /// already claimed by an earlier solution keep their id, which is what
    /// keeps per-solution tree slices disjoint.
    ///
    /// `stack_ids` is the current plan-node stack, used as a fallback to
    /// find a tree entry for leaves that only processed bookkeeping tasks.
    pub fn path_succeeded(&mut self, leaf_plan_node: u32, stack_ids: &[u32], solution_id: i32) {
        let mut plan_node = leaf_plan_node;
        let mut tree_id = self.last_tree_node.get(&plan_node).copied();
        while tree_id.is_none() {
            if let Some(parent) = self.bookkeeping_parents.get(&plan_node).copied().flatten() {
                plan_node = parent;
            } else if let Some(pos) = stack_ids.iter().position(|&id| id == plan_node) {
                if pos == 0 {
                    break;
                }
                plan_node = stack_ids[pos - 1];
            } else {
                break;
            }
            tree_id = self.last_tree_node.get(&plan_node).copied();
        }

        let mut current = match tree_id {
            Some(id) => id,
            None => return,
        };
        loop {
            let idx = match self.index.get(&current) {
                Some(&idx) => idx,
                None => break,
            };
            self.nodes[idx].is_success = true;
            if self.nodes[idx].solution_id == -1 {
                self.nodes[idx].solution_id = solution_id;
            }
            let children = self.nodes[idx].child_node_ids.clone();
            for child in children {
                self.claim_descendants(child, solution_id);
            }
            let parent = self.nodes[idx].parent_node_id;
            if parent < 0 {
                break;
            }
            current = parent;
        }
    }

    fn claim_descendants(&mut self, tree_id: i32, solution_id: i32) {
        let mut stack = vec![tree_id];
        while let Some(id) = stack.pop() {
            let idx = match self.index.get(&id) {
                Some(&idx) => idx,
                None => continue,
            };
            if self.nodes[idx].solution_id == -1 {
                self.nodes[idx].solution_id = solution_id;
            }
            stack.extend(self.nodes[idx].child_node_ids.iter().copied());
        }
    }

    /// The entries claimed by one solution.
    pub fn slice(&self, solution_id: i32) -> Vec<DecompTreeNode> {
        self.nodes
            .iter()
            .filter(|n| n.solution_id == solution_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[DecompTreeNode] {
        &self.nodes
    }

    /// Approximate bytes held by the tree, for the memory accountant.
    pub fn dynamic_size(&self) -> i64 {
        self.nodes
            .iter()
            .map(|n| {
                (std::mem::size_of::<DecompTreeNode>()
                    + n.task_name.len()
                    + n.method_signature.len()
                    + n.operator_signature.len()
                    + n.failure_reason.len()
                    + n.child_node_ids.len() * 4) as i64
            })
            .sum()
    }
}

/// Serialize a tree slice as a JSON array string.
pub fn tree_to_json(nodes: &[DecompTreeNode]) -> String {
    let values: Vec<Value> = nodes.iter().map(|n| n.to_json()).collect();
    Value::Array(values).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_created_up_front() {
        let builder = TreeBuilder::new(0, "go(home)".to_string());
        assert_eq!(builder.len(), 1);
        let root = &builder.nodes()[0];
        assert_eq!(root.tree_node_id, 0);
        assert_eq!(root.parent_node_id, -1);
        assert_eq!(root.task_name, "go(home)");
    }

    #[test]
    fn same_task_on_same_node_not_duplicated() {
        let mut builder = TreeBuilder::new(0, "go(home)".to_string());
        builder.task_resolved(0, "go(home)".to_string(), None);
        assert_eq!(builder.len(), 1);
        // A different task on the same node is a new entry
        builder.task_resolved(0, "pack(bag)".to_string(), None);
        assert_eq!(builder.len(), 2);
    }

    #[test]
    fn parents_resolve_through_bookkeeping_chain() {
        let mut builder = TreeBuilder::new(0, "go".to_string());
        // Plan node 1 handles a bookkeeping task whose scope owner is 0
        builder.note_bookkeeping_task(1, Some(0));
        // Plan node 2's scope owner is the bookkeeping node 1
        builder.task_resolved(2, "walk".to_string(), Some(1));
        let walk = &builder.nodes()[1];
        assert_eq!(walk.parent_node_id, 0);
        assert_eq!(builder.nodes()[0].child_node_ids, vec![walk.tree_node_id]);
    }

    #[test]
    fn success_marks_path_and_claims_once() {
        let mut builder = TreeBuilder::new(0, "go".to_string());
        builder.task_resolved(1, "walk".to_string(), Some(0));
        builder.path_succeeded(1, &[0, 1], 0);

        assert!(builder.nodes()[0].is_success);
        assert!(builder.nodes()[1].is_success);
        assert_eq!(builder.nodes()[0].solution_id, 0);

        // A second solution through a new child leaves the root claimed by
        // the first, so slices stay disjoint.
        builder.task_resolved(2, "ride".to_string(), Some(0));
        builder.path_succeeded(2, &[0, 2], 1);
        assert_eq!(builder.nodes()[0].solution_id, 0);
        let slice0: Vec<i32> = builder.slice(0).iter().map(|n| n.tree_node_id).collect();
        let slice1: Vec<i32> = builder.slice(1).iter().map(|n| n.tree_node_id).collect();
        assert!(slice0.iter().all(|id| !slice1.contains(id)));
    }

    #[test]
    fn failure_records_condition_info() {
        let store = TermStore::new();
        let mut builder = TreeBuilder::new(0, "go".to_string());
        let term = store.app("at", [store.var("X")]);
        builder.node_failed(
            0,
            "Condition failed".to_string(),
            1,
            Some(term_to_json(&store, term)),
        );
        let root = &builder.nodes()[0];
        assert!(root.is_failed);
        assert_eq!(root.failed_condition_index, 1);
        assert!(root.failed_condition_term.is_some());
    }

    #[test]
    fn json_uses_documented_keys_and_escapes() {
        let mut builder = TreeBuilder::new(0, "say(\"hi\\there\")".to_string());
        builder.node_failed(0, "line\nbreak".to_string(), -1, None);
        let text = tree_to_json(builder.nodes());
        assert!(text.contains("\"treeNodeID\":0"));
        assert!(text.contains("\"parentNodeID\":-1"));
        assert!(text.contains("\\\"hi\\\\there\\\""));
        assert!(text.contains("line\\nbreak"));
        assert!(text.contains("\"failedConditionTerm\":null"));
    }

    #[test]
    fn term_json_is_structured() {
        let store = TermStore::new();
        let t = store.app("at", [store.var("X"), store.atom("home")]);
        let v = term_to_json(&store, t);
        assert_eq!(v["name"], "at");
        assert_eq!(v["args"][0]["var"], "X");
        assert_eq!(v["args"][1]["name"], "home");
    }
}
