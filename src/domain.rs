use crate::resolver::is_builtin_name;
use crate::symbol::NameId;
use crate::term::{TermId, TermStore};
use crate::trace::warn;
use hashbrown::HashMap;

/// How a method treats the resolutions of its condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodType {
    /// Every condition resolution is a separate alternative solution.
    Normal,
    /// All resolutions are merged into one task list; all must succeed.
    AllSetOf,
    /// Each resolution is wrapped in try(); at least one must succeed.
    AnySetOf,
}

/// A decomposition rule: compound task head, condition conjunction, and the
/// subtasks that accomplish the head when the condition holds.
#[derive(Debug, Clone)]
pub struct Method {
    pub head: TermId,
    pub condition: Vec<TermId>,
    pub subtasks: Vec<TermId>,
    pub method_type: MethodType,
    /// The "else" flag: tried only when the preceding contiguous group of
    /// non-default methods for the same head yielded no solution.
    pub is_default: bool,
    /// Monotonically assigned at insertion; the alternative-selection
    /// tie-breaker.
    pub document_order: u32,
}

impl Method {
    /// Signature string used by the decomposition tree:
    /// `head => if(c1, c2), do(t1, t2)`.
    pub fn signature(&self, store: &TermStore) -> String {
        let mut out = store.format(self.head);
        out.push_str(" => if");
        out.push_str(&format_list(store, &self.condition));
        out.push_str(", do");
        out.push_str(&format_list(store, &self.subtasks));
        out
    }
}

/// A primitive action: task head plus the facts it deletes and adds.
#[derive(Debug, Clone)]
pub struct Operator {
    pub head: TermId,
    pub deletions: Vec<TermId>,
    pub additions: Vec<TermId>,
    /// Hidden operators change state but are filtered from the plan.
    pub hidden: bool,
}

impl Operator {
    pub fn signature(&self, store: &TermStore) -> String {
        store.format(self.head)
    }
}

/// Task names the planner interprets itself; the domain must not shadow them.
pub const RESERVED_TASK_NAMES: &[&str] = &[
    "try",
    "tryEnd",
    "countAnyOf",
    "failIfNoneOf",
    "methodScopeEnd",
    "parallel",
    "beginParallel",
    "endParallel",
];

/// An immutable catalog of methods and operators, built incrementally.
///
/// Methods are bucketed by head (name, arity) and retain insertion order
/// within and across buckets via their document order. Operators are keyed
/// by head name alone, and two operators may not share a name.
pub struct Domain {
    methods: Vec<Method>,
    method_index: HashMap<(NameId, u32), Vec<u32>>,
    operators: HashMap<NameId, Operator>,
    next_document_order: u32,
}

impl Domain {
    pub fn new() -> Self {
        Self {
            methods: Vec::new(),
            method_index: HashMap::new(),
            operators: HashMap::new(),
            next_document_order: 0,
        }
    }

    /// Add a method, returning its id. Panics if the head name is reserved.
    pub fn add_method(
        &mut self,
        store: &TermStore,
        head: TermId,
        condition: Vec<TermId>,
        subtasks: Vec<TermId>,
        method_type: MethodType,
        is_default: bool,
    ) -> u32 {
        let name = store.name_str(head);
        assert!(
            !RESERVED_TASK_NAMES.contains(&name.as_str()),
            "method head shadows reserved task name: {}",
            name
        );
        if is_builtin_name(&name) {
            warn!(head = %name, "method head reuses a built-in predicate name");
        }
        self.next_document_order += 1;
        let id = self.methods.len() as u32;
        let key = (store.name_id(head), store.arity(head) as u32);
        self.methods.push(Method {
            head,
            condition,
            subtasks,
            method_type,
            is_default,
            document_order: self.next_document_order,
        });
        self.method_index.entry(key).or_default().push(id);
        id
    }

    /// Add an operator, returning its head name. Panics on a duplicate
    /// operator name or a reserved task name: operator heads are unique.
    pub fn add_operator(
        &mut self,
        store: &TermStore,
        head: TermId,
        additions: Vec<TermId>,
        deletions: Vec<TermId>,
        hidden: bool,
    ) -> NameId {
        let name = store.name_id(head);
        let name_str = store.name_str(head);
        assert!(
            !RESERVED_TASK_NAMES.contains(&name_str.as_str()),
            "operator head shadows reserved task name: {}",
            name_str
        );
        assert!(
            !self.operators.contains_key(&name),
            "duplicate operator name: {}",
            name_str
        );
        if is_builtin_name(&name_str) {
            warn!(head = %name_str, "operator head reuses a built-in predicate name");
        }
        self.operators.insert(
            name,
            Operator {
                head,
                deletions,
                additions,
                hidden,
            },
        );
        name
    }

    pub fn clear(&mut self) {
        self.methods.clear();
        self.method_index.clear();
        self.operators.clear();
        self.next_document_order = 0;
    }

    /// The operator registered under this task name, if any.
    pub fn operator(&self, name: NameId) -> Option<&Operator> {
        self.operators.get(&name)
    }

    pub fn method(&self, id: u32) -> &Method {
        &self.methods[id as usize]
    }

    /// Candidate method ids for a head, in document order.
    pub fn methods_for(&self, name: NameId, arity: u32) -> &[u32] {
        self.method_index
            .get(&(name, arity))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn operator_count(&self) -> usize {
        self.operators.len()
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::new()
    }
}

fn format_list(store: &TermStore, terms: &[TermId]) -> String {
    let mut out = String::from("(");
    for (i, t) in terms.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&store.format(*t));
    }
    out.push(')');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_keep_document_order() {
        let store = TermStore::new();
        let mut domain = Domain::new();
        let head = store.app("go", [store.var("X")]);
        let id1 = domain.add_method(&store, head, vec![], vec![], MethodType::Normal, false);
        let id2 = domain.add_method(&store, head, vec![], vec![], MethodType::Normal, true);

        let name = store.name_id(head);
        assert_eq!(domain.methods_for(name, 1), &[id1, id2]);
        assert!(domain.method(id1).document_order < domain.method(id2).document_order);
    }

    #[test]
    fn methods_bucket_by_arity() {
        let store = TermStore::new();
        let mut domain = Domain::new();
        let one = store.app("go", [store.var("X")]);
        let two = store.app("go", [store.var("X"), store.var("Y")]);
        domain.add_method(&store, one, vec![], vec![], MethodType::Normal, false);
        domain.add_method(&store, two, vec![], vec![], MethodType::Normal, false);

        let name = store.name_id(one);
        assert_eq!(domain.methods_for(name, 1).len(), 1);
        assert_eq!(domain.methods_for(name, 2).len(), 1);
    }

    #[test]
    #[should_panic(expected = "duplicate operator name")]
    fn duplicate_operator_rejected() {
        let store = TermStore::new();
        let mut domain = Domain::new();
        let head = store.app("move", [store.var("X")]);
        domain.add_operator(&store, head, vec![], vec![], false);
        let other = store.app("move", [store.var("X"), store.var("Y")]);
        domain.add_operator(&store, other, vec![], vec![], false);
    }

    #[test]
    #[should_panic(expected = "reserved task name")]
    fn reserved_task_names_rejected() {
        let store = TermStore::new();
        let mut domain = Domain::new();
        let head = store.app("try", [store.var("X")]);
        domain.add_method(&store, head, vec![], vec![], MethodType::Normal, false);
    }

    #[test]
    fn operator_lookup_by_name() {
        let store = TermStore::new();
        let mut domain = Domain::new();
        let head = store.app("pickup", [store.var("X")]);
        let add = store.app("holding", [store.var("X")]);
        domain.add_operator(&store, head, vec![add], vec![], false);

        let op = domain.operator(store.name_id(head)).expect("registered");
        assert_eq!(op.additions, vec![add]);
        assert!(!op.hidden);
        assert!(domain.operator(store.symbols().intern("drop")).is_none());
    }

    #[test]
    fn method_signature_reads_like_source() {
        let store = TermStore::new();
        let mut domain = Domain::new();
        let v = store.var("P");
        let head = store.app("doAI", [v]);
        let cond = store.app("canAttack", [v]);
        let task = store.app("attack", [v]);
        let id = domain.add_method(&store, head, vec![cond], vec![task], MethodType::Normal, false);
        assert_eq!(
            domain.method(id).signature(&store),
            "doAI(?P) => if(canAttack(?P)), do(attack(?P))"
        );
    }

    #[test]
    fn clear_empties_the_catalog() {
        let store = TermStore::new();
        let mut domain = Domain::new();
        domain.add_method(
            &store,
            store.app("go", [store.var("X")]),
            vec![],
            vec![],
            MethodType::Normal,
            false,
        );
        domain.add_operator(&store, store.app("move", [store.var("X")]), vec![], vec![], false);
        domain.clear();
        assert_eq!(domain.method_count(), 0);
        assert_eq!(domain.operator_count(), 0);
    }
}
