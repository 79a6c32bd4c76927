use crate::resolver::is_builtin_name;
use crate::symbol::NameId;
use crate::term::{TermId, TermStore};
use crate::trace::warn;
use crate::unify::unify;
use hashbrown::{HashMap, HashSet};
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type FxHashMap<K, V> = HashMap<K, V, BuildHasherDefault<FxHasher>>;
type FxHashSet<T> = HashSet<T, BuildHasherDefault<FxHasher>>;

/// A rule: a head and an ordered list of body terms.
/// A fact is a rule with an empty tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub head: TermId,
    pub tail: Vec<TermId>,
}

impl Rule {
    pub fn fact(head: TermId) -> Self {
        Self {
            head,
            tail: Vec::new(),
        }
    }

    pub fn is_fact(&self) -> bool {
        self.tail.is_empty()
    }

    fn footprint(&self) -> i64 {
        (std::mem::size_of::<Rule>() + self.tail.len() * std::mem::size_of::<TermId>()) as i64
    }
}

/// The immutable core of a rule database, shared between copies.
///
/// Rules can only be added while no copy exists; the first `create_copy`
/// locks the core for good and later copies share it by reference.
struct SharedRules {
    rules: Vec<Rule>,
    index: FxHashMap<(NameId, u32), Vec<u32>>,
    facts: FxHashSet<TermId>,
    locked: AtomicBool,
    dynamic_size: i64,
}

impl SharedRules {
    fn new() -> Self {
        Self {
            rules: Vec::new(),
            index: FxHashMap::default(),
            facts: FxHashSet::default(),
            locked: AtomicBool::new(false),
            dynamic_size: std::mem::size_of::<SharedRules>() as i64,
        }
    }
}

/// A mutable database of facts and rules keyed by head predicate.
///
/// `create_copy` gives an independent snapshot via copy-on-write: the shared
/// core is locked and referenced, and each copy keeps its own fact diff
/// (front/back additions plus tombstones for shared facts). After a copy,
/// either set may mutate without affecting the other.
pub struct RuleSet {
    shared: Arc<SharedRules>,
    /// Shared facts hidden by a local remove (or remove-then-re-add).
    overridden: FxHashSet<TermId>,
    /// Facts asserted at the front of the database, most recent first.
    front: Vec<Rule>,
    /// Facts asserted at the back of the database, in insertion order.
    back: Vec<Rule>,
    exclusive_size: i64,
}

impl RuleSet {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SharedRules::new()),
            overridden: FxHashSet::default(),
            front: Vec::new(),
            back: Vec::new(),
            exclusive_size: std::mem::size_of::<RuleSet>() as i64,
        }
    }

    /// Add a rule to the shared core. Only legal before the first copy and
    /// before any fact diff exists; this is how a domain/query is built.
    ///
    /// A rule whose head is a built-in predicate name is accepted but can
    /// never match: the resolver dispatches built-ins before user rules.
    pub fn add_rule(&mut self, store: &TermStore, head: TermId, tail: Vec<TermId>) {
        assert!(
            self.front.is_empty() && self.back.is_empty() && self.overridden.is_empty(),
            "rules cannot be added once facts have been updated"
        );
        if is_builtin_name(&store.name_str(head)) {
            warn!(
                predicate = %store.name_str(head),
                "rule head is a built-in predicate name; the rule is shadowed"
            );
        }
        let key = (store.name_id(head), store.arity(head) as u32);
        let shared = Arc::get_mut(&mut self.shared)
            .expect("rules cannot be added once the rule set has been copied");
        assert!(!shared.locked.load(Ordering::Relaxed), "rule set is locked");

        let rule = Rule { head, tail };
        let position = shared.rules.len() as u32;
        shared.dynamic_size += rule.footprint();
        if rule.is_fact() {
            shared.facts.insert(rule.head);
        }
        shared.index.entry(key).or_default().push(position);
        shared.rules.push(rule);
    }

    fn key_of(&self, store: &TermStore, head: TermId) -> (NameId, u32) {
        (store.name_id(head), store.arity(head) as u32)
    }

    /// Create an independent mutable snapshot. The shared core is locked so
    /// neither set can grow it afterwards; fact diffs stay per-copy.
    pub fn create_copy(&self) -> RuleSet {
        self.shared.locked.store(true, Ordering::Relaxed);
        RuleSet {
            shared: Arc::clone(&self.shared),
            overridden: self.overridden.clone(),
            front: self.front.clone(),
            back: self.back.clone(),
            exclusive_size: self.exclusive_size,
        }
    }

    /// Does this exact fact hold? (Structural identity, diff-aware.)
    pub fn has_fact(&self, fact: TermId) -> bool {
        if self.front.iter().any(|r| r.head == fact) || self.back.iter().any(|r| r.head == fact) {
            return true;
        }
        if self.overridden.contains(&fact) {
            return false;
        }
        self.shared.facts.contains(&fact)
    }

    /// Append a fact at the back of the database. No-op if it already holds.
    pub fn add_fact(&mut self, fact: TermId) -> bool {
        if self.has_fact(fact) {
            return false;
        }
        let rule = Rule::fact(fact);
        self.exclusive_size += rule.footprint();
        self.back.push(rule);
        // Hide any tombstoned shared copy so document order is append
        if self.shared.facts.contains(&fact) {
            self.overridden.insert(fact);
        }
        true
    }

    /// Insert a fact at the front of the database. No-op if it already holds.
    pub fn add_fact_front(&mut self, fact: TermId) -> bool {
        if self.has_fact(fact) {
            return false;
        }
        let rule = Rule::fact(fact);
        self.exclusive_size += rule.footprint();
        self.front.insert(0, rule);
        if self.shared.facts.contains(&fact) {
            self.overridden.insert(fact);
        }
        true
    }

    /// Remove a fact. Returns false if it did not hold.
    pub fn remove_fact(&mut self, fact: TermId) -> bool {
        if let Some(pos) = self.front.iter().position(|r| r.head == fact) {
            self.exclusive_size -= self.front[pos].footprint();
            self.front.remove(pos);
            return true;
        }
        if let Some(pos) = self.back.iter().position(|r| r.head == fact) {
            self.exclusive_size -= self.back[pos].footprint();
            self.back.remove(pos);
            return true;
        }
        if !self.overridden.contains(&fact) && self.shared.facts.contains(&fact) {
            self.overridden.insert(fact);
            self.exclusive_size += std::mem::size_of::<TermId>() as i64;
            return true;
        }
        false
    }

    /// Remove the first fact unifying with `pattern`. Returns the matched
    /// fact, or None if nothing matched.
    pub fn remove_matching(&mut self, store: &TermStore, pattern: TermId) -> Option<TermId> {
        let found = self
            .rules_for_term(store, pattern)
            .into_iter()
            .filter(|r| r.is_fact())
            .find(|r| unify(pattern, r.head, store).is_some())
            .map(|r| r.head)?;
        self.remove_fact(found);
        Some(found)
    }

    /// Remove every fact unifying with `pattern`. Always succeeds.
    pub fn remove_all_matching(&mut self, store: &TermStore, pattern: TermId) -> usize {
        let matches: Vec<TermId> = self
            .rules_for_term(store, pattern)
            .into_iter()
            .filter(|r| r.is_fact())
            .filter(|r| unify(pattern, r.head, store).is_some())
            .map(|r| r.head)
            .collect();
        for fact in &matches {
            self.remove_fact(*fact);
        }
        matches.len()
    }

    /// Apply an operator's state change: deletions first, then additions.
    /// Mutations are total: deleting an absent fact or adding a present one
    /// is a no-op.
    pub fn update(&mut self, _store: &TermStore, deletions: &[TermId], additions: &[TermId]) {
        for &fact in deletions {
            self.remove_fact(fact);
        }
        for &fact in additions {
            self.add_fact(fact);
        }
    }

    /// All rules whose head matches the given name and arity, in document
    /// order: front additions first, then the shared core, then back
    /// additions.
    pub fn rules_for(&self, store: &TermStore, name: NameId, arity: u32) -> Vec<Rule> {
        let matches = |rule: &Rule| {
            store.name_id(rule.head) == name && store.arity(rule.head) as u32 == arity
        };
        let mut result = Vec::new();
        for rule in &self.front {
            if matches(rule) {
                result.push(rule.clone());
            }
        }
        if let Some(positions) = self.shared.index.get(&(name, arity)) {
            for &pos in positions {
                let rule = &self.shared.rules[pos as usize];
                if rule.is_fact() && self.overridden.contains(&rule.head) {
                    continue;
                }
                result.push(rule.clone());
            }
        }
        for rule in &self.back {
            if matches(rule) {
                result.push(rule.clone());
            }
        }
        result
    }

    pub fn rules_for_term(&self, store: &TermStore, head: TermId) -> Vec<Rule> {
        let (name, arity) = self.key_of(store, head);
        self.rules_for(store, name, arity)
    }

    /// Visit every rule in document order. The visitor returns false to stop.
    pub fn all_rules(&self, mut visit: impl FnMut(&Rule) -> bool) {
        for rule in &self.front {
            if !visit(rule) {
                return;
            }
        }
        for rule in &self.shared.rules {
            if rule.is_fact() && self.overridden.contains(&rule.head) {
                continue;
            }
            if !visit(rule) {
                return;
            }
        }
        for rule in &self.back {
            if !visit(rule) {
                return;
            }
        }
    }

    /// All facts in document order.
    pub fn facts(&self) -> Vec<TermId> {
        let mut out = Vec::new();
        self.all_rules(|r| {
            if r.is_fact() {
                out.push(r.head);
            }
            true
        });
        out
    }

    /// Serialize the facts as `a => , b => ` style pairs used by tests.
    pub fn format_facts(&self, store: &TermStore) -> String {
        let mut out = String::new();
        let mut first = true;
        self.all_rules(|r| {
            if r.is_fact() {
                if !first {
                    out.push_str(", ");
                }
                out.push_str(&store.format(r.head));
                first = false;
            }
            true
        });
        out
    }

    /// Bytes shared with other copies (the locked core).
    pub fn shared_size(&self) -> i64 {
        self.shared.dynamic_size
    }

    /// Bytes exclusive to this copy (the fact diff).
    pub fn exclusive_size(&self) -> i64 {
        self.exclusive_size
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}
