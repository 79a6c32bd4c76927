use lasso::{Spur, ThreadedRodeo};

/// A unique identifier for a functor, constant, or variable name.
/// This is an interned string ID for fast equality comparison.
pub type NameId = Spur;

/// Thread-safe symbol store for interning term names.
///
/// Guarantees:
/// - Same string always produces same NameId
/// - Different strings always produce different NameIds
/// - NameId can be resolved back to the original string
pub struct SymbolStore {
    rodeo: ThreadedRodeo,
}

impl SymbolStore {
    /// Create a new empty symbol store.
    pub fn new() -> Self {
        Self {
            rodeo: ThreadedRodeo::new(),
        }
    }

    /// Intern a name, returning its unique NameId.
    /// If the name was already interned, returns the existing NameId.
    pub fn intern(&self, name: &str) -> NameId {
        self.rodeo.get_or_intern(name)
    }

    /// Resolve a NameId back to its string representation.
    /// Returns None if the NameId was not created by this store.
    pub fn resolve(&self, id: NameId) -> Option<&str> {
        self.rodeo.try_resolve(&id)
    }

    /// Get the NameId for a name if it exists, without interning.
    pub fn get(&self, name: &str) -> Option<NameId> {
        self.rodeo.get(name)
    }

    /// Check if a name has already been interned.
    pub fn contains(&self, name: &str) -> bool {
        self.rodeo.contains(name)
    }
}

impl Default for SymbolStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_same_string_returns_same_id() {
        let store = SymbolStore::new();
        let id1 = store.intern("travel");
        let id2 = store.intern("travel");
        assert_eq!(id1, id2);
    }

    #[test]
    fn intern_different_strings_returns_different_ids() {
        let store = SymbolStore::new();
        let id1 = store.intern("walk");
        let id2 = store.intern("ride");
        assert_ne!(id1, id2);
    }

    #[test]
    fn resolve_returns_original_string() {
        let store = SymbolStore::new();
        let id = store.intern("at");
        assert_eq!(store.resolve(id), Some("at"));
    }

    #[test]
    fn get_without_interning() {
        let store = SymbolStore::new();
        let id = store.intern("have");
        assert_eq!(store.get("have"), Some(id));
        assert_eq!(store.get("missing"), None);
        assert!(store.contains("have"));
        assert!(!store.contains("missing"));
    }

    #[test]
    fn case_sensitive_names() {
        let store = SymbolStore::new();
        assert_ne!(store.intern("walk"), store.intern("Walk"));
    }
}
