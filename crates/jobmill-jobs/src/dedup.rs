//! Names of jobs currently in flight.

use std::collections::HashSet;

/// In-memory set of job names dispatched to the pool and not yet settled.
///
/// Owned by the queue filler; nothing else mutates it, so it needs no lock.
/// It is not persisted and starts empty on every process start.
#[derive(Debug, Default)]
pub struct DedupRegistry {
    names: HashSet<String>,
}

impl DedupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `name` as in flight. Returns `false` if it already was.
    pub fn add(&mut self, name: &str) -> bool {
        self.names.insert(name.to_string())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Release `name`. Returns `false` if it was not in flight.
    pub fn remove(&mut self, name: &str) -> bool {
        self.names.remove(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_contains_remove() {
        let mut registry = DedupRegistry::new();
        assert!(registry.is_empty());

        assert!(registry.add("digest"));
        assert!(registry.contains("digest"));
        assert!(!registry.contains("other"));

        assert!(registry.remove("digest"));
        assert!(!registry.contains("digest"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_add_twice_reports_duplicate() {
        let mut registry = DedupRegistry::new();
        assert!(registry.add("digest"));
        assert!(!registry.add("digest"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_missing() {
        let mut registry = DedupRegistry::new();
        assert!(!registry.remove("never-added"));
    }
}
