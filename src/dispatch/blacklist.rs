//! Permanent skip-list of work references.
//!
//! References land here on a terminal determination — expired target, invalid
//! reference, unrecognized item — and are never removed for the life of the
//! process. Run teardown deliberately leaves the set intact so a reference
//! banned in one run stays banned in the next.

use std::collections::HashSet;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct Blacklist {
    entries: RwLock<HashSet<String>>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.entries.read().unwrap().contains(reference)
    }

    /// Idempotent insert. Returns `true` when the reference was new.
    pub fn insert(&self, reference: impl Into<String>) -> bool {
        self.entries.write().unwrap().insert(reference.into())
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_references_stay_members() {
        let bl = Blacklist::new();
        assert!(!bl.contains("https://portal.example/view/1"));

        assert!(bl.insert("https://portal.example/view/1"));
        assert!(bl.contains("https://portal.example/view/1"));

        // Re-insert is a no-op, membership is unchanged.
        assert!(!bl.insert("https://portal.example/view/1"));
        assert!(bl.contains("https://portal.example/view/1"));
        assert_eq!(bl.len(), 1);
    }

    #[tokio::test]
    async fn membership_is_monotone_under_concurrent_inserts() {
        let bl = std::sync::Arc::new(Blacklist::new());

        let mut handles = Vec::new();
        for i in 0..32 {
            let bl = bl.clone();
            handles.push(tokio::spawn(async move {
                let reference = format!("ref-{}", i % 8);
                bl.insert(reference.clone());
                assert!(bl.contains(&reference));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // Every reference inserted at any point is still a member.
        for i in 0..8 {
            assert!(bl.contains(&format!("ref-{}", i)));
        }
        assert_eq!(bl.len(), 8);
    }
}
