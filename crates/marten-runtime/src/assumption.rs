//! Assumptions: revocable validity tokens.
//!
//! An assumption certifies a metadata fact ("the method table of X has not
//! changed", "constant C in M has not been redefined"). Cache entries hold
//! the assumptions their binding depends on and re-check them on every
//! consultation; whatever operation breaks the fact invalidates the
//! assumption before the mutation is published. Invalidation is permanent:
//! a new fact gets a new assumption, never a reused one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A one-way validity flag with a diagnostic label.
pub struct Assumption {
    label: String,
    valid: AtomicBool,
}

impl Assumption {
    /// Create a new, valid assumption.
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            valid: AtomicBool::new(true),
        })
    }

    /// Whether the certified fact still holds. O(1), safe to call on the
    /// dispatch hot path.
    #[inline]
    pub fn check(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Revoke the assumption. Idempotent and irreversible.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// The diagnostic label this assumption was created with.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for Assumption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assumption")
            .field("label", &self.label)
            .field("valid", &self.check())
            .finish()
    }
}

/// Check a whole dependency list. Empty lists are vacuously valid.
#[inline]
pub fn check_all(assumptions: &[Arc<Assumption>]) -> bool {
    assumptions.iter().all(|a| a.check())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidate_is_permanent() {
        let a = Assumption::new("methods of Foo");
        assert!(a.check());

        a.invalidate();
        assert!(!a.check());

        // Idempotent
        a.invalidate();
        assert!(!a.check());
    }

    #[test]
    fn test_check_all() {
        let a = Assumption::new("a");
        let b = Assumption::new("b");
        assert!(check_all(&[a.clone(), b.clone()]));

        b.invalidate();
        assert!(!check_all(&[a, b]));
        assert!(check_all(&[]));
    }
}
