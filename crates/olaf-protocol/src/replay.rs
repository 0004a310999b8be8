use crate::error::ProtocolError;

/// Strictly increasing per-identity counter check.
///
/// A fresh guard accepts any first counter and seeds itself with it; after
/// that only `counter > last` passes. A rejected counter leaves the guard
/// untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayGuard {
    last: Option<u64>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// A guard that has already accepted `counter` (e.g. from a `hello`).
    pub fn seeded(counter: u64) -> Self {
        Self {
            last: Some(counter),
        }
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    /// Check `counter` without recording it.
    pub fn check(&self, counter: u64) -> Result<(), ProtocolError> {
        match self.last {
            Some(last) if counter <= last => Err(ProtocolError::StaleCounter {
                received: counter,
                last,
            }),
            _ => Ok(()),
        }
    }

    /// Check `counter` and record it as the new high-water mark.
    pub fn accept(&mut self, counter: u64) -> Result<(), ProtocolError> {
        self.check(counter)?;
        self.last = Some(counter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_counter_always_accepted() {
        let mut guard = ReplayGuard::new();
        assert!(guard.accept(17).is_ok());
        assert_eq!(guard.last(), Some(17));
    }

    #[test]
    fn equal_or_lower_is_stale() {
        let mut guard = ReplayGuard::seeded(4);
        for counter in [0, 3, 4] {
            assert!(matches!(
                guard.accept(counter),
                Err(ProtocolError::StaleCounter { last: 4, .. })
            ));
        }
        assert_eq!(guard.last(), Some(4));
    }

    #[test]
    fn next_counter_accepted() {
        let mut guard = ReplayGuard::seeded(4);
        assert!(guard.accept(5).is_ok());
        assert_eq!(guard.last(), Some(5));
        assert!(guard.accept(5).is_err());
    }

    #[test]
    fn gaps_are_allowed() {
        let mut guard = ReplayGuard::seeded(1);
        assert!(guard.accept(100).is_ok());
        assert!(guard.accept(2).is_err());
    }

    #[test]
    fn check_does_not_record() {
        let guard = ReplayGuard::seeded(1);
        assert!(guard.check(2).is_ok());
        assert_eq!(guard.last(), Some(1));
    }
}
