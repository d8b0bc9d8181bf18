//! Resolve-once outcome cell.

use once_cell::sync::OnceCell;

/// Holds the outcome of a request. The first `settle` wins; later ones are
/// rejected and handed back.
#[derive(Debug)]
pub struct OutcomeLatch<T> {
    cell: OnceCell<T>,
}

impl<T> Default for OutcomeLatch<T> {
    fn default() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }
}

impl<T> OutcomeLatch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settle(&self, outcome: T) -> Result<(), T> {
        self.cell.set(outcome)
    }

    /// Take the settled outcome out, leaving the latch empty.
    pub fn take(&mut self) -> Option<T> {
        self.cell.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_settle_wins() {
        let mut latch = OutcomeLatch::new();
        assert!(latch.settle("response").is_ok());
        assert_eq!(latch.settle("error"), Err("error"));
        assert_eq!(latch.take(), Some("response"));
        assert_eq!(latch.take(), None);
    }

    #[test]
    fn test_unsettled() {
        let mut latch: OutcomeLatch<u8> = OutcomeLatch::new();
        assert_eq!(latch.take(), None);
    }
}
