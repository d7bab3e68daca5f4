//! Once-only terminal cell. Producers publish items first, then the
//! terminal; drains read it only after seeing their queue empty.
use std::sync::OnceLock;

use crate::error::FlowError;
use crate::hooks;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Terminal {
    Complete,
    Errored(FlowError),
}

pub(crate) struct TerminalLatch {
    cell: OnceLock<Terminal>,
}

impl TerminalLatch {
    pub(crate) fn new() -> Self {
        TerminalLatch {
            cell: OnceLock::new(),
        }
    }

    /// Publish completion. Returns false if a terminal was already set.
    pub(crate) fn complete(&self) -> bool {
        self.cell.set(Terminal::Complete).is_ok()
    }

    /// Publish an error. An error losing the race is routed to the
    /// process-wide late-error hook so it is never silently dropped.
    pub(crate) fn error(&self, error: FlowError) -> bool {
        match self.cell.set(Terminal::Errored(error)) {
            Ok(()) => true,
            Err(Terminal::Errored(late)) => {
                hooks::late_error(&late);
                false
            }
            Err(Terminal::Complete) => false,
        }
    }

    pub(crate) fn get(&self) -> Option<&Terminal> {
        self.cell.get()
    }

    pub(crate) fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_terminal_wins() {
        let latch = TerminalLatch::new();
        assert!(latch.complete());
        assert!(!latch.error(FlowError::MissingBackpressure));
        assert_eq!(latch.get(), Some(&Terminal::Complete));
    }

    #[test]
    fn error_before_complete_sticks() {
        let latch = TerminalLatch::new();
        assert!(latch.error(FlowError::MissingBackpressure));
        assert!(!latch.complete());
        assert_eq!(
            latch.get(),
            Some(&Terminal::Errored(FlowError::MissingBackpressure))
        );
    }
}
