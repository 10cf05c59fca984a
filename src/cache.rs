use crate::error::{LayerwiseError, Result};

/// Last-in-first-out store of forward-time state.
///
/// Every forward call of a stateful operator pushes one entry and every
/// backward call pops the most recent one, so an operator can be applied
/// several times (weight sharing, unrolled loops) before its gradients are
/// collected, provided the backward calls come in the reverse order.
#[derive(Debug, Clone)]
pub struct CacheStack<T> {
    entries: Vec<T>,
}

impl<T> CacheStack<T> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: T) {
        self.entries.push(entry);
    }

    /// Take the most recently pushed entry.
    ///
    /// # Errors
    /// `CacheUnderflow` naming `operator` when nothing is pending.
    pub fn pop(&mut self, operator: &str) -> Result<T> {
        self.entries
            .pop()
            .ok_or_else(|| LayerwiseError::CacheUnderflow {
                operator: operator.to_string(),
            })
    }

    pub fn peek(&self) -> Option<&T> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T> Default for CacheStack<T> {
    fn default() -> Self {
        Self::new()
    }
}
