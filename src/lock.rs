/*! Per terminal mutual exclusion. */

use crate::TerminalId;
use rustc_hash::FxHashSet as HashSet;
use std::sync::{Arc, Mutex};

/// A registry of the terminals that are currently being processed.
///
/// Clones share the same registry, so hand a clone to every engine that might touch the same
/// terminals.
#[derive(Debug, Clone, Default)]
pub struct TerminalLocks(Arc<Mutex<HashSet<TerminalId>>>);

impl TerminalLocks {
    /// Create a new, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a terminal, or `None` if someone else already has it.
    ///
    /// The claim is released when the returned guard is dropped.
    pub fn try_lock(&self, terminal: TerminalId) -> Option<TerminalGuard> {
        let mut held = match self.0.lock() {
            Ok(held) => held,
            // A panic while holding the lock can't leave the set half updated.
            Err(poisoned) => poisoned.into_inner(),
        };

        if held.insert(terminal) {
            Some(TerminalGuard {
                locks: self.clone(),
                terminal,
            })
        } else {
            None
        }
    }
}

/// Holds a terminal claimed until dropped.
#[derive(Debug)]
pub struct TerminalGuard {
    locks: TerminalLocks,
    terminal: TerminalId,
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let mut held = match self.locks.0.lock() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };

        held.remove(&self.terminal);
    }
}
