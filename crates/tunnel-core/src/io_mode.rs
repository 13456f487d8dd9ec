//! Session-wide blocking mode.
//!
//! The secure session exposes a single blocking flag shared by its listener and
//! every channel. A relay session switches it to non-blocking for its whole
//! lifetime through [`IoMode::enter_non_blocking`]; the returned
//! [`NonBlockingScope`] puts the session back into blocking mode when it is
//! exited or dropped, so no exit path can leave the flag flipped.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use tracing::trace;

use crate::{SshCoreError, SshResult};

#[derive(Debug)]
struct ModeState {
    blocking: AtomicBool,
    scoped: AtomicBool,
    restores: AtomicUsize,
}

/// Shared handle to a session's blocking flag. Starts out blocking.
#[derive(Clone, Debug)]
pub struct IoMode {
    state: Arc<ModeState>,
}

impl Default for IoMode {
    fn default() -> Self {
        Self::new()
    }
}

impl IoMode {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ModeState {
                blocking: AtomicBool::new(true),
                scoped: AtomicBool::new(false),
                restores: AtomicUsize::new(0),
            }),
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.state.blocking.load(Ordering::Acquire)
    }

    /// Flip the flag directly. Prefer [`IoMode::enter_non_blocking`] inside relays.
    pub fn set_blocking(&self, blocking: bool) {
        self.state.blocking.store(blocking, Ordering::Release);
        trace!(blocking, "secure session blocking mode changed");
    }

    /// Switch to non-blocking mode until the returned scope ends.
    ///
    /// Only one scope may be active per session.
    pub fn enter_non_blocking(&self) -> SshResult<NonBlockingScope> {
        self.state
            .scoped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SshCoreError::NonBlockingScopeActive)?;
        self.set_blocking(false);
        Ok(NonBlockingScope {
            mode: self.clone(),
            active: true,
        })
    }

    /// Whether a non-blocking scope is currently held.
    pub fn in_scope(&self) -> bool {
        self.state.scoped.load(Ordering::Acquire)
    }

    /// Number of times a scope has restored blocking mode.
    pub fn restore_count(&self) -> usize {
        self.state.restores.load(Ordering::Acquire)
    }

    /// True when both handles refer to the same session flag.
    pub fn same_session(&self, other: &IoMode) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

/// Capability token for a non-blocking section; restores blocking mode on exit.
#[derive(Debug)]
#[must_use = "dropping the scope immediately restores blocking mode"]
pub struct NonBlockingScope {
    mode: IoMode,
    active: bool,
}

impl NonBlockingScope {
    pub fn mode(&self) -> &IoMode {
        &self.mode
    }

    /// Leave the scope and put the session back into blocking mode.
    pub fn exit(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.mode.set_blocking(true);
        self.mode.state.restores.fetch_add(1, Ordering::AcqRel);
        self.mode.state.scoped.store(false, Ordering::Release);
    }
}

impl Drop for NonBlockingScope {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
#[path = "io_mode_tests.rs"]
mod tests;
