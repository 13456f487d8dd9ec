//! Process lifecycle of one tunnel run.

use tracing::debug;

use crate::{SshCoreError, SshResult};

/// `Init → Authenticated → Listening → (Accepting ⇄ Relaying)* → ShuttingDown → Terminated`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelState {
    Init,
    Authenticated,
    Listening,
    Accepting,
    Relaying,
    ShuttingDown,
    Terminated,
}

impl TunnelState {
    pub fn can_transition_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (Init, Authenticated)
                | (Authenticated, Listening)
                | (Listening, Accepting)
                | (Accepting, Relaying)
                | (Relaying, Accepting)
                | (Init | Authenticated | Listening | Accepting | Relaying, ShuttingDown)
                | (ShuttingDown, Terminated)
        )
    }
}

/// Tracks the current [`TunnelState`] and rejects transitions the lifecycle forbids.
#[derive(Debug)]
pub struct Lifecycle {
    current: TunnelState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            current: TunnelState::Init,
        }
    }

    pub fn current(&self) -> TunnelState {
        self.current
    }

    pub fn advance(&mut self, next: TunnelState) -> SshResult<()> {
        if !self.current.can_transition_to(next) {
            return Err(SshCoreError::InvalidTransition {
                from: self.current,
                to: next,
            });
        }
        debug!(from = ?self.current, to = ?next, "tunnel state");
        self.current = next;
        Ok(())
    }

    /// Move to `ShuttingDown` from wherever the run stopped. No-op once shutdown began.
    pub fn begin_shutdown(&mut self) {
        if matches!(self.current, TunnelState::ShuttingDown | TunnelState::Terminated) {
            return;
        }
        debug!(from = ?self.current, "tunnel shutting down");
        self.current = TunnelState::ShuttingDown;
    }
}
