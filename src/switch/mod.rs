//! Context Switch Engine
//!
//! Moves GPU ownership from one session to another. The protocol for
//! `switch_to(target)`:
//!
//! 1. Target already active: no-op, no drain.
//! 2. Drain the active session's queue (`flush_and_wait`). A timeout fails the
//!    switch with nothing changed.
//! 3. Mark the outgoing session `Suspended`. Its device stays in place until
//!    commit so a rollback never needs a GPU call.
//! 4. Activate the target, recovering it first if it is `Invalidated`. A
//!    device loss during activation triggers one recovery and one retry.
//! 5. Commit: publish the target in the Active-Session Slot and apply the
//!    suspend policy to the outgoing device. On failure the outgoing session
//!    goes back to `Active` and the slot is untouched.
//!
//! Switches are serialized through a FIFO [`SwitchQueue`]. A request that has
//! not started yet can be cancelled; a running one cannot.

pub(crate) mod engine;
pub mod queue;

pub(crate) use engine::SwitchEngine;
pub use queue::{SwitchQueue, Ticket};

use std::sync::Arc;
use std::time::Instant;

use crate::errors::{Result, SessionError};
use crate::session::SessionId;

/// A queued request to make `target` the active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchRequest {
    pub target: SessionId,
    pub requested_at: Instant,
}

impl SwitchRequest {
    #[must_use]
    pub fn new(target: SessionId) -> Self {
        Self {
            target,
            requested_at: Instant::now(),
        }
    }
}

/// Cancels one queued switch from any thread.
#[derive(Clone)]
pub struct CancelHandle {
    queue: Arc<SwitchQueue>,
    ticket: Ticket,
    target: SessionId,
}

impl CancelHandle {
    pub(crate) fn new(queue: Arc<SwitchQueue>, ticket: Ticket, target: SessionId) -> Self {
        Self {
            queue,
            ticket,
            target,
        }
    }

    /// Withdraws the request if it has not started.
    ///
    /// Fails with [`SessionError::SwitchAlreadyStarted`] once the switch is
    /// running or finished.
    pub fn cancel(&self) -> Result<()> {
        self.queue
            .cancel(self.ticket)
            .map_err(|_| SessionError::SwitchAlreadyStarted(self.target))
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("ticket", &self.ticket)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}
