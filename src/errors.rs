//! Error Types
//!
//! This module defines the error types used throughout the crate.
//!
//! # Overview
//!
//! The main error type [`SessionError`] covers all failure modes including:
//! - Unknown sessions and resource handles
//! - Generation mismatches on retained handles
//! - Lifecycle conflicts (destroying the active session, illegal transitions)
//! - GPU-layer failures surfaced by the switch protocol
//!
//! Nothing here is fatal to the process. Device loss affects only the owning
//! session, and every switch failure leaves sessions in a well-defined state.
//!
//! ```rust,ignore
//! use gpu_session::errors::{Result, SessionError};
//!
//! fn activate(manager: &SessionManager<HeadlessBinding>, id: SessionId) -> Result<()> {
//!     match manager.switch_to(id) {
//!         Err(SessionError::SwitchFailed { reason, .. }) => log::warn!("{reason}"),
//!         other => { other?; }
//!     }
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::gpu::AcquireError;
use crate::resources::ResourceHandle;
use crate::session::{SessionId, SessionState};

/// The main error type for session management.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    // ========================================================================
    // Lookup Errors
    // ========================================================================
    /// No live session carries this id.
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    /// The handle's slot is unknown or was already released.
    #[error("Resource not found: {0}")]
    ResourceNotFound(ResourceHandle),

    /// The handle was issued for an older generation of its session.
    #[error("Stale handle {handle}: session is at generation {current}")]
    StaleHandle {
        /// The rejected handle
        handle: ResourceHandle,
        /// Generation the session is currently at
        current: u32,
    },

    /// The handle belongs to a different session than the registry it was used with.
    #[error("Handle {handle} does not belong to session {registry}")]
    ForeignHandle {
        handle: ResourceHandle,
        registry: SessionId,
    },

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// The session is active and must be switched away from first.
    #[error("Session {0} is active; switch away before destroying it")]
    SessionBusy(SessionId),

    /// The manager already holds `max_sessions` live sessions.
    #[error("Session limit reached ({limit} live sessions)")]
    SessionLimitReached { limit: usize },

    /// Work was submitted against a session that does not own the GPU.
    #[error("Session {0} is not the active session")]
    NotActive(SessionId),

    /// The lifecycle state machine rejected a transition.
    #[error("Session {id}: illegal transition {from:?} -> {to:?}")]
    InvalidTransition {
        id: SessionId,
        from: SessionState,
        to: SessionState,
    },

    /// The session lost its device and has not been recovered yet.
    #[error("Session {0} is invalidated; recover it before use")]
    SessionInvalidated(SessionId),

    // ========================================================================
    // GPU & Switch Errors
    // ========================================================================
    /// A switch could not complete. Sessions were rolled back.
    #[error("Switch to session {target} failed: {reason}")]
    SwitchFailed {
        target: SessionId,
        reason: SwitchFailure,
    },

    /// No adapter can currently back the session. Retry later.
    #[error("No GPU adapter available: {0}")]
    AdapterUnavailable(String),

    /// An adapter was found but the session's device could not be created.
    #[error("Session {session}: {cause}")]
    AcquisitionFailed {
        session: SessionId,
        cause: AcquireError,
    },

    /// A queued switch was cancelled before it started.
    #[error("Switch to session {0} was cancelled")]
    SwitchCancelled(SessionId),

    /// Cancellation came too late; the switch had already started.
    #[error("Switch to session {0} already started and cannot be cancelled")]
    SwitchAlreadyStarted(SessionId),
}

/// Cause attached to [`SessionError::SwitchFailed`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SwitchFailure {
    /// The outgoing session's queue did not drain in time.
    #[error("queue drain of session {session} exceeded {timeout:?}")]
    DrainTimeout {
        session: SessionId,
        timeout: Duration,
    },

    /// The target could not acquire or resume its device.
    #[error("activation failed: {0}")]
    ActivationFailed(String),

    /// The target's device was lost again after the single recovery retry.
    #[error("device lost on session {session}: {message}")]
    DeviceLost { session: SessionId, message: String },

    /// An earlier switch held the queue longer than the configured timeout.
    #[error("waited {0:?} for an in-progress switch")]
    QueueTimeout(Duration),
}

impl SessionError {
    /// Returns `true` for failures the caller may retry without changing its own state.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SessionBusy(_)
                | Self::AdapterUnavailable(_)
                | Self::AcquisitionFailed {
                    cause: AcquireError::Timeout(_),
                    ..
                }
                | Self::SwitchFailed { .. }
                | Self::SessionLimitReached { .. }
        )
    }

    /// Returns `true` when the error is a generation mismatch on a handle.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleHandle { .. })
    }
}

/// Alias for `Result<T, SessionError>`.
pub type Result<T> = std::result::Result<T, SessionError>;
