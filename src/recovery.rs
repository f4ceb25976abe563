//! Recovery Coordinator
//!
//! GPU bindings report device loss asynchronously. Instead of acting on those
//! callbacks directly, bindings post a [`DeviceLossEvent`] into a channel and
//! the coordinator consumes the channel at well-defined points (the start of
//! a switch, an explicit `recover`, state queries). This keeps every lifecycle
//! transition on the thread that holds the manager's lock.
//!
//! A loss for session S:
//! 1. marks S `Invalidated` and retires its registry,
//! 2. clears the Active-Session Slot if S was active,
//! 3. queues S for lazy recovery.
//!
//! Recovery is never automatic. It runs on the next `switch_to(S)` or an
//! explicit `recover(S)`, since adapters are often briefly unavailable right
//! after a loss.

use std::fmt;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::errors::{Result, SessionError};
use crate::gpu::{AcquireError, DeviceLease, DeviceRequest, GpuBinding};
use crate::session::{Session, SessionId, SessionState};

/// Why a device went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceLossReason {
    /// Driver reset, adapter removal, or anything the API does not classify.
    Unknown,
    /// The device was destroyed while its session still held it.
    Destroyed,
}

/// A device-loss notification delivered by a binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLossEvent {
    pub session: SessionId,
    pub lease: DeviceLease,
    pub reason: DeviceLossReason,
    pub message: String,
}

/// Sending half of the loss channel, pre-tagged with the session and lease of
/// one device acquisition.
#[derive(Clone)]
pub struct DeviceLossSink {
    session: SessionId,
    lease: DeviceLease,
    sender: flume::Sender<DeviceLossEvent>,
}

impl DeviceLossSink {
    #[inline]
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    #[inline]
    #[must_use]
    pub fn lease(&self) -> DeviceLease {
        self.lease
    }

    /// Posts a loss event. Returns `false` if the manager is gone.
    pub fn report(&self, reason: DeviceLossReason, message: impl Into<String>) -> bool {
        self.sender
            .send(DeviceLossEvent {
                session: self.session,
                lease: self.lease,
                reason,
                message: message.into(),
            })
            .is_ok()
    }
}

impl fmt::Debug for DeviceLossSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLossSink")
            .field("session", &self.session)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

/// Consumes loss events and drives lazy recovery.
pub struct RecoveryCoordinator {
    sender: flume::Sender<DeviceLossEvent>,
    receiver: flume::Receiver<DeviceLossEvent>,
    /// Sessions awaiting recovery, in loss order.
    pending: Vec<SessionId>,
}

impl Default for RecoveryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryCoordinator {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            sender,
            receiver,
            pending: Vec::new(),
        }
    }

    #[must_use]
    pub fn sink_for(&self, session: SessionId, lease: DeviceLease) -> DeviceLossSink {
        DeviceLossSink {
            session,
            lease,
            sender: self.sender.clone(),
        }
    }

    #[inline]
    #[must_use]
    pub fn pending(&self) -> &[SessionId] {
        &self.pending
    }

    #[inline]
    #[must_use]
    pub fn is_pending(&self, id: SessionId) -> bool {
        self.pending.contains(&id)
    }

    pub(crate) fn forget(&mut self, id: SessionId) {
        self.pending.retain(|&p| p != id);
    }

    fn enqueue(&mut self, id: SessionId) {
        if !self.is_pending(id) {
            self.pending.push(id);
        }
    }

    /// Builds a device request for `session` with a fresh lease and sink.
    pub(crate) fn device_request<D>(
        &self,
        session: &Session<D>,
        generation: crate::session::Generation,
        timeout: Duration,
    ) -> DeviceRequest {
        let lease = DeviceLease::next();
        DeviceRequest {
            session: session.id(),
            generation,
            lease,
            label: session.config().label.clone(),
            adapter: session.config().adapter,
            timeout,
            loss_sink: self.sink_for(session.id(), lease),
        }
    }

    /// Applies every queued loss event. Returns the number of sessions that
    /// were invalidated.
    pub(crate) fn pump<D>(
        &mut self,
        sessions: &mut FxHashMap<SessionId, Session<D>>,
        active: &mut Option<SessionId>,
    ) -> usize {
        let events: Vec<_> = self.receiver.try_iter().collect();
        let mut invalidated = 0;
        for event in events {
            let Some(session) = sessions.get_mut(&event.session) else {
                log::trace!("Dropping loss event for unknown session {}", event.session);
                continue;
            };
            if session.lease() != Some(event.lease) {
                log::trace!(
                    "Ignoring loss of {} on session {}: no longer held",
                    event.lease,
                    event.session
                );
                continue;
            }
            log::debug!(
                "Loss of {} on session {} ({:?})",
                event.lease,
                event.session,
                event.reason
            );
            if self.apply_loss(session, active, &event.message) {
                invalidated += 1;
            }
        }
        invalidated
    }

    /// Invalidates `session` after its current device was lost.
    ///
    /// Returns `true` if the session moved to `Invalidated`. A `Created`
    /// session holding a pre-acquired device only loses that device.
    pub(crate) fn apply_loss<D>(
        &mut self,
        session: &mut Session<D>,
        active: &mut Option<SessionId>,
        message: &str,
    ) -> bool {
        match session.state() {
            SessionState::Active | SessionState::Suspended => {
                let id = session.id();
                match session.invalidate() {
                    Ok(lost) => drop(lost),
                    Err(e) => {
                        log::error!("Failed to invalidate session {id}: {e}");
                        return false;
                    }
                }
                if *active == Some(id) {
                    *active = None;
                }
                log::warn!(
                    "Device lost on session {}: {message}; queued for recovery",
                    session.display_name()
                );
                self.enqueue(id);
                true
            }
            SessionState::Created => {
                drop(session.take_device());
                log::warn!(
                    "Pre-acquired device of session {} lost: {message}",
                    session.display_name()
                );
                false
            }
            SessionState::Invalidated | SessionState::Destroyed => false,
        }
    }

    /// `Invalidated -> Created` with a new device and generation.
    ///
    /// No-op for sessions that are not invalidated. On failure the session
    /// stays `Invalidated` and remains queued; a missing adapter is reported
    /// as `AdapterUnavailable`, anything else as `AcquisitionFailed`.
    pub(crate) fn recover<B: GpuBinding>(
        &mut self,
        binding: &B,
        session: &mut Session<B::Device>,
        timeout: Duration,
    ) -> Result<()> {
        if session.state() != SessionState::Invalidated {
            log::debug!(
                "Session {} is {:?}; nothing to recover",
                session.id(),
                session.state()
            );
            return Ok(());
        }

        let generation = session.generation().next();
        let request = self.device_request(session, generation, timeout);
        let lease = request.lease;
        match binding.acquire_device(&request) {
            Ok(device) => {
                session.revive(device, lease)?;
                self.forget(session.id());
                log::info!(
                    "Recovered session {} at {}",
                    session.display_name(),
                    session.generation()
                );
                Ok(())
            }
            Err(err) => {
                self.enqueue(session.id());
                log::error!("Recovery of session {} failed: {err}", session.display_name());
                Err(match err {
                    AcquireError::AdapterUnavailable(msg) => SessionError::AdapterUnavailable(msg),
                    cause => SessionError::AcquisitionFailed {
                        session: session.id(),
                        cause,
                    },
                })
            }
        }
    }
}
