//! Session Manager
//!
//! [`SessionManager`] is the entry point: it owns every session, the
//! Active-Session Slot and the recovery coordinator, and routes switch
//! requests through the FIFO queue to the switch engine.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use gpu_session::{HeadlessBinding, ManagerSettings, ResourceDescriptor, SessionConfig, SessionManager};
//!
//! let manager = SessionManager::new(HeadlessBinding::new(), ManagerSettings::default());
//! let a = manager.create_session(SessionConfig::labeled("editor"))?;
//! manager.switch_to(a)?;
//! let vertices = manager.register_resource(a, ResourceDescriptor::buffer(4096))?;
//! manager.submit(a, |device| device.submit(1))?;
//! ```
//!
//! # Locking
//!
//! All state sits behind one mutex. Switches and recoveries first wait for
//! their turn in the [`SwitchQueue`] and then hold the state lock for the
//! whole protocol, so no caller ever observes a half-finished switch.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::errors::{Result, SessionError, SwitchFailure};
use crate::gpu::GpuBinding;
use crate::recovery::RecoveryCoordinator;
use crate::resources::{ResourceDescriptor, ResourceHandle, ResourceMetadata};
use crate::session::{Session, SessionId, SessionInfo, SessionState};
use crate::settings::{ManagerSettings, SessionConfig};
use crate::switch::queue::TurnError;
use crate::switch::{CancelHandle, SwitchEngine, SwitchQueue, SwitchRequest, Ticket};

/// Everything guarded by the manager's lock.
pub(crate) struct ManagerState<D> {
    pub(crate) sessions: FxHashMap<SessionId, Session<D>>,
    /// The Active-Session Slot.
    pub(crate) active: Option<SessionId>,
    pub(crate) recovery: RecoveryCoordinator,
    last_id: u64,
}

impl<D> ManagerState<D> {
    fn new() -> Self {
        Self {
            sessions: FxHashMap::default(),
            active: None,
            recovery: RecoveryCoordinator::new(),
            last_id: 0,
        }
    }

    pub(crate) fn pump_losses(&mut self) -> usize {
        self.recovery.pump(&mut self.sessions, &mut self.active)
    }

    pub(crate) fn session(&self, id: SessionId) -> Result<&Session<D>> {
        self.sessions.get(&id).ok_or(SessionError::NotFound(id))
    }

    pub(crate) fn session_mut(&mut self, id: SessionId) -> Result<&mut Session<D>> {
        self.sessions.get_mut(&id).ok_or(SessionError::NotFound(id))
    }
}

/// Top-level registry of GPU sessions.
pub struct SessionManager<B: GpuBinding> {
    binding: B,
    settings: ManagerSettings,
    state: Mutex<ManagerState<B::Device>>,
    queue: Arc<SwitchQueue>,
}

impl<B: GpuBinding> SessionManager<B> {
    #[must_use]
    pub fn new(binding: B, settings: ManagerSettings) -> Self {
        log::debug!("Session manager created with {settings:?}");
        Self {
            binding,
            settings,
            state: Mutex::new(ManagerState::new()),
            queue: Arc::new(SwitchQueue::new()),
        }
    }

    #[inline]
    #[must_use]
    pub fn binding(&self) -> &B {
        &self.binding
    }

    #[inline]
    #[must_use]
    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Allocates a `Created` session. Does not activate it.
    pub fn create_session(&self, config: SessionConfig) -> Result<SessionId> {
        let mut state = self.state.lock();
        let limit = self.settings.max_sessions;
        if state.sessions.len() >= limit {
            return Err(SessionError::SessionLimitReached { limit });
        }

        state.last_id += 1;
        let id = SessionId::from_raw(state.last_id);
        let session = Session::new(id, config);
        log::info!("Created session {}", session.display_name());
        state.sessions.insert(id, session);
        Ok(id)
    }

    /// Destroys a session that is not active, releasing its device and
    /// resources. The id is never handed out again.
    pub fn destroy_session(&self, id: SessionId) -> Result<()> {
        let mut state = self.state.lock();
        state.pump_losses();
        if state.active == Some(id) {
            return Err(SessionError::SessionBusy(id));
        }

        let mut session = state.sessions.remove(&id).ok_or(SessionError::NotFound(id))?;
        state.recovery.forget(id);
        let device = session.destroy()?;
        if let Some(held) = device {
            self.binding.release_device(held.device);
        }
        log::info!("Destroyed session {}", session.display_name());
        Ok(())
    }

    // ========================================================================
    // Switching
    // ========================================================================

    /// Makes `id` the active session, suspending the current one.
    ///
    /// Blocks until earlier switches have finished.
    pub fn switch_to(&self, id: SessionId) -> Result<SessionId> {
        self.request_switch(id).wait()
    }

    /// Queues a switch without waiting for it. Run it with
    /// [`PendingSwitch::wait`]; cancel it with [`PendingSwitch::cancel`] or a
    /// [`CancelHandle`].
    pub fn request_switch(&self, id: SessionId) -> PendingSwitch<'_, B> {
        PendingSwitch {
            manager: self,
            ticket: self.queue.enqueue(),
            request: SwitchRequest::new(id),
            done: false,
        }
    }

    /// Drains and suspends the active session, leaving no session active.
    ///
    /// Returns the suspended session, or `None` if nothing was active.
    pub fn suspend_active(&self) -> Result<Option<SessionId>> {
        let ticket = self.queue.enqueue();
        let _turn = match self.queue.wait_turn(ticket, self.settings.switch_timeout) {
            Ok(turn) => turn,
            Err(e) => {
                return match self.active_session() {
                    Some(active) => Err(Self::turn_error(e, active)),
                    None => Ok(None),
                };
            }
        };
        let mut state = self.state.lock();
        SwitchEngine::new(&self.binding, &self.settings, &mut state).suspend_active()
    }

    fn run_switch(&self, ticket: Ticket, request: SwitchRequest) -> Result<SessionId> {
        let _turn = self
            .queue
            .wait_turn(ticket, self.settings.switch_timeout)
            .map_err(|e| Self::turn_error(e, request.target))?;
        let mut state = self.state.lock();
        let result =
            SwitchEngine::new(&self.binding, &self.settings, &mut state).switch_to(request.target);
        log::debug!(
            "Switch to session {} finished in {:?}",
            request.target,
            request.requested_at.elapsed()
        );
        result
    }

    fn turn_error(error: TurnError, target: SessionId) -> SessionError {
        match error {
            TurnError::Cancelled => SessionError::SwitchCancelled(target),
            TurnError::TimedOut(waited) => SessionError::SwitchFailed {
                target,
                reason: SwitchFailure::QueueTimeout(waited),
            },
        }
    }

    /// Read of the Active-Session Slot.
    ///
    /// Pending device-loss events are applied first, so a session whose device
    /// died is never reported as active.
    pub fn active_session(&self) -> Option<SessionId> {
        let mut state = self.state.lock();
        state.pump_losses();
        state.active
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Recovers an `Invalidated` session to `Created` at the next generation.
    /// A no-op for sessions that are not invalidated.
    pub fn recover(&self, id: SessionId) -> Result<()> {
        let ticket = self.queue.enqueue();
        let _turn = self
            .queue
            .wait_turn(ticket, self.settings.switch_timeout)
            .map_err(|e| Self::turn_error(e, id))?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.pump_losses();
        let session = state.sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        state
            .recovery
            .recover(&self.binding, session, self.settings.switch_timeout)
    }

    /// Applies queued device-loss events now. Returns how many sessions were
    /// invalidated.
    pub fn process_device_loss(&self) -> usize {
        self.state.lock().pump_losses()
    }

    /// Sessions invalidated by device loss and not yet recovered, in loss order.
    pub fn pending_recovery(&self) -> Vec<SessionId> {
        let mut state = self.state.lock();
        state.pump_losses();
        state.recovery.pending().to_vec()
    }

    // ========================================================================
    // Resources
    // ========================================================================

    pub fn register_resource(
        &self,
        id: SessionId,
        descriptor: ResourceDescriptor,
    ) -> Result<ResourceHandle> {
        let mut state = self.state.lock();
        state.pump_losses();
        let handle = state.session_mut(id)?.registry_mut().register(descriptor)?;
        log::trace!("Registered {handle}");
        Ok(handle)
    }

    pub fn lookup_resource(&self, handle: ResourceHandle) -> Result<ResourceMetadata> {
        let mut state = self.state.lock();
        state.pump_losses();
        state
            .session(handle.session())?
            .registry()
            .lookup(handle)
            .cloned()
    }

    pub fn release_resource(&self, handle: ResourceHandle) -> Result<ResourceMetadata> {
        let mut state = self.state.lock();
        state.pump_losses();
        state
            .session_mut(handle.session())?
            .registry_mut()
            .release(handle)
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Runs `work` against the session's device, only if the session owns the
    /// GPU right now.
    pub fn submit<R>(&self, id: SessionId, work: impl FnOnce(&B::Device) -> R) -> Result<R> {
        let mut state = self.state.lock();
        state.pump_losses();
        let active = state.active;
        let session = state.session(id)?;
        if session.state() == SessionState::Invalidated {
            return Err(SessionError::SessionInvalidated(id));
        }
        if active != Some(id) {
            return Err(SessionError::NotActive(id));
        }
        let device = session.device().ok_or(SessionError::NotActive(id))?;
        Ok(work(device))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn session_state(&self, id: SessionId) -> Result<SessionState> {
        let mut state = self.state.lock();
        state.pump_losses();
        Ok(state.session(id)?.state())
    }

    pub fn session_info(&self, id: SessionId) -> Result<SessionInfo> {
        let mut state = self.state.lock();
        state.pump_losses();
        Ok(state.session(id)?.info())
    }

    /// Consistent snapshot of every live session, taken under one lock.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut state = self.state.lock();
        state.pump_losses();
        let mut infos: Vec<_> = state.sessions.values().map(Session::info).collect();
        infos.sort_unstable_by_key(|info| info.id);
        infos
    }

    /// Ids of all live sessions, ascending.
    pub fn session_ids(&self) -> Vec<SessionId> {
        let state = self.state.lock();
        let mut ids: Vec<_> = state.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Switch requests queued and not yet started.
    pub fn queued_switches(&self) -> usize {
        self.queue.waiting()
    }
}

impl<B: GpuBinding> Drop for SessionManager<B> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.active = None;
        for (_, mut session) in state.sessions.drain() {
            if let Ok(Some(held)) = session.destroy() {
                self.binding.release_device(held.device);
            }
        }
    }
}

/// A queued switch request.
///
/// Dropping it without calling [`wait`](Self::wait) cancels the request.
pub struct PendingSwitch<'a, B: GpuBinding> {
    manager: &'a SessionManager<B>,
    ticket: Ticket,
    request: SwitchRequest,
    done: bool,
}

impl<B: GpuBinding> PendingSwitch<'_, B> {
    #[must_use]
    pub fn request(&self) -> &SwitchRequest {
        &self.request
    }

    /// A handle that can cancel this request from another thread.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(
            Arc::clone(&self.manager.queue),
            self.ticket,
            self.request.target,
        )
    }

    /// Waits for this request's turn and runs the switch.
    pub fn wait(mut self) -> Result<SessionId> {
        self.done = true;
        self.manager.run_switch(self.ticket, self.request)
    }

    /// Withdraws the request before it starts.
    pub fn cancel(mut self) -> Result<()> {
        self.done = true;
        self.cancel_handle().cancel()?;
        self.manager.queue.forget(self.ticket);
        Ok(())
    }
}

impl<B: GpuBinding> Drop for PendingSwitch<'_, B> {
    fn drop(&mut self) {
        if !self.done {
            self.manager.queue.forget(self.ticket);
        }
    }
}
