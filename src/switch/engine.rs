use crate::errors::{Result, SessionError, SwitchFailure};
use crate::gpu::{AcquireError, DrainError, GpuBinding};
use crate::manager::ManagerState;
use crate::session::{SessionId, SessionState};
use crate::settings::ManagerSettings;

/// What happened to the outgoing session during step 2.
enum Outgoing {
    /// Nothing was active.
    None,
    /// Drained and marked `Suspended`; device release is deferred to commit.
    Suspended(SessionId),
    /// Its device died during the drain; it is `Invalidated` now.
    Lost,
}

/// Runs the switch protocol against the manager state.
///
/// The engine is built for one operation while the caller holds both the
/// switch-queue turn and the state lock. It is the only writer of session
/// lifecycle state apart from the recovery coordinator.
pub(crate) struct SwitchEngine<'a, B: GpuBinding> {
    binding: &'a B,
    settings: &'a ManagerSettings,
    state: &'a mut ManagerState<B::Device>,
}

impl<'a, B: GpuBinding> SwitchEngine<'a, B> {
    pub(crate) fn new(
        binding: &'a B,
        settings: &'a ManagerSettings,
        state: &'a mut ManagerState<B::Device>,
    ) -> Self {
        Self {
            binding,
            settings,
            state,
        }
    }

    /// Makes `target` the active session.
    pub(crate) fn switch_to(&mut self, target: SessionId) -> Result<SessionId> {
        self.state.pump_losses();
        self.state.session(target)?;

        if self.state.active == Some(target) {
            log::debug!("Session {target} is already active");
            return Ok(target);
        }

        let outgoing = self.drain_and_suspend(target)?;

        match self.activate(target) {
            Ok(()) => {
                self.commit(target, &outgoing);
                Ok(target)
            }
            Err(reason) => {
                self.rollback(&outgoing);
                log::warn!("Switch to session {target} rolled back: {reason}");
                Err(SessionError::SwitchFailed { target, reason })
            }
        }
    }

    /// Drains and suspends the active session, clearing the slot.
    ///
    /// Returns the suspended session, or `None` if nothing was active or the
    /// active session lost its device during the drain.
    pub(crate) fn suspend_active(&mut self) -> Result<Option<SessionId>> {
        self.state.pump_losses();
        let Some(id) = self.state.active else {
            return Ok(None);
        };

        match self.drain_and_suspend(id)? {
            Outgoing::Suspended(id) => {
                self.apply_suspend_policy(id);
                self.state.active = None;
                log::info!("Suspended session {id}");
                Ok(Some(id))
            }
            Outgoing::Lost | Outgoing::None => Ok(None),
        }
    }

    // ------------------------------------------------------------------------
    // Protocol steps
    // ------------------------------------------------------------------------

    /// Steps 2-3: drain the active session's queue, then mark it `Suspended`.
    ///
    /// A drain timeout fails the whole operation before anything changed.
    fn drain_and_suspend(&mut self, target: SessionId) -> Result<Outgoing> {
        let Some(out_id) = self.state.active else {
            return Ok(Outgoing::None);
        };
        let timeout = self.settings.switch_timeout;
        let session = self.state.session_mut(out_id)?;

        let drained = match session.device() {
            Some(device) => self.binding.flush_and_wait(device, timeout),
            None => Ok(()),
        };

        match drained {
            Ok(()) => {
                log::debug!("Drained session {out_id}");
                session.transition(SessionState::Suspended)?;
                Ok(Outgoing::Suspended(out_id))
            }
            Err(DrainError::Timeout(waited)) => {
                log::warn!("Drain of session {out_id} timed out after {waited:?}");
                Err(SessionError::SwitchFailed {
                    target,
                    reason: SwitchFailure::DrainTimeout {
                        session: out_id,
                        timeout,
                    },
                })
            }
            Err(DrainError::DeviceLost(message)) => {
                let state = &mut *self.state;
                if let Some(session) = state.sessions.get_mut(&out_id) {
                    state.recovery.apply_loss(session, &mut state.active, &message);
                }
                Ok(Outgoing::Lost)
            }
        }
    }

    /// Step 4: `Created|Suspended|Invalidated -> Active` for the target.
    ///
    /// A device loss while bringing the device up is routed through the
    /// recovery coordinator and the activation is retried exactly once.
    fn activate(&mut self, target: SessionId) -> std::result::Result<(), SwitchFailure> {
        if self.target_state(target) == SessionState::Invalidated {
            self.recover(target)?;
        }

        match self.bring_up(target) {
            Ok(()) => {}
            Err(AcquireError::DeviceLost(message)) => {
                log::warn!("Session {target} lost its device during activation: {message}; recovering");
                self.route_loss(target, &message);
                if self.target_state(target) == SessionState::Invalidated {
                    self.recover(target)?;
                }
                match self.bring_up(target) {
                    Ok(()) => {}
                    Err(AcquireError::DeviceLost(message)) => {
                        self.route_loss(target, &message);
                        return Err(SwitchFailure::DeviceLost {
                            session: target,
                            message,
                        });
                    }
                    Err(other) => return Err(SwitchFailure::ActivationFailed(other.to_string())),
                }
            }
            Err(other) => return Err(SwitchFailure::ActivationFailed(other.to_string())),
        }

        let session = self
            .state
            .session_mut(target)
            .map_err(|e| SwitchFailure::ActivationFailed(e.to_string()))?;
        session
            .transition(SessionState::Active)
            .map_err(|e| SwitchFailure::ActivationFailed(e.to_string()))?;
        session.record_activation();
        Ok(())
    }

    /// Acquires a device for the target, or verifies the one it already holds.
    fn bring_up(&mut self, target: SessionId) -> std::result::Result<(), AcquireError> {
        let timeout = self.settings.switch_timeout;
        let state = &mut *self.state;
        let session = state
            .sessions
            .get_mut(&target)
            .ok_or_else(|| AcquireError::Failed(format!("session {target} vanished")))?;

        if let Some(device) = session.device() {
            return self.binding.resume_device(device);
        }

        let request = state
            .recovery
            .device_request(session, session.generation(), timeout);
        let device = self.binding.acquire_device(&request)?;
        session.install_device(device, request.lease);
        log::debug!("Session {target}: acquired device {}", request.lease);
        Ok(())
    }

    fn recover(&mut self, target: SessionId) -> std::result::Result<(), SwitchFailure> {
        let timeout = self.settings.switch_timeout;
        let state = &mut *self.state;
        let session = state
            .sessions
            .get_mut(&target)
            .ok_or_else(|| SwitchFailure::ActivationFailed(format!("session {target} vanished")))?;
        state
            .recovery
            .recover(self.binding, session, timeout)
            .map_err(|e| SwitchFailure::ActivationFailed(e.to_string()))
    }

    fn route_loss(&mut self, target: SessionId, message: &str) {
        let state = &mut *self.state;
        if let Some(session) = state.sessions.get_mut(&target) {
            state.recovery.apply_loss(session, &mut state.active, message);
        }
    }

    fn target_state(&self, target: SessionId) -> SessionState {
        self.state
            .sessions
            .get(&target)
            .map_or(SessionState::Destroyed, |s| s.state())
    }

    // ------------------------------------------------------------------------
    // Commit / rollback
    // ------------------------------------------------------------------------

    /// Step 5: publish the new active session and apply the suspend policy.
    fn commit(&mut self, target: SessionId, outgoing: &Outgoing) {
        self.state.active = Some(target);
        if let Outgoing::Suspended(out_id) = *outgoing {
            self.apply_suspend_policy(out_id);
            log::info!("Switched session {out_id} -> {target}");
        } else {
            log::info!("Activated session {target}");
        }
    }

    /// Puts the outgoing session back to `Active`. Its device was never
    /// released, so this cannot fail on the GPU side.
    fn rollback(&mut self, outgoing: &Outgoing) {
        let Outgoing::Suspended(out_id) = *outgoing else {
            return;
        };
        if let Some(session) = self.state.sessions.get_mut(&out_id) {
            if let Err(e) = session.transition(SessionState::Active) {
                log::error!("Rollback of session {out_id} failed: {e}");
            }
        }
    }

    fn apply_suspend_policy(&mut self, id: SessionId) {
        if !self.settings.suspend_policy.releases_device() {
            return;
        }
        let Some(session) = self.state.sessions.get_mut(&id) else {
            return;
        };
        if let Some(held) = session.take_device() {
            log::debug!("Session {id}: releasing device {} on suspend", held.lease);
            self.binding.release_device(held.device);
        }
    }
}
