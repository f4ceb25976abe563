//! Sessions
//!
//! A [`Session`] bundles one rendering context: the device it holds (if any),
//! its [`ResourceRegistry`], its lifecycle [`SessionState`] and its
//! [`Generation`]. A session has no visibility into its siblings; the
//! one-active-session rule is enforced by the switch engine.
//!
//! All state changes go through [`Session::transition`], which validates them
//! against the lifecycle table in [`SessionState::can_transition_to`].

mod state;

pub use state::SessionState;

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SessionError};
use crate::gpu::DeviceLease;
use crate::resources::ResourceRegistry;
use crate::settings::SessionConfig;

/// Opaque session identifier. Never reused within a manager's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Recovery counter of a session; scopes resource handle validity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Generation(u32);

impl Generation {
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// A device currently owned by a session, with the lease it was acquired under.
pub(crate) struct HeldDevice<D> {
    pub device: D,
    pub lease: DeviceLease,
}

/// Point-in-time view of a session, safe to hand out across the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub label: Option<String>,
    pub state: SessionState,
    pub generation: Generation,
    /// Whether a device is held right now (active, parked, or pre-acquired).
    pub holds_device: bool,
    pub resource_count: usize,
    pub resource_bytes: u64,
    /// How many times the session has been made active.
    pub activations: u64,
    pub created_at: Instant,
}

/// One isolated rendering context.
pub struct Session<D> {
    id: SessionId,
    config: SessionConfig,
    state: SessionState,
    generation: Generation,
    device: Option<HeldDevice<D>>,
    registry: ResourceRegistry,
    activations: u64,
    created_at: Instant,
}

impl<D> Session<D> {
    pub(crate) fn new(id: SessionId, config: SessionConfig) -> Self {
        let generation = Generation::default();
        Self {
            id,
            config,
            state: SessionState::Created,
            generation,
            device: None,
            registry: ResourceRegistry::new(id, generation),
            activations: 0,
            created_at: Instant::now(),
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    #[inline]
    pub(crate) fn registry_mut(&mut self) -> &mut ResourceRegistry {
        &mut self.registry
    }

    /// Label for log lines: the configured label, or the numeric id.
    pub(crate) fn display_name(&self) -> String {
        match &self.config.label {
            Some(label) => format!("{} ({label})", self.id),
            None => self.id.to_string(),
        }
    }

    #[inline]
    pub(crate) fn device(&self) -> Option<&D> {
        self.device.as_ref().map(|held| &held.device)
    }

    #[inline]
    pub(crate) fn lease(&self) -> Option<DeviceLease> {
        self.device.as_ref().map(|held| held.lease)
    }

    pub(crate) fn install_device(&mut self, device: D, lease: DeviceLease) {
        debug_assert!(self.device.is_none(), "session already holds a device");
        self.device = Some(HeldDevice { device, lease });
    }

    pub(crate) fn take_device(&mut self) -> Option<HeldDevice<D>> {
        self.device.take()
    }

    /// Moves the session to `to`, rejecting transitions the lifecycle forbids.
    pub(crate) fn transition(&mut self, to: SessionState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(SessionError::InvalidTransition {
                id: self.id,
                from: self.state,
                to,
            });
        }
        log::trace!("Session {}: {:?} -> {:?}", self.id, self.state, to);
        self.state = to;
        Ok(())
    }

    /// Counts a completed activation. Rollbacks to `Active` do not count.
    pub(crate) fn record_activation(&mut self) {
        self.activations += 1;
    }

    /// `Active|Suspended -> Invalidated`: drops the device and retires every
    /// handle of the current generation.
    pub(crate) fn invalidate(&mut self) -> Result<Option<HeldDevice<D>>> {
        self.transition(SessionState::Invalidated)?;
        self.registry.retire();
        Ok(self.device.take())
    }

    /// `Invalidated -> Created` with a freshly acquired device.
    pub(crate) fn revive(&mut self, device: D, lease: DeviceLease) -> Result<()> {
        self.transition(SessionState::Created)?;
        self.generation = self.generation.next();
        self.registry.renew(self.generation);
        self.device = Some(HeldDevice { device, lease });
        Ok(())
    }

    /// `any -> Destroyed`. Returns the device so the caller can hand it back
    /// to the binding.
    pub(crate) fn destroy(&mut self) -> Result<Option<HeldDevice<D>>> {
        self.transition(SessionState::Destroyed)?;
        self.registry.retire();
        Ok(self.device.take())
    }

    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            label: self.config.label.clone(),
            state: self.state,
            generation: self.generation,
            holds_device: self.device.is_some(),
            resource_count: self.registry.len(),
            resource_bytes: self.registry.total_bytes(),
            activations: self.activations,
            created_at: self.created_at,
        }
    }
}

impl<D> fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("label", &self.config.label)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("lease", &self.lease())
            .field("resources", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceDescriptor;

    fn session() -> Session<()> {
        Session::new(SessionId::from_raw(7), SessionConfig::labeled("hud"))
    }

    #[test]
    fn new_session_starts_created_at_generation_zero() {
        let s = session();
        assert_eq!(s.state(), SessionState::Created);
        assert_eq!(s.generation(), Generation::new(0));
        assert!(s.device().is_none());
    }

    #[test]
    fn illegal_transition_is_rejected_and_state_kept() {
        let mut s = session();
        let err = s.transition(SessionState::Suspended).unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition { .. }));
        assert_eq!(s.state(), SessionState::Created);
    }

    #[test]
    fn invalidate_then_revive_bumps_generation_and_clears_registry() {
        let mut s = session();
        s.install_device((), DeviceLease::next());
        s.transition(SessionState::Active).unwrap();
        let handle = s
            .registry_mut()
            .register(ResourceDescriptor::buffer(64))
            .unwrap();

        let dropped = s.invalidate().unwrap();
        assert!(dropped.is_some());
        assert_eq!(s.registry().len(), 0);

        s.revive((), DeviceLease::next()).unwrap();
        assert_eq!(s.state(), SessionState::Created);
        assert_eq!(s.generation(), Generation::new(1));
        assert!(s.registry().lookup(handle).unwrap_err().is_stale());
    }

    #[test]
    fn transitions_alone_do_not_count_activations() {
        let mut s = session();
        s.transition(SessionState::Active).unwrap();
        s.record_activation();
        s.transition(SessionState::Suspended).unwrap();
        s.transition(SessionState::Active).unwrap();
        assert_eq!(s.info().activations, 1);
    }
}
