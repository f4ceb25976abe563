//! Manager & Session Configuration
//!
//! [`ManagerSettings`] is consumed once by [`SessionManager::new`] and fixes the
//! suspend policy, the timeout applied to every blocking step of a switch, and
//! the live-session budget. [`SessionConfig`] is passed per session to
//! [`SessionManager::create_session`].
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use gpu_session::{ManagerSettings, SuspendPolicy};
//!
//! // Reclaim GPU memory as soon as a session is switched away from.
//! let settings = ManagerSettings {
//!     suspend_policy: SuspendPolicy::ReleaseOnSuspend,
//!     ..Default::default()
//! };
//! ```
//!
//! Both structs derive `serde` so they can be loaded from a config file:
//!
//! ```json
//! { "suspend_policy": "release-on-suspend", "switch_timeout": { "secs": 1, "nanos": 0 }, "max_sessions": 4 }
//! ```
//!
//! [`SessionManager::new`]: crate::SessionManager::new
//! [`SessionManager::create_session`]: crate::SessionManager::create_session

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gpu::AdapterPreference;

// ---------------------------------------------------------------------------
// SuspendPolicy
// ---------------------------------------------------------------------------

/// What happens to a session's device when it is switched away from.
///
/// | Policy             | Suspend                  | Resume                    |
/// |--------------------|--------------------------|---------------------------|
/// | `RetainOnSuspend`  | device parked, memory kept | cheap liveness check    |
/// | `ReleaseOnSuspend` | device released          | full device re-acquisition |
///
/// Registry contents survive suspension under both policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuspendPolicy {
    /// Reclaim GPU memory eagerly; resuming pays for a new device.
    ReleaseOnSuspend,
    /// Keep the device live for fast resume, trading memory for latency.
    #[default]
    RetainOnSuspend,
}

impl SuspendPolicy {
    #[inline]
    #[must_use]
    pub fn releases_device(self) -> bool {
        matches!(self, Self::ReleaseOnSuspend)
    }
}

// ---------------------------------------------------------------------------
// ManagerSettings
// ---------------------------------------------------------------------------

/// Global configuration for a [`SessionManager`](crate::SessionManager).
///
/// | Field            | Description                                   | Default           |
/// |------------------|-----------------------------------------------|-------------------|
/// | `suspend_policy` | Device handling on suspend                    | `RetainOnSuspend` |
/// | `switch_timeout` | Bound on queue wait, drain and acquisition    | 2 s               |
/// | `max_sessions`   | Live-session budget guard                     | 16                |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    pub suspend_policy: SuspendPolicy,

    /// Applied independently to each suspension point of a switch: waiting for
    /// an earlier switch, draining the outgoing queue, and acquiring the
    /// target's device.
    pub switch_timeout: Duration,

    /// Maximum number of sessions that may exist at once. Destroyed sessions do
    /// not count.
    pub max_sessions: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            suspend_policy: SuspendPolicy::default(),
            switch_timeout: Duration::from_secs(2),
            max_sessions: 16,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Per-session creation parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Debug label, used in logs and passed to the device descriptor.
    pub label: Option<String>,
    /// Adapter selection forwarded to the binding on every acquisition.
    pub adapter: AdapterPreference,
}

impl SessionConfig {
    #[must_use]
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_adapter(mut self, adapter: AdapterPreference) -> Self {
        self.adapter = adapter;
        self
    }
}
