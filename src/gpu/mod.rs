//! GPU Capability Surface
//!
//! The session core never talks to a graphics API directly. Everything it
//! needs from the GPU goes through the [`GpuBinding`] trait:
//!
//! - [`GpuBinding::acquire_device`]: create a device/queue pair for a session
//! - [`GpuBinding::resume_device`]: verify a parked device is still usable
//! - [`GpuBinding::flush_and_wait`]: drain all submitted work with a timeout
//! - [`GpuBinding::release_device`]: give a device back
//!
//! Device loss is reported out of band. Every [`DeviceRequest`] carries a
//! [`DeviceLossSink`]; the binding posts a [`DeviceLossEvent`] into it when the
//! device dies, and the manager consumes those events at well-defined points.
//!
//! Two bindings ship with the crate:
//! - [`WgpuBinding`]: real devices through `wgpu`
//! - [`HeadlessBinding`]: a software binding with fault injection, used by
//!   tests and on machines without a GPU
//!
//! [`DeviceLossEvent`]: crate::recovery::DeviceLossEvent

pub mod headless;
pub mod wgpu_backend;

pub use headless::{HeadlessBinding, HeadlessDevice};
pub use wgpu_backend::{WgpuBinding, WgpuDevice};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::recovery::DeviceLossSink;
use crate::session::{Generation, SessionId};

/// Process-wide lease counter. Zero is never handed out.
static NEXT_LEASE: AtomicU64 = AtomicU64::new(1);

/// Serial number of a single device acquisition.
///
/// Loss events carry the lease of the device they refer to, so a late event
/// from a device that was already released can be told apart from a loss of
/// the device the session holds now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceLease(u64);

impl DeviceLease {
    pub(crate) fn next() -> Self {
        Self(NEXT_LEASE.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease#{}", self.0)
    }
}

/// GPU adapter selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterPreference {
    /// Prefer a discrete / dedicated GPU.
    #[default]
    HighPerformance,
    /// Prefer an integrated GPU.
    LowPower,
    /// Force the software fallback adapter.
    Fallback,
}

/// Everything a binding needs to create a device for one session.
#[derive(Debug, Clone)]
pub struct DeviceRequest {
    pub session: SessionId,
    pub generation: Generation,
    pub lease: DeviceLease,
    pub label: Option<String>,
    pub adapter: AdapterPreference,
    /// Upper bound on the acquisition.
    pub timeout: Duration,
    /// Where the binding reports a later loss of this device.
    pub loss_sink: DeviceLossSink,
}

/// Failure of [`GpuBinding::acquire_device`] or [`GpuBinding::resume_device`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("device acquisition exceeded {0:?}")]
    Timeout(Duration),

    #[error("device creation failed: {0}")]
    Failed(String),
}

/// Failure of [`GpuBinding::flush_and_wait`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DrainError {
    #[error("queue did not drain within {0:?}")]
    Timeout(Duration),

    #[error("device lost while draining: {0}")]
    DeviceLost(String),
}

/// The capability interface consumed from the GPU layer.
///
/// Implementations must be shareable across threads: the manager calls into
/// the binding from whichever thread currently holds the switch turn.
pub trait GpuBinding: Send + Sync + 'static {
    /// A device/queue pair owned by exactly one session.
    type Device: Send + 'static;

    fn acquire_device(&self, request: &DeviceRequest) -> Result<Self::Device, AcquireError>;

    /// Called before a parked device is made active again.
    fn resume_device(&self, _device: &Self::Device) -> Result<(), AcquireError> {
        Ok(())
    }

    /// Blocks until every submission on the device's queue has completed, or
    /// `timeout` elapses.
    fn flush_and_wait(&self, device: &Self::Device, timeout: Duration) -> Result<(), DrainError>;

    fn release_device(&self, device: Self::Device) {
        drop(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leases_are_unique_and_increasing() {
        let a = DeviceLease::next();
        let b = DeviceLease::next();
        assert!(b > a);
        assert_ne!(a.raw(), 0);
    }
}
