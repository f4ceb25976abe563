//! Headless Binding
//!
//! A software [`GpuBinding`] that never touches a driver. Devices are plain
//! counters, so the binding runs anywhere, and every failure mode of a real
//! GPU can be injected on demand:
//!
//! - adapter disappearance ([`HeadlessBinding::set_adapter_available`])
//! - one-shot acquisition / resume failures
//! - slow queues ([`HeadlessBinding::set_drain_latency`])
//! - device loss ([`HeadlessBinding::lose_device`])
//!
//! The binding is cheaply cloneable; clones share state, so a test can keep
//! one clone for injection after moving another into the manager.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::gpu::{AcquireError, DeviceLease, DeviceRequest, DrainError, GpuBinding};
use crate::recovery::{DeviceLossReason, DeviceLossSink};
use crate::session::SessionId;

#[derive(Default)]
struct Faults {
    acquire_failures: VecDeque<AcquireError>,
    resume_failures: VecDeque<AcquireError>,
    drain_latency: Duration,
    acquire_latency: Duration,
    /// Most recent device of each session, for loss injection.
    devices: FxHashMap<SessionId, Weak<DeviceShared>>,
}

struct Shared {
    faults: Mutex<Faults>,
    adapter_available: AtomicBool,
    acquisitions: AtomicU64,
    drains: AtomicU64,
    releases: AtomicU64,
    live: Arc<AtomicUsize>,
}

struct DeviceShared {
    session: SessionId,
    lease: DeviceLease,
    lost: AtomicBool,
    in_flight: AtomicU64,
    submitted: AtomicU64,
    sink: DeviceLossSink,
}

/// A software device. Dropping it returns it to the binding.
pub struct HeadlessDevice {
    shared: Arc<DeviceShared>,
    live: Arc<AtomicUsize>,
}

impl HeadlessDevice {
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.shared.session
    }

    #[must_use]
    pub fn lease(&self) -> DeviceLease {
        self.shared.lease
    }

    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.shared.lost.load(Ordering::Acquire)
    }

    /// Records `count` command buffers as submitted and in flight.
    pub fn submit(&self, count: u64) {
        self.shared.in_flight.fetch_add(count, Ordering::AcqRel);
        self.shared.submitted.fetch_add(count, Ordering::Relaxed);
    }

    /// Submissions not yet drained.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Submissions over the device's lifetime.
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.shared.submitted.load(Ordering::Relaxed)
    }
}

impl Drop for HeadlessDevice {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for HeadlessDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessDevice")
            .field("session", &self.shared.session)
            .field("lease", &self.shared.lease)
            .field("in_flight", &self.in_flight())
            .field("lost", &self.is_lost())
            .finish()
    }
}

#[derive(Clone)]
pub struct HeadlessBinding {
    shared: Arc<Shared>,
}

impl Default for HeadlessBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBinding {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                faults: Mutex::new(Faults::default()),
                adapter_available: AtomicBool::new(true),
                acquisitions: AtomicU64::new(0),
                drains: AtomicU64::new(0),
                releases: AtomicU64::new(0),
                live: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    // ========================================================================
    // Fault injection
    // ========================================================================

    pub fn set_adapter_available(&self, available: bool) {
        self.shared
            .adapter_available
            .store(available, Ordering::Release);
    }

    /// The next `acquire_device` call fails with `error`.
    pub fn fail_next_acquire(&self, error: AcquireError) {
        self.shared.faults.lock().acquire_failures.push_back(error);
    }

    /// The next `resume_device` call fails with `error`.
    pub fn fail_next_resume(&self, error: AcquireError) {
        self.shared.faults.lock().resume_failures.push_back(error);
    }

    /// Time every drain takes. Drains whose latency exceeds the caller's
    /// timeout fail after waiting out the timeout.
    pub fn set_drain_latency(&self, latency: Duration) {
        self.shared.faults.lock().drain_latency = latency;
    }

    pub fn set_acquire_latency(&self, latency: Duration) {
        self.shared.faults.lock().acquire_latency = latency;
    }

    /// Kills the session's current device and reports the loss the way a
    /// driver callback would. Returns `false` if the session holds no device.
    pub fn lose_device(&self, session: SessionId) -> bool {
        let device = self
            .shared
            .faults
            .lock()
            .devices
            .get(&session)
            .and_then(Weak::upgrade);
        let Some(device) = device else {
            return false;
        };
        device.lost.store(true, Ordering::Release);
        device
            .sink
            .report(DeviceLossReason::Unknown, "headless: injected device loss");
        true
    }

    // ========================================================================
    // Counters
    // ========================================================================

    #[must_use]
    pub fn acquisitions(&self) -> u64 {
        self.shared.acquisitions.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn drains(&self) -> u64 {
        self.shared.drains.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn releases(&self) -> u64 {
        self.shared.releases.load(Ordering::Relaxed)
    }

    /// Devices currently alive (acquired and not yet dropped).
    #[must_use]
    pub fn live_devices(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }
}

impl GpuBinding for HeadlessBinding {
    type Device = HeadlessDevice;

    fn acquire_device(&self, request: &DeviceRequest) -> Result<HeadlessDevice, AcquireError> {
        if !self.shared.adapter_available.load(Ordering::Acquire) {
            return Err(AcquireError::AdapterUnavailable(
                "headless: adapter disabled".to_string(),
            ));
        }

        let (failure, latency) = {
            let mut faults = self.shared.faults.lock();
            (faults.acquire_failures.pop_front(), faults.acquire_latency)
        };
        if let Some(err) = failure {
            return Err(err);
        }
        if latency > request.timeout {
            std::thread::sleep(request.timeout);
            return Err(AcquireError::Timeout(request.timeout));
        }
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let shared = Arc::new(DeviceShared {
            session: request.session,
            lease: request.lease,
            lost: AtomicBool::new(false),
            in_flight: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            sink: request.loss_sink.clone(),
        });
        {
            let mut faults = self.shared.faults.lock();
            faults.devices.retain(|_, device| device.strong_count() > 0);
            faults.devices.insert(request.session, Arc::downgrade(&shared));
        }
        self.shared.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.shared.live.fetch_add(1, Ordering::AcqRel);

        log::trace!(
            "headless: device {} for session {} ({})",
            request.lease,
            request.session,
            request.generation
        );
        Ok(HeadlessDevice {
            shared,
            live: Arc::clone(&self.shared.live),
        })
    }

    fn resume_device(&self, device: &HeadlessDevice) -> Result<(), AcquireError> {
        if device.is_lost() {
            return Err(AcquireError::DeviceLost(format!(
                "headless: {} was lost while parked",
                device.lease()
            )));
        }
        match self.shared.faults.lock().resume_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn flush_and_wait(&self, device: &HeadlessDevice, timeout: Duration) -> Result<(), DrainError> {
        self.shared.drains.fetch_add(1, Ordering::Relaxed);
        if device.is_lost() {
            return Err(DrainError::DeviceLost(format!(
                "headless: {} is lost",
                device.lease()
            )));
        }

        let latency = self.shared.faults.lock().drain_latency;
        if latency > timeout {
            std::thread::sleep(timeout);
            return Err(DrainError::Timeout(timeout));
        }
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        device.shared.in_flight.store(0, Ordering::Release);
        Ok(())
    }

    fn release_device(&self, device: HeadlessDevice) {
        self.shared.releases.fetch_add(1, Ordering::Relaxed);
        let mut faults = self.shared.faults.lock();
        let current = faults
            .devices
            .get(&device.session())
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(&device.shared)));
        if current {
            faults.devices.remove(&device.session());
        }
    }
}
