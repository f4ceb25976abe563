//! wgpu Binding
//!
//! [`WgpuBinding`] backs sessions with real `wgpu` devices. Each session gets
//! its own adapter request and its own device/queue pair, so sessions never
//! share GPU objects.
//!
//! Adapter and device creation are futures. They are driven with `pollster`
//! on a short-lived worker thread and the result comes back over a `flume`
//! channel, which lets the caller bound the wait with the session timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::gpu::{AcquireError, AdapterPreference, DeviceLease, DeviceRequest, DrainError, GpuBinding};
use crate::recovery::{DeviceLossReason, DeviceLossSink};

/// How often a drain re-polls the device while waiting for the queue.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A session's device and queue.
pub struct WgpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: wgpu::AdapterInfo,
    lease: DeviceLease,
    lost: Arc<AtomicBool>,
}

impl WgpuDevice {
    #[must_use]
    pub fn lease(&self) -> DeviceLease {
        self.lease
    }

    /// Set by the device-lost callback.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("adapter", &self.adapter_info.name)
            .field("backend", &self.adapter_info.backend)
            .field("lease", &self.lease)
            .field("lost", &self.is_lost())
            .finish_non_exhaustive()
    }
}

/// [`GpuBinding`] over `wgpu`.
pub struct WgpuBinding {
    instance: wgpu::Instance,
    required_features: wgpu::Features,
    required_limits: wgpu::Limits,
}

impl Default for WgpuBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl WgpuBinding {
    /// Uses the platform's default instance (all primary backends).
    #[must_use]
    pub fn new() -> Self {
        Self::from_instance(wgpu::Instance::default())
    }

    #[must_use]
    pub fn from_instance(instance: wgpu::Instance) -> Self {
        Self {
            instance,
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
        }
    }

    /// Features every session device must support.
    #[must_use]
    pub fn with_features(mut self, features: wgpu::Features) -> Self {
        self.required_features = features;
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: wgpu::Limits) -> Self {
        self.required_limits = limits;
        self
    }
}

fn adapter_options(preference: AdapterPreference) -> wgpu::RequestAdapterOptions<'static, 'static> {
    let (power_preference, force_fallback_adapter) = match preference {
        AdapterPreference::HighPerformance => (wgpu::PowerPreference::HighPerformance, false),
        AdapterPreference::LowPower => (wgpu::PowerPreference::LowPower, false),
        AdapterPreference::Fallback => (wgpu::PowerPreference::LowPower, true),
    };
    wgpu::RequestAdapterOptions {
        power_preference,
        force_fallback_adapter,
        compatible_surface: None,
    }
}

struct CreateParams {
    instance: wgpu::Instance,
    preference: AdapterPreference,
    label: Option<String>,
    required_features: wgpu::Features,
    required_limits: wgpu::Limits,
    lease: DeviceLease,
    sink: DeviceLossSink,
}

async fn create_device(params: CreateParams) -> Result<WgpuDevice, AcquireError> {
    let adapter = params
        .instance
        .request_adapter(&adapter_options(params.preference))
        .await
        .map_err(|e| AcquireError::AdapterUnavailable(e.to_string()))?;

    let (device, queue) = adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: params.label.as_deref(),
            required_features: params.required_features,
            required_limits: params.required_limits,
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        })
        .await
        .map_err(|e| AcquireError::Failed(e.to_string()))?;

    let lost = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&lost);
    let sink = params.sink;
    device.set_device_lost_callback(move |reason, message| {
        flag.store(true, Ordering::Release);
        let reason = match reason {
            wgpu::DeviceLostReason::Destroyed => DeviceLossReason::Destroyed,
            _ => DeviceLossReason::Unknown,
        };
        // Also fires on our own release; the lease check drops those events.
        sink.report(reason, message);
    });

    Ok(WgpuDevice {
        device,
        queue,
        adapter_info: adapter.get_info(),
        lease: params.lease,
        lost,
    })
}

impl GpuBinding for WgpuBinding {
    type Device = WgpuDevice;

    fn acquire_device(&self, request: &DeviceRequest) -> Result<WgpuDevice, AcquireError> {
        let params = CreateParams {
            instance: self.instance.clone(),
            preference: request.adapter,
            label: request.label.clone(),
            required_features: self.required_features,
            required_limits: self.required_limits.clone(),
            lease: request.lease,
            sink: request.loss_sink.clone(),
        };

        let (tx, rx) = flume::bounded(1);
        std::thread::Builder::new()
            .name(format!("gpu-session-acquire-{}", request.session))
            .spawn(move || {
                // A send error means the caller timed out; the device is dropped here.
                let _ = tx.send(pollster::block_on(create_device(params)));
            })
            .map_err(|e| AcquireError::Failed(format!("failed to spawn acquire worker: {e}")))?;

        match rx.recv_timeout(request.timeout) {
            Ok(result) => {
                if let Ok(device) = &result {
                    log::info!(
                        "Session {}: acquired {:?} device on '{}'",
                        request.session,
                        device.adapter_info.backend,
                        device.adapter_info.name
                    );
                }
                result
            }
            Err(flume::RecvTimeoutError::Timeout) => Err(AcquireError::Timeout(request.timeout)),
            Err(flume::RecvTimeoutError::Disconnected) => Err(AcquireError::Failed(
                "acquire worker exited without a result".to_string(),
            )),
        }
    }

    fn resume_device(&self, device: &WgpuDevice) -> Result<(), AcquireError> {
        if device.is_lost() {
            return Err(AcquireError::DeviceLost(format!(
                "{} was lost while parked",
                device.lease
            )));
        }
        Ok(())
    }

    fn flush_and_wait(&self, device: &WgpuDevice, timeout: Duration) -> Result<(), DrainError> {
        let (tx, rx) = flume::bounded(1);
        device.queue.on_submitted_work_done(move || {
            let _ = tx.send(());
        });

        let deadline = Instant::now() + timeout;
        loop {
            if device.is_lost() {
                return Err(DrainError::DeviceLost(format!("{} is lost", device.lease)));
            }
            if let Err(e) = device.device.poll(wgpu::PollType::Poll) {
                return Err(DrainError::DeviceLost(e.to_string()));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DrainError::Timeout(timeout));
            }
            match rx.recv_timeout(DRAIN_POLL_INTERVAL.min(deadline - now)) {
                Ok(()) => return Ok(()),
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => {
                    return Err(DrainError::DeviceLost(
                        "queue dropped the completion callback".to_string(),
                    ));
                }
            }
        }
    }

    fn release_device(&self, device: WgpuDevice) {
        log::debug!("Releasing device {}", device.lease);
        device.device.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_preference_forces_fallback_adapter() {
        let opts = adapter_options(AdapterPreference::Fallback);
        assert!(opts.force_fallback_adapter);
        assert_eq!(opts.power_preference, wgpu::PowerPreference::LowPower);
    }

    #[test]
    fn high_performance_does_not_force_fallback() {
        let opts = adapter_options(AdapterPreference::HighPerformance);
        assert!(!opts.force_fallback_adapter);
        assert_eq!(opts.power_preference, wgpu::PowerPreference::HighPerformance);
    }
}
