//! GPU session management and context switching for `wgpu`.
//!
//! A *session* is an isolated rendering context: a device/queue pair and the
//! registry of GPU resources created on it. Many sessions may exist, but only
//! one is *active* (allowed to submit work) at any instant. This crate tracks
//! session lifecycles, hands GPU ownership from one session to another without
//! leaking or dangling handles, and recovers sessions after device loss.
//!
//! - [`SessionManager`]: the public surface
//! - [`switch`]: the FIFO-serialized suspend/activate protocol
//! - [`recovery`]: device-loss handling and lazy recovery
//! - [`resources`]: generation-scoped resource handles
//! - [`gpu`]: the capability trait consumed from the GPU layer, with `wgpu`
//!   and headless implementations

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod errors;
pub mod gpu;
pub mod manager;
pub mod recovery;
pub mod resources;
pub mod session;
pub mod settings;
pub mod switch;

pub use errors::{Result, SessionError, SwitchFailure};
pub use gpu::{AdapterPreference, GpuBinding, HeadlessBinding, WgpuBinding};
pub use manager::{PendingSwitch, SessionManager};
pub use recovery::{DeviceLossEvent, DeviceLossReason};
pub use resources::{ResourceDescriptor, ResourceHandle, ResourceKind, ResourceMetadata};
pub use session::{Generation, SessionId, SessionInfo, SessionState};
pub use settings::{ManagerSettings, SessionConfig, SuspendPolicy};
pub use switch::{CancelHandle, SwitchRequest};
