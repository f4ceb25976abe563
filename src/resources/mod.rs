//! Resource Registry
//!
//! Per-session bookkeeping of GPU objects (buffers, textures, pipelines, bind
//! groups). Each session owns exactly one [`ResourceRegistry`]; registries are
//! never shared.
//!
//! # Handle validity
//!
//! A [`ResourceHandle`] is `(session, generation, local id)`:
//! - wrong session: [`ForeignHandle`](crate::SessionError::ForeignHandle)
//! - older generation, or session invalidated: [`StaleHandle`](crate::SessionError::StaleHandle)
//! - released or unknown slot: [`ResourceNotFound`](crate::SessionError::ResourceNotFound)
//!
//! Generations replace weak references: a retained handle becomes dangling in
//! a checkable way instead of needing back-pointers.

pub mod handle;
pub mod registry;

pub use handle::{
    LocalId, NativeId, ResourceDescriptor, ResourceHandle, ResourceKind, ResourceMetadata,
};
pub use registry::ResourceRegistry;
