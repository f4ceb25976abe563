use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use slotmap::{Key, new_key_type};

use crate::session::{Generation, SessionId};

new_key_type! {
    /// Slot of a resource inside its session's registry.
    pub struct LocalId;
}

/// Global native-object ID generator.
static NEXT_NATIVE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of the backing GPU object.
///
/// Unique across all sessions and generations, so two registrations never
/// share an id even when a registry slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeId(u64);

impl NativeId {
    pub(crate) fn next() -> Self {
        Self(NEXT_NATIVE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Handle to a GPU resource registered with a session.
///
/// Valid only for the `(session, generation)` pair that produced it. Using it
/// anywhere else is rejected rather than remapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    pub(crate) session: SessionId,
    pub(crate) generation: Generation,
    pub(crate) local: LocalId,
}

impl ResourceHandle {
    #[inline]
    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    #[inline]
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    #[inline]
    #[must_use]
    pub fn local(&self) -> LocalId {
        self.local
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "s{}/{}/r{:x}",
            self.session,
            self.generation,
            self.local.data().as_ffi()
        )
    }
}

/// Kind of GPU object a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Texture,
    Sampler,
    BindGroup,
    RenderPipeline,
    ComputePipeline,
}

/// What the caller registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub kind: ResourceKind,
    pub label: Option<String>,
    /// Approximate GPU memory footprint in bytes. Zero for objects that carry
    /// no storage of their own (pipelines, bind groups, samplers).
    pub size: u64,
    pub format: Option<wgpu::TextureFormat>,
}

impl ResourceDescriptor {
    #[must_use]
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            label: None,
            size: 0,
            format: None,
        }
    }

    #[must_use]
    pub fn buffer(size: u64) -> Self {
        Self {
            size,
            ..Self::new(ResourceKind::Buffer)
        }
    }

    /// A single-layer, single-mip 2D texture. The footprint is derived from the
    /// format's block size and saturates at `u64::MAX`.
    #[must_use]
    pub fn texture_2d(width: u32, height: u32, format: wgpu::TextureFormat) -> Self {
        let (block_w, block_h) = format.block_dimensions();
        let block_bytes = u64::from(format.block_copy_size(None).unwrap_or(0));
        let blocks_x = u64::from(width.div_ceil(block_w));
        let blocks_y = u64::from(height.div_ceil(block_h));
        Self {
            size: blocks_x.saturating_mul(blocks_y).saturating_mul(block_bytes),
            format: Some(format),
            ..Self::new(ResourceKind::Texture)
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Registry entry: the descriptor plus the identity of the backing object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMetadata {
    pub kind: ResourceKind,
    pub label: Option<String>,
    pub size: u64,
    pub format: Option<wgpu::TextureFormat>,
    pub native: NativeId,
}

impl ResourceMetadata {
    pub(crate) fn from_descriptor(descriptor: ResourceDescriptor) -> Self {
        Self {
            kind: descriptor.kind,
            label: descriptor.label,
            size: descriptor.size,
            format: descriptor.format,
            native: NativeId::next(),
        }
    }
}
