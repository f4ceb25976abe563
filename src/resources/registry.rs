use slotmap::SlotMap;

use crate::errors::{Result, SessionError};
use crate::resources::handle::{LocalId, ResourceDescriptor, ResourceHandle, ResourceMetadata};
use crate::session::{Generation, SessionId};

/// Per-session table of registered GPU resources.
///
/// Handles are tagged with the owning session and the registry's current
/// generation. After [`retire`](Self::retire) every outstanding handle is
/// stale until the owner is recovered and the registry is
/// [`renew`](Self::renew)ed at the next generation; the old handles stay
/// stale after that too.
#[derive(Debug)]
pub struct ResourceRegistry {
    owner: SessionId,
    generation: Generation,
    retired: bool,
    entries: SlotMap<LocalId, ResourceMetadata>,
    total_bytes: u64,
}

impl ResourceRegistry {
    #[must_use]
    pub fn new(owner: SessionId, generation: Generation) -> Self {
        Self {
            owner,
            generation,
            retired: false,
            entries: SlotMap::with_key(),
            total_bytes: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn owner(&self) -> SessionId {
        self.owner
    }

    #[inline]
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the registered resources' byte footprints, saturating at
    /// `u64::MAX`.
    #[inline]
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Stores the resource and returns a handle for the current generation.
    pub fn register(&mut self, descriptor: ResourceDescriptor) -> Result<ResourceHandle> {
        if self.retired {
            return Err(SessionError::SessionInvalidated(self.owner));
        }
        let metadata = ResourceMetadata::from_descriptor(descriptor);
        self.total_bytes = self.total_bytes.saturating_add(metadata.size);
        let local = self.entries.insert(metadata);
        Ok(ResourceHandle {
            session: self.owner,
            generation: self.generation,
            local,
        })
    }

    pub fn lookup(&self, handle: ResourceHandle) -> Result<&ResourceMetadata> {
        self.check(handle)?;
        self.entries
            .get(handle.local)
            .ok_or(SessionError::ResourceNotFound(handle))
    }

    /// Removes the entry. A second release of the same handle is `NotFound`.
    pub fn release(&mut self, handle: ResourceHandle) -> Result<ResourceMetadata> {
        self.check(handle)?;
        let metadata = self
            .entries
            .remove(handle.local)
            .ok_or(SessionError::ResourceNotFound(handle))?;
        self.total_bytes = self.total_bytes.saturating_sub(metadata.size);
        Ok(metadata)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceHandle, &ResourceMetadata)> + '_ {
        let (session, generation) = (self.owner, self.generation);
        self.entries.iter().map(move |(local, metadata)| {
            (
                ResourceHandle {
                    session,
                    generation,
                    local,
                },
                metadata,
            )
        })
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }

    /// Clears the registry and rejects all current handles as stale.
    /// Called once when the owner is invalidated or destroyed.
    pub fn retire(&mut self) {
        if self.retired {
            return;
        }
        if !self.entries.is_empty() {
            log::debug!(
                "Session {}: dropping {} resources ({} bytes) of {}",
                self.owner,
                self.entries.len(),
                self.total_bytes,
                self.generation
            );
        }
        self.clear();
        self.retired = true;
    }

    /// Re-arms a retired registry for `generation`.
    pub fn renew(&mut self, generation: Generation) {
        debug_assert!(generation > self.generation, "generation must advance");
        self.clear();
        self.generation = generation;
        self.retired = false;
    }

    fn check(&self, handle: ResourceHandle) -> Result<()> {
        if handle.session != self.owner {
            return Err(SessionError::ForeignHandle {
                handle,
                registry: self.owner,
            });
        }
        if self.retired || handle.generation != self.generation {
            return Err(SessionError::StaleHandle {
                handle,
                current: self.generation.value(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceKind;

    fn registry() -> ResourceRegistry {
        ResourceRegistry::new(SessionId::from_raw(1), Generation::default())
    }

    #[test]
    fn register_then_lookup_returns_metadata() {
        let mut reg = registry();
        let handle = reg
            .register(ResourceDescriptor::buffer(256).with_label("vertices"))
            .unwrap();

        let meta = reg.lookup(handle).unwrap();
        assert_eq!(meta.kind, ResourceKind::Buffer);
        assert_eq!(meta.size, 256);
        assert_eq!(meta.label.as_deref(), Some("vertices"));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.total_bytes(), 256);
    }

    #[test]
    fn release_twice_is_not_found() {
        let mut reg = registry();
        let handle = reg.register(ResourceDescriptor::buffer(8)).unwrap();

        reg.release(handle).unwrap();
        assert_eq!(
            reg.release(handle).unwrap_err(),
            SessionError::ResourceNotFound(handle)
        );
        assert_eq!(
            reg.lookup(handle).unwrap_err(),
            SessionError::ResourceNotFound(handle)
        );
        assert_eq!(reg.total_bytes(), 0);
    }

    #[test]
    fn oversized_resources_saturate_total_bytes() {
        let mut reg = registry();
        let huge = reg.register(ResourceDescriptor::buffer(u64::MAX)).unwrap();
        let small = reg.register(ResourceDescriptor::buffer(1)).unwrap();
        assert_eq!(reg.total_bytes(), u64::MAX);

        reg.release(huge).unwrap();
        assert_eq!(reg.total_bytes(), 0);
        reg.release(small).unwrap();
        assert_eq!(reg.total_bytes(), 0);

        let texture = reg
            .register(ResourceDescriptor::texture_2d(
                u32::MAX,
                u32::MAX,
                wgpu::TextureFormat::Rgba32Float,
            ))
            .unwrap();
        assert_eq!(reg.lookup(texture).unwrap().size, u64::MAX);
    }

    #[test]
    fn reused_slot_does_not_alias_released_handle() {
        let mut reg = registry();
        let old = reg.register(ResourceDescriptor::buffer(8)).unwrap();
        reg.release(old).unwrap();
        let new = reg.register(ResourceDescriptor::buffer(16)).unwrap();

        assert_ne!(old, new);
        assert!(reg.lookup(old).is_err());
        assert_eq!(reg.lookup(new).unwrap().size, 16);
    }

    #[test]
    fn foreign_handle_is_rejected() {
        let mut mine = registry();
        let mut other = ResourceRegistry::new(SessionId::from_raw(2), Generation::default());
        let theirs = other.register(ResourceDescriptor::buffer(8)).unwrap();
        mine.register(ResourceDescriptor::buffer(8)).unwrap();

        assert!(matches!(
            mine.lookup(theirs),
            Err(SessionError::ForeignHandle { .. })
        ));
    }

    #[test]
    fn retire_makes_handles_stale_and_blocks_registration() {
        let mut reg = registry();
        let handle = reg.register(ResourceDescriptor::buffer(8)).unwrap();

        reg.retire();
        assert!(reg.is_empty());
        assert!(reg.lookup(handle).unwrap_err().is_stale());
        assert_eq!(
            reg.register(ResourceDescriptor::buffer(8)).unwrap_err(),
            SessionError::SessionInvalidated(SessionId::from_raw(1))
        );
    }

    #[test]
    fn renew_keeps_old_generation_stale() {
        let mut reg = registry();
        let old = reg.register(ResourceDescriptor::buffer(8)).unwrap();
        reg.retire();
        reg.renew(Generation::new(1));

        let fresh = reg.register(ResourceDescriptor::buffer(8)).unwrap();
        assert_eq!(fresh.generation(), Generation::new(1));
        assert!(reg.lookup(fresh).is_ok());
        assert_eq!(
            reg.lookup(old).unwrap_err(),
            SessionError::StaleHandle {
                handle: old,
                current: 1
            }
        );
    }

    #[test]
    fn iter_yields_current_generation_handles() {
        let mut reg = registry();
        let a = reg.register(ResourceDescriptor::buffer(1)).unwrap();
        let b = reg.register(ResourceDescriptor::new(ResourceKind::Sampler)).unwrap();

        let mut seen: Vec<_> = reg.iter().map(|(h, _)| h).collect();
        seen.sort_by_key(|h| h.local());
        let mut expected = vec![a, b];
        expected.sort_by_key(|h| h.local());
        assert_eq!(seen, expected);
    }
}
