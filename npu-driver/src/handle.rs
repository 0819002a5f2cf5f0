//! Per-client handle tables
//!
//! Every handle owns one reference to its object. Deleting the handle drops
//! that reference; the object itself goes away once nothing else (a VMA, a
//! dma-buf, an in-flight lookup) still holds it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::trace;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::object::GemObject;

/// Handle table of one open client
pub struct HandleTable {
    objects: RwLock<BTreeMap<u32, Arc<GemObject>>>,
    next_handle: AtomicU32,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            next_handle: AtomicU32::new(1),
        }
    }

    fn next_handle(&self) -> Result<u32> {
        self.next_handle
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |h| h.checked_add(1))
            .map_err(|_| Error::OutOfMemory)
    }

    /// Publish `object` under a new handle
    pub fn create(&self, object: &Arc<GemObject>) -> Result<u32> {
        let handle = self.next_handle()?;
        self.objects.write().insert(handle, object.clone());
        trace!("npu: handle {} -> object {}", handle, object.id());
        Ok(handle)
    }

    /// Existing handle for `object`, or a new one if this client has none
    ///
    /// Search and insert happen under one write lock, so concurrent imports
    /// of the same object agree on a single handle.
    pub fn find_or_create(&self, object: &Arc<GemObject>) -> Result<u32> {
        let mut objects = self.objects.write();
        if let Some((&handle, _)) = objects.iter().find(|(_, o)| Arc::ptr_eq(o, object)) {
            return Ok(handle);
        }
        let handle = self.next_handle()?;
        objects.insert(handle, object.clone());
        trace!("npu: handle {} -> object {}", handle, object.id());
        Ok(handle)
    }

    /// Take a reference to the object behind `handle`
    pub fn lookup(&self, handle: u32) -> Result<Arc<GemObject>> {
        self.objects
            .read()
            .get(&handle)
            .cloned()
            .ok_or(Error::InvalidHandle)
    }

    /// Remove `handle`, dropping its reference
    pub fn delete(&self, handle: u32) -> Result<()> {
        let object = self
            .objects
            .write()
            .remove(&handle)
            .ok_or(Error::InvalidHandle)?;
        trace!("npu: handle {} released", handle);
        // may free the object; the table lock is no longer held
        drop(object);
        Ok(())
    }

    /// Existing handle for `object`, if this client has one
    pub fn find(&self, object: &Arc<GemObject>) -> Option<u32> {
        self.objects
            .read()
            .iter()
            .find(|(_, o)| Arc::ptr_eq(o, object))
            .map(|(&h, _)| h)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every handle, as on close of the client
    pub fn release_all(&self) {
        let objects = std::mem::take(&mut *self.objects.write());
        drop(objects);
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::BufferAllocator;
    use crate::offset::OffsetManager;
    use crate::platform::{DmaAttrs, PAGE_SIZE};
    use crate::sim::SimPlatform;

    fn object(allocator: &BufferAllocator) -> Arc<GemObject> {
        let offsets = Arc::new(OffsetManager::new());
        GemObject::create(allocator, &offsets, PAGE_SIZE, DmaAttrs::empty()).unwrap()
    }

    #[test]
    fn test_create_lookup_delete() {
        let sim = SimPlatform::new(false, 1 << 20);
        let allocator = BufferAllocator::new(sim.clone());
        let table = HandleTable::new();

        let obj = object(&allocator);
        let handle = table.create(&obj).unwrap();
        assert_ne!(handle, 0);
        drop(obj);

        let found = table.lookup(handle).unwrap();
        assert_eq!(Arc::strong_count(&found), 2);
        drop(found);

        table.delete(handle).unwrap();
        assert_eq!(sim.outstanding_bytes(), 0);
        assert_eq!(table.delete(handle), Err(Error::InvalidHandle));
        assert_eq!(table.lookup(handle).unwrap_err(), Error::InvalidHandle);
        assert_eq!(table.delete(0), Err(Error::InvalidHandle));
    }

    #[test]
    fn test_delete_defers_free_to_last_reference() {
        let sim = SimPlatform::new(false, 1 << 20);
        let allocator = BufferAllocator::new(sim.clone());
        let table = HandleTable::new();

        let handle = table.create(&object(&allocator)).unwrap();
        let held = table.lookup(handle).unwrap();
        table.delete(handle).unwrap();
        assert_eq!(sim.outstanding_bytes(), PAGE_SIZE as u64);
        drop(held);
        assert_eq!(sim.outstanding_bytes(), 0);
    }

    #[test]
    fn test_duplicate_handles() {
        let sim = SimPlatform::new(false, 1 << 20);
        let allocator = BufferAllocator::new(sim.clone());
        let table = HandleTable::new();

        let obj = object(&allocator);
        let a = table.create(&obj).unwrap();
        let b = table.create(&obj).unwrap();
        assert_ne!(a, b);
        assert!(table.find(&obj).is_some());
        drop(obj);

        table.delete(a).unwrap();
        assert_eq!(sim.outstanding_bytes(), PAGE_SIZE as u64);
        table.release_all();
        assert!(table.is_empty());
        assert_eq!(sim.outstanding_bytes(), 0);
    }

    #[test]
    fn test_find_or_create_is_atomic() {
        let sim = SimPlatform::new(false, 1 << 20);
        let allocator = BufferAllocator::new(sim.clone());

        for _ in 0..50 {
            let table = HandleTable::new();
            let obj = object(&allocator);
            let handles: Vec<u32> = std::thread::scope(|s| {
                let workers: Vec<_> = (0..8)
                    .map(|_| s.spawn(|| table.find_or_create(&obj).unwrap()))
                    .collect();
                workers.into_iter().map(|w| w.join().unwrap()).collect()
            });
            assert!(handles.iter().all(|&h| h == handles[0]));
            assert_eq!(table.len(), 1);
        }
    }
}
