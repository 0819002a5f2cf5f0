//! mmap offset manager
//!
//! Hands out fake file offsets, in page units, that user space passes to
//! mmap to name a buffer object. Nodes hold weak references so an offset
//! never keeps its object alive.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use log::trace;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::object::GemObject;
use crate::platform::PAGE_SHIFT;

/// First page offset handed out, above anything a real file would use
pub const FILE_PAGE_OFFSET_START: u64 = (0xFFFF_FFFF >> PAGE_SHIFT) + 1;
/// Size of the fake offset space, in pages
pub const FILE_PAGE_OFFSET_SIZE: u64 = (0xFFFF_FFFF >> PAGE_SHIFT) * 256;

struct OffsetNode {
    pages: u64,
    object: Weak<GemObject>,
}

struct Inner {
    next: u64,
    nodes: BTreeMap<u64, OffsetNode>,
}

/// Allocator of mmap offsets for one device
pub struct OffsetManager {
    inner: Mutex<Inner>,
}

impl OffsetManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next: FILE_PAGE_OFFSET_START,
                nodes: BTreeMap::new(),
            }),
        }
    }

    /// Reserve `pages` pages of offset space for `object`
    pub(crate) fn add(&self, object: &Arc<GemObject>, pages: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let start = inner.next;
        let end = start.checked_add(pages).ok_or(Error::OutOfMemory)?;
        if end > FILE_PAGE_OFFSET_START + FILE_PAGE_OFFSET_SIZE {
            return Err(Error::OutOfMemory);
        }
        inner.next = end;
        inner.nodes.insert(
            start,
            OffsetNode {
                pages,
                object: Arc::downgrade(object),
            },
        );
        trace!("npu: offset node {:#x}+{} pages", start, pages);
        Ok(start)
    }

    pub(crate) fn remove(&self, pgoff: u64) {
        self.inner.lock().nodes.remove(&pgoff);
    }

    /// Find the live object whose node starts exactly at `pgoff` and spans
    /// at least `pages` pages
    pub fn lookup(&self, pgoff: u64, pages: u64) -> Option<Arc<GemObject>> {
        let inner = self.inner.lock();
        let node = inner.nodes.get(&pgoff)?;
        if pages > node.pages {
            return None;
        }
        node.object.upgrade()
    }

    /// Number of registered nodes
    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OffsetManager {
    fn default() -> Self {
        Self::new()
    }
}
