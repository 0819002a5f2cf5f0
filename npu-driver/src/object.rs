//! NPU buffer objects
//!
//! A [`GemObject`] wraps one [`Allocation`]. It is shared through `Arc`:
//! handle tables, VMAs and exported dma-bufs each hold a reference, and the
//! memory goes back to the platform when the last of them is dropped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::allocator::{Allocation, Backing, BufferAllocator};
use crate::error::{Error, Result};
use crate::offset::OffsetManager;
use crate::platform::{DmaAddr, DmaAttrs, KernelAddr, PageRef, PAGE_SHIFT, PAGE_SIZE};
use crate::vm::{PageProt, Vma, VmFault, VmFlags, VmOperations};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Fault handling for buffer object mappings
pub static GEM_VM_OPS: VmOperations = VmOperations { fault: gem_fault };

/// A physically backed buffer object
pub struct GemObject {
    id: u64,
    allocation: Allocation,
    /// Page offset of the mmap node, once one was requested
    mmap_offset: Mutex<Option<u64>>,
    /// dma-buf descriptor while exported
    pub(crate) dma_buf: Mutex<Option<u32>>,
    offsets: Arc<OffsetManager>,
}

impl GemObject {
    /// Allocate backing for `size` bytes (rounded up to a page)
    ///
    /// On failure nothing stays allocated.
    pub fn create(
        allocator: &BufferAllocator,
        offsets: &Arc<OffsetManager>,
        size: usize,
        attrs: DmaAttrs,
    ) -> Result<Arc<Self>> {
        let allocation = allocator.allocate_attrs(size, attrs)?;
        let object = Arc::new(Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            allocation,
            mmap_offset: Mutex::new(None),
            dma_buf: Mutex::new(None),
            offsets: offsets.clone(),
        });
        debug!("npu: created object {} ({:#x} bytes)", object.id, object.size());
        Ok(object)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size in bytes, always page aligned
    pub fn size(&self) -> usize {
        self.allocation.size()
    }

    /// Device-side address, fixed for the object's lifetime
    pub fn dma_addr(&self) -> DmaAddr {
        self.allocation.dma_addr()
    }

    pub(crate) fn cpu_addr(&self) -> KernelAddr {
        self.allocation.cpu_addr()
    }

    pub fn attrs(&self) -> DmaAttrs {
        self.allocation.attrs()
    }

    pub fn backing(&self) -> &Backing {
        self.allocation.backing()
    }

    pub fn pages(&self) -> Option<&[PageRef]> {
        self.allocation.pages()
    }

    pub fn page_count(&self) -> usize {
        self.size() >> PAGE_SHIFT
    }

    pub(crate) fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    /// Register an mmap offset for this object, returning it in bytes
    ///
    /// Repeated calls return the same offset.
    pub fn create_mmap_offset(self: &Arc<Self>) -> Result<u64> {
        let mut node = self.mmap_offset.lock();
        let pgoff = match *node {
            Some(pgoff) => pgoff,
            None => {
                let pgoff = self.offsets.add(self, self.page_count() as u64)?;
                *node = Some(pgoff);
                pgoff
            }
        };
        Ok(pgoff << PAGE_SHIFT)
    }

    /// mmap offset in bytes, if one was created
    pub fn mmap_offset(&self) -> Option<u64> {
        self.mmap_offset.lock().map(|pgoff| pgoff << PAGE_SHIFT)
    }

    /// Prepare `vma` to map this object and establish the mapping
    ///
    /// The VMA takes a reference on the object that is released at unmap.
    pub fn mmap_obj(self: &Arc<Self>, vma: &mut Vma) -> Result<()> {
        if vma.len() > self.size() {
            return Err(Error::InvalidArgument);
        }
        vma.flags |= VmFlags::IO | VmFlags::PFNMAP | VmFlags::DONTEXPAND | VmFlags::DONTDUMP;
        vma.prot = PageProt::WriteCombine;
        vma.ops = Some(&GEM_VM_OPS);
        vma.object = Some(self.clone());

        self.mmap(vma)
    }

    /// Establish the user mapping
    ///
    /// Paged objects are mapped lazily from the fault handler; coherent
    /// objects are mapped in full right away.
    pub fn mmap(&self, vma: &mut Vma) -> Result<()> {
        vma.flags.remove(VmFlags::PFNMAP);
        vma.pgoff = 0;

        match self.backing() {
            Backing::Pages(_) => {
                vma.flags.insert(VmFlags::MIXEDMAP);
                Ok(())
            }
            Backing::Coherent(block) => {
                let platform = self.allocation.platform();
                if let Err(err) = platform.mmap_coherent(vma, block, self.attrs()) {
                    vma.zap();
                    vma.object = None;
                    return Err(err);
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for GemObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GemObject")
            .field("id", &self.id)
            .field("allocation", &self.allocation)
            .field("mmap_offset", &self.mmap_offset())
            .finish()
    }
}

impl Drop for GemObject {
    fn drop(&mut self) {
        if let Some(pgoff) = self.mmap_offset.get_mut().take() {
            self.offsets.remove(pgoff);
        }
        debug!("npu: freeing object {}", self.id);
    }
}

/// Page backing byte `offset` of a paged object
///
/// `None` for coherent objects and for offsets past the end.
pub fn resolve_page(object: &GemObject, offset: usize) -> Option<PageRef> {
    object.pages()?.get(offset >> PAGE_SHIFT).cloned()
}

fn gem_fault(vma: &mut Vma, address: usize) -> VmFault {
    let Some(object) = vma.object.clone() else {
        return VmFault::SigBus;
    };
    if object.pages().is_none() {
        warn!("npu: fault on coherent object {} at {:#x}", object.id, address);
        return VmFault::SigBus;
    }

    let offset = (address - vma.start) & !(PAGE_SIZE - 1);
    match resolve_page(&object, offset) {
        Some(page) => vma.insert_page(address, page),
        None => VmFault::SigBus,
    }
}
