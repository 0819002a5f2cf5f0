//! Platform DMA primitives
//!
//! The driver does not program page tables or the IOMMU itself. It asks the
//! platform for DMA-coherent blocks or for individual pages plus an IOVA
//! window, and gets back a CPU-side address and a device-side address.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::error::Result;
use crate::export::SgTable;
use crate::vm::Vma;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Physical address of a page frame
pub type PhysAddr = u64;
/// Address at which the accelerator's DMA engine sees memory
pub type DmaAddr = u64;
/// Kernel virtual address
pub type KernelAddr = usize;

bitflags! {
    /// DMA allocation attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaAttrs: u32 {
        /// Map write-combined instead of uncached
        const WRITE_COMBINE = 1 << 2;
        /// The CPU never touches the buffer through a kernel mapping
        const NO_KERNEL_MAPPING = 1 << 4;
    }
}

/// Round `size` up to a whole number of pages, `None` on overflow
pub const fn page_align(size: usize) -> Option<usize> {
    match size.checked_add(PAGE_SIZE - 1) {
        Some(end) => Some(end & !(PAGE_SIZE - 1)),
        None => None,
    }
}

/// One physical page frame
pub struct PageFrame {
    phys: PhysAddr,
    data: Mutex<Box<[u8]>>,
}

/// Shared reference to a physical page
pub type PageRef = Arc<PageFrame>;

impl PageFrame {
    pub fn new(phys: PhysAddr, data: Box<[u8]>) -> Self {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        Self {
            phys,
            data: Mutex::new(data),
        }
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Copy out of the frame starting at `offset`
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let data = self.data.lock();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copy into the frame starting at `offset`
    pub fn write(&self, offset: usize, buf: &[u8]) {
        let mut data = self.data.lock();
        data[offset..offset + buf.len()].copy_from_slice(buf);
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageFrame({:#x})", self.phys)
    }
}

/// A physically contiguous DMA-coherent block
#[derive(Debug)]
pub struct CoherentBlock {
    pub cpu_addr: KernelAddr,
    pub dma_addr: DmaAddr,
    pub size: usize,
    frames: Vec<PageRef>,
}

impl CoherentBlock {
    pub fn new(cpu_addr: KernelAddr, dma_addr: DmaAddr, frames: Vec<PageRef>) -> Self {
        Self {
            cpu_addr,
            dma_addr,
            size: frames.len() * PAGE_SIZE,
            frames,
        }
    }

    /// Backing frames, in address order
    pub fn frames(&self) -> &[PageRef] {
        &self.frames
    }

    /// Physical address of the first byte
    pub fn phys(&self) -> PhysAddr {
        self.frames.first().map(|f| f.phys()).unwrap_or_default()
    }
}

/// Platform DMA mapping interface
///
/// Implementations must be safe to call concurrently for distinct buffers.
pub trait DmaPlatform: Send + Sync {
    /// Whether device addresses go through an IOMMU
    fn has_iommu(&self) -> bool;

    /// Allocate a physically contiguous coherent block of `size` bytes
    fn alloc_coherent(&self, size: usize, attrs: DmaAttrs) -> Result<CoherentBlock>;

    /// Release a block obtained from [`DmaPlatform::alloc_coherent`]
    fn free_coherent(&self, block: &CoherentBlock, attrs: DmaAttrs);

    /// Allocate `count` individually tracked pages
    fn alloc_pages(&self, count: usize) -> Result<Vec<PageRef>>;

    /// Release pages obtained from [`DmaPlatform::alloc_pages`]
    fn free_pages(&self, pages: &[PageRef]);

    /// Map `pages` into one contiguous IOVA window
    fn iommu_map(&self, pages: &[PageRef]) -> Result<DmaAddr>;

    /// Tear down an IOVA window
    fn iommu_unmap(&self, iova: DmaAddr, size: usize);

    /// Map `pages` into kernel virtual memory
    fn vmap(&self, pages: &[PageRef], attrs: DmaAttrs) -> Result<KernelAddr>;

    /// Undo [`DmaPlatform::vmap`]
    fn vunmap(&self, addr: KernelAddr);

    /// Describe a coherent block as a scatter-gather table
    fn get_sgtable(&self, table: &mut SgTable, block: &CoherentBlock, attrs: DmaAttrs)
        -> Result<()>;

    /// Map a whole coherent block into a user VMA
    fn mmap_coherent(&self, vma: &mut Vma, block: &CoherentBlock, attrs: DmaAttrs) -> Result<()>;
}
