//! Buffer allocator
//!
//! Obtains the physical backing for one buffer object. Without an IOMMU the
//! backing is a single DMA-coherent block; with one, it is an array of
//! individually allocated pages mapped into one IOVA window and one kernel
//! mapping, and the page array is kept for fault handling.

use std::fmt;
use std::sync::Arc;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::platform::{
    page_align, CoherentBlock, DmaAddr, DmaAttrs, DmaPlatform, KernelAddr, PageRef, PAGE_SIZE,
};

/// Physical backing of an allocation
#[derive(Debug)]
pub enum Backing {
    /// One contiguous coherent block
    Coherent(CoherentBlock),
    /// Individually tracked pages behind the IOMMU
    Pages(Vec<PageRef>),
}

/// Memory obtained for one buffer object
///
/// Returned to the platform when dropped.
pub struct Allocation {
    cpu_addr: KernelAddr,
    dma_addr: DmaAddr,
    size: usize,
    attrs: DmaAttrs,
    backing: Backing,
    platform: Arc<dyn DmaPlatform>,
}

impl Allocation {
    pub fn cpu_addr(&self) -> KernelAddr {
        self.cpu_addr
    }

    pub fn dma_addr(&self) -> DmaAddr {
        self.dma_addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn attrs(&self) -> DmaAttrs {
        self.attrs
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// Page array, present only on the IOMMU path
    pub fn pages(&self) -> Option<&[PageRef]> {
        match &self.backing {
            Backing::Pages(pages) => Some(pages),
            Backing::Coherent(_) => None,
        }
    }

    pub fn platform(&self) -> &Arc<dyn DmaPlatform> {
        &self.platform
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("dma_addr", &format_args!("{:#x}", self.dma_addr))
            .field("size", &self.size)
            .field("attrs", &self.attrs)
            .field("paged", &self.pages().is_some())
            .finish()
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        trace!("npu: releasing {:#x} bytes at {:#x}", self.size, self.dma_addr);
        match &self.backing {
            Backing::Coherent(block) => self.platform.free_coherent(block, self.attrs),
            Backing::Pages(pages) => {
                self.platform.vunmap(self.cpu_addr);
                self.platform.iommu_unmap(self.dma_addr, self.size);
                self.platform.free_pages(pages);
            }
        }
    }
}

/// Allocates physical backing for buffer objects
pub struct BufferAllocator {
    platform: Arc<dyn DmaPlatform>,
}

impl BufferAllocator {
    pub fn new(platform: Arc<dyn DmaPlatform>) -> Self {
        Self { platform }
    }

    pub fn platform(&self) -> &Arc<dyn DmaPlatform> {
        &self.platform
    }

    /// Allocate `size` bytes, rounded up to the page size, write-combined
    pub fn allocate(&self, size: usize) -> Result<Allocation> {
        self.allocate_attrs(size, DmaAttrs::WRITE_COMBINE)
    }

    /// Allocate `size` bytes with explicit attributes
    pub fn allocate_attrs(&self, size: usize, attrs: DmaAttrs) -> Result<Allocation> {
        let size = page_align(size).ok_or(Error::OutOfMemory)?;
        if size == 0 {
            return Err(Error::InvalidArgument);
        }

        let allocation = if self.platform.has_iommu() {
            self.allocate_pages(size, attrs)?
        } else {
            let block = self.platform.alloc_coherent(size, attrs)?;
            Allocation {
                cpu_addr: block.cpu_addr,
                dma_addr: block.dma_addr,
                size,
                attrs,
                backing: Backing::Coherent(block),
                platform: self.platform.clone(),
            }
        };

        debug!(
            "npu: allocated {:#x} bytes, dma {:#x}, {}",
            size,
            allocation.dma_addr,
            if allocation.pages().is_some() { "paged" } else { "coherent" }
        );
        Ok(allocation)
    }

    fn allocate_pages(&self, size: usize, attrs: DmaAttrs) -> Result<Allocation> {
        let pages = self.platform.alloc_pages(size / PAGE_SIZE)?;

        let dma_addr = match self.platform.iommu_map(&pages) {
            Ok(addr) => addr,
            Err(err) => {
                self.platform.free_pages(&pages);
                return Err(err);
            }
        };

        let cpu_addr = match self.platform.vmap(&pages, attrs) {
            Ok(addr) => addr,
            Err(err) => {
                self.platform.iommu_unmap(dma_addr, size);
                self.platform.free_pages(&pages);
                return Err(err);
            }
        };

        Ok(Allocation {
            cpu_addr,
            dma_addr,
            size,
            attrs,
            backing: Backing::Pages(pages),
            platform: self.platform.clone(),
        })
    }
}
