//! Software DMA platform
//!
//! Backs every allocation with heap memory and hands out synthetic physical,
//! bus and kernel addresses. Keeps an outstanding-byte counter and has
//! switches to fail each primitive, so every error path above it can be
//! driven deliberately.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use spin::Mutex;

use crate::error::{Error, Result};
use crate::export::{SgEntry, SgTable};
use crate::platform::{
    CoherentBlock, DmaAddr, DmaAttrs, DmaPlatform, KernelAddr, PageFrame, PageRef, PAGE_SIZE,
};
use crate::vm::Vma;

const PHYS_BASE: u64 = 0x8000_0000;
const IOVA_BASE: u64 = 0x1_0000_0000;
const KVA_BASE: usize = 0xffff_c900_0000_0000;

/// Failure switches for the simulated primitives
#[derive(Debug, Default)]
pub struct FailPoints {
    pub alloc: AtomicBool,
    pub iommu_map: AtomicBool,
    pub vmap: AtomicBool,
    pub sgtable: AtomicBool,
    pub mmap: AtomicBool,
}

/// Heap-backed implementation of [`DmaPlatform`]
pub struct SimPlatform {
    iommu: bool,
    capacity: u64,
    outstanding: AtomicU64,
    next_phys: AtomicU64,
    next_iova: AtomicU64,
    next_kva: AtomicUsize,
    vmaps: Mutex<BTreeMap<KernelAddr, usize>>,
    pub fail: FailPoints,
}

impl SimPlatform {
    pub fn new(iommu: bool, capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            iommu,
            capacity,
            outstanding: AtomicU64::new(0),
            next_phys: AtomicU64::new(PHYS_BASE),
            next_iova: AtomicU64::new(IOVA_BASE),
            next_kva: AtomicUsize::new(KVA_BASE),
            vmaps: Mutex::new(BTreeMap::new()),
            fail: FailPoints::default(),
        })
    }

    /// Bytes currently allocated and not yet freed
    pub fn outstanding_bytes(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Live kernel mappings created by `vmap`
    pub fn live_vmaps(&self) -> usize {
        self.vmaps.lock().len()
    }

    fn charge(&self, bytes: u64) -> Result<()> {
        if self.fail.alloc.load(Ordering::Relaxed) {
            return Err(Error::OutOfMemory);
        }
        self.outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_add(bytes).filter(|&total| total <= self.capacity)
            })
            .map(|_| ())
            .map_err(|_| Error::OutOfMemory)
    }

    fn uncharge(&self, bytes: u64) {
        self.outstanding.fetch_sub(bytes, Ordering::SeqCst);
    }

    fn new_frame(phys: u64) -> Result<PageRef> {
        let mut data = Vec::new();
        data.try_reserve_exact(PAGE_SIZE)?;
        data.resize(PAGE_SIZE, 0);
        Ok(Arc::new(PageFrame::new(phys, data.into_boxed_slice())))
    }

    fn kva_window(&self, size: usize) -> KernelAddr {
        // leave a hole between windows like vmalloc guard pages
        self.next_kva.fetch_add(size + PAGE_SIZE, Ordering::Relaxed)
    }
}

impl DmaPlatform for SimPlatform {
    fn has_iommu(&self) -> bool {
        self.iommu
    }

    fn alloc_coherent(&self, size: usize, attrs: DmaAttrs) -> Result<CoherentBlock> {
        let count = size / PAGE_SIZE;
        self.charge(size as u64)?;

        let base = self.next_phys.fetch_add(size as u64, Ordering::Relaxed);
        let mut frames = Vec::new();
        if frames.try_reserve_exact(count).is_err() {
            self.uncharge(size as u64);
            return Err(Error::OutOfMemory);
        }
        for i in 0..count {
            match Self::new_frame(base + (i * PAGE_SIZE) as u64) {
                Ok(frame) => frames.push(frame),
                Err(err) => {
                    self.uncharge(size as u64);
                    return Err(err);
                }
            }
        }

        let cpu_addr = self.kva_window(size);
        // without an IOMMU the bus sees physical addresses
        let dma_addr = base;
        trace!(
            "sim: coherent {:#x} bytes at phys {:#x} kva {:#x} attrs {:?}",
            size,
            base,
            cpu_addr,
            attrs
        );
        Ok(CoherentBlock::new(cpu_addr, dma_addr, frames))
    }

    fn free_coherent(&self, block: &CoherentBlock, _attrs: DmaAttrs) {
        trace!("sim: free coherent {:#x}", block.dma_addr);
        self.uncharge(block.size as u64);
    }

    fn alloc_pages(&self, count: usize) -> Result<Vec<PageRef>> {
        let bytes = (count * PAGE_SIZE) as u64;
        self.charge(bytes)?;

        let mut pages = Vec::new();
        if pages.try_reserve_exact(count).is_err() {
            self.uncharge(bytes);
            return Err(Error::OutOfMemory);
        }
        for _ in 0..count {
            // pages come from anywhere; skip a frame so they are never contiguous
            let phys = self
                .next_phys
                .fetch_add(2 * PAGE_SIZE as u64, Ordering::Relaxed);
            match Self::new_frame(phys) {
                Ok(frame) => pages.push(frame),
                Err(err) => {
                    self.uncharge(bytes);
                    return Err(err);
                }
            }
        }
        Ok(pages)
    }

    fn free_pages(&self, pages: &[PageRef]) {
        self.uncharge((pages.len() * PAGE_SIZE) as u64);
    }

    fn iommu_map(&self, pages: &[PageRef]) -> Result<DmaAddr> {
        if self.fail.iommu_map.load(Ordering::Relaxed) {
            return Err(Error::OutOfMemory);
        }
        let size = (pages.len() * PAGE_SIZE) as u64;
        Ok(self.next_iova.fetch_add(size, Ordering::Relaxed))
    }

    fn iommu_unmap(&self, iova: DmaAddr, size: usize) {
        trace!("sim: iommu unmap {:#x}+{:#x}", iova, size);
    }

    fn vmap(&self, pages: &[PageRef], _attrs: DmaAttrs) -> Result<KernelAddr> {
        if self.fail.vmap.load(Ordering::Relaxed) {
            return Err(Error::OutOfMemory);
        }
        let addr = self.kva_window(pages.len() * PAGE_SIZE);
        self.vmaps.lock().insert(addr, pages.len());
        Ok(addr)
    }

    fn vunmap(&self, addr: KernelAddr) {
        if self.vmaps.lock().remove(&addr).is_none() {
            debug!("sim: vunmap of unknown address {:#x}", addr);
        }
    }

    fn get_sgtable(
        &self,
        table: &mut SgTable,
        block: &CoherentBlock,
        _attrs: DmaAttrs,
    ) -> Result<()> {
        if self.fail.sgtable.load(Ordering::Relaxed) {
            return Err(Error::OutOfMemory);
        }
        table.push(SgEntry {
            phys: block.phys(),
            dma_address: block.dma_addr,
            length: block.size,
        })
    }

    fn mmap_coherent(&self, vma: &mut Vma, block: &CoherentBlock, _attrs: DmaAttrs) -> Result<()> {
        let pages = vma.len() / PAGE_SIZE;
        if pages > block.frames().len() {
            return Err(Error::InvalidArgument);
        }
        for (i, frame) in block.frames().iter().take(pages).enumerate() {
            // fail halfway so callers see a partially built mapping
            if i == pages / 2 && self.fail.mmap.load(Ordering::Relaxed) {
                return Err(Error::OutOfMemory);
            }
            vma.insert_page(vma.start + i * PAGE_SIZE, frame.clone());
        }
        Ok(())
    }
}
