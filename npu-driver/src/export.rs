//! Buffer sharing
//!
//! Scatter-gather descriptions and kernel mappings of buffer objects, and
//! the dma-buf table through which buffers are exported to other clients
//! and subsystems.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, error};
use spin::RwLock;

use crate::allocator::Backing;
use crate::error::{Error, Result};
use crate::object::GemObject;
use crate::platform::{DmaAddr, DmaAttrs, KernelAddr, PageRef, PhysAddr, PAGE_SIZE};

/// One physically contiguous range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub phys: PhysAddr,
    pub dma_address: DmaAddr,
    pub length: usize,
}

/// Scatter-gather table
#[derive(Debug, Default)]
pub struct SgTable {
    entries: Vec<SgEntry>,
}

impl SgTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a range
    pub fn push(&mut self, entry: SgEntry) -> Result<()> {
        self.entries.try_reserve(1)?;
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    pub fn nents(&self) -> usize {
        self.entries.len()
    }

    /// Sum of all range lengths
    pub fn total_len(&self) -> usize {
        self.entries.iter().map(|e| e.length).sum()
    }
}

/// Build the table for a page array, merging physically adjacent pages
fn sg_from_pages(table: &mut SgTable, pages: &[PageRef], iova: DmaAddr) -> Result<()> {
    let mut dma = iova;
    let mut run: Option<SgEntry> = None;
    for page in pages {
        run = match run {
            Some(mut entry) if entry.phys + entry.length as u64 == page.phys() => {
                entry.length += PAGE_SIZE;
                Some(entry)
            }
            previous => {
                if let Some(entry) = previous {
                    table.push(entry)?;
                }
                Some(SgEntry {
                    phys: page.phys(),
                    dma_address: dma,
                    length: PAGE_SIZE,
                })
            }
        };
        dma += PAGE_SIZE as u64;
    }
    if let Some(entry) = run {
        table.push(entry)?;
    }
    Ok(())
}

/// Describe `object`'s physical pages for import by another subsystem
pub fn get_sg_table(object: &GemObject) -> Result<SgTable> {
    let mut table = SgTable::new();
    let ret = match object.backing() {
        Backing::Pages(pages) => sg_from_pages(&mut table, pages, object.dma_addr()),
        Backing::Coherent(block) => {
            object
                .allocation()
                .platform()
                .get_sgtable(&mut table, block, object.attrs())
        }
    };
    if let Err(err) = ret {
        error!("npu: failed to allocate sgt for object {}: {}", object.id(), err);
        return Err(err);
    }
    Ok(table)
}

/// A kernel virtual mapping of a buffer object
#[derive(Debug)]
#[must_use = "kernel mappings must be released with vunmap"]
pub struct KernelMapping<'a> {
    addr: KernelAddr,
    /// Whether `addr` came from a fresh vmap
    vmapped: bool,
    object: &'a GemObject,
}

impl KernelMapping<'_> {
    pub fn addr(&self) -> KernelAddr {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.object.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn frames(&self) -> &[PageRef] {
        match self.object.backing() {
            Backing::Pages(pages) => pages,
            Backing::Coherent(block) => block.frames(),
        }
    }

    fn for_each_chunk(
        &self,
        offset: usize,
        len: usize,
        mut f: impl FnMut(&PageRef, usize, std::ops::Range<usize>),
    ) -> Result<()> {
        let end = offset.checked_add(len).ok_or(Error::InvalidArgument)?;
        if end > self.len() {
            return Err(Error::InvalidArgument);
        }
        let mut pos = offset;
        while pos < end {
            let in_page = pos % PAGE_SIZE;
            let chunk = (PAGE_SIZE - in_page).min(end - pos);
            f(&self.frames()[pos / PAGE_SIZE], in_page, pos - offset..pos - offset + chunk);
            pos += chunk;
        }
        Ok(())
    }

    /// Read through the mapping
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.for_each_chunk(offset, buf.len(), |frame, at, range| {
            frame.read(at, &mut buf[range])
        })
    }

    /// Write through the mapping
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.for_each_chunk(offset, data.len(), |frame, at, range| {
            frame.write(at, &data[range])
        })
    }
}

/// Map `object` into kernel virtual memory
///
/// Paged objects get a new write-combined mapping over exactly their pages.
/// Coherent objects reuse the address the allocator returned, unless they
/// were allocated without a kernel mapping.
pub fn vmap(object: &GemObject) -> Result<KernelMapping<'_>> {
    if let Some(pages) = object.pages() {
        let addr = object
            .allocation()
            .platform()
            .vmap(pages, DmaAttrs::WRITE_COMBINE)
            .map_err(|_| Error::OutOfMemory)?;
        return Ok(KernelMapping {
            addr,
            vmapped: true,
            object,
        });
    }

    if object.attrs().contains(DmaAttrs::NO_KERNEL_MAPPING) {
        return Err(Error::Unsupported);
    }

    Ok(KernelMapping {
        addr: object.cpu_addr(),
        vmapped: false,
        object,
    })
}

/// Release a mapping from [`vmap`]
pub fn vunmap(object: &GemObject, mapping: KernelMapping<'_>) {
    if mapping.vmapped {
        object.allocation().platform().vunmap(mapping.addr);
    }
    // Nothing to do for coherent objects, the allocator owns that mapping
}

/// An exported buffer
pub struct DmaBuf {
    fd: u32,
    object: Arc<GemObject>,
}

impl DmaBuf {
    pub fn fd(&self) -> u32 {
        self.fd
    }

    pub fn object(&self) -> &Arc<GemObject> {
        &self.object
    }

    pub fn size(&self) -> usize {
        self.object.size()
    }

    /// Attachment mapping for an importer
    pub fn map_attachment(&self) -> Result<SgTable> {
        get_sg_table(&self.object)
    }
}

/// Exported dma-bufs of one device, indexed by descriptor
pub struct PrimeTable {
    bufs: RwLock<BTreeMap<u32, Arc<DmaBuf>>>,
    next_fd: AtomicU32,
}

impl PrimeTable {
    pub fn new() -> Self {
        Self {
            bufs: RwLock::new(BTreeMap::new()),
            next_fd: AtomicU32::new(3),
        }
    }

    /// Export `object`, reusing its dma-buf if it already has one
    pub fn export(&self, object: &Arc<GemObject>) -> Result<u32> {
        let mut exported = object.dma_buf.lock();
        if let Some(fd) = *exported {
            return Ok(fd);
        }
        let fd = self
            .next_fd
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |fd| fd.checked_add(1))
            .map_err(|_| Error::OutOfMemory)?;
        self.bufs.write().insert(
            fd,
            Arc::new(DmaBuf {
                fd,
                object: object.clone(),
            }),
        );
        *exported = Some(fd);
        debug!("npu: exported object {} as fd {}", object.id(), fd);
        Ok(fd)
    }

    pub fn get(&self, fd: u32) -> Result<Arc<DmaBuf>> {
        self.bufs.read().get(&fd).cloned().ok_or(Error::InvalidArgument)
    }

    /// Close an exported descriptor, dropping its object reference
    ///
    /// Locks in the same order as [`export`](Self::export): the object's
    /// export slot, then the descriptor table.
    pub fn close(&self, fd: u32) -> Result<()> {
        let buf = self.get(fd)?;
        {
            let mut exported = buf.object.dma_buf.lock();
            self.bufs.write().remove(&fd).ok_or(Error::InvalidArgument)?;
            if *exported == Some(fd) {
                *exported = None;
            }
        }
        debug!("npu: closed fd {} of object {}", fd, buf.object.id());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bufs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PrimeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::BufferAllocator;
    use crate::offset::OffsetManager;
    use crate::sim::SimPlatform;

    fn create(sim: &Arc<SimPlatform>, size: usize, attrs: DmaAttrs) -> Arc<GemObject> {
        let allocator = BufferAllocator::new(sim.clone());
        let offsets = Arc::new(OffsetManager::new());
        GemObject::create(&allocator, &offsets, size, attrs).unwrap()
    }

    #[test]
    fn test_sg_table_coherent() {
        let sim = SimPlatform::new(false, 1 << 20);
        let object = create(&sim, 100, DmaAttrs::WRITE_COMBINE);
        let table = get_sg_table(&object).unwrap();
        assert_eq!(table.nents(), 1);
        assert_eq!(table.total_len(), PAGE_SIZE);
        assert_eq!(table.entries()[0].dma_address, object.dma_addr());
    }

    #[test]
    fn test_sg_table_paged() {
        let sim = SimPlatform::new(true, 1 << 20);
        let object = create(&sim, 3 * PAGE_SIZE, DmaAttrs::WRITE_COMBINE);
        let table = get_sg_table(&object).unwrap();
        assert_eq!(table.total_len(), 3 * PAGE_SIZE);
        assert_eq!(table.nents(), 3);
        assert_eq!(
            table.entries()[2].dma_address,
            object.dma_addr() + 2 * PAGE_SIZE as u64
        );
    }

    #[test]
    fn test_sg_merges_adjacent_pages() {
        use crate::platform::PageFrame;
        let frame = |phys| Arc::new(PageFrame::new(phys, vec![0u8; PAGE_SIZE].into_boxed_slice()));
        let pages = vec![frame(0x1000), frame(0x2000), frame(0x8000)];
        let mut table = SgTable::new();
        sg_from_pages(&mut table, &pages, 0x10_0000).unwrap();
        assert_eq!(
            table.entries(),
            &[
                SgEntry {
                    phys: 0x1000,
                    dma_address: 0x10_0000,
                    length: 2 * PAGE_SIZE
                },
                SgEntry {
                    phys: 0x8000,
                    dma_address: 0x10_2000,
                    length: PAGE_SIZE
                },
            ]
        );
    }

    #[test]
    fn test_sg_table_failure() {
        let sim = SimPlatform::new(false, 1 << 20);
        let object = create(&sim, PAGE_SIZE, DmaAttrs::WRITE_COMBINE);
        sim.fail.sgtable.store(true, Ordering::Relaxed);
        assert_eq!(get_sg_table(&object).unwrap_err(), Error::OutOfMemory);
    }

    #[test]
    fn test_vmap_paged() {
        let sim = SimPlatform::new(true, 1 << 20);
        let object = create(&sim, 2 * PAGE_SIZE, DmaAttrs::WRITE_COMBINE);
        let before = sim.live_vmaps();

        let mapping = vmap(&object).unwrap();
        assert_ne!(mapping.addr(), object.cpu_addr());
        assert_eq!(sim.live_vmaps(), before + 1);
        mapping.write(PAGE_SIZE - 2, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 2];
        object.pages().unwrap()[1].read(0, &mut buf);
        assert_eq!(buf, [3, 4]);
        assert_eq!(mapping.write(2 * PAGE_SIZE - 1, &[0, 0]), Err(Error::InvalidArgument));

        vunmap(&object, mapping);
        assert_eq!(sim.live_vmaps(), before);
    }

    #[test]
    fn test_vmap_coherent() {
        let sim = SimPlatform::new(false, 1 << 20);
        let object = create(&sim, PAGE_SIZE, DmaAttrs::WRITE_COMBINE);
        let mapping = vmap(&object).unwrap();
        assert_eq!(mapping.addr(), object.cpu_addr());
        mapping.write(0, b"npu").unwrap();
        let mut buf = [0u8; 3];
        mapping.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"npu");
        vunmap(&object, mapping);
        assert_eq!(sim.live_vmaps(), 0);

        let hidden = create(&sim, PAGE_SIZE, DmaAttrs::NO_KERNEL_MAPPING);
        assert_eq!(vmap(&hidden).unwrap_err(), Error::Unsupported);
        assert_eq!(Error::Unsupported.errno(), syscall::error::ENOMEM);
    }

    #[test]
    fn test_vmap_failure() {
        let sim = SimPlatform::new(true, 1 << 20);
        let object = create(&sim, PAGE_SIZE, DmaAttrs::WRITE_COMBINE);
        sim.fail.vmap.store(true, Ordering::Relaxed);
        assert_eq!(vmap(&object).unwrap_err(), Error::OutOfMemory);
    }

    #[test]
    fn test_prime_export_is_cached() {
        let sim = SimPlatform::new(false, 1 << 20);
        let prime = PrimeTable::new();
        let object = create(&sim, PAGE_SIZE, DmaAttrs::WRITE_COMBINE);

        let fd = prime.export(&object).unwrap();
        assert_eq!(prime.export(&object).unwrap(), fd);
        assert_eq!(prime.len(), 1);
        assert_eq!(prime.get(fd).unwrap().size(), PAGE_SIZE);
        assert_eq!(prime.get(fd).unwrap().map_attachment().unwrap().total_len(), PAGE_SIZE);

        drop(object);
        // the dma-buf keeps the memory alive
        assert_eq!(sim.outstanding_bytes(), PAGE_SIZE as u64);
        prime.close(fd).unwrap();
        assert_eq!(sim.outstanding_bytes(), 0);
        assert_eq!(prime.close(fd), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_export_close_keep_cache_consistent() {
        let sim = SimPlatform::new(false, 1 << 20);
        let prime = PrimeTable::new();
        let object = create(&sim, PAGE_SIZE, DmaAttrs::WRITE_COMBINE);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..100 {
                        let fd = prime.export(&object).unwrap();
                        // another thread may have closed it already
                        let _ = prime.close(fd);
                    }
                });
            }
        });

        // a cached descriptor must still be open, and nothing is orphaned
        match *object.dma_buf.lock() {
            Some(fd) => {
                assert!(prime.get(fd).is_ok());
                assert_eq!(prime.len(), 1);
            }
            None => assert!(prime.is_empty()),
        }

        let fd = prime.export(&object).unwrap();
        prime.close(fd).unwrap();
        assert!(object.dma_buf.lock().is_none());
        assert_ne!(prime.export(&object).unwrap(), fd);
    }
}
