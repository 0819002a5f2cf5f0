//! User address spaces
//!
//! A small model of the host VM subsystem: anonymous regions, VMAs backed by
//! buffer objects, page tables filled eagerly or on fault, and the
//! `copy_from_user` primitive the ioctl paths use.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use log::warn;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::object::GemObject;
use crate::platform::{page_align, PageRef, PAGE_SHIFT, PAGE_SIZE};

/// First address handed out by [`AddressSpace::reserve`]
const MMAP_BASE: usize = 0x1000_0000;

bitflags! {
    /// VMA flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const SHARED = 1 << 3;
        const IO = 1 << 14;
        /// Raw page-frame mapping, no struct page behind it
        const PFNMAP = 1 << 10;
        const DONTEXPAND = 1 << 18;
        const MIXEDMAP = 1 << 28;
        const DONTDUMP = 1 << 26;
    }
}

/// Page protection of a VMA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageProt {
    Cached,
    WriteCombine,
}

/// Outcome of a page fault handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmFault {
    /// A page was installed, retry the access
    NoPage,
    /// Deliver SIGBUS to the faulting process
    SigBus,
}

/// VMA callbacks
pub struct VmOperations {
    pub fault: fn(&mut Vma, usize) -> VmFault,
}

/// One mapped region of a user address space
pub struct Vma {
    pub start: usize,
    pub end: usize,
    pub flags: VmFlags,
    pub prot: PageProt,
    /// Page offset the region was mapped at
    pub pgoff: u64,
    /// Object backing the mapping, holding a reference until unmap
    pub object: Option<Arc<GemObject>>,
    pub ops: Option<&'static VmOperations>,
    ptes: BTreeMap<usize, PageRef>,
}

impl Vma {
    pub fn new(start: usize, len: usize, pgoff: u64) -> Self {
        Self {
            start,
            end: start + len,
            flags: VmFlags::READ | VmFlags::WRITE | VmFlags::SHARED,
            prot: PageProt::Cached,
            pgoff,
            object: None,
            ops: None,
            ptes: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, address: usize) -> bool {
        (self.start..self.end).contains(&address)
    }

    /// Install `page` at the page containing `address`
    pub fn insert_page(&mut self, address: usize, page: PageRef) -> VmFault {
        if !self.contains(address) {
            return VmFault::SigBus;
        }
        self.ptes.insert((address - self.start) >> PAGE_SHIFT, page);
        VmFault::NoPage
    }

    /// Page currently installed for `address`
    pub fn page_at(&self, address: usize) -> Option<&PageRef> {
        if !self.contains(address) {
            return None;
        }
        self.ptes.get(&((address - self.start) >> PAGE_SHIFT))
    }

    /// Number of populated page table entries
    pub fn resident_pages(&self) -> usize {
        self.ptes.len()
    }

    /// Drop every installed page
    pub fn zap(&mut self) {
        self.ptes.clear();
    }

    fn handle_fault(&mut self, address: usize) -> VmFault {
        match self.ops {
            Some(ops) => (ops.fault)(self, address),
            None => VmFault::SigBus,
        }
    }
}

impl fmt::Debug for Vma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vma")
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .field("flags", &self.flags)
            .field("prot", &self.prot)
            .field("resident", &self.ptes.len())
            .finish()
    }
}

/// Signal delivered to a process touching memory it may not
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    SigBus,
    SigSegv,
}

/// A user access that did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessFault {
    pub address: usize,
    pub signal: Signal,
}

enum Region {
    Anon(Box<[u8]>),
    Mapped(Vma),
}

impl Region {
    fn len(&self) -> usize {
        match self {
            Region::Anon(data) => data.len(),
            Region::Mapped(vma) => vma.len(),
        }
    }
}

struct Mm {
    regions: BTreeMap<usize, Region>,
    next: usize,
}

impl Mm {
    fn find(&mut self, address: usize) -> Option<(usize, &mut Region)> {
        let (&start, region) = self.regions.range_mut(..=address).next_back()?;
        if address < start + region.len() {
            Some((start, region))
        } else {
            None
        }
    }

    /// Access `len` bytes at `address` within a single page
    fn access_page(
        &mut self,
        address: usize,
        mut op: impl FnMut(&mut [u8], Option<&PageRef>, usize),
        len: usize,
    ) -> Result<(), AccessFault> {
        let segv = AccessFault {
            address,
            signal: Signal::SigSegv,
        };
        let (start, region) = self.find(address).ok_or(segv)?;
        match region {
            Region::Anon(data) => {
                let offset = address - start;
                if offset + len > data.len() {
                    return Err(segv);
                }
                op(&mut data[offset..offset + len], None, 0);
                Ok(())
            }
            Region::Mapped(vma) => {
                // Retry after each installed page, as the hardware would
                loop {
                    if let Some(page) = vma.page_at(address) {
                        op(&mut [], Some(page), address & (PAGE_SIZE - 1));
                        return Ok(());
                    }
                    match vma.handle_fault(address) {
                        VmFault::NoPage => continue,
                        VmFault::SigBus => {
                            warn!("npu: SIGBUS on access to {:#x}", address);
                            return Err(AccessFault {
                                address,
                                signal: Signal::SigBus,
                            });
                        }
                    }
                }
            }
        }
    }
}

/// One process's user address space
pub struct AddressSpace {
    mm: Mutex<Mm>,
}

impl AddressSpace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mm: Mutex::new(Mm {
                regions: BTreeMap::new(),
                next: MMAP_BASE,
            }),
        })
    }

    /// Reserve an unmapped, page-aligned range of `len` bytes
    ///
    /// A guard page is left after every reservation.
    pub fn reserve(&self, len: usize) -> Result<usize> {
        let len = page_align(len).ok_or(Error::InvalidArgument)?;
        if len == 0 {
            return Err(Error::InvalidArgument);
        }
        let mut mm = self.mm.lock();
        let start = mm.next;
        mm.next = start
            .checked_add(len + PAGE_SIZE)
            .ok_or(Error::OutOfMemory)?;
        Ok(start)
    }

    /// Map zeroed anonymous memory
    pub fn map_anon(&self, len: usize) -> Result<usize> {
        let start = self.reserve(len)?;
        let len = page_align(len).ok_or(Error::InvalidArgument)?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)?;
        data.resize(len, 0);
        self.mm
            .lock()
            .regions
            .insert(start, Region::Anon(data.into_boxed_slice()));
        Ok(start)
    }

    /// Install a prepared VMA
    pub fn insert_vma(&self, vma: Vma) {
        self.mm.lock().regions.insert(vma.start, Region::Mapped(vma));
    }

    /// Remove the region starting at `address`
    ///
    /// Dropping a VMA releases the object reference it held.
    pub fn munmap(&self, address: usize) -> Result<()> {
        self.mm
            .lock()
            .regions
            .remove(&address)
            .map(|_| ())
            .ok_or(Error::InvalidArgument)
    }

    /// Run `f` on the VMA starting at `address`
    pub fn with_vma<R>(&self, address: usize, f: impl FnOnce(&mut Vma) -> R) -> Option<R> {
        match self.mm.lock().regions.get_mut(&address) {
            Some(Region::Mapped(vma)) => Some(f(vma)),
            _ => None,
        }
    }

    /// Load from user memory, faulting pages in as needed
    pub fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), AccessFault> {
        let mut mm = self.mm.lock();
        let mut done = 0;
        while done < buf.len() {
            let addr = address.checked_add(done).ok_or(AccessFault {
                address,
                signal: Signal::SigSegv,
            })?;
            let chunk = (PAGE_SIZE - (addr & (PAGE_SIZE - 1))).min(buf.len() - done);
            let out = &mut buf[done..done + chunk];
            mm.access_page(
                addr,
                |anon, page, offset| match page {
                    Some(page) => page.read(offset, out),
                    None => out.copy_from_slice(anon),
                },
                chunk,
            )?;
            done += chunk;
        }
        Ok(())
    }

    /// Store to user memory, faulting pages in as needed
    pub fn write(&self, address: usize, data: &[u8]) -> Result<(), AccessFault> {
        let mut mm = self.mm.lock();
        let mut done = 0;
        while done < data.len() {
            let addr = address.checked_add(done).ok_or(AccessFault {
                address,
                signal: Signal::SigSegv,
            })?;
            let chunk = (PAGE_SIZE - (addr & (PAGE_SIZE - 1))).min(data.len() - done);
            let src = &data[done..done + chunk];
            mm.access_page(
                addr,
                |anon, page, offset| match page {
                    Some(page) => page.write(offset, src),
                    None => anon.copy_from_slice(src),
                },
                chunk,
            )?;
            done += chunk;
        }
        Ok(())
    }

    /// Copy `dst.len()` bytes from user address `src`
    ///
    /// Fails with [`Error::Fault`] on a null or unreadable source.
    pub fn copy_from_user(&self, dst: &mut [u8], src: usize) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        if src == 0 {
            return Err(Error::Fault);
        }
        self.read(src, dst).map_err(|_| Error::Fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PageFrame;

    fn frame(phys: u64) -> PageRef {
        Arc::new(PageFrame::new(phys, vec![0u8; PAGE_SIZE].into_boxed_slice()))
    }

    #[test]
    fn test_anon_read_write() {
        let mm = AddressSpace::new();
        let addr = mm.map_anon(100).unwrap();
        mm.write(addr + 10, b"hello").unwrap();
        let mut buf = [0u8; 5];
        mm.read(addr + 10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        // rounded to a page, then the guard page
        assert!(mm.write(addr + PAGE_SIZE - 1, &[1]).is_ok());
        assert_eq!(
            mm.write(addr + PAGE_SIZE, &[1]),
            Err(AccessFault {
                address: addr + PAGE_SIZE,
                signal: Signal::SigSegv
            })
        );
    }

    #[test]
    fn test_copy_from_user() {
        let mm = AddressSpace::new();
        let addr = mm.map_anon(PAGE_SIZE).unwrap();
        mm.write(addr, &[7, 8, 9]).unwrap();

        let mut buf = [0u8; 3];
        mm.copy_from_user(&mut buf, addr).unwrap();
        assert_eq!(buf, [7, 8, 9]);

        assert_eq!(mm.copy_from_user(&mut buf, 0), Err(Error::Fault));
        assert_eq!(mm.copy_from_user(&mut buf, 0xdead_0000), Err(Error::Fault));
        // straddling the end of the region
        assert_eq!(
            mm.copy_from_user(&mut buf, addr + PAGE_SIZE - 1),
            Err(Error::Fault)
        );
        assert_eq!(mm.copy_from_user(&mut [], 0), Ok(()));
    }

    #[test]
    fn test_vma_without_ops_sigbus() {
        let mm = AddressSpace::new();
        let start = mm.reserve(PAGE_SIZE).unwrap();
        mm.insert_vma(Vma::new(start, PAGE_SIZE, 0));
        let err = mm.write(start, &[1]).unwrap_err();
        assert_eq!(err.signal, Signal::SigBus);
    }

    #[test]
    fn test_vma_prefilled() {
        let mm = AddressSpace::new();
        let start = mm.reserve(2 * PAGE_SIZE).unwrap();
        let mut vma = Vma::new(start, 2 * PAGE_SIZE, 0);
        let page = frame(0x4000);
        assert_eq!(vma.insert_page(start + PAGE_SIZE, page.clone()), VmFault::NoPage);
        assert_eq!(vma.insert_page(start + 2 * PAGE_SIZE, frame(0)), VmFault::SigBus);
        mm.insert_vma(vma);

        mm.write(start + PAGE_SIZE + 1, &[0xaa]).unwrap();
        let mut buf = [0u8; 1];
        page.read(1, &mut buf);
        assert_eq!(buf[0], 0xaa);

        mm.munmap(start).unwrap();
        assert!(mm.munmap(start).is_err());
        assert!(mm.read(start + PAGE_SIZE, &mut buf).is_err());
    }
}
