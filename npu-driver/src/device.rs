//! NPU device and its clients
//!
//! [`NpuDevice`] owns the shared state: the buffer allocator, the mmap
//! offset space, the dma-buf table and the task engine. Each open of the
//! device creates a [`Client`] with its own handle namespace and address
//! space.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::abi::SubmitArgs;
use crate::allocator::BufferAllocator;
use crate::config::NpuConfig;
use crate::engine::{SoftEngine, TaskEngine};
use crate::error::{Error, Result};
use crate::export::PrimeTable;
use crate::handle::HandleTable;
use crate::kmem::Kmem;
use crate::object::GemObject;
use crate::offset::OffsetManager;
use crate::platform::{page_align, DmaAddr, DmaAttrs, DmaPlatform, PAGE_SHIFT, PAGE_SIZE};
use crate::sim::SimPlatform;
use crate::task;
use crate::vm::{AddressSpace, Vma};

/// NPU statistics
#[derive(Debug)]
pub struct NpuStats {
    pub buffers_created: AtomicU64,
    pub buffers_destroyed: AtomicU64,
    pub tasks_submitted: AtomicU64,
    pub tasks_failed: AtomicU64,
}

impl NpuStats {
    pub fn new() -> Self {
        Self {
            buffers_created: AtomicU64::new(0),
            buffers_destroyed: AtomicU64::new(0),
            tasks_submitted: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
        }
    }
}

impl Default for NpuStats {
    fn default() -> Self {
        Self::new()
    }
}

/// One open of the device
pub struct Client {
    id: u32,
    handles: HandleTable,
    mm: Arc<AddressSpace>,
}

impl Client {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Address space user pointers of this client refer to
    pub fn mm(&self) -> &Arc<AddressSpace> {
        &self.mm
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("handles", &self.handles.len())
            .finish()
    }
}

/// NPU device instance
pub struct NpuDevice {
    config: NpuConfig,
    allocator: BufferAllocator,
    offsets: Arc<OffsetManager>,
    prime: PrimeTable,
    kmem: Kmem,
    engine: Box<dyn TaskEngine>,
    next_client: AtomicU32,
    stats: NpuStats,
}

impl NpuDevice {
    pub fn new(
        config: NpuConfig,
        platform: Arc<dyn DmaPlatform>,
        engine: Box<dyn TaskEngine>,
    ) -> Self {
        info!(
            "npu: device up, {} backing",
            if platform.has_iommu() { "iommu" } else { "coherent" }
        );
        Self {
            config,
            allocator: BufferAllocator::new(platform),
            offsets: Arc::new(OffsetManager::new()),
            prime: PrimeTable::new(),
            kmem: Kmem::new(),
            engine,
            next_client: AtomicU32::new(1),
            stats: NpuStats::new(),
        }
    }

    /// Device on a [`SimPlatform`] sized from `config`, with a [`SoftEngine`]
    pub fn simulated(config: NpuConfig) -> (Self, Arc<SimPlatform>) {
        let platform = SimPlatform::new(config.iommu, config.memory_pool_bytes());
        let device = Self::new(config, platform.clone(), Box::new(SoftEngine::new()));
        (device, platform)
    }

    pub fn config(&self) -> &NpuConfig {
        &self.config
    }

    pub fn kmem(&self) -> &Kmem {
        &self.kmem
    }

    pub fn engine(&self) -> &dyn TaskEngine {
        self.engine.as_ref()
    }

    pub fn offsets(&self) -> &OffsetManager {
        &self.offsets
    }

    pub fn prime(&self) -> &PrimeTable {
        &self.prime
    }

    pub fn stats(&self) -> &NpuStats {
        &self.stats
    }

    /// Open a new client on user address space `mm`
    pub fn open(&self, mm: Arc<AddressSpace>) -> Client {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        debug!("npu: client {} opened", id);
        Client {
            id,
            handles: HandleTable::new(),
            mm,
        }
    }

    /// Close a client, releasing every handle it still holds
    pub fn close(&self, client: Client) {
        debug!(
            "npu: client {} closed with {} handles",
            client.id,
            client.handles.len()
        );
        client.handles.release_all();
    }

    /// Create a write-combined buffer of at least `size` bytes
    pub fn gem_create(&self, client: &Client, size: u64) -> Result<u32> {
        self.gem_create_with_attrs(client, size, DmaAttrs::WRITE_COMBINE)
    }

    pub fn gem_create_with_attrs(&self, client: &Client, size: u64, attrs: DmaAttrs) -> Result<u32> {
        let size = usize::try_from(size).map_err(|_| Error::OutOfMemory)?;
        let object = GemObject::create(&self.allocator, &self.offsets, size, attrs)?;
        // the handle takes over the creation reference
        let handle = client.handles.create(&object)?;
        self.stats.buffers_created.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    /// Reference to the object behind `handle`
    pub fn lookup(&self, client: &Client, handle: u32) -> Result<Arc<GemObject>> {
        client.handles.lookup(handle)
    }

    /// mmap offset of the object behind `handle`
    pub fn gem_map_offset(&self, client: &Client, handle: u32) -> Result<u64> {
        let object = self.lookup(client, handle)?;
        object.create_mmap_offset()
    }

    pub fn gem_destroy(&self, client: &Client, handle: u32) -> Result<()> {
        client.handles.delete(handle)?;
        self.stats.buffers_destroyed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Copy one task from user memory and run it
    pub fn submit(&self, client: &Client, args: &SubmitArgs) -> Result<()> {
        self.stats.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        let ret = task::submit(self, client, args);
        if ret.is_err() {
            self.stats.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
        ret
    }

    /// Map `len` bytes at mmap `offset` into the client's address space
    ///
    /// The offset must come from [`Self::gem_map_offset`] on an object the
    /// client holds a handle to.
    pub fn mmap(&self, client: &Client, offset: u64, len: usize) -> Result<usize> {
        if offset & (PAGE_SIZE as u64 - 1) != 0 {
            return Err(Error::InvalidArgument);
        }
        let pages = page_align(len).ok_or(Error::InvalidArgument)? >> PAGE_SHIFT;
        let object = self
            .offsets
            .lookup(offset >> PAGE_SHIFT, pages as u64)
            .ok_or_else(|| {
                warn!("npu: no object at mmap offset {:#x}", offset);
                Error::InvalidArgument
            })?;
        if client.handles.find(&object).is_none() {
            return Err(Error::InvalidHandle);
        }
        self.map_object(client, &object, offset >> PAGE_SHIFT, len)
    }

    /// Map an exported buffer through its dma-buf descriptor
    pub fn mmap_dmabuf(&self, client: &Client, fd: u32, len: usize) -> Result<usize> {
        let buf = self.prime.get(fd)?;
        self.map_object(client, buf.object(), 0, len)
    }

    fn map_object(
        &self,
        client: &Client,
        object: &Arc<GemObject>,
        pgoff: u64,
        len: usize,
    ) -> Result<usize> {
        let len = page_align(len).ok_or(Error::InvalidArgument)?;
        let start = client.mm.reserve(len)?;
        let mut vma = Vma::new(start, len, pgoff);
        object.mmap_obj(&mut vma)?;
        client.mm.insert_vma(vma);
        debug!("npu: object {} mapped at {:#x}", object.id(), start);
        Ok(start)
    }

    /// Export the object behind `handle` as a dma-buf descriptor
    pub fn handle_to_fd(&self, client: &Client, handle: u32) -> Result<u32> {
        let object = self.lookup(client, handle)?;
        self.prime.export(&object)
    }

    /// Handle for the object behind dma-buf `fd`, creating one if the client
    /// has none yet
    pub fn fd_to_handle(&self, client: &Client, fd: u32) -> Result<u32> {
        let buf = self.prime.get(fd)?;
        client.handles.find_or_create(buf.object())
    }

    /// Close dma-buf descriptor `fd`
    pub fn close_fd(&self, fd: u32) -> Result<()> {
        self.prime.close(fd)
    }

    /// Device address of the buffer behind dma-buf `fd`
    pub fn gem_dma_addr(&self, client: &Client, fd: u32) -> Result<DmaAddr> {
        let handle = self.fd_to_handle(client, fd)?;
        let object = self.lookup(client, handle)?;
        Ok(object.dma_addr())
    }
}
