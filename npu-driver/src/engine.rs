//! Task execution backends

use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};

use crate::abi::MemHandle;
use crate::error::{Error, Result};
use crate::platform::DmaAddr;
use crate::task::Task;

/// Hardware execution of a fully copied task
///
/// Implementations see a task only for the duration of `submit` and must not
/// keep its address list.
pub trait TaskEngine: Send + Sync {
    fn submit(&self, task: &Task<'_>) -> Result<()>;
}

/// Engine without hardware behind it
///
/// Resolves every memory handle to a device address, which is what
/// programming the hardware would need, and completes immediately.
#[derive(Debug, Default)]
pub struct SoftEngine {
    completed: AtomicU64,
}

impl SoftEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks run to completion so far
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

/// Device address of `mem.offset` within the buffer behind `mem.handle`
pub fn resolve(task: &Task<'_>, mem: &MemHandle) -> Result<DmaAddr> {
    let device = task.device();
    let client = task.client();
    let handle = device.fd_to_handle(client, mem.handle)?;
    let object = device.lookup(client, handle)?;
    if mem.offset as usize >= object.size() {
        warn!(
            "npu: offset {:#x} outside buffer of {:#x} bytes",
            mem.offset,
            object.size()
        );
        return Err(Error::InvalidArgument);
    }
    Ok(object.dma_addr() + u64::from(mem.offset))
}

impl TaskEngine for SoftEngine {
    fn submit(&self, task: &Task<'_>) -> Result<()> {
        for mem in task.address_list() {
            let addr = resolve(task, mem)?;
            debug!("npu: fd {} -> {:#x}", mem.handle, addr);
        }
        self.completed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
