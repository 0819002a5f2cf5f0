//! Task submission
//!
//! A submit call copies one [`SubmitTask`] header out of user memory, then
//! the memory handle array it points at, into a kernel-owned [`Task`].
//! Both copies are released before the call returns, whatever the engine
//! reports.

use std::fmt;

use log::{debug, error};
use zerocopy::{FromZeros, IntoBytes};

use crate::abi::{MemHandle, SubmitArgs, SubmitTask};
use crate::device::{Client, NpuDevice};
use crate::error::{Error, Result};
use crate::kmem::{KBox, Kmem};
use crate::vm::AddressSpace;

/// Kernel-side copy of one submitted task
pub struct Task<'a> {
    pub num_addresses: u32,
    pub timeout: u32,
    address_list: Option<KBox<'a, Vec<MemHandle>>>,
    device: &'a NpuDevice,
    client: &'a Client,
}

impl<'a> Task<'a> {
    /// Memory handles referenced by the task
    pub fn address_list(&self) -> &[MemHandle] {
        self.address_list
            .as_deref()
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn device(&self) -> &'a NpuDevice {
        self.device
    }

    /// Client the task was submitted on
    pub fn client(&self) -> &'a Client {
        self.client
    }
}

impl fmt::Debug for Task<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("client", &self.client.id())
            .field("num_addresses", &self.num_addresses)
            .field("timeout", &self.timeout)
            .field("address_list", &self.address_list())
            .finish()
    }
}

/// Copy the handle array described by `local` into `task`
fn fill_task_desc<'a>(
    local: &SubmitTask,
    task: &mut Task<'a>,
    kmem: &'a Kmem,
    mm: &AddressSpace,
    max_addresses: u32,
) -> Result<()> {
    if local.num_addresses > max_addresses {
        error!(
            "npu: task references {} buffers, limit is {}",
            local.num_addresses, max_addresses
        );
        return Err(Error::InvalidArgument);
    }
    let count = local.num_addresses as usize;
    if count.checked_mul(MemHandle::SIZE).is_none() {
        return Err(Error::InvalidArgument);
    }

    let mut handles = kmem.alloc_array::<MemHandle>(count)?;

    let base = usize::try_from(local.address_list).map_err(|_| Error::Fault)?;
    // the partially filled array is released on return
    if let Err(err) = mm.copy_from_user(handles.as_mut_slice().as_mut_bytes(), base) {
        error!("npu: failed to copy address list from user ptr");
        return Err(err);
    }

    task.num_addresses = local.num_addresses;
    task.address_list = Some(handles);
    Ok(())
}

/// Copy a task out of user memory and hand it to the engine
pub fn submit(device: &NpuDevice, client: &Client, args: &SubmitArgs) -> Result<()> {
    let user_task = usize::try_from(args.tasks).map_err(|_| Error::Fault)?;
    if user_task == 0 {
        return Err(Error::InvalidArgument);
    }

    // the count is read from this copy only, never again from user memory
    let mut local = SubmitTask::new_zeroed();
    client.mm().copy_from_user(local.as_mut_bytes(), user_task)?;

    let kmem = device.kmem();
    let mut task = kmem.alloc(Task {
        num_addresses: 0,
        timeout: local.timeout,
        address_list: None,
        device,
        client,
    })?;

    fill_task_desc(
        &local,
        &mut task,
        kmem,
        client.mm(),
        device.config().max_buffers_per_task,
    )?;

    debug!(
        "npu: client {} submitting task with {} buffers",
        client.id(),
        task.num_addresses
    );
    let ret = device.engine().submit(&task);

    task.address_list = None;
    drop(task);
    ret
}
