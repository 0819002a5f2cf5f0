//! ioctl dispatch
//!
//! Decodes a raw argument block, runs the matching device operation and
//! writes any output fields back into the block.

use log::{debug, error};

use crate::abi::{
    read_args, write_args, GemCreateArgs, GemDestroyArgs, GemMapOffsetArgs, SubmitArgs,
};
use crate::device::{Client, NpuDevice};
use crate::error::{Error, Result};

pub const DRM_NPU_SUBMIT: u32 = 0x00;
pub const DRM_NPU_GEM_CREATE: u32 = 0x01;
pub const DRM_NPU_GEM_MMAP: u32 = 0x02;
pub const DRM_NPU_GEM_DESTROY: u32 = 0x03;

/// Run ioctl `cmd` with argument block `data`
///
/// Returns 0 or a negative errno.
pub fn ioctl(device: &NpuDevice, client: &Client, cmd: u32, data: &mut [u8]) -> isize {
    let ret = match cmd {
        DRM_NPU_SUBMIT => handle_submit(device, client, data),
        DRM_NPU_GEM_CREATE => handle_gem_create(device, client, data),
        DRM_NPU_GEM_MMAP => handle_gem_map_offset(device, client, data),
        DRM_NPU_GEM_DESTROY => handle_gem_destroy(device, client, data),
        _ => {
            error!("npu: unknown ioctl {:#x}", cmd);
            Err(Error::InvalidArgument)
        }
    };

    match ret {
        Ok(()) => 0,
        Err(err) => {
            debug!("npu: ioctl {:#x} failed: {}", cmd, err);
            err.to_ret()
        }
    }
}

fn handle_submit(device: &NpuDevice, client: &Client, data: &mut [u8]) -> Result<()> {
    let args: SubmitArgs = read_args(data)?;
    device.submit(client, &args)
}

fn handle_gem_create(device: &NpuDevice, client: &Client, data: &mut [u8]) -> Result<()> {
    let mut args: GemCreateArgs = read_args(data)?;
    args.handle = device.gem_create(client, args.size)?;
    write_args(&args, data)
}

fn handle_gem_map_offset(device: &NpuDevice, client: &Client, data: &mut [u8]) -> Result<()> {
    let mut args: GemMapOffsetArgs = read_args(data)?;
    args.offset = device.gem_map_offset(client, args.handle)?;
    write_args(&args, data)
}

fn handle_gem_destroy(device: &NpuDevice, client: &Client, data: &mut [u8]) -> Result<()> {
    let args: GemDestroyArgs = read_args(data)?;
    device.gem_destroy(client, args.handle)
}
