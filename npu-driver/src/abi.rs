//! User ABI records
//!
//! Fixed layouts shared with user space. Records are copied out of and
//! back into raw argument blocks through zerocopy, never referenced in
//! place. Fields are native-endian, which the little-endian-only build
//! makes the little-endian wire order.

use std::mem::size_of;

use static_assertions::{const_assert, const_assert_eq};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

// The ABI is little-endian
const_assert!(cfg!(target_endian = "little"));

/// A memory handle referenced by a task
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MemHandle {
    /// dma-buf descriptor of the buffer
    pub handle: u32,
    /// Byte offset into the buffer
    pub offset: u32,
}

impl MemHandle {
    pub const SIZE: usize = size_of::<Self>();
}

/// Header of one submitted task
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SubmitTask {
    pub num_addresses: u32,
    pub timeout: u32,
    /// User pointer to `num_addresses` [`MemHandle`] records
    pub address_list: u64,
}

impl SubmitTask {
    pub const SIZE: usize = size_of::<Self>();
}

/// Argument block of the submit ioctl
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SubmitArgs {
    /// User pointer to a [`SubmitTask`]
    pub tasks: u64,
    pub num_tasks: u16,
    pub flags: u16,
    pub version: u32,
}

/// Argument block of the create ioctl
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GemCreateArgs {
    /// Out: new handle
    pub handle: u32,
    pub flags: u32,
    pub size: u64,
}

/// Argument block of the mmap-offset ioctl
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GemMapOffsetArgs {
    pub handle: u32,
    pub reserved: u32,
    /// Out: offset to pass to mmap
    pub offset: u64,
}

/// Argument block of the destroy ioctl
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GemDestroyArgs {
    pub handle: u32,
}

const_assert_eq!(size_of::<MemHandle>(), 8);
const_assert_eq!(size_of::<SubmitTask>(), 16);
const_assert_eq!(size_of::<SubmitArgs>(), 16);
const_assert_eq!(size_of::<GemCreateArgs>(), 16);
const_assert_eq!(size_of::<GemMapOffsetArgs>(), 16);
const_assert_eq!(size_of::<GemDestroyArgs>(), 4);

/// Copy a record out of the front of an argument block
pub fn read_args<R: FromBytes>(data: &[u8]) -> Result<R> {
    R::read_from_prefix(data)
        .map(|(args, _)| args)
        .map_err(|_| Error::InvalidArgument)
}

/// Copy a record back over the front of an argument block
pub fn write_args<R: IntoBytes + Immutable>(args: &R, data: &mut [u8]) -> Result<()> {
    args.write_to_prefix(data).map_err(|_| Error::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_task_layout() {
        let task = SubmitTask {
            num_addresses: 2,
            timeout: 0x100,
            address_list: 0x1000_2000,
        };
        let bytes = task.as_bytes();
        assert_eq!(&bytes[..4], &[2, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[0x00, 0x20, 0x00, 0x10]);
        assert_eq!(read_args::<SubmitTask>(bytes).unwrap(), task);
    }

    #[test]
    fn test_short_buffers() {
        assert_eq!(
            read_args::<GemCreateArgs>(&[0u8; 15]).unwrap_err(),
            Error::InvalidArgument
        );
        let mut out = [0u8; 3];
        assert_eq!(
            write_args(&GemDestroyArgs { handle: 1 }, &mut out),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_submit_args_fields() {
        let mut bytes = [0u8; 20];
        bytes[0] = 0x40;
        bytes[8] = 1;
        bytes[12] = 3;
        let args = read_args::<SubmitArgs>(&bytes).unwrap();
        assert_eq!(args.tasks, 0x40);
        assert_eq!(args.num_tasks, 1);
        assert_eq!(args.flags, 0);
        assert_eq!(args.version, 3);
    }
}
