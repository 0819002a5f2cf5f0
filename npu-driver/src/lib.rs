//! NPU buffer object and task submission core
//!
//! Manages DMA-able buffer objects for a neural processing unit and feeds
//! tasks that reference them to an execution engine.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Client (open file: handle table + address space)               │
//! └───────────────────────────┬─────────────────────────────────────┘
//!                             │ ioctl / mmap / prime
//! ┌───────────────────────────▼─────────────────────────────────────┐
//! │  NpuDevice                                                      │
//! │  ┌──────────────────────┐  ┌──────────────────────────────────┐ │
//! │  │  Command dispatch    │  │  Task submission                 │ │
//! │  │  create / mmap /     │  │  header copy -> handle array     │ │
//! │  │  destroy / submit    │  │  copy -> TaskEngine              │ │
//! │  └──────────┬───────────┘  └──────────────────────────────────┘ │
//! │  ┌──────────▼───────────┐  ┌──────────────────────────────────┐ │
//! │  │  GemObject           │  │  Export                          │ │
//! │  │  fault-driven mmap   │  │  sg tables, vmap, dma-bufs       │ │
//! │  └──────────┬───────────┘  └──────────────────────────────────┘ │
//! │  ┌──────────▼──────────────────────────────────────────────────┐ │
//! │  │  BufferAllocator: coherent blocks or IOMMU-mapped pages     │ │
//! │  └──────────┬──────────────────────────────────────────────────┘ │
//! └─────────────┼───────────────────────────────────────────────────┘
//!               │
//! ┌─────────────▼───────────────────────────────────────────────────┐
//! │  DmaPlatform (hardware, or SimPlatform)                         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod abi;
pub mod allocator;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod export;
pub mod handle;
pub mod ioctl;
pub mod kmem;
pub mod object;
pub mod offset;
pub mod platform;
pub mod sim;
pub mod task;
pub mod vm;

pub use config::NpuConfig;
pub use device::{Client, NpuDevice, NpuStats};
pub use engine::{SoftEngine, TaskEngine};
pub use error::{Error, Result};
pub use object::GemObject;
pub use platform::{DmaPlatform, PAGE_SIZE};
pub use sim::SimPlatform;
