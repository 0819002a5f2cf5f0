use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use zerocopy::IntoBytes;

use npu_driver::abi::{MemHandle, SubmitArgs, SubmitTask};
use npu_driver::engine::resolve;
use npu_driver::ioctl::{ioctl, DRM_NPU_SUBMIT};
use npu_driver::platform::DmaAddr;
use npu_driver::task::Task;
use npu_driver::vm::AddressSpace;
use npu_driver::{Client, Error, NpuConfig, NpuDevice, SimPlatform, TaskEngine};

/// Engine that records what it was handed
#[derive(Default)]
struct RecordingEngine {
    seen: Arc<Mutex<Vec<(u32, Vec<DmaAddr>)>>>,
    fail: bool,
}

impl TaskEngine for RecordingEngine {
    fn submit(&self, task: &Task<'_>) -> npu_driver::Result<()> {
        let addrs = task
            .address_list()
            .iter()
            .map(|mem| resolve(task, mem))
            .collect::<npu_driver::Result<Vec<_>>>()?;
        self.seen.lock().push((task.timeout, addrs));
        if self.fail {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

fn recording_device(fail: bool) -> (NpuDevice, Arc<Mutex<Vec<(u32, Vec<DmaAddr>)>>>) {
    let config = NpuConfig::default();
    let platform = SimPlatform::new(false, config.memory_pool_bytes());
    let engine = RecordingEngine {
        fail,
        ..Default::default()
    };
    let seen = engine.seen.clone();
    (NpuDevice::new(config, platform, Box::new(engine)), seen)
}

/// Place a task header and its handle array in the client's memory
fn stage_task(client: &Client, timeout: u32, handles: &[MemHandle]) -> SubmitArgs {
    let mm = client.mm();
    let mut list = 0;
    if !handles.is_empty() {
        list = mm.map_anon(handles.len() * MemHandle::SIZE).unwrap();
        for (i, mem) in handles.iter().enumerate() {
            mm.write(list + i * MemHandle::SIZE, mem.as_bytes()).unwrap();
        }
    }
    let header = mm.map_anon(SubmitTask::SIZE).unwrap();
    let task = SubmitTask {
        num_addresses: handles.len() as u32,
        timeout,
        address_list: list as u64,
    };
    mm.write(header, task.as_bytes()).unwrap();
    SubmitArgs {
        tasks: header as u64,
        num_tasks: 1,
        ..Default::default()
    }
}

#[test]
fn test_engine_sees_resolved_buffers() {
    let (device, seen) = recording_device(false);
    let client = device.open(AddressSpace::new());

    let a = device.gem_create(&client, 4096).unwrap();
    let b = device.gem_create(&client, 2 * 4096).unwrap();
    let fd_a = device.handle_to_fd(&client, a).unwrap();
    let fd_b = device.handle_to_fd(&client, b).unwrap();
    let dma_a = device.lookup(&client, a).unwrap().dma_addr();
    let dma_b = device.lookup(&client, b).unwrap().dma_addr();

    let args = stage_task(
        &client,
        500,
        &[
            MemHandle { handle: fd_a, offset: 0 },
            MemHandle { handle: fd_b, offset: 0x1010 },
        ],
    );
    let mut raw = args;
    assert_eq!(
        ioctl(&device, &client, DRM_NPU_SUBMIT, raw.as_mut_bytes()),
        0
    );

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, 500);
    assert_eq!(seen[0].1, vec![dma_a, dma_b + 0x1010]);
    assert_eq!(device.kmem().live_allocations(), 0);
}

#[test]
fn test_engine_failure_releases_task() {
    let (device, seen) = recording_device(true);
    let client = device.open(AddressSpace::new());
    let handle = device.gem_create(&client, 4096).unwrap();
    let fd = device.handle_to_fd(&client, handle).unwrap();

    let args = stage_task(&client, 0, &[MemHandle { handle: fd, offset: 0 }]);
    assert_eq!(device.submit(&client, &args), Err(Error::InvalidArgument));
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(device.kmem().live_allocations(), 0);
    assert_eq!(device.stats().tasks_failed.load(Ordering::Relaxed), 1);
}

#[test]
fn test_soft_engine_rejects_bad_offsets() {
    let (device, _) = NpuDevice::simulated(NpuConfig::default());
    let client = device.open(AddressSpace::new());
    let handle = device.gem_create(&client, 4096).unwrap();
    let fd = device.handle_to_fd(&client, handle).unwrap();

    let ok = stage_task(&client, 0, &[MemHandle { handle: fd, offset: 4095 }]);
    device.submit(&client, &ok).expect("submit failed");

    let past_end = stage_task(&client, 0, &[MemHandle { handle: fd, offset: 4096 }]);
    assert_eq!(device.submit(&client, &past_end), Err(Error::InvalidArgument));

    let bad_fd = stage_task(&client, 0, &[MemHandle { handle: fd + 7, offset: 0 }]);
    assert_eq!(device.submit(&client, &bad_fd), Err(Error::InvalidArgument));

    assert_eq!(device.stats().tasks_submitted.load(Ordering::Relaxed), 3);
    assert_eq!(device.stats().tasks_failed.load(Ordering::Relaxed), 2);
    assert_eq!(device.kmem().live_allocations(), 0);
}

#[test]
fn test_count_over_limit() {
    let config = NpuConfig {
        max_buffers_per_task: 2,
        ..Default::default()
    };
    let (device, _) = NpuDevice::simulated(config);
    let client = device.open(AddressSpace::new());
    let mem = MemHandle::default();

    let args = stage_task(&client, 0, &[mem, mem, mem]);
    assert_eq!(device.submit(&client, &args), Err(Error::InvalidArgument));
    assert_eq!(device.kmem().live_allocations(), 0);
}

#[test]
fn test_empty_task_has_empty_list() {
    let (device, seen) = recording_device(false);
    let client = device.open(AddressSpace::new());

    let args = stage_task(&client, 7, &[]);
    device.submit(&client, &args).expect("submit failed");

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, 7);
    assert!(seen[0].1.is_empty());
    assert_eq!(device.kmem().live_allocations(), 0);
}

#[test]
fn test_concurrent_submits() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 25;

    let (device, seen) = recording_device(false);
    let client = device.open(AddressSpace::new());

    thread::scope(|s| {
        for t in 0..THREADS {
            let device = &device;
            let client = &client;
            s.spawn(move || {
                let handle = device.gem_create(client, 4096).expect("create failed");
                let fd = device.handle_to_fd(client, handle).expect("export failed");
                for i in 0..ROUNDS {
                    let mem = MemHandle {
                        handle: fd,
                        offset: (i * 8) as u32,
                    };
                    let args = stage_task(client, t as u32, &[mem, mem]);
                    device.submit(client, &args).expect("submit failed");
                }
            });
        }
    });

    let seen = seen.lock();
    assert_eq!(seen.len(), THREADS * ROUNDS);
    for (_, addrs) in seen.iter() {
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0], addrs[1]);
    }
    assert_eq!(
        device.stats().tasks_submitted.load(Ordering::Relaxed),
        (THREADS * ROUNDS) as u64
    );
    assert_eq!(device.stats().tasks_failed.load(Ordering::Relaxed), 0);
    assert_eq!(device.kmem().live_allocations(), 0);
}
