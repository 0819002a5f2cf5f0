//! NPU daemon
//!
//! Brings up the buffer manager on the software platform and checks that a
//! buffer can be created, mapped and released.

use std::env;
use std::sync::atomic::Ordering;

use anyhow::{bail, Context};
use log::info;
use redox_log::{OutputBuilder, RedoxLogger};

use npu_driver::vm::AddressSpace;
use npu_driver::{NpuConfig, NpuDevice, PAGE_SIZE};

const DEFAULT_CONFIG: &str = "/etc/npu.toml";

fn setup_logging(config: &NpuConfig) -> anyhow::Result<()> {
    RedoxLogger::new()
        .with_output(
            OutputBuilder::stderr()
                .with_filter(config.log_filter())
                .build(),
        )
        .with_process_name("npud".into())
        .enable()
        .context("npu: failed to install logger")?;
    Ok(())
}

fn self_check(device: &NpuDevice) -> anyhow::Result<()> {
    let client = device.open(AddressSpace::new());
    let handle = device
        .gem_create(&client, PAGE_SIZE as u64)
        .context("npu: self-check allocation failed")?;
    let offset = device.gem_map_offset(&client, handle)?;
    let addr = device.mmap(&client, offset, PAGE_SIZE)?;

    client
        .mm()
        .write(addr, &[0x5a])
        .map_err(|fault| anyhow::anyhow!("npu: self-check mapping faulted: {:?}", fault))?;
    let mut byte = [0u8];
    client
        .mm()
        .read(addr, &mut byte)
        .map_err(|fault| anyhow::anyhow!("npu: self-check mapping faulted: {:?}", fault))?;
    if byte[0] != 0x5a {
        bail!("npu: self-check read back {:#x}", byte[0]);
    }

    client.mm().munmap(addr)?;
    device.gem_destroy(&client, handle)?;
    device.close(client);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let path = env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = NpuConfig::load(&path)?;
    setup_logging(&config)?;

    info!("npu: starting v{}", env!("CARGO_PKG_VERSION"));
    info!("npu: configuration: {:?}", config);

    let (device, platform) = NpuDevice::simulated(config);
    self_check(&device)?;

    let stats = device.stats();
    info!(
        "npu: ready ({} buffers checked, {} bytes outstanding)",
        stats.buffers_created.load(Ordering::Relaxed),
        platform.outstanding_bytes()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_and_self_check() {
        let config = NpuConfig {
            memory_pool_mb: 1,
            ..Default::default()
        };
        setup_logging(&config).unwrap();

        let (device, platform) = NpuDevice::simulated(config);
        self_check(&device).unwrap();
        assert_eq!(device.stats().buffers_created.load(Ordering::Relaxed), 1);
        assert_eq!(platform.outstanding_bytes(), 0);
    }
}
