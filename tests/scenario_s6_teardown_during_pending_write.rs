//! S6 - teardown while a write group is in flight: presuspend/destruct must
//! complete within a bounded time, never deadlock, regardless of whether the
//! pending write group finishes or is cancelled first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use blockremap::device::{Device, DeviceConfig};
use blockremap::io::{MemSectorIo, SectorIo};

#[test]
fn teardown_during_pending_write_group_does_not_hang() {
    let main: Arc<dyn SectorIo> = Arc::new(MemSectorIo::new(1 << 16));
    let spare: Arc<dyn SectorIo> = Arc::new(MemSectorIo::new(1 << 16));

    let mut cfg = DeviceConfig::new(main, spare);
    cfg.main_uuid = "s6-main".into();
    cfg.spare_uuid = "s6-spare".into();
    cfg.drain_timeout = Duration::from_millis(500);
    cfg.writer_wait_timeout = Duration::from_millis(500);
    let device = Device::construct(cfg).unwrap();

    for i in 0..20u64 {
        device.install_remap_for_test(i, i + 3000);
    }
    // Force a write group and tear down immediately, without waiting for it
    // to land; presuspend must cancel it rather than block forever on it.
    device.force_write_group();

    let start = Instant::now();
    device.presuspend();
    device.postsuspend();
    device.destruct();
    let elapsed = start.elapsed();

    assert!(elapsed < Duration::from_secs(2), "teardown took too long: {elapsed:?}");

    for i in 0..20u64 {
        assert_eq!(device.dispatcher_lookup(i), Some(i + 3000));
    }
}
