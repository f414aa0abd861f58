//! S3 - bulk-installing 100 remaps drives at least one resize, lands on
//! 128 buckets, and every lookup still succeeds.

use std::sync::Arc;

use blockremap::device::{Device, DeviceConfig};
use blockremap::io::{MemSectorIo, SectorIo};

#[test]
fn bulk_install_triggers_resize_to_128_buckets() {
    let main: Arc<dyn SectorIo> = Arc::new(MemSectorIo::new(1 << 16));
    let spare: Arc<dyn SectorIo> = Arc::new(MemSectorIo::new(1 << 16));
    let device = Device::construct(DeviceConfig::new(main, spare)).unwrap();

    for i in 0..100u64 {
        device.install_remap_for_test(i, i + 1);
    }

    assert!(device.bucket_count() >= 128);
    assert_eq!(device.bucket_count(), 128);
    assert!(device.status().resize_events >= 1);
    for i in 0..100u64 {
        assert_eq!(device.dispatcher_lookup(i), Some(i + 1));
    }
}
