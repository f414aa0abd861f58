//! S4 - recovery after restart: remaps and the sequence number survive a
//! destruct + reconstruct cycle against the same spare device.

use std::sync::Arc;
use std::time::Duration;

use blockremap::device::{Device, DeviceConfig};
use blockremap::io::{MemSectorIo, SectorIo};

#[test]
fn fifty_remaps_survive_a_restart() {
    let main: Arc<dyn SectorIo> = Arc::new(MemSectorIo::new(1 << 16));
    let spare: Arc<dyn SectorIo> = Arc::new(MemSectorIo::new(1 << 16));

    {
        let mut cfg = DeviceConfig::new(main.clone(), spare.clone());
        cfg.main_uuid = "s4-main".into();
        cfg.spare_uuid = "s4-spare".into();
        let device = Device::construct(cfg).unwrap();

        for i in 0..50u64 {
            device.install_remap_for_test(i, i + 1000);
        }
        // install_remap_for_test bypasses the writer; force a write group
        // the way the dispatcher does, through the same index snapshot.
        force_write_group(&device);

        // Give the background write group time to land before destruct.
        std::thread::sleep(Duration::from_millis(150));
        device.presuspend();
        device.postsuspend();
        device.destruct();
    }

    let mut cfg = DeviceConfig::new(main, spare);
    cfg.main_uuid = "s4-main".into();
    cfg.spare_uuid = "s4-spare".into();
    let device2 = Device::construct(cfg).unwrap();

    for i in 0..50u64 {
        assert_eq!(device2.dispatcher_lookup(i), Some(i + 1000));
    }
}

/// Test-only helper: triggers a real write group the same way the
/// dispatcher's failure path would, since `install_remap_for_test` only
/// touches the in-memory index.
fn force_write_group(device: &Device) {
    device.force_write_group();
}
