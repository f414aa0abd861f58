//! S2 - lazy remap installation: the first failing read surfaces the error
//! and installs a remap; the next read of the same sector hits the spare.

use std::sync::Arc;

use blockremap::device::{Device, DeviceConfig};
use blockremap::io::{FaultInjector, IoErrorKind, MemSectorIo, SectorIo};
use blockremap::{Bio, MapOutcome, Route};

#[test]
fn first_failure_installs_remap_second_read_heals() {
    let faulted_main = Arc::new(FaultInjector::new(MemSectorIo::new(1 << 16)));
    faulted_main.fail_reads(500, 1, IoErrorKind::Media);
    let main: Arc<dyn SectorIo> = faulted_main;
    let spare: Arc<dyn SectorIo> = Arc::new(MemSectorIo::new(1 << 15));
    let device = Device::construct(DeviceConfig::new(main, spare)).unwrap();

    let mut bio = Bio::read(500, 1);
    device.map(&mut bio);

    let status = device.status();
    assert_eq!(status.total_io_errors, 1);
    assert_eq!(status.total_remaps_installed, 1);
    let installed = device.dispatcher_lookup(500).expect("remap installed after first failure");

    let mut bio2 = Bio::read(500, 1);
    let outcome = device.map(&mut bio2);
    assert_eq!(outcome, MapOutcome::Remapped);
    assert_eq!(bio2.route, Some(Route::Spare(installed)));
}
