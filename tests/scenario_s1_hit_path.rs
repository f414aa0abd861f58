//! S1 - hit path: a pre-installed remap routes a read to the spare device.

use std::sync::Arc;

use blockremap::device::{Device, DeviceConfig};
use blockremap::io::{MemSectorIo, SectorIo};
use blockremap::{Bio, MapOutcome, Route};

#[test]
fn read_through_a_known_remap_hits_the_spare() {
    let main: Arc<dyn SectorIo> = Arc::new(MemSectorIo::new(1 << 21)); // 1 GiB / 512
    let spare: Arc<dyn SectorIo> = Arc::new(MemSectorIo::new(1 << 20)); // 512 MiB / 512
    let device = Device::construct(DeviceConfig::new(main, spare)).unwrap();

    device.install_remap_for_test(1000, 0);

    let mut bio = Bio::read(1000, 1);
    let outcome = device.map(&mut bio);

    assert_eq!(outcome, MapOutcome::Remapped);
    assert_eq!(bio.route, Some(Route::Spare(0)));
    assert_eq!(device.status().total_reads, 1);
}
