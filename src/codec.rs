//! C2 - CRC32 plus encode/decode of the 4 KiB on-disk metadata frame.
//!
//! Layout (little-endian, byte offsets): magic(4) version(4) sequence(8)
//! copy_index(4) timestamp(8) entry_count(4) main_uuid(37) spare_uuid(37)
//! main_sectors(8) spare_sectors(8) entries(N*32) ... reserved(4) crc32(4).
//! Decode is pure and allocation-free save for the returned entry vector.

use crate::error::DecodeError;

/// Frame size of every metadata copy, in bytes.
pub const FRAME_SIZE: usize = 4096;
/// Magic number identifying a valid frame ("DMR4").
pub const MAGIC: u32 = 0x444D_5234;
/// The only format version this codec understands.
pub const FORMAT_VERSION: u32 = 4;
/// Fixed width of each UUID field, NUL-padded.
pub const UUID_FIELD_LEN: usize = 37;
/// Maximum entries a single frame may carry; more requires continuation
/// frames.
pub const MAX_ENTRIES_PER_FRAME: usize = 63;

const HEADER_LEN: usize = 122;
const TRAILER_LEN: usize = 8;
const ENTRY_LEN: usize = 32;

/// On-disk representation of one remap entry within a frame. 32 bytes;
/// does not carry `error_count`; that field lives only in the in-memory
/// [`crate::remap_index::RemapEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnDiskEntry {
    /// Logical sector on the main device.
    pub logical: u64,
    /// Spare sector on the spare device.
    pub spare: u64,
    /// Creation timestamp, nanoseconds.
    pub created_at_nanos: u64,
    /// Raw flags bits; see [`crate::remap_index::RemapFlags`].
    pub flags: u32,
}

/// A decoded (or about-to-be-encoded) metadata frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    /// Monotonic write-group sequence number.
    pub sequence: u64,
    /// Which of the five copies this frame is (0..4), or a continuation
    /// index ≥ 5 for continuation frames sharing this `sequence`.
    pub copy_index: u32,
    /// Write-group timestamp, nanoseconds.
    pub timestamp_nanos: u64,
    /// Main device UUID, NUL-padded to [`UUID_FIELD_LEN`] bytes.
    pub main_uuid: [u8; UUID_FIELD_LEN],
    /// Spare device UUID, NUL-padded to [`UUID_FIELD_LEN`] bytes.
    pub spare_uuid: [u8; UUID_FIELD_LEN],
    /// Total sectors on the main device at write time.
    pub main_sectors: u64,
    /// Total sectors on the spare device at write time.
    pub spare_sectors: u64,
    /// For a primary frame (`copy_index < 5`), the number of continuation
    /// frames that follow it at `META_SECTORS[copy_index] + 1 ..= +N`.
    /// Zero when all of a copy's entries fit in one frame. Unused (left
    /// `0`) on continuation frames themselves. Carried in the frame's
    /// trailing reserved field.
    pub continuation_frames: u32,
    /// Entries carried by this frame; at most [`MAX_ENTRIES_PER_FRAME`].
    pub entries: Vec<OnDiskEntry>,
}

/// Computes the standard CRC-32 (polynomial `0xEDB88320`) of `bytes`.
pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

fn pack_uuid(uuid: &str, out: &mut [u8; UUID_FIELD_LEN]) {
    let bytes = uuid.as_bytes();
    let n = bytes.len().min(UUID_FIELD_LEN - 1);
    out[..n].copy_from_slice(&bytes[..n]);
    out[n..].fill(0);
}

impl MetadataRecord {
    /// Convenience constructor that NUL-pads `main_uuid`/`spare_uuid` from
    /// ordinary strings.
    pub fn new(
        sequence: u64,
        copy_index: u32,
        timestamp_nanos: u64,
        main_uuid: &str,
        spare_uuid: &str,
        main_sectors: u64,
        spare_sectors: u64,
        continuation_frames: u32,
        entries: Vec<OnDiskEntry>,
    ) -> Self {
        let mut main_uuid_buf = [0u8; UUID_FIELD_LEN];
        let mut spare_uuid_buf = [0u8; UUID_FIELD_LEN];
        pack_uuid(main_uuid, &mut main_uuid_buf);
        pack_uuid(spare_uuid, &mut spare_uuid_buf);
        Self {
            sequence,
            copy_index,
            timestamp_nanos,
            main_uuid: main_uuid_buf,
            spare_uuid: spare_uuid_buf,
            main_sectors,
            spare_sectors,
            continuation_frames,
            entries,
        }
    }
}

/// Encodes `record` into a 4 KiB frame.
///
/// # Panics
///
/// Panics if `record.entries.len() > MAX_ENTRIES_PER_FRAME`; callers
/// (the metadata engine's write-group/continuation logic) are responsible
/// for splitting oversized entry sets before calling this.
pub fn encode(record: &MetadataRecord) -> [u8; FRAME_SIZE] {
    assert!(
        record.entries.len() <= MAX_ENTRIES_PER_FRAME,
        "encode: entries exceed single-frame capacity; caller must split into continuation frames"
    );
    let mut frame = [0u8; FRAME_SIZE];

    frame[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    frame[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    frame[8..16].copy_from_slice(&record.sequence.to_le_bytes());
    frame[16..20].copy_from_slice(&record.copy_index.to_le_bytes());
    frame[20..28].copy_from_slice(&record.timestamp_nanos.to_le_bytes());
    frame[28..32].copy_from_slice(&(record.entries.len() as u32).to_le_bytes());
    frame[32..69].copy_from_slice(&record.main_uuid);
    frame[69..106].copy_from_slice(&record.spare_uuid);
    frame[106..114].copy_from_slice(&record.main_sectors.to_le_bytes());
    frame[114..122].copy_from_slice(&record.spare_sectors.to_le_bytes());

    let mut offset = HEADER_LEN;
    for entry in &record.entries {
        frame[offset..offset + 8].copy_from_slice(&entry.logical.to_le_bytes());
        frame[offset + 8..offset + 16].copy_from_slice(&entry.spare.to_le_bytes());
        frame[offset + 16..offset + 24].copy_from_slice(&entry.created_at_nanos.to_le_bytes());
        frame[offset + 24..offset + 28].copy_from_slice(&entry.flags.to_le_bytes());
        frame[offset + 28..offset + 32].copy_from_slice(&0u32.to_le_bytes());
        offset += ENTRY_LEN;
    }

    frame[FRAME_SIZE - 8..FRAME_SIZE - 4].copy_from_slice(&record.continuation_frames.to_le_bytes());

    let crc = crc32(&frame[..FRAME_SIZE - 4]);
    frame[FRAME_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
    frame
}

/// Decodes a 4 KiB frame, validating magic, version, CRC and entry-count
/// framing, in that order.
pub fn decode(frame: &[u8; FRAME_SIZE]) -> Result<MetadataRecord, DecodeError> {
    let magic = u32::from_le_bytes(frame[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(DecodeError::Magic);
    }
    let version = u32::from_le_bytes(frame[4..8].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(DecodeError::Version);
    }

    let stored_crc = u32::from_le_bytes(frame[FRAME_SIZE - 4..].try_into().unwrap());
    let computed_crc = crc32(&frame[..FRAME_SIZE - 4]);
    if stored_crc != computed_crc {
        return Err(DecodeError::Crc);
    }

    let sequence = u64::from_le_bytes(frame[8..16].try_into().unwrap());
    let copy_index = u32::from_le_bytes(frame[16..20].try_into().unwrap());
    let timestamp_nanos = u64::from_le_bytes(frame[20..28].try_into().unwrap());
    let entry_count = u32::from_le_bytes(frame[28..32].try_into().unwrap()) as usize;

    if entry_count > MAX_ENTRIES_PER_FRAME
        || HEADER_LEN + entry_count * ENTRY_LEN + TRAILER_LEN > FRAME_SIZE
    {
        return Err(DecodeError::Framing);
    }

    let mut main_uuid = [0u8; UUID_FIELD_LEN];
    main_uuid.copy_from_slice(&frame[32..69]);
    let mut spare_uuid = [0u8; UUID_FIELD_LEN];
    spare_uuid.copy_from_slice(&frame[69..106]);
    let main_sectors = u64::from_le_bytes(frame[106..114].try_into().unwrap());
    let spare_sectors = u64::from_le_bytes(frame[114..122].try_into().unwrap());
    let continuation_frames =
        u32::from_le_bytes(frame[FRAME_SIZE - 8..FRAME_SIZE - 4].try_into().unwrap());

    let mut entries = Vec::with_capacity(entry_count);
    let mut offset = HEADER_LEN;
    for _ in 0..entry_count {
        let logical = u64::from_le_bytes(frame[offset..offset + 8].try_into().unwrap());
        let spare = u64::from_le_bytes(frame[offset + 8..offset + 16].try_into().unwrap());
        let created_at_nanos =
            u64::from_le_bytes(frame[offset + 16..offset + 24].try_into().unwrap());
        let flags = u32::from_le_bytes(frame[offset + 24..offset + 28].try_into().unwrap());
        entries.push(OnDiskEntry { logical, spare, created_at_nanos, flags });
        offset += ENTRY_LEN;
    }

    Ok(MetadataRecord {
        sequence,
        copy_index,
        timestamp_nanos,
        main_uuid,
        spare_uuid,
        main_sectors,
        spare_sectors,
        continuation_frames,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(n: usize) -> MetadataRecord {
        let entries = (0..n)
            .map(|i| OnDiskEntry {
                logical: i as u64,
                spare: i as u64 * 2,
                created_at_nanos: 42,
                flags: 0b001,
            })
            .collect();
        MetadataRecord::new(7, 0, 1234, "main-uuid", "spare-uuid", 1 << 20, 1 << 19, 0, entries)
    }

    #[test]
    fn round_trips() {
        let record = sample_record(5);
        let frame = encode(&record);
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn empty_round_trips() {
        let record = sample_record(0);
        let frame = encode(&record);
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.entries.len(), 0);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut frame = encode(&sample_record(1));
        frame[0] ^= 0xFF;
        assert_eq!(decode(&frame), Err(DecodeError::Magic));
    }

    #[test]
    fn rejects_bad_version() {
        let mut frame = encode(&sample_record(1));
        frame[4..8].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(decode(&frame), Err(DecodeError::Version));
    }

    #[test]
    fn rejects_corrupted_crc() {
        let mut frame = encode(&sample_record(3));
        frame[200] ^= 0xFF;
        assert_eq!(decode(&frame), Err(DecodeError::Crc));
    }

    #[test]
    fn rejects_oversized_entry_count() {
        let mut frame = encode(&sample_record(0));
        frame[28..32].copy_from_slice(&(MAX_ENTRIES_PER_FRAME as u32 + 1).to_le_bytes());
        let crc = crc32(&frame[..FRAME_SIZE - 4]);
        frame[FRAME_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(decode(&frame), Err(DecodeError::Framing));
    }

    #[test]
    #[should_panic]
    fn encode_panics_on_oversized_entries() {
        let _ = encode(&sample_record(MAX_ENTRIES_PER_FRAME + 1));
    }
}
