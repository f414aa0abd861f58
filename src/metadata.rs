//! C5 - metadata engine: recovery, write groups, conflict resolution.
//!
//! All five copies (plus their continuation frames, if any) live on the
//! *spare* device; the main device is never touched for metadata. A write
//! group is not atomic across copies, so recovery's max-sequence rule is
//! what makes torn write groups safe to tolerate.

use std::sync::Arc;

use log::warn;

use crate::codec::{self, MetadataRecord, OnDiskEntry, FRAME_SIZE, MAX_ENTRIES_PER_FRAME};
use crate::error::{ConstructError, DecodeError, IoError, MetadataError};
use crate::io::SectorIo;
use crate::remap_index::{RemapEntry, RemapFlags};

/// The five fixed copy start-sectors on the spare device.
pub const META_SECTORS: [u64; 5] = [0, 1024, 2048, 4096, 8192];
/// How many continuation frames are reserved after each primary copy
/// sector, bounding a single copy to `MAX_CONTINUATION_FRAMES_PER_COPY + 1`
/// frames worth of entries. Not part of the wire format; purely a
/// construction-time reservation budget.
pub const MAX_CONTINUATION_FRAMES_PER_COPY: u64 = 16;

const SECTORS_PER_FRAME: u64 = (FRAME_SIZE / crate::bio::SECTOR_SIZE) as u64;

/// Every sector the metadata engine claims, across all five copies and
/// their continuation budget: every sector within each reserved frame, not
/// just its starting sector. Callers reserve these on the spare allocator
/// before serving any other allocation.
pub fn reserved_sectors() -> impl Iterator<Item = u64> {
    META_SECTORS.iter().flat_map(|&base| {
        (0..=MAX_CONTINUATION_FRAMES_PER_COPY)
            .flat_map(move |k| (0..SECTORS_PER_FRAME).map(move |s| base + k * SECTORS_PER_FRAME + s))
    })
}

/// Outcome of [`MetadataEngine::recover`].
pub struct RecoveryOutcome {
    /// Sequence number of the winning record (0 if the device was fresh).
    pub sequence: u64,
    /// Remap entries rehydrated from the winning record.
    pub entries: Vec<RemapEntry>,
    /// Copy indices (0..5) that need a background repair write.
    pub needs_repair: Vec<usize>,
    /// Main-device sector count recorded in the winning frame, `None` if
    /// the device was fresh.
    pub recorded_main_sectors: Option<u64>,
    /// Spare-device sector count recorded in the winning frame, `None` if
    /// the device was fresh.
    pub recorded_spare_sectors: Option<u64>,
}

/// Reads/writes the five-copy on-disk record via a [`SectorIo`] and the
/// [`codec`] module.
pub struct MetadataEngine {
    spare: Arc<dyn SectorIo>,
    main_uuid: [u8; codec::UUID_FIELD_LEN],
    spare_uuid: [u8; codec::UUID_FIELD_LEN],
}

impl MetadataEngine {
    /// Creates an engine writing to `spare`, stamping `main_uuid`/
    /// `spare_uuid` into every frame it writes.
    pub fn new(spare: Arc<dyn SectorIo>, main_uuid: &str, spare_uuid: &str) -> Self {
        let mut main_buf = [0u8; codec::UUID_FIELD_LEN];
        let mut spare_buf = [0u8; codec::UUID_FIELD_LEN];
        let pack = |s: &str, out: &mut [u8; codec::UUID_FIELD_LEN]| {
            let bytes = s.as_bytes();
            let n = bytes.len().min(out.len() - 1);
            out[..n].copy_from_slice(&bytes[..n]);
        };
        pack(main_uuid, &mut main_buf);
        pack(spare_uuid, &mut spare_buf);
        Self { spare, main_uuid: main_buf, spare_uuid: spare_buf }
    }

    fn read_frame(&self, sector: u64) -> Result<[u8; FRAME_SIZE], IoError> {
        let mut buf = vec![0u8; FRAME_SIZE];
        self.spare.read(sector, SECTORS_PER_FRAME as u32, &mut buf)?;
        let mut frame = [0u8; FRAME_SIZE];
        frame.copy_from_slice(&buf);
        Ok(frame)
    }

    fn write_frame(&self, sector: u64, frame: &[u8; FRAME_SIZE]) -> Result<(), IoError> {
        self.spare.write(sector, SECTORS_PER_FRAME as u32, frame)
    }

    /// Reads the primary frame at `base_sector` only, without following its
    /// continuation chain. Used to find the winning sequence cheaply before
    /// committing to reading (and validating) any copy's full entry set.
    fn read_primary(&self, base_sector: u64) -> Option<MetadataRecord> {
        self.read_frame(base_sector).ok().and_then(|f| codec::decode(&f).ok())
    }

    /// Reads one copy's primary frame plus every continuation frame it
    /// declares, decoding all of them into a single merged entry list.
    /// Unlike a partial read, this fails the whole copy (`Err`) the moment
    /// any frame in the chain is missing, undecodable, or carries a
    /// sequence number that doesn't match the primary, rather than
    /// returning a truncated entry list. That lets `recover` treat such a
    /// copy as unusable and fall back to a sibling copy with the same
    /// sequence number instead of silently losing entries.
    fn read_copy_full(&self, base_sector: u64) -> Result<(MetadataRecord, Vec<RemapEntry>), DecodeError> {
        let frame = self.read_frame(base_sector).map_err(|_| DecodeError::Magic)?;
        let primary = codec::decode(&frame)?;
        let mut entries = on_disk_to_remap(&primary.entries);

        for k in 1..=primary.continuation_frames as u64 {
            let sector = base_sector + k * SECTORS_PER_FRAME;
            let cont = self
                .read_frame(sector)
                .map_err(|_| DecodeError::Magic)
                .and_then(|f| codec::decode(&f))?;
            if cont.sequence != primary.sequence {
                return Err(DecodeError::Framing);
            }
            entries.extend(on_disk_to_remap(&cont.entries));
        }

        Ok((primary, entries))
    }

    /// Recovers the authoritative remap set from the five copies.
    ///
    /// Finds the winning sequence number from whichever primary frames
    /// decode cleanly, then reads the full continuation chain of every
    /// copy sharing that sequence, taking the first that comes back fully
    /// intact. A copy whose primary frame matches the winning sequence but
    /// whose continuation chain is damaged is treated the same as a copy at
    /// an older sequence: it goes into `needs_repair` instead of being used
    /// as the source of truth, so a fully-readable sibling copy wins rather
    /// than the recovered entry set being silently truncated.
    pub fn recover(&self) -> Result<RecoveryOutcome, ConstructError> {
        let primaries: Vec<Option<MetadataRecord>> =
            META_SECTORS.iter().map(|&sector| self.read_primary(sector)).collect();

        let Some(winning_sequence) = primaries.iter().flatten().map(|r| r.sequence).max() else {
            return Ok(RecoveryOutcome {
                sequence: 0,
                entries: Vec::new(),
                needs_repair: Vec::new(),
                recorded_main_sectors: None,
                recorded_spare_sectors: None,
            });
        };

        let mut winner: Option<(MetadataRecord, Vec<RemapEntry>)> = None;
        let mut needs_repair = Vec::new();

        for (i, &sector) in META_SECTORS.iter().enumerate() {
            if primaries[i].as_ref().map(|r| r.sequence) != Some(winning_sequence) {
                needs_repair.push(i);
                continue;
            }

            match self.read_copy_full(sector) {
                Ok(result) => {
                    if winner.is_none() {
                        winner = Some(result);
                    }
                }
                Err(_) => {
                    warn!(
                        "metadata: copy {i} matches winning sequence {winning_sequence} but its \
                         continuation chain is damaged, deferring to a sibling copy"
                    );
                    needs_repair.push(i);
                }
            }
        }

        let Some((winner_record, winner_entries)) = winner else {
            return Err(ConstructError::MetadataRecoveryFailed);
        };

        Ok(RecoveryOutcome {
            sequence: winning_sequence,
            entries: winner_entries,
            needs_repair,
            recorded_main_sectors: Some(winner_record.main_sectors),
            recorded_spare_sectors: Some(winner_record.spare_sectors),
        })
    }

    /// Writes the winning record to `indices`, used both for background
    /// repair-on-recovery and as the primitive [`crate::writer::AsyncWriter`]
    /// drives for ordinary write groups.
    pub fn write_copies(
        &self,
        indices: &[usize],
        sequence: u64,
        entries: &[RemapEntry],
        main_sectors: u64,
        spare_sectors: u64,
    ) -> Result<(), MetadataError> {
        let frames = self.build_frames(sequence, entries, main_sectors, spare_sectors);
        let mut any_ok = false;
        for &i in indices {
            let ok = frames
                .get(i)
                .map(|group| group.iter().all(|(sector, frame)| self.write_frame(*sector, frame).is_ok()))
                .unwrap_or(false);
            any_ok |= ok;
        }
        if any_ok {
            Ok(())
        } else {
            Err(MetadataError::AllCopiesFailed)
        }
    }

    /// Builds the on-disk frames for a full write group: for each of the
    /// five copies, one primary frame plus as many continuation frames as
    /// `entries` requires. Pure; does not touch I/O.
    fn build_frames(
        &self,
        sequence: u64,
        entries: &[RemapEntry],
        main_sectors: u64,
        spare_sectors: u64,
    ) -> Vec<Vec<(u64, [u8; FRAME_SIZE])>> {
        let chunks: Vec<&[RemapEntry]> = entries.chunks(MAX_ENTRIES_PER_FRAME).collect();
        let continuation_frames = chunks.len().saturating_sub(1) as u32;
        let timestamp_nanos = now_nanos();

        META_SECTORS
            .iter()
            .enumerate()
            .map(|(copy_index, &base_sector)| {
                let mut group = Vec::with_capacity(chunks.len().max(1));
                let chunk_iter: Vec<&[RemapEntry]> = if chunks.is_empty() { vec![&[][..]] } else { chunks.clone() };
                for (k, chunk) in chunk_iter.iter().enumerate() {
                    let record = MetadataRecord {
                        sequence,
                        copy_index: copy_index as u32,
                        timestamp_nanos,
                        main_uuid: self.main_uuid,
                        spare_uuid: self.spare_uuid,
                        main_sectors,
                        spare_sectors,
                        continuation_frames: if k == 0 { continuation_frames } else { 0 },
                        entries: remap_to_on_disk(chunk),
                    };
                    let frame = codec::encode(&record);
                    group.push((base_sector + k as u64 * SECTORS_PER_FRAME, frame));
                }
                group
            })
            .collect()
    }
}

fn on_disk_to_remap(entries: &[OnDiskEntry]) -> Vec<RemapEntry> {
    entries
        .iter()
        .map(|e| RemapEntry {
            logical: e.logical,
            spare: e.spare,
            created_at_nanos: e.created_at_nanos,
            error_count: 0,
            flags: RemapFlags::from_bits_truncate(e.flags) | RemapFlags::PERSISTED,
        })
        .collect()
}

fn remap_to_on_disk(entries: &[RemapEntry]) -> Vec<OnDiskEntry> {
    entries
        .iter()
        .map(|e| OnDiskEntry {
            logical: e.logical,
            spare: e.spare,
            created_at_nanos: e.created_at_nanos,
            flags: e.flags.bits(),
        })
        .collect()
}

fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
