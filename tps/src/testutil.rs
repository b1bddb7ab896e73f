// This file is part of tpsview, a playback engine for TPS DVR recordings.
// Copyright (C) 2025 The tpsview Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! On-disk TPS fixtures for tests.
//!
//! Recording files are written sparse at their real 256 MiB size; only the
//! touched pages cost anything.

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Once;

use byteorder::{ByteOrder, LittleEndian};

use crate::frame_index::{
    CHANNEL_AUDIO, CHANNEL_VIDEO_CH1, FRAME_INDEX_MAGIC, FRAME_TYPE_I, FRAME_TYPE_P, RECORD_LEN,
};
use crate::h265::{
    NAL_UNIT_IDR_W_RADL, NAL_UNIT_PPS, NAL_UNIT_SPS, NAL_UNIT_TRAIL_R, NAL_UNIT_VPS,
};
use crate::master::{MASTER_FILE_NAME, MASTER_INDEX_MAGIC};
use crate::storage::Storage;
use crate::{PAYLOAD_REGION_END, RECORDING_FILE_LEN};

/// The byte every fixture audio frame is filled with.
pub(crate) const AUDIO_FILL: u8 = 0x7F;

pub(crate) fn init() {
    static ONCE: Once = Once::new();
    ONCE.call_once(base::tracing_setup::install_for_tests);
}

/// Writes `bytes` into an existing file at `offset`.
pub(crate) fn overwrite(path: &Path, offset: u64, bytes: &[u8]) {
    let mut f = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.write_all(bytes).unwrap();
}

/// A complete Annex-B unit: 4-byte start code, 2-byte NAL header, `len`
/// filler bytes (chosen to never form a start code).
pub(crate) fn nal(ty: u8, len: usize) -> Vec<u8> {
    let mut v = vec![0, 0, 0, 1, ty << 1, 0x01];
    v.resize(6 + len, 0xaa);
    v
}

#[derive(Clone, Copy)]
pub(crate) struct MasterEntry {
    pub channel: u8,
    pub frame_count: u16,
    pub start_time: u32,
    pub end_time: u32,
}

pub(crate) fn write_master(path: &Path, entries: &[MasterEntry]) {
    write_master_with_counts(path, entries, 1, entries.len() as u32);
}

pub(crate) fn write_master_with_counts(
    path: &Path,
    entries: &[MasterEntry],
    file_count: u32,
    entry_count: u32,
) {
    let mut buf = vec![0u8; 0x4FC + entries.len() * 0x40];
    LittleEndian::write_u32(&mut buf[0..4], MASTER_INDEX_MAGIC);
    LittleEndian::write_u32(&mut buf[0x10..0x14], file_count);
    LittleEndian::write_u32(&mut buf[0x14..0x18], entry_count);
    for (i, e) in entries.iter().enumerate() {
        let o = 0x4FC + i * 0x40;
        buf[o + 4] = e.channel;
        LittleEndian::write_u16(&mut buf[o + 6..o + 8], e.frame_count);
        LittleEndian::write_u32(&mut buf[o + 8..o + 12], e.start_time);
        LittleEndian::write_u32(&mut buf[o + 12..o + 16], e.end_time);
    }
    std::fs::write(path, buf).unwrap();
}

struct TailRecord {
    frame_type: u32,
    channel: u32,
    file_offset: u32,
    frame_size: u32,
    ts_device: u64,
    unix_ts: u32,
}

pub(crate) struct RecordingBuilder {
    len: u64,
    payload: Vec<(u64, Vec<u8>)>,
    records: Vec<TailRecord>,
    tail_pad: u64,
}

impl RecordingBuilder {
    pub fn new() -> Self {
        RecordingBuilder {
            len: RECORDING_FILE_LEN,
            payload: Vec::new(),
            records: Vec::new(),
            tail_pad: 0,
        }
    }

    /// Truncates the file to `len` bytes (no tail region).
    pub fn file_len(&mut self, len: u64) -> &mut Self {
        self.len = len;
        self
    }

    pub fn payload_at(&mut self, offset: u64, bytes: Vec<u8>) -> &mut Self {
        self.payload.push((offset, bytes));
        self
    }

    pub fn record(
        &mut self,
        frame_type: u32,
        channel: u32,
        file_offset: u32,
        frame_size: u32,
        ts_device: u64,
        unix_ts: u32,
    ) -> &mut Self {
        self.records.push(TailRecord {
            frame_type,
            channel,
            file_offset,
            frame_size,
            ts_device,
            unix_ts,
        });
        self
    }

    /// Zero bytes before the first tail record.
    pub fn tail_padding(&mut self, n: u64) -> &mut Self {
        self.tail_pad = n;
        self
    }

    pub fn write(&self, path: &Path) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .unwrap();
        f.set_len(self.len).unwrap();
        for (offset, bytes) in &self.payload {
            f.seek(SeekFrom::Start(*offset)).unwrap();
            f.write_all(bytes).unwrap();
        }
        if !self.records.is_empty() {
            // The device stores records newest-first.
            let mut by_time: Vec<&TailRecord> = self.records.iter().collect();
            by_time.sort_by(|a, b| b.ts_device.cmp(&a.ts_device));
            f.seek(SeekFrom::Start(PAYLOAD_REGION_END + self.tail_pad))
                .unwrap();
            let mut rec = [0u8; RECORD_LEN];
            for r in by_time {
                LittleEndian::write_u32(&mut rec[0..4], FRAME_INDEX_MAGIC);
                LittleEndian::write_u32(&mut rec[4..8], r.frame_type);
                LittleEndian::write_u32(&mut rec[8..12], r.channel);
                LittleEndian::write_u32(&mut rec[12..16], 0); // frame_seq
                LittleEndian::write_u32(&mut rec[16..20], r.file_offset);
                LittleEndian::write_u32(&mut rec[20..24], r.frame_size);
                LittleEndian::write_u64(&mut rec[24..32], r.ts_device);
                LittleEndian::write_u32(&mut rec[32..36], r.unix_ts);
                f.write_all(&rec).unwrap();
            }
        }
    }
}

/// One catalogued segment (channel 2, 1700000000..1700000010) plus its
/// recording file, in various states of health.
pub(crate) struct Fixture {
    pub dir: tempfile::TempDir,

    /// Payload offset of the VPS opening the fixture's seek point, where
    /// one exists.
    pub header_offset: u64,
}

impl Fixture {
    pub fn storage(&self) -> Storage {
        Storage::open(self.dir.path(), self.dir.path().join(".cache")).unwrap()
    }

    fn empty() -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        write_master(
            &dir.path().join(MASTER_FILE_NAME),
            &[MasterEntry {
                channel: 2,
                frame_count: 1,
                start_time: 1_700_000_000,
                end_time: 1_700_000_010,
            }],
        );
        Fixture {
            dir,
            header_offset: 0,
        }
    }

    fn rec_path(&self) -> std::path::PathBuf {
        self.dir.path().join("TRec000000.tps")
    }

    /// VPS/SPS/PPS/IDR quadruple starting at `offset`; returns the offset
    /// one past the IDR.
    fn header_block(b: &mut RecordingBuilder, offset: u64) -> u64 {
        let mut block = nal(NAL_UNIT_VPS, 4);
        block.extend_from_slice(&nal(NAL_UNIT_SPS, 6));
        block.extend_from_slice(&nal(NAL_UNIT_PPS, 3));
        block.extend_from_slice(&nal(NAL_UNIT_IDR_W_RADL, 2000));
        let end = offset + block.len() as u64;
        b.payload_at(offset, block);
        end
    }

    /// Audio at 10k/60k/80k, seek point at 70k, P slices at 100k/150k.
    pub fn basic() -> Fixture {
        let f = Fixture::empty();
        let mut b = RecordingBuilder::new();
        for off in [10_000u64, 60_000, 80_000] {
            b.payload_at(off, vec![AUDIO_FILL; 160]);
        }
        Self::header_block(&mut b, 70_000);
        b.payload_at(100_000, nal(NAL_UNIT_TRAIL_R, 3000));
        b.payload_at(150_000, nal(NAL_UNIT_TRAIL_R, 100));

        b.record(FRAME_TYPE_P, CHANNEL_AUDIO, 10_000, 160, 1_000_000, 1_700_000_001);
        b.record(FRAME_TYPE_P, CHANNEL_AUDIO, 60_000, 160, 3_000_000, 1_700_000_003);
        b.record(FRAME_TYPE_I, CHANNEL_VIDEO_CH1, 70_000, 2037, 4_000_000, 1_700_000_004);
        b.record(FRAME_TYPE_P, CHANNEL_AUDIO, 80_000, 160, 5_000_000, 1_700_000_005);
        b.record(FRAME_TYPE_P, CHANNEL_VIDEO_CH1, 100_000, 3006, 6_000_000, 1_700_000_006);
        b.record(FRAME_TYPE_P, CHANNEL_VIDEO_CH1, 150_000, 106, 7_000_000, 1_700_000_007);
        b.write(&f.rec_path());
        Fixture {
            header_offset: 70_000,
            ..f
        }
    }

    /// Seek point at 0, P slices at 100k/150k, file cut at 200k: no tail
    /// index, quick end-of-file.
    pub fn truncated() -> Fixture {
        let f = Fixture::empty();
        let mut b = RecordingBuilder::new();
        b.file_len(200_000);
        Self::header_block(&mut b, 0);
        b.payload_at(100_000, nal(NAL_UNIT_TRAIL_R, 3000));
        b.payload_at(150_000, nal(NAL_UNIT_TRAIL_R, 100));
        b.write(&f.rec_path());
        f
    }

    /// Catalogued, but the recording is all zeroes.
    pub fn blank() -> Fixture {
        let f = Fixture::empty();
        RecordingBuilder::new().write(&f.rec_path());
        f
    }

    /// A seek point, then one start code and megabytes of nothing.
    pub fn corrupt() -> Fixture {
        let f = Fixture::empty();
        let mut b = RecordingBuilder::new();
        Self::header_block(&mut b, 0);
        b.payload_at(10_000, nal(NAL_UNIT_TRAIL_R, 50));
        b.write(&f.rec_path());
        f
    }

    /// A seek point at 8k, audio at 5k/12k, then no video until 600k: the
    /// stream loop has to skip windows with no start codes.
    pub fn audio_stretch() -> Fixture {
        let f = Fixture::empty();
        let mut b = RecordingBuilder::new();
        b.payload_at(5_000, vec![AUDIO_FILL; 160]);
        Self::header_block(&mut b, 8_000);
        b.payload_at(12_000, vec![AUDIO_FILL; 160]);
        b.payload_at(600_000, nal(NAL_UNIT_TRAIL_R, 3000));
        b.payload_at(610_000, nal(NAL_UNIT_TRAIL_R, 100));

        b.record(FRAME_TYPE_P, CHANNEL_AUDIO, 5_000, 160, 1_000_000, 1_700_000_001);
        b.record(FRAME_TYPE_I, CHANNEL_VIDEO_CH1, 8_000, 2037, 1_500_000, 1_700_000_001);
        b.record(FRAME_TYPE_P, CHANNEL_AUDIO, 12_000, 160, 2_000_000, 1_700_000_002);
        b.record(FRAME_TYPE_P, CHANNEL_VIDEO_CH1, 600_000, 3006, 4_000_000, 1_700_000_004);
        b.record(FRAME_TYPE_P, CHANNEL_VIDEO_CH1, 610_000, 106, 5_000_000, 1_700_000_005);
        b.write(&f.rec_path());
        Fixture {
            header_offset: 8_000,
            ..f
        }
    }
}
