// This file is part of tpsview, a playback engine for TPS DVR recordings.
// Copyright (C) 2025 The tpsview Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Byte-offset ↔ wall-clock interpolation.
//!
//! Nothing in the payload region carries a usable timestamp, so the time of
//! a byte offset has to be estimated from the frame index. Three methods, in
//! decreasing order of accuracy:
//!
//! 1. Audio anchors. Audio frames recur at ~160 ms intervals and carry
//!    second-grained wall-clock stamps; the latest audio record at or before
//!    an offset bounds its time to within a second.
//! 2. Piecewise-linear interpolation between video records' stamps.
//! 3. Linear interpolation across the whole payload region, from the
//!    segment's own time range. Only used for recordings with no index.
//!
//! All three are monotonic non-decreasing in the offset.

use std::io::Read;
use std::path::Path;

use base::{err, Error};
use memchr::memmem;
use tracing::debug;

use crate::frame_index::IndexRecord;
use crate::h265::VPS_PATTERN;
use crate::master::Segment;
use crate::{read_full, PAYLOAD_REGION_END};

/// Chunk size of the whole-file VPS scan.
const SCAN_CHUNK_LEN: usize = 64 << 20;

#[derive(Clone, Debug)]
pub struct TimeModel {
    start_ms: i64,
    end_ms: i64,

    /// `(payload offset, wall-clock ms)` per audio record, ascending offset.
    audio: Vec<(u64, i64)>,

    /// `(payload offset, wall-clock ms)` per video record, ascending offset.
    video: Vec<(u64, i64)>,
}

impl TimeModel {
    pub fn new(segment: &Segment, records: &[IndexRecord]) -> Self {
        let mut audio = anchors(records, IndexRecord::is_audio);
        let mut video = anchors(records, IndexRecord::is_video);
        // The device clock occasionally steps back a second across records;
        // clamp so interpolation stays monotonic.
        for list in [&mut audio, &mut video] {
            let mut prev = i64::MIN;
            for (_, t) in list.iter_mut() {
                *t = (*t).max(prev);
                prev = *t;
            }
        }
        TimeModel {
            start_ms: segment.start_time * 1000,
            end_ms: segment.end_time * 1000,
            audio,
            video,
        }
    }

    /// The estimated wall-clock of the given payload offset, in ms.
    pub fn precise_time_ms(&self, offset: u64) -> i64 {
        if let Some(t) = self.audio_anchor_ms(offset) {
            return t;
        }
        if !self.video.is_empty() {
            return self.interpolate_video(offset);
        }
        self.linear(offset)
    }

    /// Wall-clock of the latest audio record at or before `offset`, or
    /// `None` when no audio record precedes it.
    fn audio_anchor_ms(&self, offset: u64) -> Option<i64> {
        match self.audio.partition_point(|&(o, _)| o <= offset) {
            0 => None,
            i => Some(self.audio[i - 1].1),
        }
    }

    fn interpolate_video(&self, offset: u64) -> i64 {
        let i = self.video.partition_point(|&(o, _)| o <= offset);
        let (prev_off, prev_ms) = if i > 0 {
            self.video[i - 1]
        } else {
            (0, self.start_ms)
        };
        let (next_off, next_ms) = match self.video.get(i) {
            Some(&a) => a,
            None => (PAYLOAD_REGION_END, self.end_ms),
        };
        if next_off <= prev_off || next_ms < prev_ms {
            return prev_ms;
        }
        let frac = (offset - prev_off) as f64 / (next_off - prev_off) as f64;
        prev_ms + (frac * (next_ms - prev_ms) as f64) as i64
    }

    fn linear(&self, offset: u64) -> i64 {
        let frac = offset as f64 / PAYLOAD_REGION_END as f64;
        self.start_ms + (frac * (self.end_ms - self.start_ms) as f64) as i64
    }
}

fn anchors(records: &[IndexRecord], keep: impl Fn(&IndexRecord) -> bool) -> Vec<(u64, i64)> {
    let mut out: Vec<(u64, i64)> = records
        .iter()
        .copied()
        .filter(|r| keep(r))
        .map(|r| (u64::from(r.file_offset), i64::from(r.unix_ts) * 1000))
        .collect();
    out.sort_unstable_by_key(|&(o, _)| o);
    out.dedup_by_key(|&mut (o, _)| o);
    out
}

/// Scans a recording file for VPS start codes, in 64 MiB chunks with a
/// `pattern − 1` byte overlap so cross-chunk matches aren't lost. Positions
/// at or past the payload region's end are dropped. The result is strictly
/// ascending.
pub fn scan_vps_offsets(path: &Path) -> Result<Vec<u64>, Error> {
    let mut f = std::fs::File::open(path)
        .map_err(|e| err!(ReadError, msg("unable to open {}", path.display()), source(e)))?;
    let overlap = VPS_PATTERN.len() - 1;
    let mut offsets = Vec::new();
    let mut chunk = vec![0u8; SCAN_CHUNK_LEN];
    let mut tail: Vec<u8> = Vec::new();
    let mut file_pos: u64 = 0;
    loop {
        let n = read_full(&mut f, &mut chunk)
            .map_err(|e| err!(ReadError, msg("unable to read {}", path.display()), source(e)))?;
        if n == 0 {
            break;
        }
        let mut window = tail.clone();
        window.extend_from_slice(&chunk[..n]);
        let base = file_pos - tail.len() as u64;
        for q in memmem::find_iter(&window, &VPS_PATTERN) {
            let off = base + q as u64;
            if off < PAYLOAD_REGION_END {
                offsets.push(off);
            }
        }
        // A match can't fit entirely inside the overlap, so none is seen by
        // two windows.
        tail = chunk[n.saturating_sub(overlap)..n].to_vec();
        file_pos += n as u64;
        if n < SCAN_CHUNK_LEN {
            break;
        }
    }
    debug!(path = %path.display(), vps = offsets.len(), "VPS scan complete");
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_index::{CHANNEL_AUDIO, CHANNEL_VIDEO_CH1, FRAME_TYPE_I, FRAME_TYPE_P};
    use crate::testutil;

    fn seg() -> Segment {
        Segment {
            file_index: 0,
            channel: 2,
            frame_count: 1,
            start_time: 1_700_000_000,
            end_time: 1_700_000_010,
        }
    }

    fn rec(frame_type: u32, channel: u32, file_offset: u32, unix_ts: u32) -> IndexRecord {
        IndexRecord {
            frame_type,
            channel,
            frame_seq: 0,
            file_offset,
            frame_size: 160,
            ts_device: u64::from(unix_ts) * 1_000_000,
            unix_ts,
        }
    }

    #[test]
    fn audio_anchor_then_video_interpolation() {
        let records = [
            rec(FRAME_TYPE_I, CHANNEL_VIDEO_CH1, 0, 1_700_000_000),
            rec(FRAME_TYPE_P, CHANNEL_VIDEO_CH1, 100_000, 1_700_000_004),
            rec(FRAME_TYPE_P, CHANNEL_AUDIO, 200_000, 1_700_000_003),
        ];
        let m = TimeModel::new(&seg(), &records);

        // Exact audio anchor hit.
        assert_eq!(m.precise_time_ms(200_000), 1_700_000_003_000);
        assert_eq!(m.precise_time_ms(250_000), 1_700_000_003_000);

        // No audio anchor at or before 100_000: interpolation across video
        // records lands exactly on the P record's stamp.
        assert_eq!(m.precise_time_ms(100_000), 1_700_000_004_000);

        // Between the I and P records: linear within the pair.
        assert_eq!(m.precise_time_ms(50_000), 1_700_000_002_000);
    }

    #[test]
    fn video_boundary_anchors() {
        let records = [rec(FRAME_TYPE_P, CHANNEL_VIDEO_CH1, 100_000, 1_700_000_004)];
        let m = TimeModel::new(&seg(), &records);

        // Below the first anchor, the left anchor is (0, start_time).
        assert_eq!(m.precise_time_ms(0), 1_700_000_000_000);
        assert_eq!(m.precise_time_ms(50_000), 1_700_000_002_000);

        // Above the last, the right anchor is (payload end, end_time).
        let above = m.precise_time_ms(PAYLOAD_REGION_END);
        assert_eq!(above, 1_700_000_010_000);
    }

    #[test]
    fn linear_fallback_without_records() {
        let m = TimeModel::new(&seg(), &[]);
        assert_eq!(m.precise_time_ms(0), 1_700_000_000_000);
        assert_eq!(m.precise_time_ms(PAYLOAD_REGION_END / 2), 1_700_000_005_000);
        assert_eq!(m.precise_time_ms(PAYLOAD_REGION_END), 1_700_000_010_000);
    }

    #[test]
    fn monotonic_across_the_payload_region() {
        let records = [
            rec(FRAME_TYPE_I, CHANNEL_VIDEO_CH1, 10_000, 1_700_000_001),
            rec(FRAME_TYPE_P, CHANNEL_AUDIO, 40_000, 1_700_000_002),
            rec(FRAME_TYPE_P, CHANNEL_VIDEO_CH1, 90_000, 1_700_000_003),
            rec(FRAME_TYPE_P, CHANNEL_AUDIO, 500_000, 1_700_000_006),
            rec(FRAME_TYPE_P, CHANNEL_VIDEO_CH1, 700_000, 1_700_000_008),
        ];
        let m = TimeModel::new(&seg(), &records);
        let mut prev = i64::MIN;
        let mut off = 0u64;
        while off <= PAYLOAD_REGION_END {
            let t = m.precise_time_ms(off);
            assert!(t >= prev, "time went backwards at offset {off}: {t} < {prev}");
            prev = t;
            off += 7919; // a prime, to avoid stepping in lockstep with anchors
        }
    }

    #[test]
    fn scan_finds_vps_across_chunk_boundaries() {
        testutil::init();
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("TRec000000.tps");
        let f = std::fs::File::create(&path).unwrap();
        f.set_len(70 << 20).unwrap();
        drop(f);
        // One within the first chunk, one spanning the 64 MiB boundary, one
        // in the second chunk.
        testutil::overwrite(&path, 10, &VPS_PATTERN);
        testutil::overwrite(&path, (64 << 20) - 2, &VPS_PATTERN);
        testutil::overwrite(&path, 65 << 20, &VPS_PATTERN);

        let offsets = scan_vps_offsets(&path).unwrap();
        assert_eq!(offsets, vec![10, (64 << 20) - 2, 65 << 20]);
    }

    #[test]
    fn scan_drops_positions_in_the_tail_region() {
        testutil::init();
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("TRec000000.tps");
        let f = std::fs::File::create(&path).unwrap();
        f.set_len(crate::RECORDING_FILE_LEN).unwrap();
        drop(f);
        testutil::overwrite(&path, 100, &VPS_PATTERN);
        testutil::overwrite(&path, PAYLOAD_REGION_END + 64, &VPS_PATTERN);

        let offsets = scan_vps_offsets(&path).unwrap();
        assert_eq!(offsets, vec![100]);
    }
}
