// This file is part of tpsview, a playback engine for TPS DVR recordings.
// Copyright (C) 2025 The tpsview Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The per-recording frame index.
//!
//! The tail region of a recording file holds a contiguous array of 44-byte
//! records in time-descending order, preceded by an arbitrary amount of zero
//! padding. The first record is found by scanning for its magic. Records
//! carry the byte position and (second-grained) wall-clock stamp of every
//! audio and video frame in the payload region; they are this container's
//! only framing for audio.
//!
//! Parsing failures here are not fatal: a missing file, a read error, or an
//! absent magic all mean "no index", and the recording is simply served
//! without one.

use std::io::{Seek, SeekFrom};
use std::path::Path;

use base::Error;
use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use crate::{index_cache, read_full, MIN_VALID_UNIX_TS, PAYLOAD_REGION_END};

pub const FRAME_INDEX_MAGIC: u32 = 0x4C3D_2E1F;
pub const RECORD_LEN: usize = 44;

/// Length of the tail region searched for the first record.
const INDEX_REGION_LEN: usize = 0x70_0000;

pub const CHANNEL_VIDEO_CH1: u32 = 2;
pub const CHANNEL_AUDIO: u32 = 3;
pub const CHANNEL_VIDEO_CH2: u32 = 258;

/// `frame_type` of a video I-frame record.
pub const FRAME_TYPE_I: u32 = 1;

/// `frame_type` of a video P-frame or audio record.
pub const FRAME_TYPE_P: u32 = 3;

/// One 44-byte record, minus magic and reserved bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IndexRecord {
    pub frame_type: u32,
    pub channel: u32,

    /// Producer-side monotonic counter.
    pub frame_seq: u32,

    /// Byte position inside the payload region.
    pub file_offset: u32,

    /// Byte length of the frame's payload.
    pub frame_size: u32,

    /// Device monotonic clock, microseconds.
    pub ts_device: u64,

    /// Wall-clock seconds.
    pub unix_ts: u32,
}

impl IndexRecord {
    pub fn is_audio(&self) -> bool {
        self.channel == CHANNEL_AUDIO
    }

    pub fn is_video(&self) -> bool {
        matches!(self.channel, CHANNEL_VIDEO_CH1 | CHANNEL_VIDEO_CH2)
    }

    pub fn is_iframe(&self) -> bool {
        self.is_video() && self.frame_type == FRAME_TYPE_I
    }
}

fn valid_channel(channel: u32) -> bool {
    matches!(
        channel,
        CHANNEL_VIDEO_CH1 | CHANNEL_AUDIO | CHANNEL_VIDEO_CH2
    )
}

/// Parses the frame index of the given recording file, in chronological
/// (ascending `ts_device`) order. Returns an empty list when there is no
/// usable index.
pub fn parse(path: &Path) -> Vec<IndexRecord> {
    match parse_inner(path) {
        Ok(records) => records,
        Err(err) => {
            warn!(
                err = %err.chain(),
                path = %path.display(),
                "unable to parse frame index; treating recording as unindexed"
            );
            Vec::new()
        }
    }
}

/// Like [`parse`], but consults and fills the on-disk cache in `cache_dir`.
pub fn parse_with_cache(path: &Path, cache_dir: &Path) -> Vec<IndexRecord> {
    if let Some(records) = index_cache::load(path, cache_dir) {
        debug!(path = %path.display(), records = records.len(), "frame index cache hit");
        return records;
    }
    let records = parse(path);
    if !records.is_empty() {
        if let Err(err) = index_cache::save(path, cache_dir, &records) {
            warn!(err = %err.chain(), "unable to write frame index cache");
        }
    }
    records
}

fn parse_inner(path: &Path) -> Result<Vec<IndexRecord>, Error> {
    let mut f = std::fs::File::open(path)?;
    f.seek(SeekFrom::Start(PAYLOAD_REGION_END))?;
    let mut buf = vec![0u8; INDEX_REGION_LEN];
    let n = read_full(&mut f, &mut buf)?;
    buf.truncate(n);

    let magic = FRAME_INDEX_MAGIC.to_le_bytes();
    let Some(start) = memchr::memmem::find(&buf, &magic) else {
        return Ok(Vec::new());
    };

    let mut records = Vec::new();
    let mut pos = start;
    while pos + RECORD_LEN <= buf.len() {
        let rec = &buf[pos..pos + RECORD_LEN];
        if LittleEndian::read_u32(&rec[0..4]) != FRAME_INDEX_MAGIC {
            break;
        }
        let r = IndexRecord {
            frame_type: LittleEndian::read_u32(&rec[4..8]),
            channel: LittleEndian::read_u32(&rec[8..12]),
            frame_seq: LittleEndian::read_u32(&rec[12..16]),
            file_offset: LittleEndian::read_u32(&rec[16..20]),
            frame_size: LittleEndian::read_u32(&rec[20..24]),
            ts_device: LittleEndian::read_u64(&rec[24..32]),
            unix_ts: LittleEndian::read_u32(&rec[32..36]),
        };
        if valid_channel(r.channel) && r.unix_ts >= MIN_VALID_UNIX_TS {
            records.push(r);
        }
        pos += RECORD_LEN;
    }

    // Stored newest-first; everything downstream wants chronological order.
    records.sort_by_key(|r| r.ts_device);
    Ok(records)
}
