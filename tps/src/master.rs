// This file is part of tpsview, a playback engine for TPS DVR recordings.
// Copyright (C) 2025 The tpsview Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The master index, `TIndex00.tps`.
//!
//! A 32-byte header followed (at a fixed offset) by an array of 64-byte
//! segment entries. The sequential position of an entry is the index of the
//! recording file it describes; entries are never renumbered, so discarded
//! positions still advance the counter.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use base::{bail, err, Error};
use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::{read_full, MIN_VALID_UNIX_TS};

pub const MASTER_FILE_NAME: &str = "TIndex00.tps";
pub const MASTER_INDEX_MAGIC: u32 = 0x1F2E_3D4C;

const HEADER_LEN: usize = 0x20;
const ENTRY_ARRAY_START: u64 = 0x4FC;
const ENTRY_LEN: usize = 0x40;

/// Extra entries read past the header's `entry_count`. Producers are known
/// to under-report the count; the array is bounded by end-of-file anyway.
pub const ENTRY_COUNT_SLACK: u32 = 20;

/// One recording file's worth of content: a contiguous wall-clock interval
/// on one channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    /// The suffix in `TRec{file_index:06}.tps`: the entry's sequential
    /// position in the master array, counting discarded entries.
    pub file_index: u32,
    pub channel: u8,
    pub frame_count: u32,

    /// Unix seconds.
    pub start_time: i64,

    /// Unix seconds; always greater than `start_time`.
    pub end_time: i64,
}

impl Segment {
    pub fn duration(&self) -> i64 {
        self.end_time - self.start_time
    }

    pub fn recording_file_name(&self) -> String {
        crate::recording_file_name(self.file_index)
    }
}

#[derive(Clone, Debug)]
pub struct MasterIndex {
    pub file_count: u32,
    pub entry_count: u32,

    /// Valid segments, in the order read. Two segments may share time
    /// ranges across different channels.
    pub segments: Vec<Segment>,
}

impl MasterIndex {
    pub fn load(path: &Path) -> Result<Self, Error> {
        Self::load_with_slack(path, ENTRY_COUNT_SLACK)
    }

    pub fn load_with_slack(path: &Path, slack: u32) -> Result<Self, Error> {
        let mut f = std::fs::File::open(path).map_err(|e| {
            err!(
                PathUnreadable,
                msg("unable to open master index {}", path.display()),
                source(e),
            )
        })?;
        let mut hdr = [0u8; HEADER_LEN];
        f.read_exact(&mut hdr).map_err(|e| {
            err!(
                PathUnreadable,
                msg("unable to read master index header of {}", path.display()),
                source(e),
            )
        })?;
        let magic = LittleEndian::read_u32(&hdr[0..4]);
        if magic != MASTER_INDEX_MAGIC {
            bail!(
                BadMagic,
                msg("master index magic {magic:#010x}, expected {MASTER_INDEX_MAGIC:#010x}")
            );
        }
        let file_count = LittleEndian::read_u32(&hdr[0x10..0x14]);
        let entry_count = LittleEndian::read_u32(&hdr[0x14..0x18]);

        f.seek(SeekFrom::Start(ENTRY_ARRAY_START))
            .map_err(|e| err!(ReadError, msg("unable to seek to segment array"), source(e)))?;
        let mut segments = Vec::new();
        let mut entry = [0u8; ENTRY_LEN];
        for file_index in 0..entry_count.saturating_add(slack) {
            let n = read_full(&mut f, &mut entry)
                .map_err(|e| err!(ReadError, msg("unable to read segment entry"), source(e)))?;
            if n < ENTRY_LEN {
                break;
            }
            let channel = entry[4];
            let frame_count = LittleEndian::read_u16(&entry[6..8]);
            let start_time = LittleEndian::read_u32(&entry[8..12]);
            let end_time = LittleEndian::read_u32(&entry[12..16]);

            // Unused positions and entries from an unset clock.
            if channel == 0 || channel == 0xFE {
                continue;
            }
            if start_time < MIN_VALID_UNIX_TS || end_time <= start_time {
                continue;
            }
            segments.push(Segment {
                file_index,
                channel,
                frame_count: frame_count.into(),
                start_time: start_time.into(),
                end_time: end_time.into(),
            });
        }
        debug!(
            file_count,
            entry_count,
            segments = segments.len(),
            "loaded master index"
        );
        Ok(MasterIndex {
            file_count,
            entry_count,
            segments,
        })
    }
}
