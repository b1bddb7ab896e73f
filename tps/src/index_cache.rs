// This file is part of tpsview, a playback engine for TPS DVR recordings.
// Copyright (C) 2025 The tpsview Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! On-disk cache of parsed frame indexes.
//!
//! Scanning a recording's 7 MiB tail region is the slow part of cataloguing
//! a storage directory, so parsed indexes are persisted as a flat typed
//! array, one artifact per recording file. The artifact is keyed by a
//! fingerprint of the recording's basename, size, and three 64 KiB content
//! samples; the fingerprint deliberately excludes mtime and the mount point,
//! both of which change when an SD card is re-inserted.

use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use base::{err, Error};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use crate::frame_index::IndexRecord;
use crate::read_full;

const ARTIFACT_MAGIC: &[u8; 4] = b"TPSI";
const ARTIFACT_VERSION: u16 = 1;
const ARTIFACT_SUFFIX: &str = "tpsidx";
const SAMPLE_LEN: usize = 64 << 10;

/// Loads the cached index for `rec_path`, or `None` when there is no valid
/// artifact for the file's current fingerprint. A corrupt artifact is
/// deleted so the next parse rewrites it.
pub(crate) fn load(rec_path: &Path, cache_dir: &Path) -> Option<Vec<IndexRecord>> {
    let path = artifact_path(rec_path, cache_dir).ok()?;
    let f = std::fs::File::open(&path).ok()?;
    match read_artifact(f) {
        Ok(records) => Some(records),
        Err(err) => {
            debug!(err = %err.chain(), path = %path.display(), "discarding corrupt cache artifact");
            let _ = std::fs::remove_file(&path);
            None
        }
    }
}

/// Persists `records` as the cache artifact for `rec_path`.
pub(crate) fn save(
    rec_path: &Path,
    cache_dir: &Path,
    records: &[IndexRecord],
) -> Result<(), Error> {
    std::fs::create_dir_all(cache_dir)
        .map_err(|e| err!(ReadError, msg("unable to create {}", cache_dir.display()), source(e)))?;
    let path = artifact_path(rec_path, cache_dir)?;
    let f = std::fs::File::create(&path)
        .map_err(|e| err!(ReadError, msg("unable to create {}", path.display()), source(e)))?;
    let mut w = BufWriter::new(f);
    w.write_all(ARTIFACT_MAGIC)?;
    w.write_u16::<LittleEndian>(ARTIFACT_VERSION)?;
    w.write_u32::<LittleEndian>(records.len() as u32)?;
    for r in records {
        w.write_u32::<LittleEndian>(r.frame_type)?;
        w.write_u32::<LittleEndian>(r.channel)?;
        w.write_u32::<LittleEndian>(r.frame_seq)?;
        w.write_u32::<LittleEndian>(r.file_offset)?;
        w.write_u32::<LittleEndian>(r.frame_size)?;
        w.write_u64::<LittleEndian>(r.ts_device)?;
        w.write_u32::<LittleEndian>(r.unix_ts)?;
    }
    w.flush()?;
    debug!(path = %path.display(), records = records.len(), "wrote frame index cache");
    Ok(())
}

fn read_artifact(f: std::fs::File) -> Result<Vec<IndexRecord>, Error> {
    let mut r = BufReader::new(f);
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != ARTIFACT_MAGIC {
        return Err(err!(BadMagic, msg("not a frame index cache artifact")));
    }
    let version = r.read_u16::<LittleEndian>()?;
    if version != ARTIFACT_VERSION {
        return Err(err!(BadMagic, msg("cache artifact version {version}")));
    }
    let count = r.read_u32::<LittleEndian>()?;
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        records.push(IndexRecord {
            frame_type: r.read_u32::<LittleEndian>()?,
            channel: r.read_u32::<LittleEndian>()?,
            frame_seq: r.read_u32::<LittleEndian>()?,
            file_offset: r.read_u32::<LittleEndian>()?,
            frame_size: r.read_u32::<LittleEndian>()?,
            ts_device: r.read_u64::<LittleEndian>()?,
            unix_ts: r.read_u32::<LittleEndian>()?,
        });
    }
    Ok(records)
}

fn artifact_path(rec_path: &Path, cache_dir: &Path) -> Result<PathBuf, Error> {
    Ok(cache_dir.join(format!("{}.{ARTIFACT_SUFFIX}", fingerprint(rec_path)?)))
}

/// Hash of `(basename, file size, head/mid/tail 64 KiB samples)`.
fn fingerprint(rec_path: &Path) -> Result<String, Error> {
    let name = rec_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| err!(InvalidArgument, msg("bad recording path {}", rec_path.display())))?;
    let mut f = std::fs::File::open(rec_path)?;
    let len = f.metadata()?.len();

    let mut hasher = blake3::Hasher::new();
    hasher.update(name.as_bytes());
    hasher.update(&len.to_le_bytes());
    let mid = (len / 2).saturating_sub(SAMPLE_LEN as u64 / 2);
    let tail = len.saturating_sub(SAMPLE_LEN as u64);
    let mut sample = vec![0u8; SAMPLE_LEN];
    for start in [0, mid, tail] {
        f.seek(SeekFrom::Start(start))?;
        let n = read_full(&mut f, &mut sample)?;
        hasher.update(&sample[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}
