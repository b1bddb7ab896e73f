// This file is part of tpsview, a playback engine for TPS DVR recordings.
// Copyright (C) 2025 The tpsview Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The storage façade: one master index plus a map of per-recording caches.
//!
//! `Storage` is constructed per storage directory and holds all state; there
//! is no process-wide anything. Cache entries are immutable once inserted
//! and handed out as `Arc`s, so a stream engine can keep using its entry
//! with no locks held and no back-reference to the façade.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use base::{err, Error};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::frame_index::{self, IndexRecord};
use crate::master::{MasterIndex, Segment, MASTER_FILE_NAME};
use crate::stream::{CancelHandle, StreamEngine};
use crate::time::{self, TimeModel};

/// A video frame's index entry, as cached.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VideoFrame {
    pub is_idr: bool,
    pub offset: u64,
    pub size: u32,
    pub unix_ts: u32,
    pub ts_device: u64,
}

/// An audio frame's index entry, as cached. The payload bytes at
/// `[offset, offset + size)` are raw G.711 µ-law.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AudioFrame {
    pub offset: u64,
    pub size: u32,
    pub unix_ts: u32,
    pub ts_device: u64,
}

/// A frame index entry, split by medium.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Frame {
    Video(VideoFrame),
    Audio(AudioFrame),
}

impl Frame {
    pub fn offset(&self) -> u64 {
        match self {
            Frame::Video(v) => v.offset,
            Frame::Audio(a) => a.offset,
        }
    }

    pub fn unix_ts(&self) -> u32 {
        match self {
            Frame::Video(v) => v.unix_ts,
            Frame::Audio(a) => a.unix_ts,
        }
    }
}

/// A scanned VPS position and its estimated wall-clock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VpsAnchor {
    pub offset: u64,
    pub time_ms: i64,
}

/// Everything cached about one recording file. Immutable once built.
#[derive(Clone, Debug)]
pub struct CachedSegment {
    pub segment: Segment,

    /// All index entries, chronological by `ts_device`.
    pub frames: Vec<Frame>,

    /// Audio entries only, ascending by offset.
    pub audio: Vec<AudioFrame>,

    /// Scanned VPS positions, strictly ascending.
    pub vps: Vec<VpsAnchor>,

    pub time: TimeModel,
}

impl CachedSegment {
    fn build(segment: Segment, records: &[IndexRecord], vps_offsets: &[u64]) -> Self {
        // A record pointing past the payload region is garbage; everything
        // downstream assumes offsets stay inside it.
        let records: Vec<IndexRecord> = records
            .iter()
            .copied()
            .filter(|r| u64::from(r.file_offset) < crate::PAYLOAD_REGION_END)
            .collect();
        let time = TimeModel::new(&segment, &records);
        let frames: Vec<Frame> = records
            .iter()
            .map(|r| {
                if r.is_audio() {
                    Frame::Audio(AudioFrame {
                        offset: r.file_offset.into(),
                        size: r.frame_size,
                        unix_ts: r.unix_ts,
                        ts_device: r.ts_device,
                    })
                } else {
                    Frame::Video(VideoFrame {
                        is_idr: r.is_iframe(),
                        offset: r.file_offset.into(),
                        size: r.frame_size,
                        unix_ts: r.unix_ts,
                        ts_device: r.ts_device,
                    })
                }
            })
            .collect();
        let mut audio: Vec<AudioFrame> = frames
            .iter()
            .filter_map(|f| match f {
                Frame::Audio(a) => Some(*a),
                Frame::Video(_) => None,
            })
            .collect();
        audio.sort_unstable_by_key(|a| a.offset);
        audio.dedup_by_key(|a| a.offset);
        let vps = vps_offsets
            .iter()
            .map(|&offset| VpsAnchor {
                offset,
                time_ms: time.precise_time_ms(offset),
            })
            .collect();
        CachedSegment {
            segment,
            frames,
            audio,
            vps,
            time,
        }
    }

    /// The VPS anchor with the greatest time at or before `target` (unix
    /// seconds), falling back to the first anchor; `None` only when the
    /// recording has no VPS at all.
    pub fn find_vps_for_time(&self, target: i64) -> Option<VpsAnchor> {
        let target_ms = target * 1000;
        let i = self.vps.partition_point(|a| a.time_ms <= target_ms);
        match i {
            0 => self.vps.first().copied(),
            i => Some(self.vps[i - 1]),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Building,
    Ready,
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub status: CacheState,

    /// Percent of catalogued segments cached.
    pub progress: u8,
    pub total: usize,
    pub cached: usize,
}

/// One day-bounded row of `list_recordings`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    /// The segment's `file_index`.
    pub id: u32,
    pub channel: u8,

    /// `HH:MM:SS` of `start_timestamp` in the query's zone.
    pub start: String,

    /// `HH:MM:SS` of `end_timestamp` in the query's zone.
    pub end: String,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub duration: i64,
    pub frame_count: u32,
}

pub struct Storage {
    dir: PathBuf,
    cache_dir: PathBuf,
    master: MasterIndex,
    cache: RwLock<HashMap<u32, Arc<CachedSegment>>>,

    /// Serializes prebuild passes; lookups don't take it.
    build_lock: base::Mutex<()>,
    building: AtomicBool,
    processed: AtomicUsize,
}

impl Storage {
    /// Loads the master index of the given storage directory. No recording
    /// files are touched yet.
    pub fn open(dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        let master = MasterIndex::load(&dir.join(MASTER_FILE_NAME))?;
        info!(
            dir = %dir.display(),
            segments = master.segments.len(),
            "loaded TPS storage"
        );
        Ok(Storage {
            dir,
            cache_dir: cache_dir.into(),
            master,
            cache: RwLock::new(HashMap::new()),
            build_lock: base::Mutex::new(()),
            building: AtomicBool::new(false),
            processed: AtomicUsize::new(0),
        })
    }

    pub fn master(&self) -> &MasterIndex {
        &self.master
    }

    pub fn segments(&self) -> &[Segment] {
        &self.master.segments
    }

    pub fn recording_path(&self, file_index: u32) -> PathBuf {
        self.dir.join(crate::recording_file_name(file_index))
    }

    /// The first catalogued segment covering `(timestamp, channel)`.
    pub fn find_segment_by_time(&self, timestamp: i64, channel: u8) -> Option<&Segment> {
        self.master
            .segments
            .iter()
            .find(|s| s.channel == channel && s.start_time <= timestamp && timestamp <= s.end_time)
    }

    pub fn cached(&self, file_index: u32) -> Option<Arc<CachedSegment>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&file_index)
            .cloned()
    }

    /// Returns the cache entry for `file_index`, building it on demand.
    pub fn get_or_build(&self, file_index: u32) -> Result<Arc<CachedSegment>, Error> {
        if let Some(c) = self.cached(file_index) {
            return Ok(c);
        }
        let segment = self
            .master
            .segments
            .iter()
            .find(|s| s.file_index == file_index)
            .ok_or_else(|| {
                err!(
                    SegmentNotFound,
                    msg("no catalogued segment with file index {file_index}")
                )
            })?
            .clone();
        let built = self.build_segment(segment)?;
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        Ok(cache.entry(file_index).or_insert(built).clone())
    }

    fn build_segment(&self, segment: Segment) -> Result<Arc<CachedSegment>, Error> {
        let path = self.recording_path(segment.file_index);
        let records = frame_index::parse_with_cache(&path, &self.cache_dir);
        let vps = time::scan_vps_offsets(&path)?;
        debug!(
            file_index = segment.file_index,
            records = records.len(),
            vps = vps.len(),
            "built segment cache"
        );
        Ok(Arc::new(CachedSegment::build(segment, &records, &vps)))
    }

    /// Builds cache entries for every catalogued segment. Per-segment
    /// failures are logged and skipped; the segment just stays uncached.
    /// Returns the number of entries built by this pass.
    pub fn build_cache(&self) -> usize {
        let _guard = self.build_lock.lock();
        self.building.store(true, Ordering::SeqCst);
        self.processed.store(0, Ordering::SeqCst);
        let mut built = 0;
        for segment in &self.master.segments {
            let file_index = segment.file_index;
            if self.cached(file_index).is_none() {
                match self.build_segment(segment.clone()) {
                    Ok(c) => {
                        self.cache
                            .write()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(file_index, c);
                        built += 1;
                    }
                    Err(err) => {
                        warn!(err = %err.chain(), file_index, "unable to cache segment; skipping");
                    }
                }
            }
            self.processed.fetch_add(1, Ordering::SeqCst);
        }
        self.building.store(false, Ordering::SeqCst);
        info!(built, total = self.master.segments.len(), "cache build complete");
        built
    }

    pub fn cache_status(&self) -> CacheStatus {
        let total = self.master.segments.len();
        let cached = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let building = self.building.load(Ordering::SeqCst);
        let progress = if building {
            let processed = self.processed.load(Ordering::SeqCst);
            if total == 0 {
                100
            } else {
                (processed * 100 / total) as u8
            }
        } else {
            100
        };
        CacheStatus {
            status: if building {
                CacheState::Building
            } else {
                CacheState::Ready
            },
            progress,
            total,
            cached,
        }
    }

    /// Sorted `YYYY-MM-DD` dates with any recorded content, in the given
    /// IANA zone.
    pub fn list_dates(&self, channel: Option<u8>, tz: &str) -> Result<Vec<String>, Error> {
        let tz = load_zone(tz)?;
        let mut dates = BTreeSet::new();
        for s in &self.master.segments {
            if channel.is_some_and(|c| c != s.channel) {
                continue;
            }
            // Both endpoints, so a segment spanning midnight shows on both
            // days.
            for t in [s.start_time, s.end_time] {
                let ts = jiff::Timestamp::from_second(t)
                    .map_err(|e| err!(Internal, msg("segment time {t} out of range"), source(e)))?;
                dates.insert(ts.to_zoned(tz.clone()).strftime("%Y-%m-%d").to_string());
            }
        }
        Ok(dates.into_iter().collect())
    }

    /// Channels present in the catalogue, ascending.
    pub fn channels(&self) -> Vec<u8> {
        let set: BTreeSet<u8> = self.master.segments.iter().map(|s| s.channel).collect();
        set.into_iter().collect()
    }

    /// The recordings overlapping the given `YYYY-MM-DD` day in the given
    /// IANA zone, clamped to the day's bounds and ordered by start time.
    pub fn list_recordings(
        &self,
        date: &str,
        channel: Option<u8>,
        tz: &str,
    ) -> Result<Vec<Recording>, Error> {
        let tz = load_zone(tz)?;
        let date = jiff::civil::Date::strptime("%Y-%m-%d", date)
            .map_err(|e| err!(InvalidArgument, msg("invalid date {date:?}"), source(e)))?;
        let day_start = date
            .to_zoned(tz.clone())
            .map_err(|e| err!(InvalidArgument, msg("invalid day start"), source(e)))?
            .timestamp()
            .as_second();
        let day_end = date
            .tomorrow()
            .map_err(|e| err!(InvalidArgument, msg("date {date} has no tomorrow"), source(e)))?
            .to_zoned(tz.clone())
            .map_err(|e| err!(InvalidArgument, msg("invalid day end"), source(e)))?
            .timestamp()
            .as_second();

        let mut out = Vec::new();
        for s in &self.master.segments {
            if channel.is_some_and(|c| c != s.channel) {
                continue;
            }
            if s.start_time >= day_end || s.end_time <= day_start {
                continue;
            }
            let start_timestamp = s.start_time.max(day_start);
            let end_timestamp = s.end_time.min(day_end);
            out.push(Recording {
                id: s.file_index,
                channel: s.channel,
                start: hms(start_timestamp, &tz)?,
                end: hms(end_timestamp, &tz)?,
                start_timestamp,
                end_timestamp,
                duration: end_timestamp - start_timestamp,
                frame_count: s.frame_count,
            });
        }
        out.sort_by_key(|r| r.start_timestamp);
        Ok(out)
    }

    /// Seeks `(timestamp, channel)` and returns a stream engine positioned
    /// at the nearest decodable point. Builds the segment's cache entry if
    /// it isn't resident yet.
    pub fn open_stream(
        &self,
        channel: u8,
        timestamp: i64,
        rate: f64,
        cancel: CancelHandle,
    ) -> Result<StreamEngine, Error> {
        let segment = self.find_segment_by_time(timestamp, channel).ok_or_else(|| {
            err!(
                SegmentNotFound,
                msg("no segment covers channel {channel} at {timestamp}")
            )
        })?;
        let file_index = segment.file_index;
        let cached = self.get_or_build(file_index)?;
        StreamEngine::new(
            &self.recording_path(file_index),
            cached,
            timestamp,
            rate,
            cancel,
        )
    }
}

fn load_zone(name: &str) -> Result<jiff::tz::TimeZone, Error> {
    jiff::tz::TimeZone::get(name)
        .map_err(|e| err!(InvalidArgument, msg("invalid time zone {name:?}"), source(e)))
}

fn hms(t: i64, tz: &jiff::tz::TimeZone) -> Result<String, Error> {
    let ts = jiff::Timestamp::from_second(t)
        .map_err(|e| err!(Internal, msg("timestamp {t} out of range"), source(e)))?;
    Ok(ts.to_zoned(tz.clone()).strftime("%H:%M:%S").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, Fixture};

    #[test]
    fn list_recordings_for_day() {
        testutil::init();
        let f = Fixture::basic();
        let storage = f.storage();

        // 1700000000 is 2023-11-14T22:13:20Z.
        let recordings = storage.list_recordings("2023-11-14", Some(2), "UTC").unwrap();
        assert_eq!(recordings.len(), 1);
        let r = &recordings[0];
        assert_eq!(r.id, 0);
        assert_eq!(r.channel, 2);
        assert_eq!(r.duration, 10);
        assert_eq!(r.frame_count, 1);
        assert_eq!(r.start, "22:13:20");
        assert_eq!(r.start_timestamp, 1_700_000_000);

        assert!(storage
            .list_recordings("2023-11-13", Some(2), "UTC")
            .unwrap()
            .is_empty());
        assert!(storage
            .list_recordings("2023-11-14", Some(9), "UTC")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn list_dates_respects_zone() {
        testutil::init();
        let f = Fixture::basic();
        let storage = f.storage();
        assert_eq!(storage.list_dates(None, "UTC").unwrap(), ["2023-11-14"]);
        // 22:13:20Z is already the 15th in Shanghai.
        assert_eq!(
            storage.list_dates(None, "Asia/Shanghai").unwrap(),
            ["2023-11-15"]
        );
        assert!(storage.list_dates(Some(9), "UTC").unwrap().is_empty());
        storage.list_dates(None, "Not/AZone").unwrap_err();
    }

    #[test]
    fn find_segment_by_time() {
        testutil::init();
        let f = Fixture::basic();
        let storage = f.storage();
        assert_eq!(
            storage
                .find_segment_by_time(1_700_000_005, 2)
                .map(|s| s.file_index),
            Some(0)
        );
        assert_eq!(storage.find_segment_by_time(1_700_000_005, 3), None);
        assert_eq!(storage.find_segment_by_time(1_600_000_000, 2), None);
    }

    #[test]
    fn cache_builds_and_reports_status() {
        testutil::init();
        let f = Fixture::basic();
        let storage = f.storage();
        let before = storage.cache_status();
        assert_eq!(before.status, CacheState::Ready);
        assert_eq!(before.cached, 0);
        assert_eq!(before.total, 1);

        assert_eq!(storage.build_cache(), 1);
        let after = storage.cache_status();
        assert_eq!(after.cached, 1);
        assert_eq!(after.progress, 100);

        // A second pass has nothing to do.
        assert_eq!(storage.build_cache(), 0);

        let cached = storage.cached(0).unwrap();
        assert_eq!(cached.segment.file_index, 0);
        assert!(!cached.audio.is_empty());
        assert!(!cached.vps.is_empty());
        // The frame list is chronological and carries both media.
        assert!(cached
            .frames
            .windows(2)
            .all(|w| w[0].unix_ts() <= w[1].unix_ts()));
        assert!(cached.frames.iter().any(|f| matches!(f, Frame::Video(v) if v.is_idr)));
        assert!(cached
            .frames
            .iter()
            .any(|f| matches!(f, Frame::Audio(a) if a.offset == 10_000)));
        // Audio list ascending by offset.
        for w in cached.audio.windows(2) {
            assert!(w[0].offset < w[1].offset);
        }
        // VPS anchors strictly ascending, inside the payload region.
        for w in cached.vps.windows(2) {
            assert!(w[0].offset < w[1].offset);
        }
        assert!(cached.vps.iter().all(|a| a.offset < crate::PAYLOAD_REGION_END));

        // Each anchor points at an actual VPS start.
        use std::io::{Read, Seek, SeekFrom};
        let mut rec = std::fs::File::open(f.dir.path().join("TRec000000.tps")).unwrap();
        for a in &cached.vps {
            let mut b = [0u8; 6];
            rec.seek(SeekFrom::Start(a.offset)).unwrap();
            rec.read_exact(&mut b).unwrap();
            assert_eq!(b, [0x00, 0x00, 0x00, 0x01, 0x40, 0x01]);
        }
    }

    #[test]
    fn find_vps_for_time_prefers_latest_at_or_before() {
        testutil::init();
        let f = Fixture::basic();
        let storage = f.storage();
        let cached = storage.get_or_build(0).unwrap();
        let anchor = cached.find_vps_for_time(1_700_000_009).unwrap();
        assert_eq!(anchor.offset, f.header_offset);
        // A target before every anchor falls back to the first.
        let anchor = cached.find_vps_for_time(1_600_000_000).unwrap();
        assert_eq!(anchor.offset, f.header_offset);
    }
}
