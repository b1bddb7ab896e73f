// This file is part of tpsview, a playback engine for TPS DVR recordings.
// Copyright (C) 2025 The tpsview Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The stream engine: seek, header extraction, and buffered NAL streaming
//! with offset-aligned audio interleaving.
//!
//! An engine is a lazy iterator of [`StreamEvent`]s over one segment. It is
//! synchronous; the transport layer drives it at its own pace, typically
//! from a blocking task. Pacing between pictures is a plain sleep inside
//! `next()`, sized from the playback rate; a rate of zero disables it
//! ("drain" mode, used by exporters).
//!
//! A new seek means a new engine. Buffers are never reused across seeks, and
//! each engine owns exactly one file handle, closed on drop.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base::{err, Error};
use bytes::Bytes;
use tracing::{debug, trace};

use crate::h265;
use crate::storage::CachedSegment;
use crate::{read_full, PAYLOAD_REGION_END};

/// Target minimum buffered bytes before demuxing.
const MIN_FILL: usize = 256 << 10;

/// Size of one payload read.
const CHUNK_LEN: usize = 64 << 10;

/// Extra bytes read when the buffer holds a single, possibly-truncated unit.
const RETRY_READ_LEN: usize = 256 << 10;

/// Bound on those extra reads before the region is declared corrupt.
const MAX_RETRIES: u32 = 10;

/// Size of the header search window past the seek offset.
const HEADER_READ_LEN: usize = 512 << 10;

/// Nominal picture rate of the recordings.
const NOMINAL_FPS: f64 = 25.0;

/// A cooperative cancellation flag, polled at emission boundaries and
/// between chunk reads.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One item of a playback stream. Timestamps are wall-clock milliseconds.
#[derive(Debug)]
pub enum StreamEvent {
    /// The decodable seek point, emitted exactly once, first. All four NAL
    /// payloads carry the same timestamp and no start codes.
    VideoHeader {
        ts_ms: i64,
        vps: Bytes,
        sps: Bytes,
        pps: Bytes,
        idr: Bytes,
    },

    /// One video NAL, start code stripped.
    VideoNal { ts_ms: i64, ty: u8, data: Bytes },

    /// One G.711 µ-law audio frame.
    Audio { ts_ms: i64, data: Bytes },

    /// Terminal: end of segment or cancellation. Nothing follows.
    End,

    /// Terminal: the stream died mid-flight. Nothing follows.
    Error(Error),
}

#[derive(Debug)]
enum State {
    Running,
    Finished,
}

#[derive(Debug)]
pub struct StreamEngine {
    file: File,
    seg: Arc<CachedSegment>,
    cancel: CancelHandle,
    pacing: Duration,
    state: State,

    /// Pending header, emitted on the first `next()` call.
    header: Option<(i64, h265::VideoHeader)>,

    /// Parsed events not yet handed out.
    pending: VecDeque<StreamEvent>,

    buffer: Vec<u8>,

    /// Absolute payload offset of `buffer[0]`.
    buffer_origin: u64,

    /// Absolute payload offset of the next read.
    stream_pos: u64,

    /// Index into `seg.audio` of the next audio frame to emit.
    audio_idx: usize,

    retries: u32,
    eof: bool,

    /// Sleep before handing out the next event (the previous one was a
    /// picture).
    pace_next: bool,
}

impl StreamEngine {
    /// Seeks within `seg` to the nearest decodable point at or after the
    /// audio anchor for `timestamp` and prepares to stream. Fails with
    /// `NoVideoHeader` when the header search window past the seek offset
    /// holds no VPS/SPS/PPS/IDR quadruple.
    pub(crate) fn new(
        path: &Path,
        seg: Arc<CachedSegment>,
        timestamp: i64,
        rate: f64,
        cancel: CancelHandle,
    ) -> Result<Self, Error> {
        let mut file = File::open(path).map_err(|e| {
            err!(
                ReadError,
                msg("unable to open recording {}", path.display()),
                source(e),
            )
        })?;

        let seek_off = seek_offset(&seg, timestamp);

        let mut window =
            vec![0u8; HEADER_READ_LEN.min(PAYLOAD_REGION_END.saturating_sub(seek_off) as usize)];
        file.seek(SeekFrom::Start(seek_off))
            .map_err(|e| err!(ReadError, msg("unable to seek to {seek_off}"), source(e)))?;
        let n = read_full(&mut file, &mut window)
            .map_err(|e| err!(ReadError, msg("unable to read header window"), source(e)))?;
        window.truncate(n);
        let header = h265::find_video_header(&window).ok_or_else(|| {
            err!(
                NoVideoHeader,
                msg(
                    "no VPS/SPS/PPS/IDR within {n} bytes at offset {seek_off} of {}",
                    path.display()
                )
            )
        })?;

        let stream_pos = seek_off + header.idr_end as u64;
        let ts_ms = seg.time.precise_time_ms(seek_off);
        let audio_idx = seg.audio.partition_point(|a| a.offset < stream_pos);
        debug!(
            timestamp,
            seek_off, stream_pos, ts_ms, audio_idx, "seek complete"
        );

        Ok(StreamEngine {
            file,
            cancel,
            pacing: pacing_for_rate(rate),
            state: State::Running,
            header: Some((ts_ms, header)),
            pending: VecDeque::new(),
            buffer: Vec::with_capacity(MIN_FILL + CHUNK_LEN),
            buffer_origin: stream_pos,
            stream_pos,
            audio_idx,
            retries: 0,
            eof: false,
            pace_next: false,
            seg,
        })
    }

    /// The cached segment this engine plays from.
    pub fn segment(&self) -> &CachedSegment {
        &self.seg
    }

    /// The wall-clock of the seek point, in ms: the header's timestamp.
    pub fn start_ts_ms(&self) -> i64 {
        // Taken only by the first `next()`, so this is present until then;
        // afterwards callers should have remembered the header event.
        self.header.as_ref().map(|(ts, _)| *ts).unwrap_or_default()
    }

    fn exhausted(&self) -> bool {
        self.eof || self.stream_pos >= PAYLOAD_REGION_END
    }

    /// One iteration of the streaming loop: refill, demux, queue events.
    /// `Ok(true)` means progress was made (events queued or more data
    /// wanted); `Ok(false)` means the segment is over.
    fn advance(&mut self) -> Result<bool, Error> {
        while self.buffer.len() < MIN_FILL && !self.exhausted() {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            if self.read_chunk(CHUNK_LEN)? == 0 {
                break;
            }
        }
        if self.buffer.is_empty() {
            return Ok(false);
        }

        let units = h265::find_nal_units(&self.buffer);
        if units.is_empty() {
            // No start codes at all: an audio-only stretch of the payload
            // region. Skip the whole window.
            trace!(
                origin = self.buffer_origin,
                len = self.buffer.len(),
                "no start codes in window"
            );
            self.buffer.clear();
            self.buffer_origin = self.stream_pos;
            return Ok(!self.exhausted());
        }
        if units.len() == 1 {
            // The lone unit may be truncated; never emit it without a
            // terminator. Read on, within bounds.
            if self.exhausted() {
                return Ok(false);
            }
            self.retries += 1;
            if self.retries > MAX_RETRIES {
                return Err(err!(
                    StreamStall,
                    msg(
                        "no complete NAL unit in {} bytes at offset {}",
                        self.buffer.len(),
                        self.buffer_origin
                    )
                ));
            }
            self.read_chunk(RETRY_READ_LEN)?;
            return Ok(true);
        }
        self.retries = 0;

        for u in &units[..units.len() - 1] {
            let nal_off = self.buffer_origin + u.offset as u64;
            if h265::is_picture_slice(u.ty) {
                self.flush_audio(nal_off)?;
            }
            let ts_ms = self.seg.time.precise_time_ms(nal_off);
            let data = h265::strip_start_code(&self.buffer[u.offset..u.offset + u.size]).to_vec();
            self.pending.push_back(StreamEvent::VideoNal {
                ts_ms,
                ty: u.ty,
                data: data.into(),
            });
        }
        let consumed = units[units.len() - 1].offset;
        self.buffer.drain(..consumed);
        self.buffer_origin += consumed as u64;
        Ok(true)
    }

    /// Queues every not-yet-emitted audio frame positioned at or before
    /// `nal_off`, reading the µ-law payloads from the recording file.
    fn flush_audio(&mut self, nal_off: u64) -> Result<(), Error> {
        while self.audio_idx < self.seg.audio.len() {
            let af = self.seg.audio[self.audio_idx];
            if af.offset > nal_off {
                break;
            }
            let mut data = vec![0u8; af.size as usize];
            self.file
                .seek(SeekFrom::Start(af.offset))
                .map_err(|e| err!(ReadError, msg("unable to seek to audio frame"), source(e)))?;
            self.file.read_exact(&mut data).map_err(|e| {
                err!(
                    ReadError,
                    msg("short read of audio frame at {}", af.offset),
                    source(e),
                )
            })?;
            self.pending.push_back(StreamEvent::Audio {
                ts_ms: i64::from(af.unix_ts) * 1000,
                data: data.into(),
            });
            self.audio_idx += 1;
        }
        Ok(())
    }

    /// Reads up to `len` payload bytes at `stream_pos`, appending to the
    /// buffer. Reads never cross into the tail index region.
    fn read_chunk(&mut self, len: usize) -> Result<usize, Error> {
        let len = len.min(PAYLOAD_REGION_END.saturating_sub(self.stream_pos) as usize);
        if len == 0 {
            return Ok(0);
        }
        let start = self.buffer.len();
        self.buffer.resize(start + len, 0);
        self.file
            .seek(SeekFrom::Start(self.stream_pos))
            .map_err(|e| err!(ReadError, msg("unable to seek to {}", self.stream_pos), source(e)))?;
        let n = read_full(&mut self.file, &mut self.buffer[start..])
            .map_err(|e| err!(ReadError, msg("unable to read payload chunk"), source(e)))?;
        self.buffer.truncate(start + n);
        self.stream_pos += n as u64;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }
}

impl Iterator for StreamEngine {
    type Item = StreamEvent;

    fn next(&mut self) -> Option<StreamEvent> {
        if matches!(self.state, State::Finished) {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.state = State::Finished;
            debug!("stream cancelled");
            return Some(StreamEvent::End);
        }
        if self.pace_next {
            self.pace_next = false;
            if !self.pacing.is_zero() {
                std::thread::sleep(self.pacing);
            }
        }

        if let Some((ts_ms, h)) = self.header.take() {
            return Some(StreamEvent::VideoHeader {
                ts_ms,
                vps: h.vps.into(),
                sps: h.sps.into(),
                pps: h.pps.into(),
                idr: h.idr.into(),
            });
        }

        loop {
            if let Some(ev) = self.pending.pop_front() {
                if let StreamEvent::VideoNal { ty, .. } = &ev {
                    if h265::is_picture_slice(*ty) {
                        self.pace_next = true;
                    }
                }
                return Some(ev);
            }
            match self.advance() {
                Ok(true) => continue,
                Ok(false) => {
                    self.state = State::Finished;
                    debug!("stream end");
                    return Some(StreamEvent::End);
                }
                Err(e) => {
                    self.state = State::Finished;
                    return Some(StreamEvent::Error(e));
                }
            }
        }
    }
}

/// The inter-picture delay for a playback rate; zero disables pacing.
fn pacing_for_rate(rate: f64) -> Duration {
    if rate > 0.0 {
        Duration::from_secs_f64(1.0 / (NOMINAL_FPS * rate))
    } else {
        Duration::ZERO
    }
}

/// Phase 1 of a seek: the audio anchor with the smallest offset whose
/// wall-clock is at or past the target, the last audio offset when none
/// qualifies, a VPS anchor for recordings with no audio at all, and the
/// start of the payload region as the last resort.
fn seek_offset(seg: &CachedSegment, timestamp: i64) -> u64 {
    if !seg.audio.is_empty() {
        let i = seg
            .audio
            .partition_point(|a| i64::from(a.unix_ts) < timestamp);
        return seg.audio[i.min(seg.audio.len() - 1)].offset;
    }
    if let Some(anchor) = seg.find_vps_for_time(timestamp) {
        return anchor.offset;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, Fixture};
    use crate::wire;

    /// Seeking mid-segment: the header comes first with the seek point's
    /// timestamp, then audio frames interleave ahead of the video NALs they
    /// precede in the file, in offset order with monotonic timestamps.
    #[test]
    fn seek_emits_header_audio_video_in_order() {
        testutil::init();
        let f = Fixture::basic();
        let storage = f.storage();
        let cancel = CancelHandle::new();
        let mut engine = storage
            .open_stream(2, 1_700_000_002, 0.0, cancel.clone())
            .unwrap();

        // The audio anchor for T is audio2 (offset 60_000, ts 03); the
        // header search from there finds the seek point at 70_000.
        match engine.next().unwrap() {
            StreamEvent::VideoHeader {
                ts_ms,
                vps,
                sps,
                pps,
                idr,
            } => {
                assert_eq!(ts_ms, 1_700_000_003_000);
                assert_eq!(vps[0], h265::NAL_UNIT_VPS << 1);
                assert_eq!(sps[0], h265::NAL_UNIT_SPS << 1);
                assert_eq!(pps[0], h265::NAL_UNIT_PPS << 1);
                assert_eq!(idr[0], h265::NAL_UNIT_IDR_W_RADL << 1);
                assert_eq!(idr.len(), 2002);
            }
            ev => panic!("expected header, got {ev:?}"),
        }

        // audio3 (offset 80_000) precedes the P slice at 100_000.
        match engine.next().unwrap() {
            StreamEvent::Audio { ts_ms, data } => {
                assert_eq!(ts_ms, 1_700_000_005_000);
                assert_eq!(data.len(), 160);
                assert!(data.iter().all(|&b| b == testutil::AUDIO_FILL));
            }
            ev => panic!("expected audio, got {ev:?}"),
        }

        match engine.next().unwrap() {
            StreamEvent::VideoNal { ts_ms, ty, data } => {
                // Timestamped from the audio anchor at 80_000.
                assert_eq!(ts_ms, 1_700_000_005_000);
                assert_eq!(ty, h265::NAL_UNIT_TRAIL_R);
                assert_eq!(data.len(), 3002);
            }
            ev => panic!("expected video, got {ev:?}"),
        }

        // Cancel mid-stream: exactly one End, then exhaustion.
        cancel.cancel();
        assert!(matches!(engine.next(), Some(StreamEvent::End)));
        assert!(engine.next().is_none());
    }

    /// A truncated recording plays to its end: the held-back final unit is
    /// never emitted and the engine signals End.
    #[test]
    fn truncated_recording_ends_cleanly() {
        testutil::init();
        let f = Fixture::truncated();
        let storage = f.storage();
        let mut engine = storage
            .open_stream(2, 1_700_000_000, 0.0, CancelHandle::new())
            .unwrap();

        assert!(matches!(
            engine.next(),
            Some(StreamEvent::VideoHeader { ts_ms: 1_700_000_000_000, .. })
        ));
        match engine.next().unwrap() {
            StreamEvent::VideoNal { ty, .. } => assert_eq!(ty, h265::NAL_UNIT_TRAIL_R),
            ev => panic!("expected video, got {ev:?}"),
        }
        // The second slice is the file's final unit: held back, never sent.
        assert!(matches!(engine.next(), Some(StreamEvent::End)));
        assert!(engine.next().is_none());
    }

    /// A blank recording is catalogued but yields `NoVideoHeader` on seek.
    #[test]
    fn blank_recording_has_no_header() {
        testutil::init();
        let f = Fixture::blank();
        let storage = f.storage();
        assert_eq!(
            storage
                .list_recordings("2023-11-14", Some(2), "UTC")
                .unwrap()
                .len(),
            1
        );
        let e = storage
            .open_stream(2, 1_700_000_002, 1.0, CancelHandle::new())
            .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::NoVideoHeader);
    }

    /// Seeking a time no segment covers fails up front.
    #[test]
    fn seek_outside_catalogue() {
        testutil::init();
        let f = Fixture::basic();
        let storage = f.storage();
        let e = storage
            .open_stream(2, 1_600_000_000, 1.0, CancelHandle::new())
            .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::SegmentNotFound);
    }

    /// A single start code followed by megabytes of garbage trips the
    /// retry bound.
    #[test]
    fn corrupt_region_stalls() {
        testutil::init();
        let f = Fixture::corrupt();
        let storage = f.storage();
        let mut engine = storage
            .open_stream(2, 1_700_000_000, 0.0, CancelHandle::new())
            .unwrap();
        assert!(matches!(engine.next(), Some(StreamEvent::VideoHeader { .. })));
        match engine.next().unwrap() {
            StreamEvent::Error(e) => assert_eq!(e.kind(), base::ErrorKind::StreamStall),
            ev => panic!("expected stall, got {ev:?}"),
        }
        assert!(engine.next().is_none());
    }

    /// An audio-only stretch (no start codes for a long run) is skipped,
    /// and its audio still plays out ahead of the next video NAL.
    #[test]
    fn audio_only_stretch_is_skipped() {
        testutil::init();
        let f = Fixture::audio_stretch();
        let storage = f.storage();
        let cancel = CancelHandle::new();
        let mut engine = storage
            .open_stream(2, 1_700_000_000, 0.0, cancel.clone())
            .unwrap();

        assert!(matches!(engine.next(), Some(StreamEvent::VideoHeader { .. })));
        assert!(matches!(engine.next(), Some(StreamEvent::Audio { .. })));
        match engine.next().unwrap() {
            StreamEvent::VideoNal { ty, .. } => assert_eq!(ty, h265::NAL_UNIT_TRAIL_R),
            ev => panic!("expected video, got {ev:?}"),
        }
        cancel.cancel();
        assert!(matches!(engine.next(), Some(StreamEvent::End)));
    }

    /// Drain mode (rate 0) disables pacing; positive rates scale 25 Hz.
    #[test]
    fn pacing() {
        assert_eq!(pacing_for_rate(0.0), Duration::ZERO);
        assert_eq!(pacing_for_rate(1.0), Duration::from_millis(40));
        assert_eq!(pacing_for_rate(2.0), Duration::from_millis(20));
    }

    /// The header event converts into the four wire frames the relay sends.
    #[test]
    fn header_to_wire_kinds() {
        testutil::init();
        let f = Fixture::basic();
        let storage = f.storage();
        let mut engine = storage
            .open_stream(2, 1_700_000_002, 0.0, CancelHandle::new())
            .unwrap();
        let Some(StreamEvent::VideoHeader { ts_ms, vps, sps, pps, idr }) = engine.next() else {
            panic!("expected header");
        };
        for (nal, kind) in [
            (&vps, wire::KIND_VPS),
            (&sps, wire::KIND_SPS),
            (&pps, wire::KIND_PPS),
            (&idr, wire::KIND_IDR),
        ] {
            let frame = wire::video_frame(ts_ms, h265::nal_type(nal[0]), nal);
            assert_eq!(&frame[0..4], wire::VIDEO_MAGIC);
            assert_eq!(frame[12], kind);
        }
    }
}
