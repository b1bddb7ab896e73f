// This file is part of tpsview, a playback engine for TPS DVR recordings.
// Copyright (C) 2025 The tpsview Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The `export` subcommand: write a clip as a raw H.265 elementary stream.
//!
//! Runs the stream engine in drain mode (rate 0, no pacing) and rewrites
//! Annex-B start codes in front of each emitted NAL. The output plays in
//! anything that accepts a bare `.h265` bitstream.

use std::io::Write;
use std::path::PathBuf;

use base::{err, Error};
use bpaf::Bpaf;
use tracing::info;
use tps::{CancelHandle, Storage, StreamEvent};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Export a clip as a raw Annex-B H.265 elementary stream.
#[derive(Bpaf, Clone, Debug)]
#[bpaf(command("export"))]
pub struct Args {
    /// Directory holding `TIndex00.tps` and the `TRec*.tps` recordings.
    #[bpaf(argument("DIR"))]
    dvr_dir: PathBuf,

    /// Channel to export.
    #[bpaf(argument("CH"))]
    channel: u8,

    /// Start time: `YYYY-MM-DDTHH:MM:SS` (in --time-zone) or unix seconds.
    #[bpaf(argument("TIME"))]
    start: String,

    /// Seconds of video to export.
    #[bpaf(argument("SECS"), fallback(60))]
    duration: i64,

    /// IANA time zone `--start` is interpreted in.
    #[bpaf(argument("ZONE"), fallback("UTC".to_owned()), debug_fallback)]
    time_zone: String,

    /// Output path for the elementary stream.
    #[bpaf(argument("PATH"))]
    out: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let start = parse_time(&args.start, &args.time_zone)?;
    let end_ms = (start + args.duration) * 1000;
    let storage = Storage::open(&args.dvr_dir, super::default_cache_dir(&args.dvr_dir))?;
    let engine = storage.open_stream(args.channel, start, 0.0, CancelHandle::new())?;

    let out_file = std::fs::File::create(&args.out)
        .map_err(|e| err!(ReadError, msg("unable to create {}", args.out.display()), source(e)))?;
    let mut out = std::io::BufWriter::new(out_file);
    let mut nals = 0u64;
    for event in engine {
        match event {
            StreamEvent::VideoHeader { vps, sps, pps, idr, .. } => {
                for nal in [&vps, &sps, &pps, &idr] {
                    out.write_all(&START_CODE)?;
                    out.write_all(nal)?;
                    nals += 1;
                }
            }
            StreamEvent::VideoNal { ts_ms, data, .. } => {
                if ts_ms > end_ms {
                    break;
                }
                out.write_all(&START_CODE)?;
                out.write_all(&data)?;
                nals += 1;
            }
            StreamEvent::Audio { .. } => {} // video-only output
            StreamEvent::End => break,
            StreamEvent::Error(err) => return Err(err),
        }
    }
    out.flush()?;
    info!(nals, out = %args.out.display(), "export complete");
    Ok(0)
}

fn parse_time(s: &str, zone: &str) -> Result<i64, Error> {
    if let Ok(ts) = s.parse::<i64>() {
        return Ok(ts);
    }
    let tz = jiff::tz::TimeZone::get(zone)
        .map_err(|e| err!(InvalidArgument, msg("invalid time zone {zone:?}"), source(e)))?;
    let dt = jiff::civil::DateTime::strptime("%Y-%m-%dT%H:%M:%S", s)
        .map_err(|e| err!(InvalidArgument, msg("invalid start time {s:?}"), source(e)))?;
    Ok(dt
        .to_zoned(tz)
        .map_err(|e| err!(InvalidArgument, msg("ambiguous start time {s:?}"), source(e)))?
        .timestamp()
        .as_second())
}

#[cfg(test)]
mod tests {
    #[test]
    fn parse_time_forms() {
        assert_eq!(super::parse_time("1700000002", "UTC").unwrap(), 1_700_000_002);
        assert_eq!(
            super::parse_time("2023-11-14T22:13:20", "UTC").unwrap(),
            1_700_000_000
        );
        super::parse_time("not a time", "UTC").unwrap_err();
        super::parse_time("2023-11-14T22:13:20", "Not/AZone").unwrap_err();
    }
}
