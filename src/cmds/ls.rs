// This file is part of tpsview, a playback engine for TPS DVR recordings.
// Copyright (C) 2025 The tpsview Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The `ls` subcommand: list recording dates, or one day's recordings.

use std::path::PathBuf;

use base::Error;
use bpaf::Bpaf;
use tps::Storage;

/// List recording dates, or the recordings of one day.
#[derive(Bpaf, Clone, Debug)]
#[bpaf(command("ls"))]
pub struct Args {
    /// Directory holding `TIndex00.tps` and the `TRec*.tps` recordings.
    #[bpaf(argument("DIR"))]
    dvr_dir: PathBuf,

    /// Only show this channel.
    #[bpaf(argument("CH"))]
    channel: Option<u8>,

    /// IANA time zone for day boundaries.
    #[bpaf(argument("ZONE"), fallback("UTC".to_owned()), debug_fallback)]
    time_zone: String,

    /// Day to list, `YYYY-MM-DD`. Omit to list the available dates.
    #[bpaf(positional("DATE"))]
    date: Option<String>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let storage = Storage::open(&args.dvr_dir, super::default_cache_dir(&args.dvr_dir))?;
    match &args.date {
        None => {
            for date in storage.list_dates(args.channel, &args.time_zone)? {
                println!("{date}");
            }
        }
        Some(date) => {
            for r in storage.list_recordings(date, args.channel, &args.time_zone)? {
                println!(
                    "{:>6}  ch{:02}  {} - {}  {:>6}s  {:>6} iframes",
                    r.id, r.channel, r.start, r.end, r.duration, r.frame_count
                );
            }
        }
    }
    Ok(0)
}
