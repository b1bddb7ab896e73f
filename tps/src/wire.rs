// This file is part of tpsview, a playback engine for TPS DVR recordings.
// Copyright (C) 2025 The tpsview Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire framing for the transport relay.
//!
//! The relay forwards these frames opaquely; the browser-side player is the
//! only consumer. All integers are big-endian. Three shapes:
//!
//! | magic  | then                              | payload                      |
//! |--------|-----------------------------------|------------------------------|
//! | `H265` | u64 ts_ms, u8 kind, u32 len       | one NAL, no start code       |
//! | `G711` | u64 ts_ms, u16 sample_rate, u32 len | µ-law bytes                |
//! | `HVCC` | u64 ts_ms, u8 kind, u32 len       | (u32 len, NAL) blocks        |

use crate::h265;

pub const VIDEO_MAGIC: &[u8; 4] = b"H265";
pub const AUDIO_MAGIC: &[u8; 4] = b"G711";
pub const PICTURE_MAGIC: &[u8; 4] = b"HVCC";

/// G.711 µ-law is fixed at 8 kHz here.
pub const AUDIO_SAMPLE_RATE: u16 = 8000;

pub const KIND_INTER: u8 = 0;
pub const KIND_IDR: u8 = 1;
pub const KIND_VPS: u8 = 2;
pub const KIND_SPS: u8 = 3;
pub const KIND_PPS: u8 = 4;

/// The wire `kind` of a NAL unit type.
pub fn kind_for_nal_type(ty: u8) -> u8 {
    match ty {
        h265::NAL_UNIT_VPS => KIND_VPS,
        h265::NAL_UNIT_SPS => KIND_SPS,
        h265::NAL_UNIT_PPS => KIND_PPS,
        t if h265::is_idr(t) => KIND_IDR,
        _ => KIND_INTER,
    }
}

/// Frames one video NAL (start code already stripped).
pub fn video_frame(ts_ms: i64, ty: u8, nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(17 + nal.len());
    out.extend_from_slice(VIDEO_MAGIC);
    out.extend_from_slice(&(ts_ms as u64).to_be_bytes());
    out.push(kind_for_nal_type(ty));
    out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
    out.extend_from_slice(nal);
    out
}

/// Frames one G.711 µ-law audio frame.
pub fn audio_frame(ts_ms: i64, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(18 + data.len());
    out.extend_from_slice(AUDIO_MAGIC);
    out.extend_from_slice(&(ts_ms as u64).to_be_bytes());
    out.extend_from_slice(&AUDIO_SAMPLE_RATE.to_be_bytes());
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// Frames an aggregated picture: several NALs, each prefixed with its
/// length. Used to hand a whole seek point to the player in one message.
pub fn picture_frame(ts_ms: i64, kind: u8, nals: &[&[u8]]) -> Vec<u8> {
    let payload_len: usize = nals.iter().map(|n| 4 + n.len()).sum();
    let mut out = Vec::with_capacity(17 + payload_len);
    out.extend_from_slice(PICTURE_MAGIC);
    out.extend_from_slice(&(ts_ms as u64).to_be_bytes());
    out.push(kind);
    out.extend_from_slice(&(payload_len as u32).to_be_bytes());
    for n in nals {
        out.extend_from_slice(&(n.len() as u32).to_be_bytes());
        out.extend_from_slice(n);
    }
    out
}
