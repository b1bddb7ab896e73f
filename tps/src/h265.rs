// This file is part of tpsview, a playback engine for TPS DVR recordings.
// Copyright (C) 2025 The tpsview Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! H.265 Annex-B demuxing.
//!
//! tpsview does not try to understand the video codec. The payload region of
//! a recording file is a raw Annex-B byte stream, though, so locating NAL
//! unit boundaries is unavoidable: it's the only video framing the container
//! has. This file finds start codes, classifies unit types, and extracts the
//! VPS/SPS/PPS/IDR quadruple that makes a seek point decodable. Units pass
//! through encoded; no RBSP unescaping happens here.

use memchr::memmem;

// See ISO/IEC 23008-2 table 7-1, NAL unit type codes and NAL unit type
// classes.
pub const NAL_UNIT_TRAIL_N: u8 = 0;
pub const NAL_UNIT_TRAIL_R: u8 = 1;
pub const NAL_UNIT_IDR_W_RADL: u8 = 19;
pub const NAL_UNIT_IDR_N_LP: u8 = 20;
pub const NAL_UNIT_VPS: u8 = 32;
pub const NAL_UNIT_SPS: u8 = 33;
pub const NAL_UNIT_PPS: u8 = 34;

/// Start code plus the first header byte of a VPS (type 32 << 1); the
/// pattern the whole-file scan looks for.
pub(crate) const VPS_PATTERN: [u8; 5] = [0x00, 0x00, 0x00, 0x01, 0x40];

/// One Annex-B unit within a scanned slice. `size` includes the start code;
/// the final unit of a slice extends to the end of the slice and may be
/// truncated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NalUnit {
    pub offset: usize,
    pub size: usize,
    pub ty: u8,
}

/// The NAL unit type from the first byte following the start code.
pub fn nal_type(first_byte: u8) -> u8 {
    (first_byte >> 1) & 0x3F
}

pub fn is_idr(ty: u8) -> bool {
    matches!(ty, NAL_UNIT_IDR_W_RADL | NAL_UNIT_IDR_N_LP)
}

/// True for the slice types this container produces; parameter sets and
/// anything exotic are not pictures.
pub fn is_picture_slice(ty: u8) -> bool {
    matches!(
        ty,
        NAL_UNIT_TRAIL_N | NAL_UNIT_TRAIL_R | NAL_UNIT_IDR_W_RADL | NAL_UNIT_IDR_N_LP
    )
}

pub fn strip_start_code(data: &[u8]) -> &[u8] {
    if data.starts_with(&[0, 0, 0, 1]) {
        &data[4..]
    } else if data.starts_with(&[0, 0, 1]) {
        &data[3..]
    } else {
        data
    }
}

/// Finds every start code in `data`, as `(offset, prefix_len)`.
///
/// Both the four-byte `00 00 00 01` and three-byte `00 00 01` forms count; a
/// three-byte match preceded by a zero byte is the tail of a four-byte code
/// and is reported as such. A code with no byte after it (nothing to take a
/// type from) is ignored, leaving those bytes to the preceding unit.
fn start_codes(data: &[u8]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    for q in memmem::find_iter(data, &[0, 0, 1]) {
        if q + 3 >= data.len() {
            continue;
        }
        if q > 0 && data[q - 1] == 0 {
            out.push((q - 1, 4));
        } else {
            out.push((q, 3));
        }
    }
    out
}

/// Produces an ordered list of the Annex-B units in `data`. Each unit runs
/// from its start code to the next one; the final unit runs to the end of
/// the slice.
pub fn find_nal_units(data: &[u8]) -> Vec<NalUnit> {
    let starts = start_codes(data);
    let mut out = Vec::with_capacity(starts.len());
    for (i, &(offset, prefix_len)) in starts.iter().enumerate() {
        let end = match starts.get(i + 1) {
            Some(&(next, _)) => next,
            None => data.len(),
        };
        out.push(NalUnit {
            offset,
            size: end - offset,
            ty: nal_type(data[offset + prefix_len]),
        });
    }
    out
}

/// A decodable seek point: parameter sets plus the first IDR picture, start
/// codes stripped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VideoHeader {
    pub vps: Vec<u8>,
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
    pub idr: Vec<u8>,

    /// Position within the searched slice immediately after the IDR unit.
    pub idr_end: usize,
}

/// Locates the first VPS in `data`, then walks forward collecting the first
/// SPS, PPS, and IDR seen. `None` if any of the four is missing before the
/// slice ends.
pub fn find_video_header(data: &[u8]) -> Option<VideoHeader> {
    let units = find_nal_units(data);
    let first_vps = units.iter().position(|u| u.ty == NAL_UNIT_VPS)?;
    let mut vps: Option<Vec<u8>> = None;
    let mut sps: Option<Vec<u8>> = None;
    let mut pps: Option<Vec<u8>> = None;
    for u in &units[first_vps..] {
        let raw = &data[u.offset..u.offset + u.size];
        match u.ty {
            NAL_UNIT_VPS => {
                vps.get_or_insert_with(|| strip_start_code(raw).to_vec());
            }
            NAL_UNIT_SPS => {
                sps.get_or_insert_with(|| strip_start_code(raw).to_vec());
            }
            NAL_UNIT_PPS => {
                pps.get_or_insert_with(|| strip_start_code(raw).to_vec());
            }
            t if is_idr(t) => {
                return Some(VideoHeader {
                    vps: vps?,
                    sps: sps?,
                    pps: pps?,
                    idr: strip_start_code(raw).to_vec(),
                    idr_end: u.offset + u.size,
                });
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rustfmt::skip]
    const MIXED_PREFIXES: [u8; 24] = [
        0x00, 0x00, 0x00, 0x01, 0x40, 0x01, 0xaa,       // VPS, 4-byte code
        0x00, 0x00, 0x01, 0x42, 0x01, 0xbb, 0xcc,       // SPS, 3-byte code
        0x00, 0x00, 0x00, 0x01, 0x26, 0x01, 0xdd,       // IDR_W_RADL
        0x00, 0x00, 0x01,                               // trailing, typeless
    ];

    #[test]
    fn mixed_prefix_forms() {
        let units = find_nal_units(&MIXED_PREFIXES);
        assert_eq!(
            units,
            &[
                NalUnit { offset: 0, size: 7, ty: NAL_UNIT_VPS },
                NalUnit { offset: 7, size: 7, ty: NAL_UNIT_SPS },
                NalUnit { offset: 14, size: 10, ty: NAL_UNIT_IDR_W_RADL },
            ]
        );
    }

    #[test]
    fn four_byte_code_takes_precedence() {
        // 00 00 00 01 must be reported at the position of its first zero,
        // not as a three-byte code one byte in.
        let data = [0x00, 0x00, 0x00, 0x01, 0x02, 0x99];
        let units = find_nal_units(&data);
        assert_eq!(units, &[NalUnit { offset: 0, size: 6, ty: NAL_UNIT_TRAIL_R }]);
    }

    #[test]
    fn round_trip_law() {
        // Every reported unit begins with a start code and contains no
        // other start code past its own.
        let units = find_nal_units(&MIXED_PREFIXES);
        for u in &units {
            let bytes = &MIXED_PREFIXES[u.offset..u.offset + u.size];
            assert!(bytes.starts_with(&[0, 0, 0, 1]) || bytes.starts_with(&[0, 0, 1]));
            let interior = &bytes[3..];
            assert!(find_nal_units(interior).is_empty(), "unit at {} re-demuxes", u.offset);
        }
    }

    #[test]
    fn idempotent_over_concatenation() {
        // Demuxing a concatenation of complete units reproduces the same
        // tuples as demuxing the units individually.
        let a = [0x00u8, 0x00, 0x00, 0x01, 0x40, 0x01, 0x11, 0x22];
        let b = [0x00u8, 0x00, 0x01, 0x02, 0x33];
        let mut joined = a.to_vec();
        joined.extend_from_slice(&b);
        let units = find_nal_units(&joined);
        assert_eq!(units.len(), 2);
        assert_eq!((units[0].offset, units[0].size, units[0].ty), (0, a.len(), NAL_UNIT_VPS));
        assert_eq!(
            (units[1].offset, units[1].size, units[1].ty),
            (a.len(), b.len(), NAL_UNIT_TRAIL_R)
        );
    }

    #[test]
    fn strip() {
        assert_eq!(strip_start_code(&[0, 0, 0, 1, 0x40, 0x01]), &[0x40, 0x01]);
        assert_eq!(strip_start_code(&[0, 0, 1, 0x40, 0x01]), &[0x40, 0x01]);
        assert_eq!(strip_start_code(&[0x40, 0x01]), &[0x40, 0x01]);
    }

    fn unit(ty: u8, len: usize) -> Vec<u8> {
        let mut v = vec![0, 0, 0, 1, ty << 1, 0x01];
        v.resize(6 + len, 0xaa);
        v
    }

    #[test]
    fn header_extraction() {
        let mut data = Vec::new();
        data.extend_from_slice(&unit(NAL_UNIT_VPS, 4));
        data.extend_from_slice(&unit(NAL_UNIT_SPS, 6));
        data.extend_from_slice(&unit(39, 2)); // prefix SEI, passed over
        data.extend_from_slice(&unit(NAL_UNIT_PPS, 3));
        data.extend_from_slice(&unit(NAL_UNIT_IDR_W_RADL, 100));
        data.extend_from_slice(&unit(NAL_UNIT_TRAIL_R, 10));
        let h = find_video_header(&data).unwrap();
        assert_eq!(h.vps.len(), 6);
        assert_eq!(h.sps.len(), 8);
        assert_eq!(h.pps.len(), 5);
        assert_eq!(h.idr.len(), 102);
        assert_eq!(h.idr_end, 10 + 12 + 8 + 9 + 106);
        assert_eq!(h.vps[0], NAL_UNIT_VPS << 1);
    }

    #[test]
    fn header_requires_all_four() {
        // No PPS before the IDR.
        let mut data = Vec::new();
        data.extend_from_slice(&unit(NAL_UNIT_VPS, 4));
        data.extend_from_slice(&unit(NAL_UNIT_SPS, 6));
        data.extend_from_slice(&unit(NAL_UNIT_IDR_W_RADL, 100));
        assert_eq!(find_video_header(&data), None);

        // Parameter sets but no IDR.
        let mut data = Vec::new();
        data.extend_from_slice(&unit(NAL_UNIT_VPS, 4));
        data.extend_from_slice(&unit(NAL_UNIT_SPS, 6));
        data.extend_from_slice(&unit(NAL_UNIT_PPS, 3));
        assert_eq!(find_video_header(&data), None);

        // Garbage before the first VPS is ignored.
        let mut data = vec![0xde, 0xad, 0xbe, 0xef];
        data.extend_from_slice(&unit(NAL_UNIT_VPS, 4));
        data.extend_from_slice(&unit(NAL_UNIT_SPS, 6));
        data.extend_from_slice(&unit(NAL_UNIT_PPS, 3));
        data.extend_from_slice(&unit(NAL_UNIT_IDR_N_LP, 50));
        assert!(find_video_header(&data).is_some());
    }

    #[test]
    fn vps_pattern_matches_nal_type() {
        assert_eq!(nal_type(VPS_PATTERN[4]), NAL_UNIT_VPS);
    }
}
