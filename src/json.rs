// This file is part of tpsview, a playback engine for TPS DVR recordings.
// Copyright (C) 2025 The tpsview Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! JSON types for the WebSocket control channel.
//!
//! Requests arrive as text frames with an `action` tag; status messages go
//! back as text frames with a `type` tag. Media goes out as binary frames
//! (see `tps::wire`), never as JSON.

use serde::{Deserialize, Serialize};

fn default_speed() -> f64 {
    1.0
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayRequest {
    pub channel: u8,

    /// Unix seconds to start playback at.
    pub timestamp: i64,

    /// Playback rate; pictures are paced at 25 Hz × speed.
    #[serde(default = "default_speed")]
    pub speed: f64,

    /// Send the seek point as one aggregated `HVCC` frame instead of four
    /// `H265` frames.
    #[serde(default)]
    pub aggregate: bool,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlRequest {
    Play(PlayRequest),
    Seek(PlayRequest),
    Pause,
    #[serde(rename_all = "camelCase")]
    Dates {
        channel: Option<u8>,
        time_zone: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Recordings {
        date: String,
        channel: Option<u8>,
        time_zone: Option<String>,
    },
    Status,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Status {
    #[serde(rename_all = "camelCase")]
    StreamStart {
        channel: u8,
        start_time: i64,
        end_time: i64,

        /// Wall-clock seconds of the frame actually served first.
        actual_start_time: i64,
        has_audio: bool,
        audio_format: &'static str,
        audio_sample_rate: u16,
    },
    StreamEnd,
    Error {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Dates {
        dates: Vec<String>,
        channels: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    Recordings {
        recordings: Vec<tps::storage::Recording>,
    },
    CacheStatus(tps::storage::CacheStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_play() {
        let req: ControlRequest = serde_json::from_str(
            r#"{"action": "play", "channel": 2, "timestamp": 1700000002, "speed": 2.0}"#,
        )
        .unwrap();
        assert_eq!(
            req,
            ControlRequest::Play(PlayRequest {
                channel: 2,
                timestamp: 1_700_000_002,
                speed: 2.0,
                aggregate: false,
            })
        );
    }

    #[test]
    fn parse_defaults() {
        let req: ControlRequest =
            serde_json::from_str(r#"{"action": "seek", "channel": 1, "timestamp": 1700000002}"#)
                .unwrap();
        let ControlRequest::Seek(req) = req else {
            panic!("expected seek");
        };
        assert_eq!(req.speed, 1.0);
        assert!(!req.aggregate);
    }

    #[test]
    fn parse_pause_and_queries() {
        assert_eq!(
            serde_json::from_str::<ControlRequest>(r#"{"action": "pause"}"#).unwrap(),
            ControlRequest::Pause
        );
        let req: ControlRequest = serde_json::from_str(
            r#"{"action": "recordings", "date": "2023-11-14", "channel": 2, "timeZone": "UTC"}"#,
        )
        .unwrap();
        assert_eq!(
            req,
            ControlRequest::Recordings {
                date: "2023-11-14".to_owned(),
                channel: Some(2),
                time_zone: Some("UTC".to_owned()),
            }
        );
    }

    #[test]
    fn unknown_action_is_rejected() {
        serde_json::from_str::<ControlRequest>(r#"{"action": "dance"}"#).unwrap_err();
    }

    #[test]
    fn status_serialization() {
        let s = Status::StreamStart {
            channel: 2,
            start_time: 1,
            end_time: 2,
            actual_start_time: 1,
            has_audio: true,
            audio_format: "g711-ulaw",
            audio_sample_rate: 8000,
        };
        let v: serde_json::Value = serde_json::to_value(&s).unwrap();
        assert_eq!(v["type"], "stream_start");
        assert_eq!(v["actualStartTime"], 1);
        assert_eq!(v["audioSampleRate"], 8000);

        let v = serde_json::to_value(Status::StreamEnd).unwrap();
        assert_eq!(v["type"], "stream_end");
    }
}
